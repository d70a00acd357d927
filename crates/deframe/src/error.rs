//! Deframer error type

/// Errors from deframer configuration; stream-level problems are logged
/// and skipped, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum DeframeError {
    /// The `-F`/`-G` argument did not parse
    #[error("invalid deframer spec {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: String },
}
