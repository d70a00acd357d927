//! Source error type

use edibridge_protocol::ProtocolError;

/// Errors from the input side
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Binding or joining the UDP receive socket failed
    #[error("failed to bind UDP receiver on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A logic error from the decoder that must stop the process, e.g. an
    /// impossible ETI reconstruction
    #[error("fatal decoder error on {source_label}: {source}")]
    Fatal {
        source_label: String,
        #[source]
        source: ProtocolError,
    },
}
