//! Sink error type

use edibridge_protocol::ProtocolError;

/// Errors from the output side
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Binding a destination socket or listener failed
    #[error("failed to open destination {destination}: {source}")]
    Open {
        destination: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while emitting
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// AF/PFT encoding failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// ZMQ transport error
    #[error("ZMQ error: {0}")]
    Zmq(String),

    /// The ETI stream jumped frame phase mid-group
    #[error("unexpected frame phase {got}, expected {expected}")]
    FramePhase { expected: u8, got: u8 },
}
