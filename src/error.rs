// Error types for the send session.
//
// Setup errors abort before any protocol traffic; protocol errors come from
// malformed inbound frames; I/O errors during chunk reads terminate the
// session.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SendError>;

#[derive(Debug, Error)]
pub enum SendError {
    /// A user-supplied path could not be inspected. Fatal, reported before
    /// the start frame is written.
    #[error("failed to stat {path}: {source}")]
    Setup {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The argument list cannot describe a transfer.
    #[error("{0}")]
    Usage(String),

    /// Malformed command text in an inbound frame.
    #[error("malformed transfer command: {0}")]
    Protocol(String),

    /// The deflate stream reported an internal error.
    #[error("compression failed: {0}")]
    Compress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
