//! Error types for wirebox.

use thiserror::Error;

/// Main error type for all wirebox operations.
///
/// Transport-level failures (`Io`, `ConnectionClosed`, `Protocol`) are caught
/// inside the pump and the listen loops and reported through their return
/// values; they never unwind into the caller. `AlreadyListening` is a
/// programming-contract violation and is returned to the caller directly.
#[derive(Debug, Error)]
pub enum WireboxError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation (bad length prefix from the peer).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Connection closed by the peer or locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The cooperative pump is already running on this mailbox.
    #[error("mailbox {0} is already being processed asynchronously")]
    AlreadyListening(String),
}

/// Result type alias using WireboxError.
pub type Result<T> = std::result::Result<T, WireboxError>;
