//! Common error types for MediPost.

use thiserror::Error;

/// Top-level error type for MediPost operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network transport failure (connect, DNS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// A network call exceeded its timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The device has no usable network path.
    #[error("Device is offline")]
    Offline,

    /// The server failed to process the request (5xx).
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The server rejected the request as invalid (4xx).
    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation refused because a conflicting one is in progress.
    #[error("Busy: {0}")]
    Busy(String),
}

impl Error {
    /// Whether a failed operation may succeed if retried later.
    ///
    /// Transient failures are retried with backoff; everything else is
    /// surfaced immediately (and, in the outbox, dead-lettered).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::Offline
                | Error::Server { .. }
                | Error::Io(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
