//! Common error types for graphfs.

use thiserror::Error;

/// Top-level error type for drive operations.
///
/// Callers can tell apart "not found", "access denied" and "server
/// unavailable" by variant; transient conditions are retried inside the
/// client before they surface as [`Error::RateLimited`] or
/// [`Error::Unavailable`].
#[derive(Debug, Error)]
pub enum Error {
    /// Credential rejected, token refresh failed, or a retried request was
    /// rejected a second time.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Path or item absent on the remote drive.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Etag/version mismatch or a name collision on the server.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The remote item changed while it was being read.
    #[error("Stale read: {0}")]
    StaleRead(String),

    /// The upload protocol was violated (e.g. acknowledged offset mismatch).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An upload session lapsed before it was committed.
    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    /// Throttled by the server and the retry budget is spent.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Server or network unavailable after retries, or an ambiguous failure
    /// of a request that cannot be repeated.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Any other rejected request, with the server's error code.
    #[error("Request failed with status {status} ({code}): {message}")]
    Request {
        status: u16,
        code: String,
        message: String,
    },

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Directory is not empty.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Local I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error is a transient condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RateLimited(_) | Error::Unavailable(_))
    }

    /// Whether the error reports a missing path or item.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
