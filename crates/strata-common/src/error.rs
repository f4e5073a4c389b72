//! Error types for StrataDB.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in StrataDB operations.
///
/// Precondition violations (out-of-range frame ids, removing a
/// non-evictable frame from the replacer) are programming errors and
/// assert instead of surfacing here.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer pool full, unable to allocate frame")]
    PoolFull,

    #[error("invalid page id")]
    InvalidPageId,

    #[error("configuration error: {0}")]
    ConfigError(String),
}
