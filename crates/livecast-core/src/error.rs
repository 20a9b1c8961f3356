//! Error types for the Livecast core library.

use thiserror::Error;

/// Result type alias using the Livecast core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Livecast operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (unreadable or malformed file, invalid values)
    #[error("Configuration error: {0}")]
    Config(String),
}
