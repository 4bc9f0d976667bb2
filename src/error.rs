//! Error types for Granary

use std::fmt;

/// Result type alias for Granary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Granary
#[derive(Debug)]
pub enum Error {
    /// Malformed line-protocol record or object key
    Format(String),
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors (staging files)
    Io(std::io::Error),
    /// Transport errors talking to the fast store
    Http(reqwest::Error),
    /// Fast store returned an unusable response
    FastStore(String),
    /// Upstream service temporarily unavailable (5xx); retried
    Unavailable(String),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Result cache error
    Cache(String),
    /// Internal error
    Internal(String),
    /// Too many retries
    TooManyRetries,
}

impl Error {
    /// Whether the operation that produced this error may succeed on retry.
    ///
    /// Format and precondition problems never heal on their own; transport
    /// errors and 5xx responses usually do. A missing object is not a
    /// transport problem.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::ObjectStore(e) => !matches!(e, object_store::Error::NotFound { .. }),
            Error::Http(_) | Error::Unavailable(_) => true,
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "Format error: {}", msg),
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::FastStore(msg) => write!(f, "Fast store error: {}", msg),
            Error::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Cache(msg) => write!(f, "Cache error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::TooManyRetries => {
                write!(f, "Too many retries: operation failed after maximum retry attempts")
            }
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
