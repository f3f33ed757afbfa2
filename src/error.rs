//! Error types for the packagist-advisories crate.
//!
//! This module provides a single error type [`AdvisoryError`] covering fetch,
//! parse, persistence and configuration failures.

use std::io;

/// The main error type for all operations in this crate.
#[derive(Debug, thiserror::Error)]
pub enum AdvisoryError {
    /// Redis/DragonflyDB connection or operation failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to fetch data from an advisory source.
    #[error("Source '{source_name}' fetch failed: {message}")]
    SourceFetch {
        /// Name of the source that failed (e.g., "GitHub").
        source_name: String,
        /// Description of what went wrong.
        message: String,
    },

    /// An upstream record could not be interpreted at all.
    #[error("Malformed advisory '{remote_id}': {message}")]
    MalformedAdvisory {
        /// Identifier of the offending record (file path, GHSA id, ...).
        remote_id: String,
        message: String,
    },

    /// A remote advisory violated a construction invariant.
    #[error("Invalid advisory: {0}")]
    InvalidAdvisory(String),

    /// The store already holds an advisory with this internal id.
    #[error("Duplicate advisory id: {0}")]
    DuplicateAdvisoryId(String),

    /// A record changed in the store after this run loaded it.
    #[error("Advisory {0} was modified concurrently")]
    ConcurrentModification(String),

    /// Configuration error (missing or invalid values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP request via middleware failed.
    #[error("HTTP middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// I/O error (file operations, etc.).
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Task join error (from spawned tasks).
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// GraphQL API error.
    #[error("GraphQL error: {0}")]
    GraphQL(String),
}

/// A specialized Result type for advisory operations.
pub type Result<T> = std::result::Result<T, AdvisoryError>;

impl AdvisoryError {
    /// Create a new source fetch error.
    pub fn source_fetch(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceFetch {
            source_name: source.into(),
            message: message.into(),
        }
    }

    /// Create a new malformed advisory error.
    pub fn malformed(remote_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedAdvisory {
            remote_id: remote_id.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid advisory error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidAdvisory(message.into())
    }

    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new GraphQL error.
    pub fn graphql(message: impl Into<String>) -> Self {
        Self::GraphQL(message.into())
    }
}

// zstd reports its failures as io::Error
impl From<std::io::Error> for AdvisoryError {
    fn from(err: std::io::Error) -> Self {
        if err.to_string().contains("zstd") || err.to_string().contains("compress") {
            Self::Compression(err.to_string())
        } else {
            Self::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_source_name() {
        let err = AdvisoryError::source_fetch("GitHub", "API returned 502");
        assert_eq!(
            err.to_string(),
            "Source 'GitHub' fetch failed: API returned 502"
        );
    }

    #[test]
    fn test_zstd_io_errors_become_compression_errors() {
        let err: AdvisoryError = std::io::Error::other("zstd: unknown frame descriptor").into();
        assert!(matches!(err, AdvisoryError::Compression(_)));

        let err: AdvisoryError = std::io::Error::other("permission denied").into();
        assert!(matches!(err, AdvisoryError::Io(_)));
    }
}
