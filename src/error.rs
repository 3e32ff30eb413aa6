//! Relay error types

use thiserror::Error;

/// Relay error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record store error
    #[error("Store error: {0}")]
    Store(String),

    /// A row referenced by a relation field is not committed yet.
    ///
    /// This is its own variant (rather than a `Store` string) because
    /// `save_with_retry` dispatches on it: relation races during chat and
    /// message creation are retried, every other store failure propagates.
    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    /// Requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine request failed
    #[error("Engine error: {0}")]
    Engine(String),

    /// Filesystem materializer error
    #[error("Materialize error: {0}")]
    Materialize(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML rendering error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;
