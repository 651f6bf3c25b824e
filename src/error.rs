//! Error types for the lookout crate

/// Errors that can occur across the probe, aggregator, and query paths
#[derive(Debug, thiserror::Error)]
pub enum LookoutError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Notifier error: {0}")]
    Notifier(String),
}

/// Result type alias for lookout operations
pub type Result<T> = std::result::Result<T, LookoutError>;
