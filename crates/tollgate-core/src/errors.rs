//! Error types for the Tollgate core library.
//!
//! Only configuration, storage and I/O problems surface as errors. A check
//! that crashes or fails is data on the `ExecutionRun`, never an `Err`.

/// Top-level error enum for the Tollgate core library.
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No gate level fits: {0}")]
    NoLevelFits(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TollgateError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        TollgateError::Config(msg.into())
    }

    /// True for errors that must stop the caller at load time.
    pub fn is_config(&self) -> bool {
        matches!(self, TollgateError::Config(_) | TollgateError::NoLevelFits(_))
    }
}

pub type TollgateResult<T> = Result<T, TollgateError>;
