// Fatal engine errors
// Anything in here aborts the query. Per-record problems are Diagnostics instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A source table is missing or cannot be read. Never degrade to an empty result.
    #[error("source table `{table}` is unavailable: {reason}")]
    SourceUnavailable { table: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl EngineError {
    pub fn source_unavailable(table: &str, reason: impl ToString) -> Self {
        EngineError::SourceUnavailable {
            table: table.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the failure means a whole source could not be reached
    pub fn is_fatal_source_failure(&self) -> bool {
        matches!(self, EngineError::SourceUnavailable { .. })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
