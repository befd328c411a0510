use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no results for query")]
    NoResults,

    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("feedback batch already consumed: {marked} of {expected} records still unused")]
    BatchConsumed { expected: usize, marked: usize },

    #[error("invalid correction: {0}")]
    InvalidCorrection(String),

    #[error("cannot decode column '{column}': {reason}")]
    Decode { column: String, reason: String },

    #[error("store connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Transient contention that a retry may resolve.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::DuckDb(e) => e.to_string().to_ascii_lowercase().contains("conflict"),
            _ => false,
        }
    }
}
