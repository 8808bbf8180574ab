use thiserror::Error;

use telemetry_model::{UnknownCategory, UnknownInterval};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Rejected query parameters; surfaced to clients as 400.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("missing query parameter '{0}'")]
    MissingParam(&'static str),
    #[error("invalid timestamp for '{param}': '{value}'")]
    BadTimestamp { param: &'static str, value: String },
    #[error(transparent)]
    Interval(#[from] UnknownInterval),
    #[error(transparent)]
    Category(#[from] UnknownCategory),
}
