//! Structured error type for the workplan engine.
//!
//! `WorkplannerError` is the only error type the engine's public API returns.
//! Storage adapters translate their own failures (unique-violation, IO,
//! timeout) into one of these variants at the port boundary — no
//! adapter-specific error type (e.g. `sqlx::Error`) ever crosses it.

use thiserror::Error;

/// Errors produced by the workplan lifecycle engine and filter compiler.
#[derive(Debug, Error)]
pub enum WorkplannerError {
    /// Bad input: unknown filter field, non-positive `step`, a non-UTC
    /// timestamp, a non-negative entry in `offset_periods`, an unknown
    /// status passed as `status_trigger`, or an operator applied to a value
    /// it cannot act on (e.g. `like` on an integer).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup by `id` or by `(name, worktime_utc)` found nothing.
    #[error("workplan not found")]
    NotFound,

    /// A write collided with the unique `(name, worktime_utc)` constraint.
    ///
    /// Some callers (`create_next_or_none`, `fill_missing`) recover from
    /// this locally and never let it escape; everywhere else it surfaces.
    #[error("conflict on (name, worktime_utc)")]
    Conflict,

    /// The storage adapter failed for reasons unrelated to the request
    /// itself (connection drop, timeout, serialization fault).
    #[error("storage error: {0}")]
    StorageError(#[source] anyhow::Error),
}

impl WorkplannerError {
    /// Build an [`WorkplannerError::InvalidArgument`] from any displayable reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        WorkplannerError::InvalidArgument(reason.into())
    }
}

impl From<anyhow::Error> for WorkplannerError {
    fn from(err: anyhow::Error) -> Self {
        WorkplannerError::StorageError(err)
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, WorkplannerError>;
