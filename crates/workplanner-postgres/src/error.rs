//! Translate `sqlx::Error` into the closed `WorkplannerError` taxonomy.
//!
//! Mirrors the teacher's habit of inspecting the underlying error before
//! deciding how to classify it (`kernel/jobs/runner.rs`'s error
//! classification), rather than letting a driver-specific error type cross
//! the port boundary.

use workplanner_core::WorkplannerError;

const UNIQUE_VIOLATION: &str = "23505";

pub fn map_sqlx_error(err: sqlx::Error) -> WorkplannerError {
    match &err {
        sqlx::Error::RowNotFound => WorkplannerError::NotFound,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            WorkplannerError::Conflict
        }
        _ => WorkplannerError::from(anyhow::Error::new(err)),
    }
}
