//! Postgres adapter for the workplan lifecycle engine.
//!
//! Implements `workplanner_core::store::WorkplanStore` against a `sqlx`
//! connection pool, the same split the teacher draws between its kernel
//! traits and their `postgres`-suffixed implementations.

mod error;
mod query;
mod row;
mod store;

pub use row::PgWorkplanStatus;
pub use store::PostgresStore;
