//! The storage port the lifecycle engine depends on.
//!
//! This is the seam between the engine and persistence: no `sqlx` type, no
//! SQL string, and no ORM query object appears on this trait. Adapters
//! (e.g. `workplanner-postgres`) implement it against whatever backend they
//! choose; the engine only ever sees `dyn WorkplanStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::filter::CompiledQuery;
use crate::model::Workplan;

/// Partial-update document. `None` means "leave unchanged"; only the fields
/// listed in spec are ever mutable through this path.
#[derive(Debug, Clone, Default)]
pub struct WorkplanPatch {
    pub data: Option<serde_json::Value>,
    pub retries: Option<u32>,
    pub hash: Option<String>,
    pub status: Option<crate::model::WorkplanStatus>,
    pub info: Option<Option<String>>,
    pub duration: Option<Option<i64>>,
    pub expires_utc: Option<Option<DateTime<Utc>>>,
    pub started_utc: Option<Option<DateTime<Utc>>>,
    pub finished_utc: Option<Option<DateTime<Utc>>>,
}

/// The capability set the engine needs from persistence. Every method runs
/// under the caller's transaction — this trait does not manage its own
/// commit/rollback boundaries except through [`WorkplanStore::transaction`].
#[async_trait]
pub trait WorkplanStore: Send + Sync {
    async fn get_by_id(&self, id: uuid::Uuid) -> Result<Option<Workplan>>;

    async fn get_by_pk(&self, name: &str, worktime_utc: DateTime<Utc>) -> Result<Option<Workplan>>;

    /// Max `worktime_utc` for `name`.
    async fn last_by_worktime(&self, name: &str) -> Result<Option<Workplan>>;

    /// Min `worktime_utc` for `name`.
    async fn first_by_worktime(&self, name: &str) -> Result<Option<Workplan>>;

    async fn exists(&self, name: &str) -> Result<bool>;

    /// All worktimes currently stored for `name`.
    async fn list_worktimes(&self, name: &str) -> Result<Vec<DateTime<Utc>>>;

    /// Atomic; returns `Ok(None)` (not an error) on natural-key conflict so
    /// callers that want "insert or ignore" semantics don't have to match
    /// on an error variant.
    async fn insert(&self, workplan: Workplan) -> Result<Option<Workplan>>;

    /// Replace-on-conflict on the natural key. Returns the number of rows
    /// affected (inserted or replaced).
    async fn bulk_upsert(&self, rows: Vec<Workplan>) -> Result<u64>;

    /// Applies `patch` to every row matching `query`; returns the updated
    /// rows.
    async fn update_matching(&self, query: &CompiledQuery, patch: &WorkplanPatch) -> Result<Vec<Workplan>>;

    async fn delete_matching(&self, query: &CompiledQuery) -> Result<u64>;

    async fn select(&self, query: &CompiledQuery) -> Result<Vec<Workplan>>;

    async fn count(&self, query: &CompiledQuery) -> Result<i64>;

    /// Open a nested transactional scope, returning a fresh handle bound to
    /// it. Every lifecycle operation that performs more than one mutation
    /// opens one of these; `generate_workplans` opens the outer scope and
    /// its sub-steps run against the returned handle instead of `self`.
    ///
    /// Adapters whose backend has no savepoint support may collapse a
    /// nested `begin` call into the single outer transaction rather than
    /// reject it — see `workplanner-postgres`.
    async fn begin(&self) -> Result<Box<dyn WorkplanStore>>;

    /// Commit the scope opened by [`WorkplanStore::begin`]. Calling this on
    /// a handle not returned by `begin` is a caller error.
    async fn commit(&self) -> Result<()>;

    /// Roll back the scope opened by [`WorkplanStore::begin`], discarding
    /// every effect performed through this handle. Calling this on a handle
    /// not returned by `begin` is a caller error.
    async fn rollback(&self) -> Result<()>;
}
