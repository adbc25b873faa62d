//! `PostgresStore`: the `sqlx`/Postgres implementation of `WorkplanStore`.
//!
//! Structured the way the teacher's `PostgresJobQueue`/`PostgresJobStore`
//! wrap a pool (`kernel/jobs/queue.rs`, `kernel/jobs/job_store.rs`), except
//! this adapter additionally has to stand in a transaction on its own —
//! nothing in the teacher plays that role, so `PgConn` is this crate's own
//! addition, built from `sqlx::Transaction`'s own API rather than borrowed
//! from anywhere in the pack.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;
use workplanner_core::filter::CompiledQuery;
use workplanner_core::store::{WorkplanPatch, WorkplanStore};
use workplanner_core::{Result, Workplan, WorkplannerError};

use crate::error::map_sqlx_error;
use crate::query::{push_limit_offset, push_order_by, push_where};
use crate::row::{PgWorkplanStatus, WorkplanRow, WORKPLAN_COLUMNS};

enum PgConn {
    Pool(PgPool),
    /// A transaction in progress. `owns` is true only for the handle that
    /// actually opened it (via `begin`); a re-entrant `begin()` call against
    /// an already-open transaction (the nested-scope collapse described in
    /// `workplanner_core::store::WorkplanStore::begin`) returns a handle that
    /// shares the same transaction but does not finalize it.
    Txn {
        txn: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
        owns: bool,
    },
}

/// A `WorkplanStore` backed by a Postgres table created by
/// `migrations/0001_workplans.sql`.
pub struct PostgresStore {
    conn: PgConn,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { conn: PgConn::Pool(pool) }
    }
}

fn to_patch_status(status: workplanner_core::WorkplanStatus) -> PgWorkplanStatus {
    PgWorkplanStatus::from(status)
}

fn push_set(builder: &mut QueryBuilder<'_, Postgres>, patch: &WorkplanPatch) {
    let mut any = false;
    let mut push_comma = |builder: &mut QueryBuilder<'_, Postgres>, any: &mut bool| {
        if *any {
            builder.push(", ");
        }
        *any = true;
    };

    if let Some(data) = &patch.data {
        push_comma(builder, &mut any);
        builder.push("data = ").push_bind(data.clone());
    }
    if let Some(retries) = patch.retries {
        push_comma(builder, &mut any);
        builder.push("retries = ").push_bind(retries as i32);
    }
    if let Some(hash) = &patch.hash {
        push_comma(builder, &mut any);
        builder.push("hash = ").push_bind(hash.clone());
    }
    if let Some(status) = patch.status {
        push_comma(builder, &mut any);
        builder.push("status = ").push_bind(to_patch_status(status));
    }
    if let Some(info) = &patch.info {
        push_comma(builder, &mut any);
        builder.push("info = ").push_bind(info.clone());
    }
    if let Some(duration) = patch.duration {
        push_comma(builder, &mut any);
        builder.push("duration = ").push_bind(duration);
    }
    if let Some(expires_utc) = patch.expires_utc {
        push_comma(builder, &mut any);
        builder.push("expires_utc = ").push_bind(expires_utc);
    }
    if let Some(started_utc) = patch.started_utc {
        push_comma(builder, &mut any);
        builder.push("started_utc = ").push_bind(started_utc);
    }
    if let Some(finished_utc) = patch.finished_utc {
        push_comma(builder, &mut any);
        builder.push("finished_utc = ").push_bind(finished_utc);
    }

    if any {
        builder.push(", updated_utc = now()");
    } else {
        builder.push("updated_utc = now()");
    }
}

#[async_trait]
impl WorkplanStore for PostgresStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Workplan>> {
        let sql = format!("SELECT {WORKPLAN_COLUMNS} FROM workplans WHERE id = $1");
        let row = match &self.conn {
            PgConn::Pool(pool) => sqlx::query_as::<_, WorkplanRow>(&sql).bind(id).fetch_optional(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                sqlx::query_as::<_, WorkplanRow>(&sql).bind(id).fetch_optional(conn).await
            }
        };
        row.map(|r| r.map(Into::into)).map_err(map_sqlx_error)
    }

    async fn get_by_pk(&self, name: &str, worktime_utc: DateTime<Utc>) -> Result<Option<Workplan>> {
        let sql = format!("SELECT {WORKPLAN_COLUMNS} FROM workplans WHERE name = $1 AND worktime_utc = $2");
        let row = match &self.conn {
            PgConn::Pool(pool) => {
                sqlx::query_as::<_, WorkplanRow>(&sql)
                    .bind(name)
                    .bind(worktime_utc)
                    .fetch_optional(pool)
                    .await
            }
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                sqlx::query_as::<_, WorkplanRow>(&sql)
                    .bind(name)
                    .bind(worktime_utc)
                    .fetch_optional(conn)
                    .await
            }
        };
        row.map(|r| r.map(Into::into)).map_err(map_sqlx_error)
    }

    async fn last_by_worktime(&self, name: &str) -> Result<Option<Workplan>> {
        let sql = format!("SELECT {WORKPLAN_COLUMNS} FROM workplans WHERE name = $1 ORDER BY worktime_utc DESC LIMIT 1");
        let row = match &self.conn {
            PgConn::Pool(pool) => sqlx::query_as::<_, WorkplanRow>(&sql).bind(name).fetch_optional(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                sqlx::query_as::<_, WorkplanRow>(&sql).bind(name).fetch_optional(conn).await
            }
        };
        row.map(|r| r.map(Into::into)).map_err(map_sqlx_error)
    }

    async fn first_by_worktime(&self, name: &str) -> Result<Option<Workplan>> {
        let sql = format!("SELECT {WORKPLAN_COLUMNS} FROM workplans WHERE name = $1 ORDER BY worktime_utc ASC LIMIT 1");
        let row = match &self.conn {
            PgConn::Pool(pool) => sqlx::query_as::<_, WorkplanRow>(&sql).bind(name).fetch_optional(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                sqlx::query_as::<_, WorkplanRow>(&sql).bind(name).fetch_optional(conn).await
            }
        };
        row.map(|r| r.map(Into::into)).map_err(map_sqlx_error)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let sql = "SELECT EXISTS(SELECT 1 FROM workplans WHERE name = $1)";
        let row: std::result::Result<(bool,), sqlx::Error> = match &self.conn {
            PgConn::Pool(pool) => sqlx::query_as(sql).bind(name).fetch_one(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                sqlx::query_as(sql).bind(name).fetch_one(conn).await
            }
        };
        row.map(|(exists,)| exists).map_err(map_sqlx_error)
    }

    async fn list_worktimes(&self, name: &str) -> Result<Vec<DateTime<Utc>>> {
        let sql = "SELECT worktime_utc FROM workplans WHERE name = $1";
        let rows = match &self.conn {
            PgConn::Pool(pool) => sqlx::query(sql).bind(name).fetch_all(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                sqlx::query(sql).bind(name).fetch_all(conn).await
            }
        };
        rows.map_err(map_sqlx_error)?
            .into_iter()
            .map(|r| r.try_get::<DateTime<Utc>, _>("worktime_utc").map_err(map_sqlx_error))
            .collect()
    }

    async fn insert(&self, workplan: Workplan) -> Result<Option<Workplan>> {
        let sql = format!(
            "INSERT INTO workplans ({WORKPLAN_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14) \
             ON CONFLICT (name, worktime_utc) DO NOTHING RETURNING {WORKPLAN_COLUMNS}"
        );
        let row = match &self.conn {
            PgConn::Pool(pool) => {
                sqlx::query_as::<_, WorkplanRow>(&sql)
                    .bind(workplan.id)
                    .bind(workplan.name.clone())
                    .bind(workplan.worktime_utc)
                    .bind(to_patch_status(workplan.status))
                    .bind(workplan.hash.clone())
                    .bind(workplan.retries as i32)
                    .bind(workplan.info.clone())
                    .bind(workplan.data.clone())
                    .bind(workplan.duration)
                    .bind(workplan.expires_utc)
                    .bind(workplan.started_utc)
                    .bind(workplan.finished_utc)
                    .bind(workplan.created_utc)
                    .bind(workplan.updated_utc)
                    .fetch_optional(pool)
                    .await
            }
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                sqlx::query_as::<_, WorkplanRow>(&sql)
                    .bind(workplan.id)
                    .bind(workplan.name.clone())
                    .bind(workplan.worktime_utc)
                    .bind(to_patch_status(workplan.status))
                    .bind(workplan.hash.clone())
                    .bind(workplan.retries as i32)
                    .bind(workplan.info.clone())
                    .bind(workplan.data.clone())
                    .bind(workplan.duration)
                    .bind(workplan.expires_utc)
                    .bind(workplan.started_utc)
                    .bind(workplan.finished_utc)
                    .bind(workplan.created_utc)
                    .bind(workplan.updated_utc)
                    .fetch_optional(conn)
                    .await
            }
        };
        row.map(|r| r.map(Into::into)).map_err(map_sqlx_error)
    }

    async fn bulk_upsert(&self, rows: Vec<Workplan>) -> Result<u64> {
        let sql = format!(
            "INSERT INTO workplans ({WORKPLAN_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14) \
             ON CONFLICT (name, worktime_utc) DO UPDATE SET \
             status = EXCLUDED.status, hash = EXCLUDED.hash, retries = EXCLUDED.retries, \
             info = EXCLUDED.info, data = EXCLUDED.data, duration = EXCLUDED.duration, \
             expires_utc = EXCLUDED.expires_utc, started_utc = EXCLUDED.started_utc, \
             finished_utc = EXCLUDED.finished_utc, updated_utc = now()"
        );
        let mut count = 0u64;
        for workplan in rows {
            let result = match &self.conn {
                PgConn::Pool(pool) => {
                    sqlx::query(&sql)
                        .bind(workplan.id)
                        .bind(workplan.name.clone())
                        .bind(workplan.worktime_utc)
                        .bind(to_patch_status(workplan.status))
                        .bind(workplan.hash.clone())
                        .bind(workplan.retries as i32)
                        .bind(workplan.info.clone())
                        .bind(workplan.data.clone())
                        .bind(workplan.duration)
                        .bind(workplan.expires_utc)
                        .bind(workplan.started_utc)
                        .bind(workplan.finished_utc)
                        .bind(workplan.created_utc)
                        .bind(workplan.updated_utc)
                        .execute(pool)
                        .await
                }
                PgConn::Txn { txn, .. } => {
                    let mut guard = txn.lock().await;
                    let conn = guard.as_mut().expect("transaction already finished");
                    sqlx::query(&sql)
                        .bind(workplan.id)
                        .bind(workplan.name.clone())
                        .bind(workplan.worktime_utc)
                        .bind(to_patch_status(workplan.status))
                        .bind(workplan.hash.clone())
                        .bind(workplan.retries as i32)
                        .bind(workplan.info.clone())
                        .bind(workplan.data.clone())
                        .bind(workplan.duration)
                        .bind(workplan.expires_utc)
                        .bind(workplan.started_utc)
                        .bind(workplan.finished_utc)
                        .bind(workplan.created_utc)
                        .bind(workplan.updated_utc)
                        .execute(conn)
                        .await
                }
            };
            count += result.map_err(map_sqlx_error)?.rows_affected();
        }
        Ok(count)
    }

    async fn update_matching(&self, query: &CompiledQuery, patch: &WorkplanPatch) -> Result<Vec<Workplan>> {
        let mut builder = QueryBuilder::new("UPDATE workplans SET ");
        push_set(&mut builder, patch);
        push_where(&mut builder, &query.predicates);
        builder.push(format!(" RETURNING {WORKPLAN_COLUMNS}"));

        let rows = match &self.conn {
            PgConn::Pool(pool) => builder.build_query_as::<WorkplanRow>().fetch_all(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                builder.build_query_as::<WorkplanRow>().fetch_all(conn).await
            }
        };
        rows.map(|rs| rs.into_iter().map(Into::into).collect()).map_err(map_sqlx_error)
    }

    async fn delete_matching(&self, query: &CompiledQuery) -> Result<u64> {
        let mut builder = QueryBuilder::new("DELETE FROM workplans");
        push_where(&mut builder, &query.predicates);

        let result = match &self.conn {
            PgConn::Pool(pool) => builder.build().execute(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                builder.build().execute(conn).await
            }
        };
        result.map(|r| r.rows_affected()).map_err(map_sqlx_error)
    }

    async fn select(&self, query: &CompiledQuery) -> Result<Vec<Workplan>> {
        let mut builder = QueryBuilder::new(format!("SELECT {WORKPLAN_COLUMNS} FROM workplans"));
        push_where(&mut builder, &query.predicates);
        push_order_by(&mut builder, &query.order_by);
        push_limit_offset(&mut builder, query);

        let rows = match &self.conn {
            PgConn::Pool(pool) => builder.build_query_as::<WorkplanRow>().fetch_all(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                builder.build_query_as::<WorkplanRow>().fetch_all(conn).await
            }
        };
        rows.map(|rs| rs.into_iter().map(Into::into).collect()).map_err(map_sqlx_error)
    }

    async fn count(&self, query: &CompiledQuery) -> Result<i64> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM workplans");
        push_where(&mut builder, &query.predicates);

        let row: std::result::Result<(i64,), sqlx::Error> = match &self.conn {
            PgConn::Pool(pool) => builder.build_query_as().fetch_one(pool).await,
            PgConn::Txn { txn, .. } => {
                let mut guard = txn.lock().await;
                let conn = guard.as_mut().expect("transaction already finished");
                builder.build_query_as().fetch_one(conn).await
            }
        };
        row.map(|(n,)| n).map_err(map_sqlx_error)
    }

    async fn begin(&self) -> Result<Box<dyn WorkplanStore>> {
        match &self.conn {
            PgConn::Pool(pool) => {
                let txn = pool.begin().await.map_err(map_sqlx_error)?;
                Ok(Box::new(PostgresStore {
                    conn: PgConn::Txn {
                        txn: Arc::new(Mutex::new(Some(txn))),
                        owns: true,
                    },
                }))
            }
            PgConn::Txn { txn, .. } => Ok(Box::new(PostgresStore {
                conn: PgConn::Txn {
                    txn: Arc::clone(txn),
                    owns: false,
                },
            })),
        }
    }

    async fn commit(&self) -> Result<()> {
        match &self.conn {
            PgConn::Pool(_) => Err(WorkplannerError::invalid("commit() called on a handle that never opened a transaction")),
            PgConn::Txn { txn, owns } => {
                if !owns {
                    return Ok(());
                }
                let mut guard = txn.lock().await;
                let txn = guard.take().expect("transaction already finished");
                txn.commit().await.map_err(map_sqlx_error)
            }
        }
    }

    async fn rollback(&self) -> Result<()> {
        match &self.conn {
            PgConn::Pool(_) => Err(WorkplannerError::invalid("rollback() called on a handle that never opened a transaction")),
            PgConn::Txn { txn, owns } => {
                if !owns {
                    return Ok(());
                }
                let mut guard = txn.lock().await;
                let txn = guard.take().expect("transaction already finished");
                txn.rollback().await.map_err(map_sqlx_error)
            }
        }
    }
}
