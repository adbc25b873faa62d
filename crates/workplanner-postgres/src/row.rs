//! The `workplans` table row and its mapping to/from [`workplanner_core::Workplan`].

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;
use workplanner_core::{Workplan, WorkplanStatus};

/// Postgres-side mirror of [`WorkplanStatus`], bound to the `workplan_status`
/// enum type created by the `0001_workplans.sql` migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "workplan_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PgWorkplanStatus {
    Add,
    Queue,
    Run,
    Success,
    Error,
    FatalError,
}

impl From<WorkplanStatus> for PgWorkplanStatus {
    fn from(value: WorkplanStatus) -> Self {
        match value {
            WorkplanStatus::Add => PgWorkplanStatus::Add,
            WorkplanStatus::Queue => PgWorkplanStatus::Queue,
            WorkplanStatus::Run => PgWorkplanStatus::Run,
            WorkplanStatus::Success => PgWorkplanStatus::Success,
            WorkplanStatus::Error => PgWorkplanStatus::Error,
            WorkplanStatus::FatalError => PgWorkplanStatus::FatalError,
        }
    }
}

impl From<PgWorkplanStatus> for WorkplanStatus {
    fn from(value: PgWorkplanStatus) -> Self {
        match value {
            PgWorkplanStatus::Add => WorkplanStatus::Add,
            PgWorkplanStatus::Queue => WorkplanStatus::Queue,
            PgWorkplanStatus::Run => WorkplanStatus::Run,
            PgWorkplanStatus::Success => WorkplanStatus::Success,
            PgWorkplanStatus::Error => WorkplanStatus::Error,
            PgWorkplanStatus::FatalError => WorkplanStatus::FatalError,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkplanRow {
    pub id: Uuid,
    pub name: String,
    pub worktime_utc: DateTime<Utc>,
    pub status: PgWorkplanStatus,
    pub hash: String,
    pub retries: i32,
    pub info: Option<String>,
    pub data: serde_json::Value,
    pub duration: Option<i64>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub started_utc: Option<DateTime<Utc>>,
    pub finished_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

pub const WORKPLAN_COLUMNS: &str = "id, name, worktime_utc, status, hash, retries, info, data, \
    duration, expires_utc, started_utc, finished_utc, created_utc, updated_utc";

impl From<WorkplanRow> for Workplan {
    fn from(row: WorkplanRow) -> Self {
        let mut builder = Workplan::builder()
            .id(row.id)
            .name(row.name)
            .worktime_utc(row.worktime_utc)
            .status(row.status.into())
            .hash(row.hash)
            .retries(row.retries.max(0) as u32)
            .data(row.data)
            .created_utc(row.created_utc)
            .updated_utc(row.updated_utc);
        if let Some(info) = row.info {
            builder = builder.info(info);
        }
        if let Some(duration) = row.duration {
            builder = builder.duration(duration);
        }
        if let Some(expires_utc) = row.expires_utc {
            builder = builder.expires_utc(expires_utc);
        }
        if let Some(started_utc) = row.started_utc {
            builder = builder.started_utc(started_utc);
        }
        if let Some(finished_utc) = row.finished_utc {
            builder = builder.finished_utc(finished_utc);
        }
        builder.build()
    }
}
