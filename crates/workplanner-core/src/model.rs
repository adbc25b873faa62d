//! The `Workplan` value type and its status enumeration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// One scheduled slot of one named job at one instant.
///
/// Primary identity is `id`; `(name, worktime_utc)` is additionally unique
/// and addressable as a natural key. Both uniqueness invariants must hold
/// across create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Workplan {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub name: String,
    pub worktime_utc: DateTime<Utc>,

    #[builder(default)]
    pub status: WorkplanStatus,

    #[builder(default)]
    pub hash: String,

    #[builder(default)]
    pub retries: u32,

    #[builder(default, setter(strip_option))]
    pub info: Option<String>,

    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub data: serde_json::Value,

    #[builder(default, setter(strip_option))]
    pub duration: Option<i64>,

    #[builder(default, setter(strip_option))]
    pub expires_utc: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub started_utc: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub finished_utc: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_utc: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_utc: DateTime<Utc>,
}

impl Workplan {
    /// A slot is expired iff `expires_utc` is set and has passed `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc.is_some_and(|e| e <= now)
    }

    /// Whether this slot belongs to the runnable set: `status = ADD` and
    /// not expired.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkplanStatus::Add && !self.is_expired(now)
    }
}

/// Closed status set for a workplan slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkplanStatus {
    /// Ready for execution.
    #[default]
    Add,
    /// Claimed by a worker pool.
    Queue,
    /// Executing.
    Run,
    /// Terminal: completed successfully.
    Success,
    /// Retryable failure.
    Error,
    /// Terminal: non-retryable for this job definition.
    FatalError,
}

impl WorkplanStatus {
    /// `{ERROR}` — retryable failures, the set `update_errors` drains.
    pub fn is_error(self) -> bool {
        matches!(self, WorkplanStatus::Error)
    }

    /// `{QUEUE, RUN}` — in-flight, candidates for "lost" at restart.
    pub fn is_in_flight(self) -> bool {
        matches!(self, WorkplanStatus::Queue | WorkplanStatus::Run)
    }

    /// `{SUCCESS, FATAL_ERROR}` — no further transition is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkplanStatus::Success | WorkplanStatus::FatalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2022-11-11T11:11:11Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn new_workplan_defaults_to_add_status() {
        let w = Workplan::builder().name("A").worktime_utc(now()).build();
        assert_eq!(w.status, WorkplanStatus::Add);
        assert_eq!(w.retries, 0);
        assert!(w.data.is_object());
    }

    #[test]
    fn expired_requires_expires_utc_in_the_past() {
        let w = Workplan::builder()
            .name("A")
            .worktime_utc(now())
            .expires_utc(now())
            .build();
        assert!(w.is_expired(now()));
        assert!(!w.is_expired(now() - chrono::Duration::seconds(1)));
    }

    #[test]
    fn runnable_requires_add_and_not_expired() {
        let w = Workplan::builder().name("A").worktime_utc(now()).build();
        assert!(w.is_runnable(now()));

        let expired = Workplan::builder()
            .name("A")
            .worktime_utc(now())
            .expires_utc(now())
            .build();
        assert!(!expired.is_runnable(now()));
    }

    #[test]
    fn status_groupings_are_correct() {
        assert!(WorkplanStatus::Error.is_error());
        assert!(!WorkplanStatus::Add.is_error());

        assert!(WorkplanStatus::Queue.is_in_flight());
        assert!(WorkplanStatus::Run.is_in_flight());
        assert!(!WorkplanStatus::Add.is_in_flight());

        assert!(WorkplanStatus::Success.is_terminal());
        assert!(WorkplanStatus::FatalError.is_terminal());
        assert!(!WorkplanStatus::Error.is_terminal());
    }
}
