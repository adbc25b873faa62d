//! Per-schedule knobs the orchestrator needs.
//!
//! The engine does not read environment or config files itself (that is the
//! surrounding service's job); callers build one of these from whatever
//! config source they use, the same way the teacher's `ScheduleOptions`
//! builder is assembled by callers of `JobManager::schedule`.

use typed_builder::TypedBuilder;

/// Configuration for one call to [`crate::engine::WorkplanEngine::generate_workplans`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct ScheduleConfig {
    pub name: String,

    /// Anchor instant the schedule is computed from when no workplan for
    /// `name` exists yet.
    pub start_time: chrono::DateTime<chrono::Utc>,

    /// The interval between consecutive slots, in seconds.
    pub interval_in_seconds: i64,

    /// If true, backfill every missing slot since the schedule's start
    /// instead of only advancing to the next slot.
    #[builder(default)]
    pub keep_sequence: bool,

    #[builder(default = 3)]
    pub max_retries: u32,

    /// Delay, in seconds, `update_errors` waits after `finished_utc` before
    /// retrying a row.
    #[builder(default = 60)]
    pub retry_delay_seconds: i64,

    /// Fingerprint of the job definition; a hash change resets the circuit
    /// breaker.
    pub notebook_hash: String,

    #[builder(default = 3)]
    pub max_fatal_errors: u32,

    /// Either a positive count `n` (replay `[-1..-n]`) or an explicit list
    /// of strictly-negative period offsets, applied only the first time
    /// `create_next_or_none` actually creates a new slot.
    #[builder(default, setter(strip_option))]
    pub back_restarts: Option<BackRestarts>,

    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub extra: serde_json::Value,

    /// When set, this schedule's slots are generated only in response to a
    /// parent schedule's status transitions (`iter_generate_child_workplans`);
    /// everything else in `generate_workplans` is skipped.
    #[builder(default, setter(strip_option))]
    pub parent_name: Option<String>,

    #[builder(default, setter(strip_option))]
    pub status_trigger: Option<crate::model::WorkplanStatus>,
}

impl ScheduleConfig {
    pub fn step(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.interval_in_seconds)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_delay_seconds)
    }
}

/// The `back_restarts` argument to `generate_workplans`: either a count of
/// trailing periods to replay, or the explicit negative offsets themselves.
#[derive(Debug, Clone)]
pub enum BackRestarts {
    Count(u32),
    Offsets(Vec<i64>),
}
