//! The workplan lifecycle engine: the scheduling algorithms from §4.4.
//!
//! `WorkplanEngine` holds no storage state of its own — every method takes
//! a `&dyn WorkplanStore` handle, so the engine is `Send + Sync` and cheap
//! to share across workers. The only state it owns is a [`Clock`], swapped
//! for a [`crate::clock::FixedClock`] in tests that fix `now`.

use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{BackRestarts, ScheduleConfig};
use crate::error::{Result, WorkplannerError};
use crate::filter::{CompiledQuery, FilterValue, Operator, Predicate, WorkplanField};
use crate::model::{Workplan, WorkplanStatus};
use crate::schemas::{NewWorkplan, WorkplanIdentity, WorkplanUpdate};
use crate::store::{WorkplanPatch, WorkplanStore};
use crate::time;

fn name_eq(name: &str) -> Predicate {
    Predicate {
        field: WorkplanField::Name,
        operator: Operator::Equal,
        value: FilterValue::Text(name.to_string()),
    }
}

fn status_eq(status: WorkplanStatus) -> Predicate {
    Predicate {
        field: WorkplanField::Status,
        operator: Operator::Equal,
        value: FilterValue::Status(status),
    }
}

fn by_id_query(id: Uuid) -> CompiledQuery {
    CompiledQuery {
        predicates: vec![Predicate {
            field: WorkplanField::Id,
            operator: Operator::Equal,
            value: FilterValue::Id(id),
        }],
        order_by: vec![],
        limit: 1,
        offset: 0,
    }
}

/// The scheduling algorithms from §4.4, generic over a time source so tests
/// can fix `now`.
pub struct WorkplanEngine {
    clock: Box<dyn Clock>,
}

impl Default for WorkplanEngine {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl WorkplanEngine {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self { clock: Box::new(clock) }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// §4.4.1 — true iff a workplan exists for `name` and `now - last.worktime_utc >= step`.
    pub async fn is_create_next(&self, store: &dyn WorkplanStore, name: &str, step: Duration) -> Result<bool> {
        if step <= Duration::zero() {
            return Err(WorkplannerError::invalid("step must be strictly positive"));
        }
        let last = store.last_by_worktime(name).await?;
        Ok(match last {
            Some(w) => self.now() - w.worktime_utc >= step,
            None => false,
        })
    }

    /// §4.4.2 — `snap_to_last_boundary(last.worktime_utc, step)`, or nothing
    /// if `name` has no workplans yet.
    pub async fn next_worktime(&self, store: &dyn WorkplanStore, name: &str, step: Duration) -> Result<Option<DateTime<Utc>>> {
        let last = store.last_by_worktime(name).await?;
        match last {
            Some(w) => Ok(Some(time::snap_to_last_boundary(w.worktime_utc, step, self.now())?)),
            None => Ok(None),
        }
    }

    /// §4.4.3 — atomically create the next slot, or nothing if it isn't
    /// due yet or another caller raced us to it.
    pub async fn create_next_or_none(
        &self,
        store: &dyn WorkplanStore,
        name: &str,
        step: Duration,
        data: Option<Value>,
    ) -> Result<Option<Workplan>> {
        if !self.is_create_next(store, name, step).await? {
            return Ok(None);
        }
        let worktime = self
            .next_worktime(store, name, step)
            .await?
            .expect("is_create_next() == true implies a workplan already exists for name");

        let mut new_workplan = NewWorkplan::new(name, worktime)?;
        if let Some(data) = data {
            new_workplan = new_workplan.data(data);
        }
        let created = store.insert(new_workplan.into_workplan()).await?;
        if let Some(w) = &created {
            tracing::info!(name, worktime = %w.worktime_utc, "created next workplan slot");
        }
        Ok(created)
    }

    /// §4.4.4 — backfill every worktime in `[start, end]` that `name` is
    /// missing. Idempotent: re-running over the same range creates nothing.
    pub async fn fill_missing(
        &self,
        store: &dyn WorkplanStore,
        name: &str,
        step: Duration,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        data: Option<Value>,
    ) -> Result<Vec<Workplan>> {
        let end = end.unwrap_or_else(|| self.now());
        let existing: std::collections::HashSet<DateTime<Utc>> =
            store.list_worktimes(name).await?.into_iter().collect();

        let mut created = Vec::new();
        for worktime in time::iter_range(start, end, step)? {
            if existing.contains(&worktime) {
                continue;
            }
            let mut new_workplan = NewWorkplan::new(name, worktime)?;
            if let Some(data) = data.clone() {
                new_workplan = new_workplan.data(data);
            }
            // A conflict here means another caller inserted the same slot
            // concurrently; treated as "already exists", not an error.
            if let Some(w) = store.insert(new_workplan.into_workplan()).await? {
                created.push(w);
            }
        }
        tracing::debug!(name, created = created.len(), "fill_missing complete");
        Ok(created)
    }

    /// §4.4.5 — force replay of past slots.
    pub async fn recreate_prev(
        &self,
        store: &dyn WorkplanStore,
        name: &str,
        offset_periods: &BackRestarts,
        step: Duration,
        from: Option<DateTime<Utc>>,
        data: Option<Value>,
    ) -> Result<Option<Vec<Workplan>>> {
        // offsets are deltas from `anchor`, not the raw values the caller passes in:
        // a count of n means "the last n boundaries including the anchor itself"
        // ([0, -1, ..., -(n-1)]), and an explicit list is shifted by +1 so that its
        // caller-facing "-1" also lands on the anchor. Mirrors the Python source's
        // `[-i for i in range(n)]` / `[i + 1 for i in offset_periods]`.
        let offsets: Vec<i64> = match offset_periods {
            BackRestarts::Count(n) => {
                if *n == 0 {
                    return Err(WorkplannerError::invalid("offset_periods count must be a positive integer"));
                }
                (0..*n as i64).map(|k| -k).collect()
            }
            BackRestarts::Offsets(list) => {
                if list.is_empty() || list.iter().any(|k| *k >= 0) {
                    return Err(WorkplannerError::invalid(
                        "offset_periods entries must all be strictly negative",
                    ));
                }
                list.iter().map(|k| k + 1).collect()
            }
        };

        let Some(first) = store.first_by_worktime(name).await? else {
            return Ok(None);
        };

        let anchor = match from {
            Some(from) => from,
            None => time::snap_to_last_boundary(first.worktime_utc, step, self.now())?,
        };

        let mut targets: Vec<DateTime<Utc>> = offsets.iter().map(|k| anchor + step * (*k as i32)).collect();
        targets.retain(|t| *t >= first.worktime_utc);

        if targets.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let delete_query = CompiledQuery {
            predicates: vec![
                name_eq(name),
                Predicate {
                    field: WorkplanField::WorktimeUtc,
                    operator: Operator::In,
                    value: FilterValue::List(targets.iter().map(|t| FilterValue::Timestamp(*t)).collect()),
                },
            ],
            order_by: vec![],
            limit: i64::MAX,
            offset: 0,
        };
        store.delete_matching(&delete_query).await?;

        let mut recreated = Vec::new();
        for (run_start, run_end) in time::group_contiguous(&targets, step) {
            let mut created = self
                .fill_missing(store, name, step, run_start, Some(run_end), data.clone())
                .await?;
            recreated.append(&mut created);
        }
        tracing::info!(name, recreated = recreated.len(), "replayed past workplan slots");
        Ok(Some(recreated))
    }

    /// §4.4.6 — circuit breaker; a hash change always resets it.
    pub async fn is_allowed_execute(
        &self,
        store: &dyn WorkplanStore,
        name: &str,
        hash: &str,
        max_fatal_errors: u32,
    ) -> Result<bool> {
        let Some(last) = store.last_by_worktime(name).await? else {
            return Ok(true);
        };
        if last.hash != hash {
            return Ok(true);
        }

        let query = CompiledQuery {
            predicates: vec![
                name_eq(name),
                Predicate {
                    field: WorkplanField::Hash,
                    operator: Operator::Equal,
                    value: FilterValue::Text(hash.to_string()),
                },
                status_eq(WorkplanStatus::FatalError),
            ],
            order_by: vec![],
            limit: i64::MAX,
            offset: 0,
        };
        let fatal_count = store.count(&query).await?;
        let allowed = fatal_count < max_fatal_errors as i64;
        if !allowed {
            tracing::info!(name, hash, fatal_count, max_fatal_errors, "circuit breaker tripped");
        }
        Ok(allowed)
    }

    /// §4.4.7 — drain retryable errors back to `ADD` once their retry delay
    /// has elapsed and their retry budget isn't exhausted.
    pub async fn update_errors(
        &self,
        store: &dyn WorkplanStore,
        name: &str,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Vec<Workplan>> {
        let now = self.now();
        let query = CompiledQuery {
            predicates: vec![
                name_eq(name),
                status_eq(WorkplanStatus::Error),
                Predicate {
                    field: WorkplanField::Retries,
                    operator: Operator::Less,
                    value: FilterValue::Int(max_retries as i64),
                },
            ],
            order_by: vec![],
            limit: i64::MAX,
            offset: 0,
        };
        let candidates = store.select(&query).await?;

        let mut affected = Vec::new();
        for w in candidates {
            if w.is_expired(now) {
                continue;
            }
            let ready = match w.finished_utc {
                None => true,
                Some(finished) => now >= finished + retry_delay,
            };
            if !ready {
                continue;
            }

            let patch = WorkplanPatch {
                retries: Some(w.retries + 1),
                status: Some(WorkplanStatus::Add),
                info: Some(None),
                duration: Some(None),
                ..Default::default()
            };
            let mut updated = store.update_matching(&by_id_query(w.id), &patch).await?;
            affected.append(&mut updated);
        }
        tracing::debug!(name, affected = affected.len(), "update_errors complete");
        Ok(affected)
    }

    /// §4.4.8 — move any non-terminal expired row to `ERROR`.
    pub async fn check_expiration(&self, store: &dyn WorkplanStore) -> Result<Vec<Workplan>> {
        let now = self.now();
        let query = CompiledQuery {
            predicates: vec![Predicate {
                field: WorkplanField::Status,
                operator: Operator::NotIn,
                value: FilterValue::List(vec![
                    FilterValue::Status(WorkplanStatus::Success),
                    FilterValue::Status(WorkplanStatus::FatalError),
                ]),
            }],
            order_by: vec![],
            limit: i64::MAX,
            offset: 0,
        };
        let candidates = store.select(&query).await?;

        let mut affected = Vec::new();
        for w in candidates {
            if !w.is_expired(now) {
                continue;
            }
            let patch = WorkplanPatch {
                status: Some(WorkplanStatus::Error),
                info: Some(Some("expired".to_string())),
                ..Default::default()
            };
            let mut updated = store.update_matching(&by_id_query(w.id), &patch).await?;
            affected.append(&mut updated);
        }
        if !affected.is_empty() {
            tracing::info!(count = affected.len(), "expired workplan slots");
        }
        Ok(affected)
    }

    /// §4.4.9 — run at service start; reclaims work left in-flight by a
    /// previous, now-dead process.
    pub async fn clear_statuses_of_lost_items(&self, store: &dyn WorkplanStore) -> Result<Vec<Workplan>> {
        let query = CompiledQuery {
            predicates: vec![Predicate {
                field: WorkplanField::Status,
                operator: Operator::In,
                value: FilterValue::List(vec![
                    FilterValue::Status(WorkplanStatus::Queue),
                    FilterValue::Status(WorkplanStatus::Run),
                ]),
            }],
            order_by: vec![],
            limit: i64::MAX,
            offset: 0,
        };
        let patch = WorkplanPatch {
            status: Some(WorkplanStatus::Add),
            ..Default::default()
        };
        let reclaimed = store.update_matching(&query, &patch).await?;
        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "reclaimed lost in-flight workplans");
        }
        Ok(reclaimed)
    }

    /// §4.4.10 — lazily generate the children of a dependency-driven
    /// schedule. Parent worktimes are materialized up front (not held open
    /// as a live cursor) so the stream can be consumed inside the same
    /// transactional scope that performs the inserts.
    pub async fn iter_generate_child_workplans<'a>(
        &'a self,
        store: &'a dyn WorkplanStore,
        name: &'a str,
        parent_name: &str,
        status_trigger: WorkplanStatus,
        from: Option<DateTime<Utc>>,
        data: Option<Value>,
    ) -> Result<impl Stream<Item = Result<Workplan>> + 'a> {
        let mut predicates = vec![name_eq(parent_name), status_eq(status_trigger)];
        if let Some(from) = from {
            predicates.push(Predicate {
                field: WorkplanField::WorktimeUtc,
                operator: Operator::MoreOrEqual,
                value: FilterValue::Timestamp(from),
            });
        }
        let parent_query = CompiledQuery {
            predicates,
            order_by: vec![WorkplanField::WorktimeUtc],
            limit: i64::MAX,
            offset: 0,
        };
        let parents = store.select(&parent_query).await?;
        let existing_children: std::collections::HashSet<DateTime<Utc>> =
            store.list_worktimes(name).await?.into_iter().collect();

        let pending: Vec<DateTime<Utc>> = parents
            .into_iter()
            .map(|p| p.worktime_utc)
            .filter(|worktime| !existing_children.contains(worktime))
            .collect();

        let name = name.to_string();
        Ok(futures::stream::iter(pending).then(move |worktime| {
            let name = name.clone();
            let data = data.clone();
            async move {
                let mut new_workplan = NewWorkplan::new(name, worktime)?;
                if let Some(data) = data {
                    new_workplan = new_workplan.data(data);
                }
                match store.insert(new_workplan.into_workplan()).await? {
                    Some(w) => Ok(w),
                    None => Err(WorkplannerError::Conflict),
                }
            }
        }))
    }

    /// §4.4.11 — the orchestrator. Opens the outer transactional scope and
    /// runs every sub-step against it; a failure anywhere rolls the whole
    /// call back.
    pub async fn generate_workplans(&self, store: &dyn WorkplanStore, config: &ScheduleConfig) -> Result<Vec<Workplan>> {
        let txn = store.begin().await?;
        match self.generate_workplans_inner(txn.as_ref(), config).await {
            Ok(rows) => {
                txn.commit().await?;
                Ok(rows)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    // `store.begin()` returns a `Box<dyn WorkplanStore>`, so `txn.as_ref()`
    // below is already the `&dyn WorkplanStore` the sub-steps expect — no
    // trait-object upcasting required.

    async fn generate_workplans_inner(&self, txn: &dyn WorkplanStore, config: &ScheduleConfig) -> Result<Vec<Workplan>> {
        let step = config.step();

        if let Some(parent_name) = &config.parent_name {
            let status_trigger = config
                .status_trigger
                .ok_or_else(|| WorkplannerError::invalid("status_trigger is required when parent_name is set"))?;
            let stream = self
                .iter_generate_child_workplans(
                    txn,
                    &config.name,
                    parent_name,
                    status_trigger,
                    None,
                    Some(config.extra.clone()),
                )
                .await?;
            return stream.try_collect().await;
        }

        if !self
            .is_allowed_execute(txn, &config.name, &config.notebook_hash, config.max_fatal_errors)
            .await?
        {
            return self.execute_list(txn, &config.name).await;
        }

        if config.keep_sequence {
            self.fill_missing(txn, &config.name, step, config.start_time, None, Some(config.extra.clone()))
                .await?;
        } else if !txn.exists(&config.name).await? {
            let worktime = time::snap_to_last_boundary(config.start_time, step, self.now())?;
            let new_workplan = NewWorkplan::new(config.name.clone(), worktime)?.data(config.extra.clone());
            txn.insert(new_workplan.into_workplan()).await?;
        } else {
            let created = self
                .create_next_or_none(txn, &config.name, step, Some(config.extra.clone()))
                .await?;
            if created.is_some() {
                if let Some(back_restarts) = &config.back_restarts {
                    self.recreate_prev(txn, &config.name, back_restarts, step, None, Some(config.extra.clone()))
                        .await?;
                }
            }
        }

        self.update_errors(txn, &config.name, config.max_retries, config.retry_delay()).await?;
        self.check_expiration(txn).await?;

        self.execute_list(txn, &config.name).await
    }

    /// §4.4.12 — the runnable set, newest worktime first.
    pub async fn execute_list(&self, store: &dyn WorkplanStore, name: &str) -> Result<Vec<Workplan>> {
        let now = self.now();
        let query = CompiledQuery {
            predicates: vec![name_eq(name), status_eq(WorkplanStatus::Add)],
            order_by: vec![WorkplanField::WorktimeUtc],
            limit: i64::MAX,
            offset: 0,
        };
        let mut rows = store.select(&query).await?;
        rows.retain(|w| !w.is_expired(now));
        rows.sort_by(|a, b| b.worktime_utc.cmp(&a.worktime_utc));
        Ok(rows)
    }

    /// Resolve an identity to its row or fail with `NotFound` — the
    /// `find_by_pk_or_404` convenience used pervasively before mutating a
    /// single slot.
    pub async fn get_or_not_found(&self, store: &dyn WorkplanStore, identity: &WorkplanIdentity) -> Result<Workplan> {
        let existing = match identity {
            WorkplanIdentity::Id(id) => store.get_by_id(*id).await?,
            WorkplanIdentity::NaturalKey { name, worktime_utc } => store.get_by_pk(name, *worktime_utc).await?,
        };
        existing.ok_or(WorkplannerError::NotFound)
    }

    /// §4.4.13 — manually re-queue a single slot.
    pub async fn run(&self, store: &dyn WorkplanStore, id: Uuid) -> Result<Option<Workplan>> {
        let existing = match self.get_or_not_found(store, &WorkplanIdentity::Id(id)).await {
            Ok(w) => w,
            Err(WorkplannerError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        let patch = WorkplanPatch {
            retries: Some(existing.retries + 1),
            status: Some(WorkplanStatus::Add),
            ..Default::default()
        };
        let updated = store.update_matching(&by_id_query(id), &patch).await?;
        Ok(updated.into_iter().next())
    }

    /// §4.4.14 — partial update by `id` if present, else by `(name, worktime_utc)`.
    pub async fn update(&self, store: &dyn WorkplanStore, schema: &WorkplanUpdate) -> Result<Workplan> {
        let existing = self.get_or_not_found(store, &schema.identity).await?;
        let updated = store.update_matching(&by_id_query(existing.id), &schema.patch).await?;
        updated.into_iter().next().ok_or(WorkplannerError::NotFound)
    }

    /// §4.4.14 — apply every patch inside one transactional scope; either
    /// all of them land or none do.
    pub async fn many_update(&self, store: &dyn WorkplanStore, schemas: &[WorkplanUpdate]) -> Result<Vec<Workplan>> {
        let txn = store.begin().await?;
        let mut results = Vec::with_capacity(schemas.len());
        for schema in schemas {
            match self.update(txn.as_ref(), schema).await {
                Ok(w) => results.push(w),
                Err(err) => {
                    let _ = txn.rollback().await;
                    return Err(err);
                }
            }
        }
        txn.commit().await?;
        Ok(results)
    }
}
