//! End-to-end scenarios for the lifecycle engine, run against `InMemoryStore`.
//!
//! `now` is fixed to `2022-11-11T11:11:11Z` throughout, matching the
//! scenarios these tests are named after.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use workplanner_core::clock::FixedClock;
use workplanner_core::config::{BackRestarts, ScheduleConfig};
use workplanner_core::engine::WorkplanEngine;
use workplanner_core::model::{Workplan, WorkplanStatus};
use workplanner_core::testing::InMemoryStore;

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2022-11-11T11:11:11Z").unwrap().with_timezone(&Utc)
}

fn engine() -> WorkplanEngine {
    WorkplanEngine::new(FixedClock(now()))
}

fn minutes(n: i64) -> DateTime<Utc> {
    now() + Duration::seconds(60 * n)
}

#[tokio::test]
async fn next_slot_creation() {
    let store = InMemoryStore::new();
    let engine = engine();

    for i in 1..=5 {
        store
            .seed([Workplan::builder().name("A").worktime_utc(minutes(i)).build()])
            .await;
    }

    assert!(!engine.is_create_next(&store, "A", Duration::seconds(60)).await.unwrap());

    let later = WorkplanEngine::new(FixedClock(minutes(6)));
    assert!(later.is_create_next(&store, "A", Duration::seconds(60)).await.unwrap());

    let created = later
        .create_next_or_none(&store, "A", Duration::seconds(60), None)
        .await
        .unwrap()
        .expect("slot should have been created");
    assert_eq!(created.worktime_utc, minutes(6));
}

#[tokio::test]
async fn backfill_gap() {
    let store = InMemoryStore::new();
    let base = now();
    for offset in [0, 60, 120, 300] {
        store
            .seed([Workplan::builder()
                .name("B")
                .worktime_utc(base + Duration::seconds(offset))
                .build()])
            .await;
    }

    let current = WorkplanEngine::new(FixedClock(base + Duration::seconds(300)));
    let created = current
        .fill_missing(
            &store,
            "B",
            Duration::seconds(60),
            base,
            Some(base + Duration::seconds(300)),
            None,
        )
        .await
        .unwrap();

    let mut worktimes: Vec<_> = created.iter().map(|w| w.worktime_utc).collect();
    worktimes.sort();
    assert_eq!(worktimes, vec![base + Duration::seconds(180), base + Duration::seconds(240)]);

    // idempotent: a second call creates nothing new.
    let again = current
        .fill_missing(
            &store,
            "B",
            Duration::seconds(60),
            base,
            Some(base + Duration::seconds(300)),
            None,
        )
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn replay_negative_list() {
    let store = InMemoryStore::new();
    let base = now();
    for offset in [0, 60, 120, 180, 240] {
        store
            .seed([Workplan::builder()
                .name("C")
                .worktime_utc(base + Duration::seconds(offset))
                .build()])
            .await;
    }

    let engine = engine();
    let recreated = engine
        .recreate_prev(
            &store,
            "C",
            &BackRestarts::Offsets(vec![-1, -3]),
            Duration::seconds(60),
            Some(base + Duration::seconds(240)),
            None,
        )
        .await
        .unwrap()
        .expect("schedule has slots");

    // offsets [-1, -3] shift by +1 to deltas [0, -2] from the `from` anchor
    // (T+240), landing on T+240 and T+120.
    let mut worktimes: Vec<_> = recreated.iter().map(|w| w.worktime_utc).collect();
    worktimes.sort();
    assert_eq!(worktimes, vec![base + Duration::seconds(120), base + Duration::seconds(240)]);
    assert!(recreated.iter().all(|w| w.retries == 0));
}

#[tokio::test]
async fn retry_gate() {
    let store = InMemoryStore::new();
    let base = now();
    let id = Uuid::new_v4();
    store
        .seed([Workplan::builder()
            .id(id)
            .name("row")
            .worktime_utc(base)
            .status(WorkplanStatus::Error)
            .finished_utc(base)
            .build()])
        .await;

    let at_5s = WorkplanEngine::new(FixedClock(base + Duration::seconds(5)));
    let affected = at_5s
        .update_errors(&store, "row", 3, Duration::seconds(10))
        .await
        .unwrap();
    assert!(affected.is_empty());

    let at_10s = WorkplanEngine::new(FixedClock(base + Duration::seconds(10)));
    let affected = at_10s
        .update_errors(&store, "row", 3, Duration::seconds(10))
        .await
        .unwrap();
    assert_eq!(affected.len(), 1);
    assert_eq!(affected[0].status, WorkplanStatus::Add);
    assert_eq!(affected[0].retries, 1);
}

#[tokio::test]
async fn circuit_breaker() {
    let store = InMemoryStore::new();
    let base = now();
    for i in 0..4 {
        store
            .seed([Workplan::builder()
                .name("D")
                .worktime_utc(base + Duration::seconds(60 * i))
                .status(WorkplanStatus::FatalError)
                .hash("h1")
                .build()])
            .await;
    }

    let engine = engine();
    assert!(!engine.is_allowed_execute(&store, "D", "h1", 3).await.unwrap());
    assert!(engine.is_allowed_execute(&store, "D", "h2", 3).await.unwrap());
}

#[tokio::test]
async fn child_generation() {
    let store = InMemoryStore::new();
    let base = now();

    for i in 0..5 {
        store
            .seed([Workplan::builder()
                .name("P")
                .worktime_utc(base + Duration::seconds(60 * i))
                .status(WorkplanStatus::Success)
                .build()])
            .await;
    }
    for i in 0..3 {
        store
            .seed([Workplan::builder()
                .name("C2")
                .worktime_utc(base + Duration::seconds(60 * i))
                .build()])
            .await;
    }

    let engine = engine();
    use futures::TryStreamExt;
    let stream = engine
        .iter_generate_child_workplans(&store, "C2", "P", WorkplanStatus::Success, None, None)
        .await
        .unwrap();
    let children: Vec<Workplan> = stream.try_collect().await.unwrap();

    let mut worktimes: Vec<_> = children.iter().map(|w| w.worktime_utc).collect();
    worktimes.sort();
    assert_eq!(
        worktimes,
        vec![base + Duration::seconds(180), base + Duration::seconds(240)]
    );
}

#[tokio::test]
async fn check_expiration_moves_non_terminal_expired_rows_to_error() {
    let store = InMemoryStore::new();
    let base = now();
    store
        .seed([Workplan::builder()
            .name("E")
            .worktime_utc(base)
            .expires_utc(base - Duration::seconds(1))
            .build()])
        .await;

    let engine = engine();
    let affected = engine.check_expiration(&store).await.unwrap();
    assert_eq!(affected.len(), 1);
    assert_eq!(affected[0].status, WorkplanStatus::Error);
    assert_eq!(affected[0].info.as_deref(), Some("expired"));
}

#[tokio::test]
async fn clear_statuses_of_lost_items_resets_in_flight_rows() {
    let store = InMemoryStore::new();
    let base = now();
    store
        .seed([
            Workplan::builder().name("F").worktime_utc(base).status(WorkplanStatus::Queue).build(),
            Workplan::builder()
                .name("F")
                .worktime_utc(base + Duration::seconds(60))
                .status(WorkplanStatus::Run)
                .build(),
        ])
        .await;

    let engine = engine();
    let reclaimed = engine.clear_statuses_of_lost_items(&store).await.unwrap();
    assert_eq!(reclaimed.len(), 2);
    assert!(reclaimed.iter().all(|w| w.status == WorkplanStatus::Add));
}

#[tokio::test]
async fn generate_workplans_orchestrates_the_full_lifecycle() {
    let store = InMemoryStore::new();
    let base = now();
    let engine = engine();

    let config = ScheduleConfig::builder()
        .name("G".to_string())
        .start_time(base)
        .interval_in_seconds(60)
        .notebook_hash("h1".to_string())
        .build();

    let first_pass = engine.generate_workplans(&store, &config).await.unwrap();
    assert_eq!(first_pass.len(), 1);
    assert_eq!(first_pass[0].worktime_utc, base);

    // second pass at the same instant is a no-op: still just the one runnable slot.
    let second_pass = engine.generate_workplans(&store, &config).await.unwrap();
    assert_eq!(second_pass.len(), 1);
    assert_eq!(second_pass[0].worktime_utc, base);
}

#[tokio::test]
async fn generate_workplans_skips_mutation_when_circuit_breaker_is_tripped() {
    let store = InMemoryStore::new();
    let base = now();
    for i in 0..5 {
        store
            .seed([Workplan::builder()
                .name("H")
                .worktime_utc(base + Duration::seconds(60 * i))
                .status(WorkplanStatus::FatalError)
                .hash("h1")
                .build()])
            .await;
    }

    let engine = engine();
    let config = ScheduleConfig::builder()
        .name("H".to_string())
        .start_time(base)
        .interval_in_seconds(60)
        .notebook_hash("h1".to_string())
        .max_fatal_errors(3)
        .build();

    let rows = engine.generate_workplans(&store, &config).await.unwrap();
    // circuit breaker tripped: no new slot, and nothing in the runnable set.
    assert!(rows.is_empty());
    assert_eq!(store.all().await.len(), 5);
}

#[tokio::test]
async fn update_by_natural_key_bumps_updated_utc() {
    use workplanner_core::schemas::{WorkplanIdentity, WorkplanUpdate};
    use workplanner_core::store::WorkplanPatch;

    let store = InMemoryStore::new();
    let base = now();
    let created_utc = base - Duration::seconds(3600);
    store
        .seed([Workplan::builder()
            .name("I")
            .worktime_utc(base)
            .created_utc(created_utc)
            .updated_utc(created_utc)
            .build()])
        .await;

    let engine = engine();
    let updated = engine
        .update(
            &store,
            &WorkplanUpdate {
                identity: WorkplanIdentity::NaturalKey {
                    name: "I".to_string(),
                    worktime_utc: base,
                },
                patch: WorkplanPatch {
                    duration: Some(Some(42)),
                    ..Default::default()
                },
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.duration, Some(42));
    assert!(updated.updated_utc > created_utc);
}

#[tokio::test]
async fn update_with_unknown_id_is_not_found() {
    use workplanner_core::error::WorkplannerError;
    use workplanner_core::schemas::{WorkplanIdentity, WorkplanUpdate};
    use workplanner_core::store::WorkplanPatch;

    let store = InMemoryStore::new();
    let engine = engine();
    let err = engine
        .update(
            &store,
            &WorkplanUpdate {
                identity: WorkplanIdentity::Id(Uuid::new_v4()),
                patch: WorkplanPatch::default(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkplannerError::NotFound));
}
