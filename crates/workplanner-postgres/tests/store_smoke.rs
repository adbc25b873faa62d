//! Smoke tests running a small slice of the lifecycle scenarios against a
//! real Postgres container, grounded on the teacher's shared-container
//! harness (`tests/common/harness.rs`) but scoped down to this crate:
//! one container, started once, reused by every test in this binary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use workplanner_core::filter::{compile, FilterEntry, FilterValue, Operator, WorkplanField, WorkplanQuery};
use workplanner_core::store::{WorkplanPatch, WorkplanStore};
use workplanner_core::{Workplan, WorkplanStatus};
use workplanner_postgres::PostgresStore;

struct SharedInfra {
    pool: PgPool,
    _container: ContainerAsync<Postgres>,
}

static SHARED: OnceCell<SharedInfra> = OnceCell::const_new();

async fn pool() -> PgPool {
    let infra = SHARED
        .get_or_init(|| async {
            let container = Postgres::default().start().await.expect("start postgres container");
            let host = container.get_host().await.expect("container host");
            let port = container.get_host_port_ipv4(5432).await.expect("container port");
            let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
            let pool = PgPool::connect(&url).await.expect("connect to postgres");
            sqlx::migrate!("./migrations").run(&pool).await.expect("run migrations");
            SharedInfra { pool, _container: container }
        })
        .await;
    infra.pool.clone()
}

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2022-11-11T11:11:11Z").unwrap().with_timezone(&Utc)
}

fn workplan(name: &str, worktime_utc: DateTime<Utc>) -> Workplan {
    Workplan::builder().name(name).worktime_utc(worktime_utc).created_utc(now()).updated_utc(now()).build()
}

async fn fresh_store() -> (PostgresStore, String) {
    let store = PostgresStore::new(pool().await);
    let name = format!("smoke-{}", Uuid::new_v4());
    (store, name)
}

fn by_name(name: &str) -> WorkplanQuery {
    let mut filter = BTreeMap::new();
    filter.insert(
        WorkplanField::Name,
        vec![FilterEntry { value: FilterValue::Text(name.to_string()), operator: Operator::Equal }],
    );
    WorkplanQuery { filter, order_by: vec![WorkplanField::WorktimeUtc], page: Some(1), limit: 100 }
}

#[tokio::test]
async fn insert_then_get_by_id_round_trips() {
    let (store, name) = fresh_store().await;
    let w = workplan(&name, now());
    let inserted = store.insert(w.clone()).await.unwrap().expect("no conflict on a fresh name");
    let fetched = store.get_by_id(inserted.id).await.unwrap().expect("row exists");
    assert_eq!(fetched.id, w.id);
    assert_eq!(fetched.name, name);
    assert_eq!(fetched.status, WorkplanStatus::Add);
}

#[tokio::test]
async fn insert_on_existing_natural_key_returns_none() {
    let (store, name) = fresh_store().await;
    let w = workplan(&name, now());
    store.insert(w.clone()).await.unwrap().expect("first insert succeeds");

    let conflicting = Workplan::builder().name(&name).worktime_utc(w.worktime_utc).build();
    let result = store.insert(conflicting).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn select_orders_and_paginates() {
    let (store, name) = fresh_store().await;
    for offset in [0, 60, 120] {
        store.insert(workplan(&name, now() + chrono::Duration::seconds(offset))).await.unwrap();
    }

    let query = WorkplanQuery { limit: 2, ..by_name(&name) };
    let compiled = compile(&query).unwrap();
    let page = store.select(&compiled).await.unwrap();
    assert_eq!(page.len(), 2);
    assert!(page[0].worktime_utc < page[1].worktime_utc);
}

#[tokio::test]
async fn update_matching_applies_patch_and_returns_rows() {
    let (store, name) = fresh_store().await;
    store.insert(workplan(&name, now())).await.unwrap();

    let compiled = compile(&by_name(&name)).unwrap();
    let patch = WorkplanPatch { status: Some(WorkplanStatus::Queue), retries: Some(1), ..Default::default() };
    let updated = store.update_matching(&compiled, &patch).await.unwrap();

    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].status, WorkplanStatus::Queue);
    assert_eq!(updated[0].retries, 1);
}

#[tokio::test]
async fn delete_matching_removes_rows_and_count_reflects_it() {
    let (store, name) = fresh_store().await;
    store.insert(workplan(&name, now())).await.unwrap();
    store.insert(workplan(&name, now() + chrono::Duration::seconds(60))).await.unwrap();

    let compiled = compile(&by_name(&name)).unwrap();
    assert_eq!(store.count(&compiled).await.unwrap(), 2);

    let deleted = store.delete_matching(&compiled).await.unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.count(&compiled).await.unwrap(), 0);
}

#[tokio::test]
async fn rollback_discards_every_effect_performed_through_the_transaction_handle() {
    let (store, name) = fresh_store().await;
    let txn = store.begin().await.unwrap();
    txn.insert(workplan(&name, now())).await.unwrap();
    txn.rollback().await.unwrap();

    assert!(!store.exists(&name).await.unwrap());
}

#[tokio::test]
async fn commit_persists_every_effect_performed_through_the_transaction_handle() {
    let (store, name) = fresh_store().await;
    let txn = store.begin().await.unwrap();
    txn.insert(workplan(&name, now())).await.unwrap();
    txn.commit().await.unwrap();

    assert!(store.exists(&name).await.unwrap());
}

#[tokio::test]
async fn in_operator_matches_against_a_status_list() {
    let (store, name) = fresh_store().await;
    store.insert(workplan(&name, now())).await.unwrap();

    let mut filter = BTreeMap::new();
    filter.insert(
        WorkplanField::Name,
        vec![FilterEntry { value: FilterValue::Text(name.clone()), operator: Operator::Equal }],
    );
    filter.insert(
        WorkplanField::Status,
        vec![FilterEntry {
            value: FilterValue::List(vec![FilterValue::Status(WorkplanStatus::Add), FilterValue::Status(WorkplanStatus::Queue)]),
            operator: Operator::In,
        }],
    );
    let query = WorkplanQuery { filter, order_by: vec![], page: Some(1), limit: 10 };
    let compiled = compile(&query).unwrap();
    let rows = store.select(&compiled).await.unwrap();
    assert_eq!(rows.len(), 1);
}
