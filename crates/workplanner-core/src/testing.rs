//! An in-memory [`WorkplanStore`] for exercising the engine without a
//! database, in the spirit of the job package's `TestJobManager`: a
//! `RwLock`-guarded map standing in for the real backend.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::filter::{CompiledQuery, FilterValue, Operator, Predicate, WorkplanField};
use crate::model::{Workplan, WorkplanStatus};
use crate::store::{WorkplanPatch, WorkplanStore};

/// A `WorkplanStore` backed by a plain `HashMap`. `begin()` snapshots the
/// current rows into a fresh handle; `commit()` writes that snapshot back
/// into the parent; `rollback()` simply discards it.
pub struct InMemoryStore {
    rows: Arc<RwLock<HashMap<Uuid, Workplan>>>,
    parent: Option<Arc<RwLock<HashMap<Uuid, Workplan>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            parent: None,
        }
    }

    pub async fn seed(&self, workplans: impl IntoIterator<Item = Workplan>) {
        let mut rows = self.rows.write().await;
        for w in workplans {
            rows.insert(w.id, w);
        }
    }

    pub async fn all(&self) -> Vec<Workplan> {
        self.rows.read().await.values().cloned().collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_patch(w: &mut Workplan, patch: &WorkplanPatch) {
    if let Some(data) = patch.data.clone() {
        w.data = data;
    }
    if let Some(retries) = patch.retries {
        w.retries = retries;
    }
    if let Some(hash) = patch.hash.clone() {
        w.hash = hash;
    }
    if let Some(status) = patch.status {
        w.status = status;
    }
    if let Some(info) = patch.info.clone() {
        w.info = info;
    }
    if let Some(duration) = patch.duration {
        w.duration = duration;
    }
    if let Some(expires_utc) = patch.expires_utc {
        w.expires_utc = expires_utc;
    }
    if let Some(started_utc) = patch.started_utc {
        w.started_utc = started_utc;
    }
    if let Some(finished_utc) = patch.finished_utc {
        w.finished_utc = finished_utc;
    }
}

fn like_match(value: &str, pattern: &str, case_insensitive: bool) -> bool {
    let (value, pattern) = if case_insensitive {
        (value.to_lowercase(), pattern.to_lowercase())
    } else {
        (value.to_string(), pattern.to_string())
    };
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return value == pattern;
    }
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !value[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == parts.len() - 1 {
            return value[pos..].ends_with(part);
        } else if let Some(found) = value[pos..].find(part) {
            pos += found + part.len();
        } else {
            return false;
        }
    }
    true
}

fn bool_text(value: &str, predicate: &Predicate) -> bool {
    match (predicate.operator, &predicate.value) {
        (Operator::Equal, FilterValue::Text(v)) => value == v,
        (Operator::NotEqual, FilterValue::Text(v)) => value != v,
        (Operator::Less, FilterValue::Text(v)) => value < v.as_str(),
        (Operator::LessOrEqual, FilterValue::Text(v)) => value <= v.as_str(),
        (Operator::More, FilterValue::Text(v)) => value > v.as_str(),
        (Operator::MoreOrEqual, FilterValue::Text(v)) => value >= v.as_str(),
        (Operator::In, FilterValue::List(items)) => items.iter().any(|i| matches!(i, FilterValue::Text(t) if t == value)),
        (Operator::NotIn, FilterValue::List(items)) => !items.iter().any(|i| matches!(i, FilterValue::Text(t) if t == value)),
        (Operator::Like, FilterValue::Text(v)) => like_match(value, v, false),
        (Operator::NotLike, FilterValue::Text(v)) => !like_match(value, v, false),
        (Operator::Ilike, FilterValue::Text(v)) => like_match(value, v, true),
        (Operator::NotIlike, FilterValue::Text(v)) => !like_match(value, v, true),
        (Operator::Contains, FilterValue::Text(v)) => value.contains(v.as_str()),
        (Operator::NotContains, FilterValue::Text(v)) => !value.contains(v.as_str()),
        _ => false,
    }
}

fn bool_opt_text(value: Option<&str>, predicate: &Predicate) -> bool {
    match value {
        Some(v) => bool_text(v, predicate),
        None => false,
    }
}

fn bool_int(value: i64, predicate: &Predicate) -> bool {
    match (predicate.operator, &predicate.value) {
        (Operator::Equal, FilterValue::Int(v)) => value == *v,
        (Operator::NotEqual, FilterValue::Int(v)) => value != *v,
        (Operator::Less, FilterValue::Int(v)) => value < *v,
        (Operator::LessOrEqual, FilterValue::Int(v)) => value <= *v,
        (Operator::More, FilterValue::Int(v)) => value > *v,
        (Operator::MoreOrEqual, FilterValue::Int(v)) => value >= *v,
        (Operator::In, FilterValue::List(items)) => items.iter().any(|i| matches!(i, FilterValue::Int(n) if *n == value)),
        (Operator::NotIn, FilterValue::List(items)) => !items.iter().any(|i| matches!(i, FilterValue::Int(n) if *n == value)),
        _ => false,
    }
}

fn bool_opt_int(value: Option<i64>, predicate: &Predicate) -> bool {
    match value {
        Some(v) => bool_int(v, predicate),
        None => false,
    }
}

fn bool_timestamp(value: Option<DateTime<Utc>>, predicate: &Predicate) -> bool {
    let Some(value) = value else { return false };
    match (predicate.operator, &predicate.value) {
        (Operator::Equal, FilterValue::Timestamp(v)) => value == *v,
        (Operator::NotEqual, FilterValue::Timestamp(v)) => value != *v,
        (Operator::Less, FilterValue::Timestamp(v)) => value < *v,
        (Operator::LessOrEqual, FilterValue::Timestamp(v)) => value <= *v,
        (Operator::More, FilterValue::Timestamp(v)) => value > *v,
        (Operator::MoreOrEqual, FilterValue::Timestamp(v)) => value >= *v,
        (Operator::In, FilterValue::List(items)) => items.iter().any(|i| matches!(i, FilterValue::Timestamp(t) if *t == value)),
        (Operator::NotIn, FilterValue::List(items)) => !items.iter().any(|i| matches!(i, FilterValue::Timestamp(t) if *t == value)),
        _ => false,
    }
}

fn bool_status(value: WorkplanStatus, predicate: &Predicate) -> bool {
    match (predicate.operator, &predicate.value) {
        (Operator::Equal, FilterValue::Status(v)) => value == *v,
        (Operator::NotEqual, FilterValue::Status(v)) => value != *v,
        (Operator::In, FilterValue::List(items)) => items.iter().any(|i| matches!(i, FilterValue::Status(s) if *s == value)),
        (Operator::NotIn, FilterValue::List(items)) => !items.iter().any(|i| matches!(i, FilterValue::Status(s) if *s == value)),
        _ => false,
    }
}

fn bool_id(value: Uuid, predicate: &Predicate) -> bool {
    match (predicate.operator, &predicate.value) {
        (Operator::Equal, FilterValue::Id(v)) => value == *v,
        (Operator::NotEqual, FilterValue::Id(v)) => value != *v,
        (Operator::In, FilterValue::List(items)) => items.iter().any(|i| matches!(i, FilterValue::Id(id) if *id == value)),
        (Operator::NotIn, FilterValue::List(items)) => !items.iter().any(|i| matches!(i, FilterValue::Id(id) if *id == value)),
        _ => false,
    }
}

fn matches(w: &Workplan, predicate: &Predicate) -> bool {
    match predicate.field {
        WorkplanField::Id => bool_id(w.id, predicate),
        WorkplanField::Name => bool_text(&w.name, predicate),
        WorkplanField::WorktimeUtc => bool_timestamp(Some(w.worktime_utc), predicate),
        WorkplanField::Status => bool_status(w.status, predicate),
        WorkplanField::Hash => bool_text(&w.hash, predicate),
        WorkplanField::Retries => bool_int(w.retries as i64, predicate),
        WorkplanField::Info => bool_opt_text(w.info.as_deref(), predicate),
        WorkplanField::Duration => bool_opt_int(w.duration, predicate),
        WorkplanField::ExpiresUtc => bool_timestamp(w.expires_utc, predicate),
        WorkplanField::StartedUtc => bool_timestamp(w.started_utc, predicate),
        WorkplanField::FinishedUtc => bool_timestamp(w.finished_utc, predicate),
        WorkplanField::CreatedUtc => bool_timestamp(Some(w.created_utc), predicate),
        WorkplanField::UpdatedUtc => bool_timestamp(Some(w.updated_utc), predicate),
    }
}

fn compare_field(a: &Workplan, b: &Workplan, field: WorkplanField) -> Ordering {
    match field {
        WorkplanField::Id => a.id.cmp(&b.id),
        WorkplanField::Name => a.name.cmp(&b.name),
        WorkplanField::WorktimeUtc => a.worktime_utc.cmp(&b.worktime_utc),
        WorkplanField::Status => (a.status as u8).cmp(&(b.status as u8)),
        WorkplanField::Hash => a.hash.cmp(&b.hash),
        WorkplanField::Retries => a.retries.cmp(&b.retries),
        WorkplanField::Info => a.info.cmp(&b.info),
        WorkplanField::Duration => a.duration.cmp(&b.duration),
        WorkplanField::ExpiresUtc => a.expires_utc.cmp(&b.expires_utc),
        WorkplanField::StartedUtc => a.started_utc.cmp(&b.started_utc),
        WorkplanField::FinishedUtc => a.finished_utc.cmp(&b.finished_utc),
        WorkplanField::CreatedUtc => a.created_utc.cmp(&b.created_utc),
        WorkplanField::UpdatedUtc => a.updated_utc.cmp(&b.updated_utc),
    }
}

fn filter_sort_paginate(mut rows: Vec<Workplan>, query: &CompiledQuery) -> Vec<Workplan> {
    rows.retain(|w| query.predicates.iter().all(|p| matches(w, p)));
    for field in query.order_by.iter().rev() {
        rows.sort_by(|a, b| compare_field(a, b, *field));
    }
    let offset = query.offset.max(0) as usize;
    rows.into_iter().skip(offset).take(query.limit.max(0) as usize).collect()
}

#[async_trait]
impl WorkplanStore for InMemoryStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Workplan>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn get_by_pk(&self, name: &str, worktime_utc: DateTime<Utc>) -> Result<Option<Workplan>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|w| w.name == name && w.worktime_utc == worktime_utc)
            .cloned())
    }

    async fn last_by_worktime(&self, name: &str) -> Result<Option<Workplan>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|w| w.name == name)
            .max_by_key(|w| w.worktime_utc)
            .cloned())
    }

    async fn first_by_worktime(&self, name: &str) -> Result<Option<Workplan>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|w| w.name == name)
            .min_by_key(|w| w.worktime_utc)
            .cloned())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.rows.read().await.values().any(|w| w.name == name))
    }

    async fn list_worktimes(&self, name: &str) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|w| w.name == name)
            .map(|w| w.worktime_utc)
            .collect())
    }

    async fn insert(&self, workplan: Workplan) -> Result<Option<Workplan>> {
        let mut rows = self.rows.write().await;
        let conflict = rows
            .values()
            .any(|w| w.name == workplan.name && w.worktime_utc == workplan.worktime_utc);
        if conflict {
            return Ok(None);
        }
        rows.insert(workplan.id, workplan.clone());
        Ok(Some(workplan))
    }

    async fn bulk_upsert(&self, new_rows: Vec<Workplan>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let mut count = 0u64;
        for mut w in new_rows {
            let existing_id = rows
                .values()
                .find(|e| e.name == w.name && e.worktime_utc == w.worktime_utc)
                .map(|e| e.id);
            if let Some(id) = existing_id {
                w.id = id;
            }
            rows.insert(w.id, w);
            count += 1;
        }
        Ok(count)
    }

    async fn update_matching(&self, query: &CompiledQuery, patch: &WorkplanPatch) -> Result<Vec<Workplan>> {
        let mut rows = self.rows.write().await;
        let matching_ids: Vec<Uuid> = rows
            .values()
            .filter(|w| query.predicates.iter().all(|p| matches(w, p)))
            .map(|w| w.id)
            .collect();

        let mut updated = Vec::with_capacity(matching_ids.len());
        for id in matching_ids {
            if let Some(w) = rows.get_mut(&id) {
                apply_patch(w, patch);
                w.updated_utc = Utc::now();
                updated.push(w.clone());
            }
        }
        Ok(updated)
    }

    async fn delete_matching(&self, query: &CompiledQuery) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, w| !query.predicates.iter().all(|p| matches(w, p)));
        Ok((before - rows.len()) as u64)
    }

    async fn select(&self, query: &CompiledQuery) -> Result<Vec<Workplan>> {
        let rows = self.rows.read().await.values().cloned().collect();
        Ok(filter_sort_paginate(rows, query))
    }

    async fn count(&self, query: &CompiledQuery) -> Result<i64> {
        let rows = self.rows.read().await;
        Ok(rows.values().filter(|w| query.predicates.iter().all(|p| matches(w, p))).count() as i64)
    }

    async fn begin(&self) -> Result<Box<dyn WorkplanStore>> {
        let snapshot = self.rows.read().await.clone();
        Ok(Box::new(InMemoryStore {
            rows: Arc::new(RwLock::new(snapshot)),
            parent: Some(self.rows.clone()),
        }))
    }

    async fn commit(&self) -> Result<()> {
        if let Some(parent) = &self.parent {
            let snapshot = self.rows.read().await.clone();
            *parent.write().await = snapshot;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }
}
