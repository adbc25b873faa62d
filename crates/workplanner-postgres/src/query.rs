//! Turns a storage-agnostic [`CompiledQuery`] into a dynamic `sqlx::QueryBuilder`
//! fragment, the same technique the pack's `cloud-common` repo layer uses
//! (`RowMeta::add_where_clause`) to build predicate lists without a macro
//! for every combination of filters.

use sqlx::{Postgres, QueryBuilder};
use workplanner_core::filter::{CompiledQuery, FilterValue, Operator, WorkplanField};

use crate::row::PgWorkplanStatus;

fn column_name(field: WorkplanField) -> &'static str {
    match field {
        WorkplanField::Id => "id",
        WorkplanField::Name => "name",
        WorkplanField::WorktimeUtc => "worktime_utc",
        WorkplanField::Status => "status",
        WorkplanField::Hash => "hash",
        WorkplanField::Retries => "retries",
        WorkplanField::Info => "info",
        WorkplanField::Duration => "duration",
        WorkplanField::ExpiresUtc => "expires_utc",
        WorkplanField::StartedUtc => "started_utc",
        WorkplanField::FinishedUtc => "finished_utc",
        WorkplanField::CreatedUtc => "created_utc",
        WorkplanField::UpdatedUtc => "updated_utc",
    }
}

/// Appends `WHERE <conjunction of predicates>` (or nothing, if `predicates`
/// is empty) to `builder`.
pub fn push_where(builder: &mut QueryBuilder<'_, Postgres>, predicates: &[workplanner_core::filter::Predicate]) {
    if predicates.is_empty() {
        return;
    }
    builder.push(" WHERE ");
    for (i, predicate) in predicates.iter().enumerate() {
        if i > 0 {
            builder.push(" AND ");
        }
        push_predicate(builder, predicate);
    }
}

fn push_predicate(builder: &mut QueryBuilder<'_, Postgres>, predicate: &workplanner_core::filter::Predicate) {
    let column = column_name(predicate.field);

    match (predicate.operator, &predicate.value) {
        (Operator::Equal, v) => {
            builder.push(column).push(" = ");
            push_scalar(builder, v);
        }
        (Operator::NotEqual, v) => {
            builder.push(column).push(" != ");
            push_scalar(builder, v);
        }
        (Operator::Less, v) => {
            builder.push(column).push(" < ");
            push_scalar(builder, v);
        }
        (Operator::LessOrEqual, v) => {
            builder.push(column).push(" <= ");
            push_scalar(builder, v);
        }
        (Operator::More, v) => {
            builder.push(column).push(" > ");
            push_scalar(builder, v);
        }
        (Operator::MoreOrEqual, v) => {
            builder.push(column).push(" >= ");
            push_scalar(builder, v);
        }
        (Operator::In, FilterValue::List(items)) => {
            builder.push(column).push(" = ANY(");
            push_array(builder, items);
            builder.push(")");
        }
        (Operator::NotIn, FilterValue::List(items)) => {
            builder.push("NOT (").push(column).push(" = ANY(");
            push_array(builder, items);
            builder.push("))");
        }
        (Operator::Like, FilterValue::Text(v)) => {
            builder.push(column).push(" LIKE ").push_bind(v.clone());
        }
        (Operator::NotLike, FilterValue::Text(v)) => {
            builder.push(column).push(" NOT LIKE ").push_bind(v.clone());
        }
        (Operator::Ilike, FilterValue::Text(v)) => {
            builder.push(column).push(" ILIKE ").push_bind(v.clone());
        }
        (Operator::NotIlike, FilterValue::Text(v)) => {
            builder.push(column).push(" NOT ILIKE ").push_bind(v.clone());
        }
        (Operator::Contains, FilterValue::Text(v)) => {
            builder.push(column).push(" LIKE '%' || ").push_bind(v.clone()).push(" || '%'");
        }
        (Operator::NotContains, FilterValue::Text(v)) => {
            builder
                .push(column)
                .push(" NOT LIKE '%' || ")
                .push_bind(v.clone())
                .push(" || '%'");
        }
        // The filter compiler already rejects any operator/value combination
        // that doesn't match one of the arms above (see `operator_applies`).
        _ => unreachable!("operator {:?} incompatible with its value; rejected at compile()", predicate.operator),
    }
}

fn push_scalar(builder: &mut QueryBuilder<'_, Postgres>, value: &FilterValue) {
    match value {
        FilterValue::Text(v) => {
            builder.push_bind(v.clone());
        }
        FilterValue::Int(v) => {
            builder.push_bind(*v);
        }
        FilterValue::Bool(v) => {
            builder.push_bind(*v);
        }
        FilterValue::Timestamp(v) => {
            builder.push_bind(*v);
        }
        FilterValue::Status(v) => {
            builder.push_bind(PgWorkplanStatus::from(*v));
        }
        FilterValue::Id(v) => {
            builder.push_bind(*v);
        }
        FilterValue::List(_) => unreachable!("a List value is only valid with in_/not_in_, handled separately"),
    }
}

/// Binds a homogeneous `List` value as a Postgres array literal for use with
/// `= ANY(...)`. Mixed-type lists never reach here: the compiler only
/// produces lists the engine itself builds, always of one variant.
fn push_array(builder: &mut QueryBuilder<'_, Postgres>, items: &[FilterValue]) {
    match items.first() {
        None => {
            builder.push_bind(Vec::<i64>::new());
        }
        Some(FilterValue::Text(_)) => {
            let values: Vec<String> = items
                .iter()
                .map(|v| match v {
                    FilterValue::Text(s) => s.clone(),
                    _ => unreachable!("mixed-type filter list"),
                })
                .collect();
            builder.push_bind(values);
        }
        Some(FilterValue::Int(_)) => {
            let values: Vec<i64> = items
                .iter()
                .map(|v| match v {
                    FilterValue::Int(n) => *n,
                    _ => unreachable!("mixed-type filter list"),
                })
                .collect();
            builder.push_bind(values);
        }
        Some(FilterValue::Timestamp(_)) => {
            let values: Vec<chrono::DateTime<chrono::Utc>> = items
                .iter()
                .map(|v| match v {
                    FilterValue::Timestamp(t) => *t,
                    _ => unreachable!("mixed-type filter list"),
                })
                .collect();
            builder.push_bind(values);
        }
        Some(FilterValue::Status(_)) => {
            let values: Vec<PgWorkplanStatus> = items
                .iter()
                .map(|v| match v {
                    FilterValue::Status(s) => PgWorkplanStatus::from(*s),
                    _ => unreachable!("mixed-type filter list"),
                })
                .collect();
            builder.push_bind(values);
        }
        Some(FilterValue::Id(_)) => {
            let values: Vec<uuid::Uuid> = items
                .iter()
                .map(|v| match v {
                    FilterValue::Id(id) => *id,
                    _ => unreachable!("mixed-type filter list"),
                })
                .collect();
            builder.push_bind(values);
        }
        Some(FilterValue::Bool(_)) => {
            let values: Vec<bool> = items
                .iter()
                .map(|v| match v {
                    FilterValue::Bool(b) => *b,
                    _ => unreachable!("mixed-type filter list"),
                })
                .collect();
            builder.push_bind(values);
        }
        Some(FilterValue::List(_)) => unreachable!("filter lists do not nest"),
    }
}

pub fn push_order_by(builder: &mut QueryBuilder<'_, Postgres>, order_by: &[WorkplanField]) {
    if order_by.is_empty() {
        return;
    }
    builder.push(" ORDER BY ");
    for (i, field) in order_by.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(column_name(*field));
    }
}

/// Appends `LIMIT`/`OFFSET`, clamping a negative offset (possible from
/// `compile()`'s literal formula for `page <= 0`) to zero — Postgres rejects
/// a negative `OFFSET` outright.
pub fn push_limit_offset(builder: &mut QueryBuilder<'_, Postgres>, query: &CompiledQuery) {
    builder.push(" LIMIT ").push_bind(query.limit).push(" OFFSET ").push_bind(query.offset.max(0));
}
