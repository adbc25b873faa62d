//! Filter document compiler.
//!
//! Translates a declarative [`WorkplanQuery`] into a [`CompiledQuery`] — a
//! storage-agnostic predicate tree, ordering, and pagination window. The
//! filter compiler never touches storage; a `workplanner-postgres` adapter
//! is what turns a `CompiledQuery` into SQL (e.g. with `sqlx::QueryBuilder`).
//! No ORM query type ever leaks back into the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkplannerError};
use crate::model::WorkplanStatus;

/// Fields the filter/order DSL is allowed to reference. Closed set so an
/// unknown field is caught at compile time, not at the SQL layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkplanField {
    Id,
    Name,
    WorktimeUtc,
    Status,
    Hash,
    Retries,
    Info,
    Duration,
    ExpiresUtc,
    StartedUtc,
    FinishedUtc,
    CreatedUtc,
    UpdatedUtc,
}

/// The closed operator set the filter DSL supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    More,
    MoreOrEqual,
    In,
    NotIn,
    Like,
    NotLike,
    Ilike,
    NotIlike,
    Contains,
    NotContains,
}

/// A scalar or list value carried by one filter entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Status(WorkplanStatus),
    Id(uuid::Uuid),
    List(Vec<FilterValue>),
}

/// One `{ value, operator }` entry within a field's filter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterEntry {
    pub value: FilterValue,
    pub operator: Operator,
}

/// The filter document accepted by `select`/`count`/`update`/`delete`.
///
/// Per-field filters are conjunctive across fields and across entries
/// within a field. Unspecified fields produce no predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkplanQuery {
    #[serde(default)]
    pub filter: BTreeMap<WorkplanField, Vec<FilterEntry>>,
    #[serde(default)]
    pub order_by: Vec<WorkplanField>,
    /// 1-based; zero or negative means "from the end".
    pub page: Option<i64>,
    pub limit: i64,
}

/// One compiled predicate: `field <operator> value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: WorkplanField,
    pub operator: Operator,
    pub value: FilterValue,
}

/// The storage-agnostic result of compiling a [`WorkplanQuery`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub predicates: Vec<Predicate>,
    pub order_by: Vec<WorkplanField>,
    pub limit: i64,
    pub offset: i64,
}

/// Whether `operator` can act on `value`'s shape at all, independent of
/// which field it targets (e.g. `like` needs text, `in_`/`not_in` need a
/// list).
fn operator_applies(operator: Operator, value: &FilterValue) -> bool {
    match operator {
        Operator::Like | Operator::NotLike | Operator::Ilike | Operator::NotIlike => {
            matches!(value, FilterValue::Text(_))
        }
        Operator::In | Operator::NotIn => matches!(value, FilterValue::List(_)),
        Operator::Contains | Operator::NotContains => {
            matches!(value, FilterValue::Text(_) | FilterValue::List(_))
        }
        Operator::Less | Operator::LessOrEqual | Operator::More | Operator::MoreOrEqual => {
            matches!(value, FilterValue::Int(_) | FilterValue::Text(_) | FilterValue::Timestamp(_))
        }
        Operator::Equal | Operator::NotEqual => true,
    }
}

/// Compile a filter document into a storage-agnostic query.
///
/// Corrected operator semantics: `less_or_equal`/`more_or_equal` compile to
/// straightforward `<=`/`>=` (an earlier variant of this compiler emitted a
/// negation for these two operators; that was a bug, not intended
/// behavior, and is not reproduced here).
pub fn compile(query: &WorkplanQuery) -> Result<CompiledQuery> {
    if query.limit <= 0 {
        return Err(WorkplannerError::invalid("limit must be strictly positive"));
    }

    let mut predicates = Vec::new();
    for (field, entries) in &query.filter {
        for entry in entries {
            if !operator_applies(entry.operator, &entry.value) {
                return Err(WorkplannerError::invalid(format!(
                    "operator {:?} is not applicable to the value supplied for field {:?}",
                    entry.operator, field
                )));
            }
            predicates.push(Predicate {
                field: *field,
                operator: entry.operator,
                value: entry.value.clone(),
            });
        }
    }

    let page = query.page.unwrap_or(1);
    let offset = if page > 0 {
        (page - 1) * query.limit
    } else {
        page * query.limit
    };

    Ok(CompiledQuery {
        predicates,
        order_by: query.order_by.clone(),
        limit: query.limit,
        offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(filter: BTreeMap<WorkplanField, Vec<FilterEntry>>, page: Option<i64>, limit: i64) -> WorkplanQuery {
        WorkplanQuery {
            filter,
            order_by: vec![],
            page,
            limit,
        }
    }

    #[test]
    fn rejects_non_positive_limit() {
        assert!(compile(&q(BTreeMap::new(), Some(1), 0)).is_err());
        assert!(compile(&q(BTreeMap::new(), Some(1), -1)).is_err());
    }

    #[test]
    fn positive_page_offsets_forward() {
        let c = compile(&q(BTreeMap::new(), Some(3), 10)).unwrap();
        assert_eq!(c.offset, 20);
    }

    #[test]
    fn non_positive_page_offsets_from_end() {
        let c = compile(&q(BTreeMap::new(), Some(0), 10)).unwrap();
        assert_eq!(c.offset, 0);

        let c = compile(&q(BTreeMap::new(), Some(-2), 10)).unwrap();
        assert_eq!(c.offset, -20);
    }

    #[test]
    fn missing_page_defaults_to_first_page() {
        let c = compile(&q(BTreeMap::new(), None, 10)).unwrap();
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn less_or_equal_and_more_or_equal_are_not_negated() {
        let mut filter = BTreeMap::new();
        filter.insert(
            WorkplanField::Retries,
            vec![FilterEntry {
                value: FilterValue::Int(3),
                operator: Operator::LessOrEqual,
            }],
        );
        let c = compile(&q(filter, Some(1), 10)).unwrap();
        assert_eq!(c.predicates[0].operator, Operator::LessOrEqual);
    }

    #[test]
    fn like_on_non_text_value_is_invalid_argument() {
        let mut filter = BTreeMap::new();
        filter.insert(
            WorkplanField::Retries,
            vec![FilterEntry {
                value: FilterValue::Int(3),
                operator: Operator::Like,
            }],
        );
        let err = compile(&q(filter, Some(1), 10)).unwrap_err();
        assert!(matches!(err, WorkplannerError::InvalidArgument(_)));
    }

    #[test]
    fn in_on_scalar_value_is_invalid_argument() {
        let mut filter = BTreeMap::new();
        filter.insert(
            WorkplanField::Name,
            vec![FilterEntry {
                value: FilterValue::Text("A".into()),
                operator: Operator::In,
            }],
        );
        assert!(compile(&q(filter, Some(1), 10)).is_err());
    }
}
