//! Input DTOs for mutating a single workplan or a batch of them.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, WorkplannerError};
use crate::store::WorkplanPatch;

/// §3.1's cap on `name`: non-empty, at most 255 bytes.
const MAX_NAME_BYTES: usize = 255;

/// How a single workplan is addressed for an update: by its primary `id`,
/// or by the `(name, worktime_utc)` natural key.
#[derive(Debug, Clone)]
pub enum WorkplanIdentity {
    Id(Uuid),
    NaturalKey { name: String, worktime_utc: DateTime<Utc> },
}

/// One partial update, as accepted by [`crate::engine::WorkplanEngine::update`]
/// and [`crate::engine::WorkplanEngine::many_update`].
#[derive(Debug, Clone)]
pub struct WorkplanUpdate {
    pub identity: WorkplanIdentity,
    pub patch: WorkplanPatch,
}

/// The fields needed to insert a brand-new workplan row. `hash` defaults to
/// empty (unspecified) and `data` to an empty object, matching [`crate::model::Workplan`]'s
/// own defaults.
#[derive(Debug, Clone)]
pub struct NewWorkplan {
    pub name: String,
    pub worktime_utc: DateTime<Utc>,
    pub hash: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl NewWorkplan {
    /// Validates `name` per §3.1 (non-empty, at most 255 bytes) before
    /// building the DTO.
    pub fn new(name: impl Into<String>, worktime_utc: DateTime<Utc>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_BYTES {
            return Err(WorkplannerError::invalid(
                "name must be non-empty and at most 255 bytes",
            ));
        }
        Ok(Self { name, worktime_utc, hash: None, data: None })
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn into_workplan(self) -> crate::model::Workplan {
        let mut builder = crate::model::Workplan::builder()
            .name(self.name)
            .worktime_utc(self.worktime_utc);
        if let Some(hash) = self.hash {
            builder = builder.hash(hash);
        }
        if let Some(data) = self.data {
            builder = builder.data(data);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2022-11-11T11:11:11Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn new_workplan_rejects_empty_name() {
        assert!(NewWorkplan::new("", now()).is_err());
    }

    #[test]
    fn new_workplan_rejects_name_over_255_bytes() {
        let name = "x".repeat(256);
        assert!(NewWorkplan::new(name, now()).is_err());
    }

    #[test]
    fn new_workplan_accepts_255_byte_name() {
        let name = "x".repeat(255);
        assert!(NewWorkplan::new(name, now()).is_ok());
    }

    #[test]
    fn into_workplan_carries_hash_and_data() {
        let w = NewWorkplan::new("A", now())
            .unwrap()
            .hash("h")
            .data(serde_json::json!({"k": 1}))
            .into_workplan();
        assert_eq!(w.hash, "h");
        assert_eq!(w.data, serde_json::json!({"k": 1}));
    }
}
