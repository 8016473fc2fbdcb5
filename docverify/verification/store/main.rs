//! Subject persistence contracts and implementations.

/// HTTP data-API backed store.
pub mod data_api;
/// In-memory store for tests and local runs.
pub mod memory;
/// Native document-database driver store.
pub mod mongo;

pub use data_api::{DataApiConfig, DataApiStore};
pub use memory::MemorySubjectStore;
pub use mongo::{MongoConfig, MongoSubjectStore};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::model::{fields, ObjectId, RecordSet, Subject, SubjectId, Verdict};

/// Errors emitted by subject stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Request never completed.
    #[error("store transport error: {0}")]
    Transport(String),
    /// Store answered with a non-success status.
    #[error("store returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// Response could not be interpreted.
    #[error("store response could not be decoded: {0}")]
    Decode(String),
}

/// Result of the single-flight check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Status moved to `PROCESSING`; the caller owns the run.
    Acquired,
    /// Another run already owns the subject.
    AlreadyProcessing,
    /// No such subject.
    NotFound,
}

/// Persistence operations needed by the gateway and the workflow.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Loads a subject by id.
    async fn find_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError>;

    /// Loads the record set a subject points at.
    async fn find_record_set(&self, reference: &ObjectId) -> Result<Option<RecordSet>, StoreError>;

    /// Atomically moves the subject to `PROCESSING` unless it already is.
    async fn claim_for_processing(&self, id: &SubjectId) -> Result<ClaimOutcome, StoreError>;

    /// Persists a terminal verdict, superseding `PROCESSING`.
    async fn write_verdict(&self, id: &SubjectId, verdict: &Verdict) -> Result<(), StoreError>;

    /// Returns up to `limit` raw subject documents with ids stringified.
    async fn sample_subjects(&self, limit: usize) -> Result<Vec<Value>, StoreError>;
}

/// Update document persisting a verdict.
pub(crate) fn verdict_update(verdict: &Verdict) -> Value {
    let mut set = Map::new();
    set.insert(fields::STATUS.into(), json!(verdict.status.as_str()));
    if let Some(flag) = verdict.is_system_verified {
        set.insert(fields::SYSTEM_VERIFIED.into(), json!(flag));
    }
    match &verdict.detail {
        Some(detail) => {
            set.insert(fields::DETAILS.into(), json!(detail));
            json!({ "$set": set })
        }
        None => json!({ "$set": set, "$unset": { fields::DETAILS: "" } }),
    }
}

/// Recursively replaces extended-JSON object ids (`{"$oid": "..."}`) with
/// their hex string.
#[must_use]
pub fn stringify_object_ids(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(hex)) = map.get("$oid") {
                    return Value::String(hex.clone());
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, stringify_object_ids(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(stringify_object_ids).collect()),
        other => other,
    }
}
