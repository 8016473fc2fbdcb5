use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::{stringify_object_ids, ClaimOutcome, StoreError, SubjectStore};
use crate::model::{ObjectId, RecordSet, Subject, SubjectId, VerificationStatus, Verdict};

/// Thread-safe in-memory store. The claim is a compare-and-swap under one lock.
#[derive(Debug, Clone, Default)]
pub struct MemorySubjectStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    subjects: IndexMap<SubjectId, Subject>,
    record_sets: HashMap<ObjectId, RecordSet>,
    verdicts: Vec<(SubjectId, Verdict)>,
}

impl MemorySubjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a subject.
    pub fn insert_subject(&self, subject: Subject) {
        self.inner.lock().subjects.insert(subject.id.clone(), subject);
    }

    /// Inserts or replaces a record set.
    pub fn insert_record_set(&self, id: ObjectId, records: RecordSet) {
        self.inner.lock().record_sets.insert(id, records);
    }

    /// Current state of a subject.
    #[must_use]
    pub fn subject(&self, id: &SubjectId) -> Option<Subject> {
        self.inner.lock().subjects.get(id).cloned()
    }

    /// Every verdict written for a subject, oldest first.
    #[must_use]
    pub fn verdicts_for(&self, id: &SubjectId) -> Vec<Verdict> {
        self.inner
            .lock()
            .verdicts
            .iter()
            .filter(|(subject, _)| subject == id)
            .map(|(_, verdict)| verdict.clone())
            .collect()
    }
}

#[async_trait]
impl SubjectStore for MemorySubjectStore {
    async fn find_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        Ok(self.subject(id))
    }

    async fn find_record_set(&self, reference: &ObjectId) -> Result<Option<RecordSet>, StoreError> {
        Ok(self.inner.lock().record_sets.get(reference).cloned())
    }

    async fn claim_for_processing(&self, id: &SubjectId) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.inner.lock();
        Ok(match state.subjects.get_mut(id) {
            None => ClaimOutcome::NotFound,
            Some(subject) if subject.status == VerificationStatus::Processing => {
                ClaimOutcome::AlreadyProcessing
            }
            Some(subject) => {
                subject.status = VerificationStatus::Processing;
                ClaimOutcome::Acquired
            }
        })
    }

    async fn write_verdict(&self, id: &SubjectId, verdict: &Verdict) -> Result<(), StoreError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        // Matches nothing when the subject is gone, like an update on a missing key.
        if let Some(subject) = state.subjects.get_mut(id) {
            subject.status = verdict.status;
            if let Some(flag) = verdict.is_system_verified {
                subject.is_system_verified = flag;
            }
            subject.detail = verdict.detail.clone();
            state.verdicts.push((id.clone(), verdict.clone()));
        }
        Ok(())
    }

    async fn sample_subjects(&self, limit: usize) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .inner
            .lock()
            .subjects
            .values()
            .take(limit)
            .map(|subject| stringify_object_ids(subject.to_document()))
            .collect())
    }
}
