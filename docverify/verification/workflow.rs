use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use anyhow::{anyhow, Result};
use futures::FutureExt;
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    extractor::{ExtractError, TextExtractor},
    fetcher::{DocumentFetcher, FetchError},
    model::{ObjectId, Record, SubjectId, VerificationOutcome, Verdict},
    notifier::{Notification, Notifier},
    oracle::{render_prompt, MatchClaim, MatchOracle, MatchVerdict, OracleError, GRADE_FIELD},
    store::{StoreError, SubjectStore},
    telemetry::VerificationTelemetry,
};

/// Why a single slot failed. Slot failures are recorded in the aggregate and
/// never end the run.
#[derive(Debug, Error)]
pub enum SlotFailure {
    /// Document could not be downloaded.
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    /// Document could not be parsed.
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    /// Expected value or subject name missing, so no match was attempted.
    #[error("expected value or subject name missing")]
    MissingExpectation,
    /// Oracle did not confirm the document.
    #[error("document rejected by oracle")]
    Rejected,
    /// Oracle could not be consulted.
    #[error("oracle failed: {0}")]
    Oracle(#[from] OracleError),
    /// Anything else, including panics.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl SlotFailure {
    /// Short machine-readable kind used in audit records.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Extract(_) => "extract",
            Self::MissingExpectation => "missing_expectation",
            Self::Rejected => "rejected",
            Self::Oracle(_) => "oracle",
            Self::Unexpected(_) => "unexpected",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    /// Every slot was considered and the verdict persisted.
    Finalized(Verdict),
    /// Subject does not exist; nothing was written.
    SubjectMissing,
    /// Record set could not be resolved; a failed verdict was persisted.
    RecordsUnavailable,
    /// The run failed outside the slot loop.
    SystemError {
        /// Whether the generic failed verdict reached the store.
        persisted: bool,
    },
}

impl RunReport {
    /// Label used in events.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Finalized(_) => "finalized",
            Self::SubjectMissing => "subject_missing",
            Self::RecordsUnavailable => "records_unavailable",
            Self::SystemError { .. } => "system_error",
        }
    }
}

/// Builder wiring a workflow's collaborators.
#[derive(Default)]
pub struct VerificationWorkflowBuilder {
    store: Option<Arc<dyn SubjectStore>>,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
    extractor: Option<Arc<dyn TextExtractor>>,
    oracle: Option<Arc<dyn MatchOracle>>,
    notifier: Option<Arc<dyn Notifier>>,
    telemetry: Option<VerificationTelemetry>,
}

impl VerificationWorkflowBuilder {
    /// Sets the subject store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn SubjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the document fetcher.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Sets the text extractor.
    #[must_use]
    pub fn extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Sets the match oracle.
    #[must_use]
    pub fn oracle(mut self, oracle: Arc<dyn MatchOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Enables outcome notifications.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sets telemetry; defaults to tracing only.
    #[must_use]
    pub fn telemetry(mut self, telemetry: VerificationTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<VerificationWorkflow> {
        Ok(VerificationWorkflow {
            store: self.store.ok_or_else(|| anyhow!("workflow requires a subject store"))?,
            fetcher: self.fetcher.ok_or_else(|| anyhow!("workflow requires a document fetcher"))?,
            extractor: self.extractor.ok_or_else(|| anyhow!("workflow requires a text extractor"))?,
            oracle: self.oracle.ok_or_else(|| anyhow!("workflow requires a match oracle"))?,
            notifier: self.notifier,
            telemetry: self
                .telemetry
                .unwrap_or_else(|| VerificationTelemetry::tracing_only("verification")),
        })
    }
}

/// Per-subject verification run: walks every slot in order, isolates slot
/// failures, and always ends with a persisted terminal status when the
/// subject exists.
#[derive(Clone)]
pub struct VerificationWorkflow {
    store: Arc<dyn SubjectStore>,
    fetcher: Arc<dyn DocumentFetcher>,
    extractor: Arc<dyn TextExtractor>,
    oracle: Arc<dyn MatchOracle>,
    notifier: Option<Arc<dyn Notifier>>,
    telemetry: VerificationTelemetry,
}

impl std::fmt::Debug for VerificationWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationWorkflow")
            .field("notifier", &self.notifier.is_some())
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

impl VerificationWorkflow {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> VerificationWorkflowBuilder {
        VerificationWorkflowBuilder::default()
    }

    /// Store the workflow persists to.
    #[must_use]
    pub fn store(&self) -> Arc<dyn SubjectStore> {
        Arc::clone(&self.store)
    }

    /// Telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> &VerificationTelemetry {
        &self.telemetry
    }

    /// Runs verification for a subject whose claim is already held.
    pub async fn run(&self, id: &SubjectId) -> RunReport {
        self.telemetry
            .log(LogLevel::Info, "verification.run.start", Some(id), json!({}));
        let report = match AssertUnwindSafe(self.execute(id)).catch_unwind().await {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => self.recover(id, &err.to_string()).await,
            Err(panic) => self.recover(id, &panic_message(&*panic)).await,
        };
        let (status, detail) = match &report {
            RunReport::Finalized(verdict) => (Some(verdict.status.as_str()), verdict.detail.clone()),
            _ => (None, None),
        };
        self.telemetry
            .event(
                "verification.completed",
                json!({
                    "subjectId": id.as_str(),
                    "outcome": report.label(),
                    "status": status,
                    "detail": detail,
                }),
            )
            .await;
        report
    }

    async fn execute(&self, id: &SubjectId) -> Result<RunReport, StoreError> {
        let Some(subject) = self.store.find_subject(id).await? else {
            self.telemetry.log(
                LogLevel::Error,
                "verification.run.aborted",
                Some(id),
                json!({ "reason": "subject not found" }),
            );
            return Ok(RunReport::SubjectMissing);
        };

        let reference = subject
            .records_reference
            .as_deref()
            .and_then(|raw| ObjectId::parse(raw).ok());
        let records = match reference {
            Some(reference) => self.store.find_record_set(&reference).await?,
            None => None,
        };
        let Some(records) = records else {
            self.telemetry.log(
                LogLevel::Error,
                "verification.run.aborted",
                Some(id),
                json!({
                    "reason": "record set unresolvable",
                    "reference": subject.records_reference,
                }),
            );
            self.store
                .write_verdict(id, &Verdict::records_unavailable())
                .await?;
            return Ok(RunReport::RecordsUnavailable);
        };

        let name = subject.name.as_deref();
        let mut outcome = VerificationOutcome::default();
        for record in records.records() {
            if !record.is_submitted() {
                self.telemetry.log(
                    LogLevel::Debug,
                    "verification.slot.skipped",
                    Some(id),
                    json!({ "slot": record.slot }),
                );
                continue;
            }
            outcome.mark_document_found();
            let result = AssertUnwindSafe(self.verify_slot(id, name, record))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(SlotFailure::Unexpected(panic_message(&*panic))));
            match result {
                Ok(()) => {
                    self.telemetry.log(
                        LogLevel::Info,
                        "verification.slot.confirmed",
                        Some(id),
                        json!({ "slot": record.slot }),
                    );
                    outcome.record_confirmed(record.slot);
                }
                Err(failure) => {
                    self.telemetry.log(
                        LogLevel::Warn,
                        "verification.slot.failed",
                        Some(id),
                        json!({
                            "slot": record.slot,
                            "kind": failure.kind(),
                            "reason": failure.to_string(),
                        }),
                    );
                    outcome.record_failure(record.slot);
                }
            }
        }

        let summary = json!({
            "submitted": records.submitted_count(),
            "documents_found": outcome.any_document_found(),
            "confirmed": outcome.confirmed_slots(),
            "failed": outcome.failed_slots(),
        });
        let verdict = outcome.into_verdict();
        self.store.write_verdict(id, &verdict).await?;
        self.telemetry.log(
            LogLevel::Info,
            "verification.run.finalized",
            Some(id),
            json!({
                "status": verdict.status.as_str(),
                "detail": verdict.detail,
                "slots": summary,
            }),
        );
        self.notify(id, subject.email.as_deref(), &verdict);
        Ok(RunReport::Finalized(verdict))
    }

    async fn verify_slot(
        &self,
        id: &SubjectId,
        name: Option<&str>,
        record: &Record,
    ) -> Result<(), SlotFailure> {
        let reference = record
            .document_reference
            .as_deref()
            .ok_or(SlotFailure::MissingExpectation)?;
        let bytes = self.fetcher.fetch(reference).await?;

        let extractor = Arc::clone(&self.extractor);
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&bytes))
            .await
            .map_err(|err| SlotFailure::Unexpected(err.to_string()))??;
        if !extracted.failed_pages.is_empty() {
            self.telemetry.log(
                LogLevel::Debug,
                "verification.slot.partial_text",
                Some(id),
                json!({
                    "slot": record.slot,
                    "page_count": extracted.page_count,
                    "failed_pages": extracted.failed_pages,
                }),
            );
        }
        if !extracted.has_text() {
            // Still consulted: the oracle owns the verdict.
            self.telemetry.log(
                LogLevel::Warn,
                "verification.slot.empty_text",
                Some(id),
                json!({ "slot": record.slot, "page_count": extracted.page_count }),
            );
        }

        let (Some(name), Some(expected)) = (name, record.expected_value.as_deref()) else {
            return Err(SlotFailure::MissingExpectation);
        };
        let claim = MatchClaim::new(name, extracted.text).with_expected(GRADE_FIELD, expected);
        self.telemetry.log(
            LogLevel::Info,
            "verification.oracle.request",
            Some(id),
            json!({ "slot": record.slot, "request": render_prompt(&claim) }),
        );
        let decision = self.oracle.evaluate(&claim).await?;
        self.telemetry.log(
            LogLevel::Info,
            "verification.oracle.response",
            Some(id),
            json!({
                "slot": record.slot,
                "raw_response": decision.raw_response,
                "verdict": decision.verdict,
            }),
        );
        match decision.verdict {
            MatchVerdict::Confirmed => Ok(()),
            MatchVerdict::Rejected => Err(SlotFailure::Rejected),
        }
    }

    async fn recover(&self, id: &SubjectId, reason: &str) -> RunReport {
        // The store may be what panicked; the release write must not unwind
        // past the run.
        let write = AssertUnwindSafe(self.store.write_verdict(id, &Verdict::system_error()))
            .catch_unwind()
            .await;
        let error = match write {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(panic) => Some(panic_message(&*panic)),
        };
        let persisted = error.is_none();
        if let Some(error) = error {
            self.telemetry.log(
                LogLevel::Error,
                "verification.run.unpersisted",
                Some(id),
                json!({ "error": error }),
            );
        }
        self.telemetry.log(
            LogLevel::Error,
            "verification.run.system_error",
            Some(id),
            json!({ "reason": reason, "persisted": persisted }),
        );
        RunReport::SystemError { persisted }
    }

    fn notify(&self, id: &SubjectId, recipient: Option<&str>, verdict: &Verdict) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let Some(recipient) = recipient else {
            self.telemetry.log(
                LogLevel::Debug,
                "verification.notify.skipped",
                Some(id),
                json!({ "reason": "no recipient" }),
            );
            return;
        };
        let notification = Notification::new(recipient, id, verdict.summary());
        let telemetry = self.telemetry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&notification).await {
                telemetry.log(
                    LogLevel::Warn,
                    "verification.notify.failed",
                    Some(&id),
                    json!({ "error": err.to_string() }),
                );
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic without message".to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        extractor::{tests::pdf_from_pages, ExtractedDocument, PdfTextExtractor},
        model::{RecordSet, Subject, VerificationStatus, NO_DOCUMENTS_DETAIL},
        notifier::NotifyError,
        oracle::{KeywordOracle, OracleDecision},
        store::{ClaimOutcome, MemorySubjectStore},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::MemoryLogSink;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::mpsc;

    pub(crate) const SUBJECT: &str = "64b7f0c2a1b2c3d4e5f60718";
    pub(crate) const RECORDS: &str = "64b7f0c2a1b2c3d4e5f60719";

    pub(crate) fn subject_id() -> SubjectId {
        SubjectId::parse(SUBJECT).unwrap()
    }

    pub(crate) fn doc(name: &str) -> String {
        format!("https://drive.google.com/file/d/{name}/view")
    }

    /// Serves canned documents; `panic` references panic.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        documents: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn with(self, name: &str, text: &str) -> Self {
            self.with_bytes(name, text.as_bytes().to_vec())
        }

        pub(crate) fn with_bytes(mut self, name: &str, bytes: Vec<u8>) -> Self {
            self.documents.insert(doc(name), bytes);
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl DocumentFetcher for ScriptedFetcher {
        async fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.lock().push(reference.to_string());
            assert!(!reference.contains("/d/panic/"), "fetcher exploded");
            self.documents
                .get(reference)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(reference.to_string()))
        }
    }

    /// Treats bytes as text; bytes starting with `%BAD` are unreadable.
    pub(crate) struct PlainTextExtractor;

    impl TextExtractor for PlainTextExtractor {
        fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
            if bytes.starts_with(b"%BAD") {
                return Err(ExtractError::Unreadable("corrupt".into()));
            }
            Ok(ExtractedDocument {
                text: String::from_utf8_lossy(bytes).into_owned(),
                page_count: 1,
                failed_pages: Vec::new(),
            })
        }
    }

    /// Answers with a fixed response and counts calls.
    struct FixedOracle {
        response: &'static str,
        calls: AtomicUsize,
    }

    impl FixedOracle {
        fn new(response: &'static str) -> Self {
            Self {
                response,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MatchOracle for FixedOracle {
        async fn evaluate(&self, claim: &MatchClaim) -> Result<OracleDecision, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(OracleDecision::from_exchange(
                render_prompt(claim),
                self.response.to_string(),
            ))
        }
    }

    /// Store whose first `failures` verdict writes fail.
    struct FlakyStore {
        inner: MemorySubjectStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl SubjectStore for FlakyStore {
        async fn find_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
            self.inner.find_subject(id).await
        }

        async fn find_record_set(&self, reference: &ObjectId) -> Result<Option<RecordSet>, StoreError> {
            self.inner.find_record_set(reference).await
        }

        async fn claim_for_processing(&self, id: &SubjectId) -> Result<ClaimOutcome, StoreError> {
            self.inner.claim_for_processing(id).await
        }

        async fn write_verdict(&self, id: &SubjectId, verdict: &Verdict) -> Result<(), StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Transport("connection reset".into()));
            }
            self.inner.write_verdict(id, verdict).await
        }

        async fn sample_subjects(&self, limit: usize) -> Result<Vec<Value>, StoreError> {
            self.inner.sample_subjects(limit).await
        }
    }

    /// Store whose reads panic; writes panic too when `writes_panic` is set.
    struct PanickingStore {
        inner: MemorySubjectStore,
        writes_panic: bool,
    }

    #[async_trait]
    impl SubjectStore for PanickingStore {
        async fn find_subject(&self, _id: &SubjectId) -> Result<Option<Subject>, StoreError> {
            panic!("byte index 512 is not a char boundary");
        }

        async fn find_record_set(&self, reference: &ObjectId) -> Result<Option<RecordSet>, StoreError> {
            self.inner.find_record_set(reference).await
        }

        async fn claim_for_processing(&self, id: &SubjectId) -> Result<ClaimOutcome, StoreError> {
            self.inner.claim_for_processing(id).await
        }

        async fn write_verdict(&self, id: &SubjectId, verdict: &Verdict) -> Result<(), StoreError> {
            assert!(!self.writes_panic, "store write panicked");
            self.inner.write_verdict(id, verdict).await
        }

        async fn sample_subjects(&self, limit: usize) -> Result<Vec<Value>, StoreError> {
            self.inner.sample_subjects(limit).await
        }
    }

    struct ChannelNotifier(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.0
                .send(notification.clone())
                .map_err(|err| NotifyError::Transport(err.to_string()))
        }
    }

    pub(crate) fn seeded_store(records: RecordSet) -> MemorySubjectStore {
        let store = MemorySubjectStore::new();
        store.insert_subject(
            Subject::new(subject_id(), "Alice")
                .with_email("alice@example.com")
                .with_records_reference(RECORDS)
                .with_status(VerificationStatus::Processing),
        );
        store.insert_record_set(ObjectId::parse(RECORDS).unwrap(), records);
        store
    }

    fn workflow(
        store: Arc<dyn SubjectStore>,
        fetcher: Arc<dyn DocumentFetcher>,
        oracle: Arc<dyn MatchOracle>,
    ) -> VerificationWorkflow {
        VerificationWorkflow::builder()
            .store(store)
            .fetcher(fetcher)
            .extractor(Arc::new(PlainTextExtractor))
            .oracle(oracle)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn confirmed_document_verifies_subject() {
        let store = seeded_store(RecordSet::empty().with_slot(1, Some(&doc("a")), Some("9.0")));
        let fetcher = Arc::new(ScriptedFetcher::default().with("a", "Name: Alice\nSGPI: 9.0"));
        let report = workflow(Arc::new(store.clone()), fetcher, Arc::new(KeywordOracle))
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::Finalized(Verdict::verified()));
        let subject = store.subject(&subject_id()).unwrap();
        assert_eq!(subject.status, VerificationStatus::Verified);
        assert!(subject.is_system_verified);
        assert!(subject.detail.is_none());
    }

    #[tokio::test]
    async fn rejected_document_fails_its_slot() {
        let store = seeded_store(RecordSet::empty().with_slot(1, Some(&doc("a")), Some("9.0")));
        let fetcher = Arc::new(ScriptedFetcher::default().with("a", "Name: Alice\nSGPI: 9.0"));
        let report = workflow(
            Arc::new(store.clone()),
            fetcher,
            Arc::new(FixedOracle::new("NOT MATCHED")),
        )
        .run(&subject_id())
        .await;

        assert_eq!(report, RunReport::Finalized(Verdict::failed_slots(&[1])));
        let subject = store.subject(&subject_id()).unwrap();
        assert_eq!(subject.status, VerificationStatus::Failed);
        assert_eq!(subject.detail.as_deref(), Some("failed semesters: [1]"));
        assert!(!subject.is_system_verified);
    }

    #[tokio::test]
    async fn no_submitted_documents_fails_without_consulting_oracle() {
        let store = seeded_store(
            RecordSet::empty()
                .with_slot(1, None, Some("9.0"))
                .with_slot(2, None, Some("8.0")),
        );
        let oracle = Arc::new(FixedOracle::new("MATCHED"));
        let fetcher = Arc::new(ScriptedFetcher::default());
        let report = workflow(Arc::new(store.clone()), fetcher.clone(), oracle.clone())
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::Finalized(Verdict::no_documents()));
        assert_eq!(
            store.subject(&subject_id()).unwrap().detail.as_deref(),
            Some(NO_DOCUMENTS_DETAIL)
        );
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_does_not_stop_later_slots() {
        let mut records = RecordSet::empty();
        let mut fetcher = ScriptedFetcher::default();
        for slot in 1..=8 {
            let name = format!("sem{slot}");
            records = records.with_slot(slot, Some(&doc(&name)), Some("9.0"));
            if slot != 3 {
                fetcher = fetcher.with(&name, "Alice 9.0");
            }
        }
        let store = seeded_store(records);
        let fetcher = Arc::new(fetcher);
        let report = workflow(Arc::new(store), fetcher.clone(), Arc::new(KeywordOracle))
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::Finalized(Verdict::failed_slots(&[3])));
        let expected: Vec<String> = (1..=8).map(|slot| doc(&format!("sem{slot}"))).collect();
        assert_eq!(fetcher.calls(), expected);
    }

    #[tokio::test]
    async fn failed_slots_exclude_unsubmitted_ones() {
        let store = seeded_store(
            RecordSet::empty()
                .with_slot(1, Some(&doc("ok")), Some("9.0"))
                .with_slot(2, None, Some("9.1"))
                .with_slot(4, Some(&doc("nograde")), None)
                .with_slot(5, Some(&doc("corrupt")), Some("7.0"))
                .with_slot(6, Some(&doc("other")), Some("8.0")),
        );
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with("ok", "Alice 9.0")
                .with("nograde", "Alice 9.0")
                .with("corrupt", "%BAD")
                .with("other", "Bob 8.0"),
        );
        let report = workflow(Arc::new(store), fetcher, Arc::new(KeywordOracle))
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::Finalized(Verdict::failed_slots(&[4, 5, 6])));
    }

    #[tokio::test]
    async fn panicking_slot_is_isolated() {
        let store = seeded_store(
            RecordSet::empty()
                .with_slot(1, Some(&doc("a")), Some("9.0"))
                .with_slot(2, Some(&doc("panic")), Some("9.0"))
                .with_slot(3, Some(&doc("a")), Some("9.0")),
        );
        let fetcher = Arc::new(ScriptedFetcher::default().with("a", "Alice 9.0"));
        let report = workflow(Arc::new(store), fetcher.clone(), Arc::new(KeywordOracle))
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::Finalized(Verdict::failed_slots(&[2])));
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn missing_subject_writes_nothing() {
        let store = MemorySubjectStore::new();
        let report = workflow(
            Arc::new(store.clone()),
            Arc::new(ScriptedFetcher::default()),
            Arc::new(KeywordOracle),
        )
        .run(&subject_id())
        .await;

        assert_eq!(report, RunReport::SubjectMissing);
        assert!(store.verdicts_for(&subject_id()).is_empty());
    }

    #[tokio::test]
    async fn unresolvable_record_set_releases_subject() {
        let store = MemorySubjectStore::new();
        store.insert_subject(
            Subject::new(subject_id(), "Alice")
                .with_records_reference(RECORDS)
                .with_status(VerificationStatus::Processing),
        );
        let report = workflow(
            Arc::new(store.clone()),
            Arc::new(ScriptedFetcher::default()),
            Arc::new(KeywordOracle),
        )
        .run(&subject_id())
        .await;

        assert_eq!(report, RunReport::RecordsUnavailable);
        let subject = store.subject(&subject_id()).unwrap();
        assert_eq!(subject.status, VerificationStatus::Failed);
        assert_eq!(subject.detail.as_deref(), Some("records unavailable"));
    }

    #[tokio::test]
    async fn store_failure_is_recovered_as_system_error() {
        let inner = seeded_store(RecordSet::empty().with_slot(1, Some(&doc("a")), Some("9.0")));
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures: AtomicUsize::new(1),
        });
        let fetcher = Arc::new(ScriptedFetcher::default().with("a", "Alice 9.0"));
        let report = workflow(store, fetcher, Arc::new(KeywordOracle))
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::SystemError { persisted: true });
        let subject = inner.subject(&subject_id()).unwrap();
        assert_eq!(subject.status, VerificationStatus::Failed);
        assert_eq!(subject.detail.as_deref(), Some("unexpected system error"));
    }

    #[tokio::test]
    async fn unwritable_store_reports_unpersisted_error() {
        let inner = seeded_store(RecordSet::empty());
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            failures: AtomicUsize::new(2),
        });
        let report = workflow(store, Arc::new(ScriptedFetcher::default()), Arc::new(KeywordOracle))
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::SystemError { persisted: false });
        assert_eq!(
            inner.subject(&subject_id()).unwrap().status,
            VerificationStatus::Processing
        );
    }

    #[tokio::test]
    async fn panicking_store_read_is_released_as_system_error() {
        let inner = seeded_store(RecordSet::empty());
        let store = Arc::new(PanickingStore {
            inner: inner.clone(),
            writes_panic: false,
        });
        let report = workflow(store, Arc::new(ScriptedFetcher::default()), Arc::new(KeywordOracle))
            .run(&subject_id())
            .await;

        assert_eq!(report, RunReport::SystemError { persisted: true });
        let subject = inner.subject(&subject_id()).unwrap();
        assert_eq!(subject.status, VerificationStatus::Failed);
        assert_eq!(subject.detail.as_deref(), Some("unexpected system error"));
    }

    #[tokio::test]
    async fn panicking_release_write_still_reports() {
        let inner = seeded_store(RecordSet::empty());
        let store = Arc::new(PanickingStore {
            inner: inner.clone(),
            writes_panic: true,
        });
        let sink = Arc::new(MemoryLogSink::new());
        let telemetry = VerificationTelemetry::builder("verification")
            .sink(sink.clone())
            .build()
            .unwrap();
        let workflow = VerificationWorkflow::builder()
            .store(store)
            .fetcher(Arc::new(ScriptedFetcher::default()))
            .extractor(Arc::new(PlainTextExtractor))
            .oracle(Arc::new(KeywordOracle))
            .telemetry(telemetry)
            .build()
            .unwrap();
        let report = workflow.run(&subject_id()).await;

        assert_eq!(report, RunReport::SystemError { persisted: false });
        let unpersisted = sink.with_message("verification.run.unpersisted");
        assert_eq!(unpersisted.len(), 1);
        assert_eq!(unpersisted[0].metadata["error"], "store write panicked");
    }

    #[tokio::test]
    async fn unreadable_page_keeps_remaining_text() {
        let store = seeded_store(RecordSet::empty().with_slot(1, Some(&doc("a")), Some("9.0")));
        let sink = Arc::new(MemoryLogSink::new());
        let telemetry = VerificationTelemetry::builder("verification")
            .sink(sink.clone())
            .build()
            .unwrap();
        let fetcher = ScriptedFetcher::default()
            .with_bytes("a", pdf_from_pages(&[Some("Alice"), None, Some("SGPI 9.0")]));
        let workflow = VerificationWorkflow::builder()
            .store(Arc::new(store.clone()))
            .fetcher(Arc::new(fetcher))
            .extractor(Arc::new(PdfTextExtractor))
            .oracle(Arc::new(KeywordOracle))
            .telemetry(telemetry)
            .build()
            .unwrap();
        let report = workflow.run(&subject_id()).await;

        assert_eq!(report, RunReport::Finalized(Verdict::verified()));
        let partial = sink.with_message("verification.slot.partial_text");
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].metadata["failed_pages"], json!([2]));
        assert_eq!(partial[0].metadata["page_count"], 3);
        let finalized = sink.with_message("verification.run.finalized");
        assert_eq!(finalized[0].metadata["slots"]["submitted"], 1);
        assert_eq!(finalized[0].metadata["slots"]["confirmed"], json!([1]));
    }

    #[tokio::test]
    async fn oracle_exchange_is_audited_and_outcome_published() {
        let store = seeded_store(RecordSet::empty().with_slot(1, Some(&doc("a")), Some("9.0")));
        let sink = Arc::new(MemoryLogSink::new());
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = VerificationTelemetry::builder("verification")
            .sink(sink.clone())
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let workflow = VerificationWorkflow::builder()
            .store(Arc::new(store))
            .fetcher(Arc::new(ScriptedFetcher::default().with("a", "Alice 9.0")))
            .extractor(Arc::new(PlainTextExtractor))
            .oracle(Arc::new(KeywordOracle))
            .telemetry(telemetry)
            .build()
            .unwrap();
        workflow.run(&subject_id()).await;

        let requests = sink.with_message("verification.oracle.request");
        assert_eq!(requests.len(), 1);
        let prompt = requests[0].metadata["request"].as_str().unwrap();
        assert!(prompt.contains("- Student Name: Alice"));
        assert!(prompt.contains("- Semester Grade (SGPI): 9.0"));
        let responses = sink.with_message("verification.oracle.response");
        assert_eq!(responses[0].metadata["raw_response"], "MATCHED");

        let completed = bus.events_of("verification.completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload["status"], "VERIFIED");
        assert_eq!(completed[0].payload["subjectId"], SUBJECT);
    }

    #[tokio::test]
    async fn notifier_receives_outcome() {
        let store = seeded_store(RecordSet::empty().with_slot(1, Some(&doc("a")), Some("9.0")));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let workflow = VerificationWorkflow::builder()
            .store(Arc::new(store))
            .fetcher(Arc::new(ScriptedFetcher::default().with("a", "Bob 7.0")))
            .extractor(Arc::new(PlainTextExtractor))
            .oracle(Arc::new(KeywordOracle))
            .notifier(Arc::new(ChannelNotifier(tx)))
            .build()
            .unwrap();
        workflow.run(&subject_id()).await;

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.recipient, "alice@example.com");
        assert_eq!(notification.subject_id, SUBJECT);
        assert_eq!(notification.message, "verification failed: failed semesters: [1]");
    }

    #[test]
    fn builder_requires_collaborators() {
        let err = VerificationWorkflow::builder()
            .store(Arc::new(MemorySubjectStore::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("document fetcher"));
    }
}
