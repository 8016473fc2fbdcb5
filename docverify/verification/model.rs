use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Number of semester slots in a record set.
pub const SLOT_COUNT: usize = 8;

/// Detail persisted when no slot carried a document.
pub const NO_DOCUMENTS_DETAIL: &str = "no documents submitted";

/// Detail persisted when a run fails for reasons outside the slots.
pub const SYSTEM_ERROR_DETAIL: &str = "unexpected system error";

/// Detail persisted when the subject's record set cannot be resolved.
pub const RECORDS_UNAVAILABLE_DETAIL: &str = "records unavailable";

/// Store document field names.
pub mod fields {
    /// Primary key.
    pub const ID: &str = "_id";
    /// Subject display name.
    pub const NAME: &str = "stud_name";
    /// Subject contact email.
    pub const EMAIL: &str = "stud_email";
    /// Reference to the subject's record set document.
    pub const RECORDS_REFERENCE: &str = "stud_info_id";
    /// Workflow status.
    pub const STATUS: &str = "verificationStatus";
    /// Set once every submitted document was confirmed.
    pub const SYSTEM_VERIFIED: &str = "isSystemVerified";
    /// Failure diagnostic.
    pub const DETAILS: &str = "verificationDetails";

    /// Field holding the document reference for `slot` (1-based).
    #[must_use]
    pub fn marksheet(slot: usize) -> String {
        format!("stud_sem{slot}_marksheet")
    }

    /// Field holding the expected grade for `slot` (1-based).
    #[must_use]
    pub fn grade(slot: usize) -> String {
        format!("stud_sem{slot}_grade")
    }
}

/// Errors raised while parsing identifiers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    /// Input is not 24 hexadecimal digits.
    #[error("invalid object id '{0}': expected 24 hex digits")]
    Malformed(String),
}

/// Errors raised while decoding store documents.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    /// Primary key missing or not an object id.
    #[error("document has no usable _id")]
    MissingId,
    /// Top-level value is not a JSON object.
    #[error("document is not an object")]
    NotAnObject,
}

/// Store object id (12 bytes, rendered as 24 lowercase hex digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

/// Subjects are addressed by store object id.
pub type SubjectId = ObjectId;

impl ObjectId {
    /// Parses a 24-digit hex id, case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let trimmed = raw.trim();
        if trimmed.len() == 24 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(trimmed.to_ascii_lowercase()))
        } else {
            Err(IdError::Malformed(raw.to_string()))
        }
    }

    /// Hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extended-JSON form, `{"$oid": "..."}`.
    #[must_use]
    pub fn to_extended_json(&self) -> Value {
        json!({ "$oid": self.0 })
    }

    /// Reads either `{"$oid": "..."}` or a bare hex string.
    #[must_use]
    pub fn from_extended_json(value: &Value) -> Option<Self> {
        let raw = value
            .get("$oid")
            .and_then(Value::as_str)
            .or_else(|| value.as_str())?;
        Self::parse(raw).ok()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

/// Verification lifecycle of a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerificationStatus {
    /// Never verified.
    #[default]
    Unverified,
    /// A run currently owns the subject.
    Processing,
    /// Every submitted document was confirmed.
    Verified,
    /// Last run failed.
    Failed,
}

impl VerificationStatus {
    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "UNVERIFIED",
            Self::Processing => "PROCESSING",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses a stored label; unknown or missing labels count as unverified.
    #[must_use]
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(str::trim) {
            Some(l) if l.eq_ignore_ascii_case("PROCESSING") => Self::Processing,
            Some(l) if l.eq_ignore_ascii_case("VERIFIED") => Self::Verified,
            Some(l) if l.eq_ignore_ascii_case("FAILED") => Self::Failed,
            _ => Self::Unverified,
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The entity being verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Identity.
    pub id: SubjectId,
    /// Display name matched against documents.
    pub name: Option<String>,
    /// Contact address used for notifications.
    pub email: Option<String>,
    /// Opaque handle to the record set.
    pub records_reference: Option<String>,
    /// Current status.
    pub status: VerificationStatus,
    /// Whether the last run verified every document.
    pub is_system_verified: bool,
    /// Last failure diagnostic.
    pub detail: Option<String>,
}

impl Subject {
    /// Creates an unverified subject.
    #[must_use]
    pub fn new(id: SubjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
            email: None,
            records_reference: None,
            status: VerificationStatus::Unverified,
            is_system_verified: false,
            detail: None,
        }
    }

    /// Sets the record set handle.
    #[must_use]
    pub fn with_records_reference(mut self, reference: impl Into<String>) -> Self {
        self.records_reference = Some(reference.into());
        self
    }

    /// Sets the contact address.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: VerificationStatus) -> Self {
        self.status = status;
        self
    }

    /// Decodes a store document.
    pub fn from_document(doc: &Value) -> Result<Self, DocumentError> {
        let obj = doc.as_object().ok_or(DocumentError::NotAnObject)?;
        let id = obj
            .get(fields::ID)
            .and_then(ObjectId::from_extended_json)
            .ok_or(DocumentError::MissingId)?;
        Ok(Self {
            id,
            name: text_field(obj, fields::NAME),
            email: text_field(obj, fields::EMAIL),
            records_reference: obj
                .get(fields::RECORDS_REFERENCE)
                .and_then(|v| {
                    ObjectId::from_extended_json(v)
                        .map(String::from)
                        .or_else(|| v.as_str().map(str::to_string))
                })
                .filter(|s| !s.trim().is_empty()),
            status: VerificationStatus::from_label(
                obj.get(fields::STATUS).and_then(Value::as_str),
            ),
            is_system_verified: obj
                .get(fields::SYSTEM_VERIFIED)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            detail: text_field(obj, fields::DETAILS),
        })
    }

    /// Encodes as a store document with an extended-JSON id.
    #[must_use]
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert(fields::ID.into(), self.id.to_extended_json());
        if let Some(name) = &self.name {
            doc.insert(fields::NAME.into(), json!(name));
        }
        if let Some(email) = &self.email {
            doc.insert(fields::EMAIL.into(), json!(email));
        }
        if let Some(reference) = &self.records_reference {
            doc.insert(fields::RECORDS_REFERENCE.into(), json!(reference));
        }
        doc.insert(fields::STATUS.into(), json!(self.status.as_str()));
        doc.insert(fields::SYSTEM_VERIFIED.into(), json!(self.is_system_verified));
        if let Some(detail) = &self.detail {
            doc.insert(fields::DETAILS.into(), json!(detail));
        }
        Value::Object(doc)
    }
}

fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// One slot of a record set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// 1-based slot index.
    pub slot: usize,
    /// External document pointer; `None` means not submitted.
    pub document_reference: Option<String>,
    /// Value the document must show, e.g. a grade.
    pub expected_value: Option<String>,
}

impl Record {
    /// Whether a document was submitted for this slot.
    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        self.document_reference.is_some()
    }
}

/// Fixed-size, slot-ordered records of one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl Default for RecordSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl RecordSet {
    /// All slots unsubmitted.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            records: (1..=SLOT_COUNT)
                .map(|slot| Record {
                    slot,
                    ..Record::default()
                })
                .collect(),
        }
    }

    /// Fills one slot; out-of-range slots are ignored.
    #[must_use]
    pub fn with_slot(
        mut self,
        slot: usize,
        document_reference: Option<&str>,
        expected_value: Option<&str>,
    ) -> Self {
        if let Some(record) = slot
            .checked_sub(1)
            .and_then(|idx| self.records.get_mut(idx))
        {
            record.document_reference = document_reference.map(str::to_string);
            record.expected_value = expected_value.map(str::to_string);
        }
        self
    }

    /// Decodes a record-set store document.
    ///
    /// Empty strings count as absent and numeric grades are rendered as text.
    #[must_use]
    pub fn from_document(doc: &Value) -> Self {
        let records = (1..=SLOT_COUNT)
            .map(|slot| Record {
                slot,
                document_reference: doc
                    .get(fields::marksheet(slot))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                expected_value: doc.get(fields::grade(slot)).and_then(scalar_text),
            })
            .collect();
        Self { records }
    }

    /// Slots in index order.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of submitted slots.
    #[must_use]
    pub fn submitted_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_submitted()).count()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Final, persisted outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Terminal status (never `Processing`).
    pub status: VerificationStatus,
    /// Value for `isSystemVerified`; `None` leaves the stored flag untouched.
    pub is_system_verified: Option<bool>,
    /// Value for `verificationDetails`; `None` clears it.
    pub detail: Option<String>,
}

impl Verdict {
    /// Every submitted document confirmed.
    #[must_use]
    pub const fn verified() -> Self {
        Self {
            status: VerificationStatus::Verified,
            is_system_verified: Some(true),
            detail: None,
        }
    }

    /// Nothing submitted.
    #[must_use]
    pub fn no_documents() -> Self {
        Self::failed(NO_DOCUMENTS_DETAIL.to_string(), None)
    }

    /// Some slots failed; `slots` must be ascending.
    #[must_use]
    pub fn failed_slots(slots: &[usize]) -> Self {
        Self::failed(format!("failed semesters: {slots:?}"), Some(false))
    }

    /// Unexpected failure outside the slot loop.
    #[must_use]
    pub fn system_error() -> Self {
        Self::failed(SYSTEM_ERROR_DETAIL.to_string(), None)
    }

    /// Record set could not be resolved.
    #[must_use]
    pub fn records_unavailable() -> Self {
        Self::failed(RECORDS_UNAVAILABLE_DETAIL.to_string(), None)
    }

    fn failed(detail: String, is_system_verified: Option<bool>) -> Self {
        Self {
            status: VerificationStatus::Failed,
            is_system_verified,
            detail: Some(detail),
        }
    }

    /// Human-readable message used for notifications.
    #[must_use]
    pub fn summary(&self) -> String {
        match (&self.status, &self.detail) {
            (VerificationStatus::Verified, _) => "verification successful".to_string(),
            (_, Some(detail)) => format!("verification failed: {detail}"),
            (status, None) => format!("verification ended as {status}"),
        }
    }
}

/// Aggregate built while a run walks the slots.
#[derive(Debug, Default)]
pub struct VerificationOutcome {
    any_document_found: bool,
    confirmed_slots: Vec<usize>,
    failed_slots: Vec<usize>,
}

impl VerificationOutcome {
    /// Notes that a slot carried a document.
    pub fn mark_document_found(&mut self) {
        self.any_document_found = true;
    }

    /// Records a confirmed slot.
    pub fn record_confirmed(&mut self, slot: usize) {
        self.confirmed_slots.push(slot);
    }

    /// Records a failed slot.
    pub fn record_failure(&mut self, slot: usize) {
        self.failed_slots.push(slot);
    }

    /// Whether any slot carried a document.
    #[must_use]
    pub const fn any_document_found(&self) -> bool {
        self.any_document_found
    }

    /// Failed slots so far.
    #[must_use]
    pub fn failed_slots(&self) -> &[usize] {
        &self.failed_slots
    }

    /// Confirmed slots so far.
    #[must_use]
    pub fn confirmed_slots(&self) -> &[usize] {
        &self.confirmed_slots
    }

    /// Consumes the aggregate into the verdict to persist.
    #[must_use]
    pub fn into_verdict(mut self) -> Verdict {
        if !self.any_document_found {
            return Verdict::no_documents();
        }
        if self.failed_slots.is_empty() {
            return Verdict::verified();
        }
        self.failed_slots.sort_unstable();
        self.failed_slots.dedup();
        Verdict::failed_slots(&self.failed_slots)
    }
}
