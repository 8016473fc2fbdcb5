//! Binary text-matching decisions over extracted documents.

/// Prompt-based oracle backed by a hosted generative model.
pub mod gemini;
/// Rule-based containment oracle.
pub mod keyword;

pub use gemini::GeminiOracle;
pub use keyword::KeywordOracle;

use std::fmt::Write as _;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

/// Label under which the identity is presented to the oracle.
pub const IDENTITY_FIELD: &str = "Student Name";

/// Label under which a slot's expected grade is presented to the oracle.
pub const GRADE_FIELD: &str = "Semester Grade (SGPI)";

/// Response token meaning every expected value is present.
pub const MATCHED: &str = "MATCHED";

/// Response token meaning at least one expected value is absent.
pub const NOT_MATCHED: &str = "NOT MATCHED";

const PROMPT_PREAMBLE: &str = "You are an automated document verification assistant. \
Decide whether the 'Extracted Text from Document' contains ALL of the 'Information from Database'.

Respond with ONLY the word 'MATCHED' if every item of the database information is clearly present in the document text.
Respond with ONLY the word 'NOT MATCHED' otherwise.
";

/// A structured claim checked against one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchClaim {
    /// Identity the document must belong to.
    pub identity_label: String,
    /// Named values the document must show, in presentation order.
    pub expected_values: IndexMap<String, String>,
    /// Extracted document text.
    pub document_text: String,
}

impl MatchClaim {
    /// Creates a claim with no expected values yet.
    #[must_use]
    pub fn new(identity_label: impl Into<String>, document_text: impl Into<String>) -> Self {
        Self {
            identity_label: identity_label.into(),
            expected_values: IndexMap::new(),
            document_text: document_text.into(),
        }
    }

    /// Adds a named expected value.
    #[must_use]
    pub fn with_expected(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.expected_values.insert(field.into(), value.into());
        self
    }
}

/// Binary oracle verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchVerdict {
    /// Document supports the claim.
    Confirmed,
    /// Document does not support the claim.
    Rejected,
}

impl MatchVerdict {
    /// Maps a raw model response: only a trimmed, case-insensitive `MATCHED`
    /// confirms.
    #[must_use]
    pub fn from_response(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case(MATCHED) {
            Self::Confirmed
        } else {
            Self::Rejected
        }
    }
}

/// Verdict together with the exact exchange, kept for audit logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleDecision {
    /// Decision.
    pub verdict: MatchVerdict,
    /// Exact request sent.
    pub request: String,
    /// Raw response received.
    pub raw_response: String,
}

impl OracleDecision {
    /// Builds a decision from a raw response.
    #[must_use]
    pub fn from_exchange(request: String, raw_response: String) -> Self {
        Self {
            verdict: MatchVerdict::from_response(&raw_response),
            request,
            raw_response,
        }
    }
}

/// Errors raised while consulting an oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Request never completed.
    #[error("oracle transport error: {0}")]
    Transport(String),
    /// Oracle answered with a non-success status.
    #[error("oracle returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// Response held no text.
    #[error("oracle response contained no text")]
    EmptyResponse,
    /// Response could not be interpreted.
    #[error("oracle response could not be decoded: {0}")]
    Decode(String),
}

/// Decides whether a document supports a claim.
#[async_trait]
pub trait MatchOracle: Send + Sync {
    /// Evaluates a claim, returning the verdict and the raw exchange.
    async fn evaluate(&self, claim: &MatchClaim) -> Result<OracleDecision, OracleError>;
}

/// Renders the fixed verification prompt for a claim.
#[must_use]
pub fn render_prompt(claim: &MatchClaim) -> String {
    let mut prompt = String::from(PROMPT_PREAMBLE);
    prompt.push_str("\n---\nInformation from Database:\n");
    let _ = writeln!(prompt, "- {IDENTITY_FIELD}: {}", claim.identity_label);
    for (field, value) in &claim.expected_values {
        let _ = writeln!(prompt, "- {field}: {value}");
    }
    prompt.push_str("\nExtracted Text from Document:\n");
    prompt.push_str(&claim.document_text);
    prompt.push_str("\n---\n");
    prompt
}
