use async_trait::async_trait;

use super::{render_prompt, MatchClaim, MatchOracle, OracleDecision, OracleError, MATCHED, NOT_MATCHED};

/// Confirms a claim when the identity and every expected value occur in the
/// document text, ignoring case and whitespace runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordOracle;

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl KeywordOracle {
    /// Pure containment check.
    #[must_use]
    pub fn matches(claim: &MatchClaim) -> bool {
        let haystack = normalize(&claim.document_text);
        std::iter::once(claim.identity_label.as_str())
            .chain(claim.expected_values.values().map(String::as_str))
            .map(normalize)
            .all(|needle| !needle.is_empty() && haystack.contains(&needle))
    }
}

#[async_trait]
impl MatchOracle for KeywordOracle {
    async fn evaluate(&self, claim: &MatchClaim) -> Result<OracleDecision, OracleError> {
        let raw = if Self::matches(claim) { MATCHED } else { NOT_MATCHED };
        Ok(OracleDecision::from_exchange(render_prompt(claim), raw.to_string()))
    }
}
