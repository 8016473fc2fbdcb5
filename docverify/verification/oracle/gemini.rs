use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{render_prompt, MatchClaim, MatchOracle, OracleDecision, OracleError};

/// Public generative-language endpoint.
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

const MAX_ERROR_BODY: usize = 512;

/// Oracle that asks a hosted generative model to answer `MATCHED` or
/// `NOT MATCHED`, sampled at temperature 0.
pub struct GeminiOracle {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl std::fmt::Debug for GeminiOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiOracle")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GeminiOracle {
    /// Creates an oracle for `model`.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, OracleError> {
        let client = Client::builder()
            .user_agent("docverify/0.1")
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_API_BASE.to_string(),
        })
    }

    /// Points the oracle at another endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().filter_map(|part| part.text).collect();
        Some(text).filter(|t| !t.is_empty())
    }
}

#[async_trait]
impl MatchOracle for GeminiOracle {
    async fn evaluate(&self, claim: &MatchClaim) -> Result<OracleDecision, OracleError> {
        let prompt = render_prompt(claim);
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.0 }
        });
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let raw = response
            .json::<GenerateResponse>()
            .await
            .map_err(|err| OracleError::Decode(err.to_string()))?
            .first_text()
            .ok_or(OracleError::EmptyResponse)?;
        Ok(OracleDecision::from_exchange(prompt, raw))
    }
}
