use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::FetchError;

/// OAuth scope granting read-only drive access.
pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

/// Errors raised while decoding the credential blob.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Blob is not valid base64.
    #[error("credential blob is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Decoded blob is not a service-account JSON document.
    #[error("credential blob is not a service account key: {0}")]
    Json(#[from] serde_json::Error),
    /// Private key cannot be used for RS256 signing.
    #[error("service account private key is unusable: {0}")]
    InvalidKey(String),
}

/// The fields of a service-account key file this service needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Account identity, used as the JWT issuer.
    pub client_email: String,
    /// PEM-encoded RSA private key.
    pub private_key: String,
    /// Token endpoint.
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// Decodes a base64-encoded key file held in memory.
    pub fn from_base64(blob: &str) -> Result<Self, CredentialError> {
        let raw = STANDARD.decode(blob.trim())?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Supplies bearer tokens for document downloads.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Returns a currently valid access token.
    async fn access_token(&self) -> Result<String, FetchError>;
}

/// Fixed token, for tests and pre-minted credentials.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl AccessTokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, FetchError> {
        Ok(self.0.clone())
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

const fn default_expires_in() -> i64 {
    TOKEN_LIFETIME_SECS
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Mints access tokens with the JWT-bearer grant and caches them until
/// shortly before expiry.
pub struct ServiceAccountTokenSource {
    client: Client,
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for ServiceAccountTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountTokenSource")
            .field("key", &self.key)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountTokenSource {
    /// Validates the private key and prepares the token client.
    pub fn new(key: ServiceAccountKey, scope: impl Into<String>) -> Result<Self, CredentialError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|err| CredentialError::InvalidKey(err.to_string()))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|err| CredentialError::InvalidKey(format!("http client: {err}")))?;
        Ok(Self {
            client,
            key,
            signing_key,
            scope: scope.into(),
            cached: Mutex::new(None),
        })
    }

    fn cached_token(&self) -> Option<String> {
        let margin = Duration::seconds(REFRESH_MARGIN_SECS);
        self.cached
            .lock()
            .as_ref()
            .filter(|token| token.expires_at - margin > Utc::now())
            .map(|token| token.value.clone())
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, FetchError> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + TOKEN_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|err| FetchError::Auth(format!("signing assertion: {err}")))
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String, FetchError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        let now = Utc::now();
        let assertion = self.signed_assertion(now)?;
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| FetchError::Auth(err.to_string()))?
            .error_for_status()
            .map_err(|err| FetchError::Auth(err.to_string()))?
            .json::<TokenResponse>()
            .await
            .map_err(|err| FetchError::Auth(format!("token response: {err}")))?;
        *self.cached.lock() = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at: now + Duration::seconds(response.expires_in),
        });
        Ok(response.access_token)
    }
}
