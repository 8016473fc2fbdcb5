//! Document retrieval from the cloud file store.

/// Service-account credentials and access tokens.
pub mod credentials;
/// Drive v3 download client.
pub mod drive;

pub use credentials::{
    AccessTokenSource, CredentialError, ServiceAccountKey, ServiceAccountTokenSource, StaticToken,
    DRIVE_READONLY_SCOPE,
};
pub use drive::DriveDocumentFetcher;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static PATH_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/d/([A-Za-z0-9_-]+)").expect("valid drive path pattern")
});
static QUERY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").expect("valid drive query pattern")
});

/// Errors emitted while fetching a document.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Reference does not contain a file id.
    #[error("malformed document reference '{0}'")]
    MalformedReference(String),
    /// Access token could not be obtained.
    #[error("authorization failed: {0}")]
    Auth(String),
    /// File does not exist or is not shared with the service account.
    #[error("document {0} not found")]
    NotFound(String),
    /// Provider answered with another non-success status.
    #[error("document {file_id} download failed with status {status}")]
    Status {
        /// File id requested.
        file_id: String,
        /// HTTP status code.
        status: u16,
    },
    /// Request never completed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Retrieves raw document bytes for an opaque reference.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Downloads the referenced document.
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError>;
}

/// Extracts the file id from a share link such as
/// `https://drive.google.com/file/d/<id>/view` or `...open?id=<id>`.
pub fn drive_file_id(reference: &str) -> Result<String, FetchError> {
    PATH_ID
        .captures(reference)
        .or_else(|| QUERY_ID.captures(reference))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| FetchError::MalformedReference(reference.to_string()))
}
