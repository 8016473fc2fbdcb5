use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::{drive_file_id, AccessTokenSource, DocumentFetcher, FetchError};

/// Public drive v3 endpoint.
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Downloads shared files through the drive v3 `alt=media` endpoint.
pub struct DriveDocumentFetcher {
    client: Client,
    tokens: Arc<dyn AccessTokenSource>,
    base_url: String,
}

impl std::fmt::Debug for DriveDocumentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveDocumentFetcher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DriveDocumentFetcher {
    /// Creates a fetcher against the public endpoint.
    pub fn new(tokens: Arc<dyn AccessTokenSource>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent("docverify/0.1")
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            tokens,
            base_url: DRIVE_API_BASE.to_string(),
        })
    }

    /// Points the fetcher at another endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl DocumentFetcher for DriveDocumentFetcher {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
        let file_id = drive_file_id(reference)?;
        let token = self.tokens.access_token().await?;
        let url = format!(
            "{}/files/{file_id}",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(url)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        match response.status() {
            status if status.is_success() => response
                .bytes()
                .await
                .map(|bytes| bytes.to_vec())
                .map_err(|err| FetchError::Transport(err.to_string())),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(file_id)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Auth(format!(
                "access to {file_id} denied with status {}",
                response.status().as_u16()
            ))),
            status => Err(FetchError::Status {
                file_id,
                status: status.as_u16(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::StaticToken;
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode},
        routing::get,
        Router,
    };
    use std::collections::HashMap;

    async fn media(
        Path(file_id): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Result<Vec<u8>, StatusCode> {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer t0ken") {
            return Err(StatusCode::UNAUTHORIZED);
        }
        if params.get("alt").map(String::as_str) != Some("media") {
            return Err(StatusCode::BAD_REQUEST);
        }
        match file_id.as_str() {
            "sem1" => Ok(b"%PDF-1.4 fake".to_vec()),
            "broken" => Err(StatusCode::INTERNAL_SERVER_ERROR),
            _ => Err(StatusCode::NOT_FOUND),
        }
    }

    async fn fetcher(token: &str) -> DriveDocumentFetcher {
        let app = Router::new().route("/files/:file_id", get(media));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        DriveDocumentFetcher::new(Arc::new(StaticToken::new(token)))
            .unwrap()
            .with_base_url(format!("http://{addr}"))
    }

    #[tokio::test]
    async fn downloads_shared_file() {
        let fetcher = fetcher("t0ken").await;
        let bytes = fetcher
            .fetch("https://drive.google.com/file/d/sem1/view")
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.4 fake");
    }

    #[tokio::test]
    async fn maps_provider_failures() {
        let fetcher = fetcher("t0ken").await;
        assert!(matches!(
            fetcher.fetch("https://drive.google.com/file/d/missing/view").await,
            Err(FetchError::NotFound(id)) if id == "missing"
        ));
        assert!(matches!(
            fetcher.fetch("https://drive.google.com/file/d/broken/view").await,
            Err(FetchError::Status { status: 500, .. })
        ));
        assert!(matches!(
            fetcher.fetch("not a link").await,
            Err(FetchError::MalformedReference(_))
        ));
    }

    #[tokio::test]
    async fn rejected_token_is_auth_failure() {
        let fetcher = fetcher("expired").await;
        assert!(matches!(
            fetcher.fetch("https://drive.google.com/file/d/sem1/view").await,
            Err(FetchError::Auth(_))
        ));
    }
}
