use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::model::SubjectId;

/// Path appended to the notification service base URL.
pub const SEND_PATH: &str = "/notifications/send_notification";

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome message delivered to a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Subject the message concerns.
    #[serde(rename = "userId")]
    pub subject_id: String,
    /// Message body.
    pub message: String,
    /// Recipient address.
    #[serde(rename = "email")]
    pub recipient: String,
}

impl Notification {
    /// Creates a notification.
    #[must_use]
    pub fn new(recipient: impl Into<String>, subject_id: &SubjectId, message: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            message: message.into(),
            recipient: recipient.into(),
        }
    }
}

/// Errors raised while delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Request never completed.
    #[error("notification transport error: {0}")]
    Transport(String),
    /// Service answered with a non-success status.
    #[error("notification service returned status {0}")]
    Status(u16),
}

/// Out-of-band channel for run outcomes. Callers treat delivery as best
/// effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one notification.
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts notifications as JSON to an HTTP notification service.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    /// Creates a notifier for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}{SEND_PATH}", base_url.trim_end_matches('/')),
        })
    }

    /// Full URL notifications are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(response.status().as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[tokio::test]
    async fn posts_expected_payload() {
        let received = Arc::new(Mutex::new(Vec::<Value>::new()));
        let app = Router::new()
            .route(
                SEND_PATH,
                post(|State(seen): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                    seen.lock().push(body);
                    Json(json!({ "ok": true }))
                }),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let notifier = HttpNotifier::new(&format!("http://{addr}/")).unwrap();
        assert_eq!(notifier.endpoint(), format!("http://{addr}{SEND_PATH}"));
        let id = SubjectId::parse("64b7f0c2a1b2c3d4e5f60718").unwrap();
        notifier
            .notify(&Notification::new("alice@example.com", &id, "verification successful"))
            .await
            .unwrap();
        assert_eq!(
            received.lock().clone(),
            vec![json!({
                "userId": "64b7f0c2a1b2c3d4e5f60718",
                "message": "verification successful",
                "email": "alice@example.com"
            })]
        );
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        let notifier = HttpNotifier::new("http://127.0.0.1:9").unwrap();
        let id = SubjectId::parse("64b7f0c2a1b2c3d4e5f60718").unwrap();
        assert!(matches!(
            notifier.notify(&Notification::new("a@b.c", &id, "x")).await,
            Err(NotifyError::Transport(_))
        ));
    }
}
