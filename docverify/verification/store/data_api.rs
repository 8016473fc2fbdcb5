use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

use super::{stringify_object_ids, verdict_update, ClaimOutcome, StoreError, SubjectStore};
use crate::model::{
    fields, ObjectId, RecordSet, Subject, SubjectId, VerificationStatus, Verdict,
};

const MAX_ERROR_BODY: usize = 512;

/// Connection settings for a document store reached over its HTTP data API.
#[derive(Debug, Clone)]
pub struct DataApiConfig {
    /// Base URL; actions are posted to `{endpoint}/action/{name}`.
    pub endpoint: String,
    /// Cluster / data source name.
    pub data_source: String,
    /// Database name.
    pub database: String,
    /// Key sent as the `api-key` header.
    pub api_key: Option<String>,
    /// Collection holding subjects.
    pub subject_collection: String,
    /// Collection holding record sets.
    pub record_collection: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl DataApiConfig {
    /// Settings with the default collection names.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            data_source: "Cluster0".into(),
            database: database.into(),
            api_key: None,
            subject_collection: "students".into(),
            record_collection: "studentinfos".into(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Subject store backed by a document database's HTTP data API.
///
/// The claim is a single conditional `updateOne`, so the store itself
/// provides the compare-and-swap.
#[derive(Debug, Clone)]
pub struct DataApiStore {
    client: Client,
    config: DataApiConfig,
}

impl DataApiStore {
    /// Builds the HTTP client.
    pub fn new(config: DataApiConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .user_agent("docverify/0.1")
            .timeout(config.timeout)
            .build()
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        Ok(Self { client, config })
    }

    async fn action(&self, action: &str, collection: &str, arguments: Value) -> Result<Value, StoreError> {
        let mut body = Map::new();
        body.insert("dataSource".into(), json!(self.config.data_source));
        body.insert("database".into(), json!(self.config.database));
        body.insert("collection".into(), json!(collection));
        if let Value::Object(extra) = arguments {
            body.extend(extra);
        }
        let url = format!(
            "{}/action/{action}",
            self.config.endpoint.trim_end_matches('/')
        );
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&Value::Object(body));
        if let Some(key) = &self.config.api_key {
            request = request.header("api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| StoreError::Decode(err.to_string()))
    }

    async fn find_one(&self, collection: &str, id: &ObjectId) -> Result<Option<Value>, StoreError> {
        let response = self
            .action("findOne", collection, json!({ "filter": id_filter(id) }))
            .await?;
        Ok(match response.get("document") {
            None | Some(Value::Null) => None,
            Some(doc) => Some(doc.clone()),
        })
    }
}

fn id_filter(id: &ObjectId) -> Value {
    json!({ fields::ID: id.to_extended_json() })
}

fn matched_count(response: &Value) -> Result<u64, StoreError> {
    response
        .get("matchedCount")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Decode("updateOne response lacks matchedCount".into()))
}

#[async_trait]
impl SubjectStore for DataApiStore {
    async fn find_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        self.find_one(&self.config.subject_collection, id)
            .await?
            .map(|doc| Subject::from_document(&doc).map_err(|err| StoreError::Decode(err.to_string())))
            .transpose()
    }

    async fn find_record_set(&self, reference: &ObjectId) -> Result<Option<RecordSet>, StoreError> {
        Ok(self
            .find_one(&self.config.record_collection, reference)
            .await?
            .map(|doc| RecordSet::from_document(&doc)))
    }

    async fn claim_for_processing(&self, id: &SubjectId) -> Result<ClaimOutcome, StoreError> {
        let processing = VerificationStatus::Processing.as_str();
        let response = self
            .action(
                "updateOne",
                &self.config.subject_collection,
                json!({
                    "filter": {
                        fields::ID: id.to_extended_json(),
                        fields::STATUS: { "$ne": processing }
                    },
                    "update": { "$set": { fields::STATUS: processing } }
                }),
            )
            .await?;
        if matched_count(&response)? > 0 {
            return Ok(ClaimOutcome::Acquired);
        }
        Ok(
            match self.find_one(&self.config.subject_collection, id).await? {
                Some(_) => ClaimOutcome::AlreadyProcessing,
                None => ClaimOutcome::NotFound,
            },
        )
    }

    async fn write_verdict(&self, id: &SubjectId, verdict: &Verdict) -> Result<(), StoreError> {
        let response = self
            .action(
                "updateOne",
                &self.config.subject_collection,
                json!({ "filter": id_filter(id), "update": verdict_update(verdict) }),
            )
            .await?;
        matched_count(&response).map(|_| ())
    }

    async fn sample_subjects(&self, limit: usize) -> Result<Vec<Value>, StoreError> {
        let response = self
            .action(
                "find",
                &self.config.subject_collection,
                json!({ "filter": {}, "limit": limit }),
            )
            .await?;
        let documents = response
            .get("documents")
            .and_then(Value::as_array)
            .ok_or_else(|| StoreError::Decode("find response lacks documents".into()))?;
        Ok(documents
            .iter()
            .take(limit)
            .cloned()
            .map(stringify_object_ids)
            .collect())
    }
}
