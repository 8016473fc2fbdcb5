use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, oid, Bson, Document},
    options::{ClientOptions, FindOptions},
    Client, Collection,
};
use serde_json::Value;

use super::{stringify_object_ids, verdict_update, ClaimOutcome, StoreError, SubjectStore};
use crate::model::{
    fields, ObjectId, RecordSet, Subject, SubjectId, VerificationStatus, Verdict,
};

/// Connection settings for the native driver.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// `mongodb://` or `mongodb+srv://` connection string.
    pub uri: String,
    /// Database name.
    pub database: String,
    /// Collection holding subjects.
    pub subject_collection: String,
    /// Collection holding record sets.
    pub record_collection: String,
    /// Server selection and connect timeout.
    pub timeout: Duration,
}

impl MongoConfig {
    /// Settings with the default collection names.
    #[must_use]
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            subject_collection: "students".into(),
            record_collection: "studentinfos".into(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Subject store speaking the database wire protocol.
///
/// The claim is a `findOneAndUpdate` filtered on `status != PROCESSING`, so
/// the server arbitrates concurrent claims.
#[derive(Debug, Clone)]
pub struct MongoSubjectStore {
    subjects: Collection<Document>,
    records: Collection<Document>,
}

impl MongoSubjectStore {
    /// Parses the connection string and builds a lazily connecting client.
    pub async fn connect(config: &MongoConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.uri).await.map_err(driver)?;
        options.app_name = Some("docverify".into());
        options.connect_timeout = Some(config.timeout);
        options.server_selection_timeout = Some(config.timeout);
        let client = Client::with_options(options).map_err(driver)?;
        let database = client.database(&config.database);
        Ok(Self {
            subjects: database.collection(&config.subject_collection),
            records: database.collection(&config.record_collection),
        })
    }

    async fn find_by_id(
        collection: &Collection<Document>,
        id: &ObjectId,
    ) -> Result<Option<Value>, StoreError> {
        Ok(collection
            .find_one(id_filter(id)?, None)
            .await
            .map_err(driver)?
            .map(document_value))
    }
}

fn driver(err: mongodb::error::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

fn id_filter(id: &ObjectId) -> Result<Document, StoreError> {
    let oid = oid::ObjectId::parse_str(id.as_str())
        .map_err(|err| StoreError::Decode(err.to_string()))?;
    let mut filter = Document::new();
    filter.insert(fields::ID, oid);
    Ok(filter)
}

/// Filter that only matches a subject not already being processed.
fn claim_filter(id: &ObjectId) -> Result<Document, StoreError> {
    let mut filter = id_filter(id)?;
    filter.insert(
        fields::STATUS,
        doc! { "$ne": VerificationStatus::Processing.as_str() },
    );
    Ok(filter)
}

fn claim_update() -> Document {
    let mut set = Document::new();
    set.insert(fields::STATUS, VerificationStatus::Processing.as_str());
    doc! { "$set": set }
}

fn verdict_document(verdict: &Verdict) -> Result<Document, StoreError> {
    bson::to_document(&verdict_update(verdict)).map_err(|err| StoreError::Decode(err.to_string()))
}

/// Relaxed extended JSON, so object ids read back as `{"$oid": "..."}`.
fn document_value(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

#[async_trait]
impl SubjectStore for MongoSubjectStore {
    async fn find_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StoreError> {
        Self::find_by_id(&self.subjects, id)
            .await?
            .map(|doc| Subject::from_document(&doc).map_err(|err| StoreError::Decode(err.to_string())))
            .transpose()
    }

    async fn find_record_set(&self, reference: &ObjectId) -> Result<Option<RecordSet>, StoreError> {
        Ok(Self::find_by_id(&self.records, reference)
            .await?
            .map(|doc| RecordSet::from_document(&doc)))
    }

    async fn claim_for_processing(&self, id: &SubjectId) -> Result<ClaimOutcome, StoreError> {
        let previous = self
            .subjects
            .find_one_and_update(claim_filter(id)?, claim_update(), None)
            .await
            .map_err(driver)?;
        if previous.is_some() {
            return Ok(ClaimOutcome::Acquired);
        }
        Ok(match Self::find_by_id(&self.subjects, id).await? {
            Some(_) => ClaimOutcome::AlreadyProcessing,
            None => ClaimOutcome::NotFound,
        })
    }

    async fn write_verdict(&self, id: &SubjectId, verdict: &Verdict) -> Result<(), StoreError> {
        self.subjects
            .update_one(id_filter(id)?, verdict_document(verdict)?, None)
            .await
            .map_err(driver)?;
        Ok(())
    }

    async fn sample_subjects(&self, limit: usize) -> Result<Vec<Value>, StoreError> {
        let options = FindOptions::builder()
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .build();
        let documents: Vec<Document> = self
            .subjects
            .find(Document::new(), options)
            .await
            .map_err(driver)?
            .try_collect()
            .await
            .map_err(driver)?;
        Ok(documents
            .into_iter()
            .take(limit)
            .map(|doc| stringify_object_ids(document_value(doc)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ID: &str = "64b7f0c2a1b2c3d4e5f60718";

    #[test]
    fn claim_filter_excludes_processing_subjects() {
        let id = SubjectId::parse(ID).unwrap();
        let filter = claim_filter(&id).unwrap();
        assert_eq!(
            filter.get_object_id("_id").unwrap(),
            oid::ObjectId::parse_str(ID).unwrap()
        );
        assert_eq!(
            filter
                .get_document("verificationStatus")
                .unwrap()
                .get_str("$ne")
                .unwrap(),
            "PROCESSING"
        );
        assert_eq!(
            claim_update().get_document("$set").unwrap().get_str("verificationStatus").unwrap(),
            "PROCESSING"
        );
    }

    #[test]
    fn verdict_document_mirrors_update() {
        let update = verdict_document(&Verdict::verified()).unwrap();
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("verificationStatus").unwrap(), "VERIFIED");
        assert!(set.get_bool("isSystemVerified").unwrap());
        assert!(update.get_document("$unset").unwrap().contains_key("verificationDetails"));
    }

    #[test]
    fn stored_documents_decode_into_model() {
        let subject = doc! {
            "_id": oid::ObjectId::parse_str(ID).unwrap(),
            "stud_name": "Alice",
            "stud_info_id": oid::ObjectId::parse_str("64b7f0c2a1b2c3d4e5f60719").unwrap(),
            "verificationStatus": "UNVERIFIED",
        };
        let value = document_value(subject);
        assert_eq!(value["_id"], json!({ "$oid": ID }));
        let decoded = Subject::from_document(&value).unwrap();
        assert_eq!(decoded.id.as_str(), ID);
        assert_eq!(decoded.name.as_deref(), Some("Alice"));
        assert_eq!(decoded.records_reference.as_deref(), Some("64b7f0c2a1b2c3d4e5f60719"));

        let records = document_value(doc! { "stud_sem1_marksheet": "https://x/d/a", "stud_sem1_grade": 9.5 });
        let set = RecordSet::from_document(&records);
        assert_eq!(set.submitted_count(), 1);
    }

    #[tokio::test]
    async fn rejects_non_database_uri() {
        let err = MongoSubjectStore::connect(&MongoConfig::new("https://data.example.com", "placement"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_store_error() {
        let mut config = MongoConfig::new("mongodb://127.0.0.1:1/?directConnection=true", "placement");
        config.timeout = Duration::from_millis(200);
        let store = MongoSubjectStore::connect(&config).await.unwrap();
        let id = SubjectId::parse(ID).unwrap();
        assert!(matches!(
            store.claim_for_processing(&id).await,
            Err(StoreError::Transport(_))
        ));
    }
}
