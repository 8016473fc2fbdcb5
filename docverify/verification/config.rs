use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{builder::BoolishValueParser, ArgAction, Parser, ValueEnum};

use crate::{
    fetcher::ServiceAccountKey,
    oracle::gemini::DEFAULT_MODEL,
    store::{DataApiConfig, MongoConfig},
};

const STORE_TIMEOUT: Duration = Duration::from_secs(15);

/// Store implementation selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Native driver connecting to `MONGO_URI`.
    Mongo,
    /// HTTP data API at `STORE_DATA_API_URL`.
    DataApi,
}

/// Oracle implementation selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OracleBackend {
    /// Hosted generative model.
    Gemini,
    /// Local keyword containment.
    Keyword,
}

/// Command-line flags, each falling back to an environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "verification_server", version, about = "Marksheet verification service")]
pub struct ServiceArgs {
    /// Store implementation.
    #[arg(long, env = "STORE_BACKEND", value_enum, default_value_t = StoreBackend::Mongo)]
    pub store_backend: StoreBackend,
    /// Document database connection string.
    #[arg(long, env = "MONGO_URI", hide_env_values = true)]
    pub mongo_uri: Option<String>,
    /// Database holding the subject collections.
    #[arg(long, env = "DATABASE_NAME")]
    pub database_name: String,
    /// Base URL of the store's HTTP data API.
    #[arg(long, env = "STORE_DATA_API_URL")]
    pub store_data_api_url: Option<String>,
    /// Data source (cluster) name sent with every data API action.
    #[arg(long, env = "STORE_DATA_SOURCE", default_value = "Cluster0")]
    pub store_data_source: String,
    /// Data API key.
    #[arg(long, env = "STORE_API_KEY", hide_env_values = true)]
    pub store_api_key: Option<String>,
    /// Collection of subjects.
    #[arg(long, env = "STUDENT_COLLECTION", default_value = "students")]
    pub student_collection: String,
    /// Collection of record sets.
    #[arg(long, env = "STUDENT_INFO_COLLECTION", default_value = "studentinfos")]
    pub student_info_collection: String,
    /// Base64-encoded service-account JSON for document downloads.
    #[arg(long, env = "GOOGLE_SERVICE_ACCOUNT_JSON_BASE64", hide_env_values = true)]
    pub service_account_base64: String,
    /// API key for the generative model.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    pub google_api_key: Option<String>,
    /// Oracle implementation.
    #[arg(long, env = "ORACLE_BACKEND", value_enum, default_value_t = OracleBackend::Gemini)]
    pub oracle_backend: OracleBackend,
    /// Model queried by the gemini backend.
    #[arg(long, env = "ORACLE_MODEL", default_value = DEFAULT_MODEL)]
    pub oracle_model: String,
    /// Base URL of the notification service.
    #[arg(long, env = "NOTIFICATION_SERVICE_URL")]
    pub notification_service_url: Option<String>,
    /// Send outcome notifications after each run.
    #[arg(
        long,
        env = "NOTIFY_ON_COMPLETION",
        default_value_t = false,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub notify_on_completion: bool,
    /// Listen address.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: SocketAddr,
    /// Upper bound on simultaneously executing runs.
    #[arg(long, env = "VERIFY_MAX_CONCURRENT_RUNS", default_value_t = 4)]
    pub max_concurrent_runs: usize,
    /// JSON-lines audit log.
    #[arg(long, env = "VERIFY_LOG_PATH")]
    pub log_path: Option<PathBuf>,
    /// JSON-lines event ledger.
    #[arg(long, env = "VERIFY_EVENT_LOG")]
    pub event_log: Option<PathBuf>,
    /// Emit process logs as JSON.
    #[arg(
        long,
        env = "LOG_JSON",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: bool,
}

/// Oracle settings after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleConfig {
    /// Hosted model.
    Gemini {
        /// API key.
        api_key: String,
        /// Model name.
        model: String,
    },
    /// Keyword containment.
    Keyword,
}

/// Store settings after validation.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Native driver.
    Mongo(MongoConfig),
    /// HTTP data API.
    DataApi(DataApiConfig),
}

impl StoreConfig {
    /// Database name.
    #[must_use]
    pub fn database(&self) -> &str {
        match self {
            Self::Mongo(config) => &config.database,
            Self::DataApi(config) => &config.database,
        }
    }

    /// Short backend label for logs.
    #[must_use]
    pub const fn backend(&self) -> &'static str {
        match self {
            Self::Mongo(_) => "mongo",
            Self::DataApi(_) => "data_api",
        }
    }
}

/// Validated service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Store connection settings.
    pub store: StoreConfig,
    /// Decoded service-account key.
    pub credentials: ServiceAccountKey,
    /// Oracle settings.
    pub oracle: OracleConfig,
    /// Notification service base URL, present only when notifications are on.
    pub notification_url: Option<String>,
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Upper bound on simultaneously executing runs.
    pub max_concurrent_runs: usize,
    /// Audit log path.
    pub log_path: Option<PathBuf>,
    /// Event ledger path.
    pub event_log: Option<PathBuf>,
    /// Emit process logs as JSON.
    pub log_json: bool,
}

impl ServiceArgs {
    /// Validates arguments and decodes the credential blob.
    pub fn into_config(self) -> Result<ServiceConfig> {
        if self.database_name.trim().is_empty() {
            bail!("DATABASE_NAME must not be empty");
        }
        if self.max_concurrent_runs == 0 {
            bail!("VERIFY_MAX_CONCURRENT_RUNS must be at least 1");
        }
        let credentials = ServiceAccountKey::from_base64(&self.service_account_base64)
            .context("decoding GOOGLE_SERVICE_ACCOUNT_JSON_BASE64")?;
        let oracle = match self.oracle_backend {
            OracleBackend::Gemini => OracleConfig::Gemini {
                api_key: self
                    .google_api_key
                    .filter(|key| !key.trim().is_empty())
                    .context("GOOGLE_API_KEY is required for the gemini oracle backend")?,
                model: self.oracle_model,
            },
            OracleBackend::Keyword => OracleConfig::Keyword,
        };
        let notification_url = match (self.notify_on_completion, self.notification_service_url) {
            (true, Some(url)) => Some(url),
            (true, None) => bail!("NOTIFY_ON_COMPLETION requires NOTIFICATION_SERVICE_URL"),
            (false, _) => None,
        };
        let store = match self.store_backend {
            StoreBackend::Mongo => StoreConfig::Mongo(MongoConfig {
                uri: non_empty(self.mongo_uri)
                    .context("MONGO_URI is required for the mongo store backend")?,
                database: self.database_name,
                subject_collection: self.student_collection,
                record_collection: self.student_info_collection,
                timeout: STORE_TIMEOUT,
            }),
            StoreBackend::DataApi => StoreConfig::DataApi(DataApiConfig {
                endpoint: non_empty(self.store_data_api_url)
                    .context("STORE_DATA_API_URL is required for the data-api store backend")?,
                data_source: self.store_data_source,
                database: self.database_name,
                api_key: self.store_api_key,
                subject_collection: self.student_collection,
                record_collection: self.student_info_collection,
                timeout: STORE_TIMEOUT,
            }),
        };
        Ok(ServiceConfig {
            store,
            credentials,
            oracle,
            notification_url,
            bind_addr: self.bind_addr,
            max_concurrent_runs: self.max_concurrent_runs,
            log_path: self.log_path,
            event_log: self.event_log,
            log_json: self.log_json,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
