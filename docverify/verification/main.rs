use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;

use crate::{
    config::{OracleConfig, ServiceConfig, StoreConfig},
    dispatcher::{DispatcherHandle, VerificationDispatcher},
    extractor::PdfTextExtractor,
    fetcher::{DriveDocumentFetcher, ServiceAccountTokenSource, DRIVE_READONLY_SCOPE},
    gateway::{build_router, GatewayState},
    notifier::HttpNotifier,
    oracle::{GeminiOracle, KeywordOracle, MatchOracle},
    store::{DataApiStore, MongoSubjectStore, SubjectStore},
    telemetry::VerificationTelemetry,
    workflow::VerificationWorkflow,
};

/// Process-scoped context: owns the collaborators shared by the gateway and
/// every workflow run.
#[derive(Debug)]
pub struct VerificationRuntime {
    workflow: Arc<VerificationWorkflow>,
    max_concurrent_runs: usize,
}

impl VerificationRuntime {
    /// Wires production collaborators from validated configuration. The
    /// store client connects lazily; nothing here waits on the network.
    pub async fn bootstrap(config: &ServiceConfig) -> Result<Self> {
        let mut telemetry = VerificationTelemetry::builder("verification");
        if let Some(path) = &config.log_path {
            telemetry = telemetry.log_path(path);
        }
        if let Some(path) = &config.event_log {
            let publisher = FileEventPublisher::new(path)
                .with_context(|| format!("opening event ledger {}", path.display()))?;
            telemetry = telemetry.event_publisher(Arc::new(publisher));
        }
        let telemetry = telemetry.build().context("initialising audit telemetry")?;

        let store: Arc<dyn SubjectStore> = match &config.store {
            StoreConfig::Mongo(mongo) => Arc::new(
                MongoSubjectStore::connect(mongo)
                    .await
                    .context("configuring document store client")?,
            ),
            StoreConfig::DataApi(api) => {
                Arc::new(DataApiStore::new(api.clone()).context("building store client")?)
            }
        };
        let tokens = ServiceAccountTokenSource::new(config.credentials.clone(), DRIVE_READONLY_SCOPE)
            .context("loading service account credentials")?;
        let fetcher = DriveDocumentFetcher::new(Arc::new(tokens)).context("building drive client")?;
        let oracle: Arc<dyn MatchOracle> = match &config.oracle {
            OracleConfig::Gemini { api_key, model } => Arc::new(
                GeminiOracle::new(api_key.as_str(), model.as_str()).context("building oracle client")?,
            ),
            OracleConfig::Keyword => Arc::new(KeywordOracle),
        };

        let mut workflow = VerificationWorkflow::builder()
            .store(store)
            .fetcher(Arc::new(fetcher))
            .extractor(Arc::new(PdfTextExtractor))
            .oracle(oracle)
            .telemetry(telemetry.clone());
        if let Some(url) = &config.notification_url {
            workflow = workflow
                .notifier(Arc::new(HttpNotifier::new(url).context("building notifier")?));
        }
        let oracle_kind = match config.oracle {
            OracleConfig::Gemini { .. } => "gemini",
            OracleConfig::Keyword => "keyword",
        };
        telemetry.log(
            LogLevel::Info,
            "verification.runtime.bootstrapped",
            None,
            json!({
                "store": config.store.backend(),
                "database": config.store.database(),
                "oracle": oracle_kind,
                "notifications": config.notification_url.is_some(),
                "max_concurrent_runs": config.max_concurrent_runs,
            }),
        );
        Ok(Self::from_parts(workflow.build()?, config.max_concurrent_runs))
    }

    /// Wraps an already-built workflow.
    #[must_use]
    pub fn from_parts(workflow: VerificationWorkflow, max_concurrent_runs: usize) -> Self {
        Self {
            workflow: Arc::new(workflow),
            max_concurrent_runs,
        }
    }

    /// Shared workflow.
    #[must_use]
    pub const fn workflow(&self) -> &Arc<VerificationWorkflow> {
        &self.workflow
    }

    /// Store used by the gateway and the workflow.
    #[must_use]
    pub fn store(&self) -> Arc<dyn SubjectStore> {
        self.workflow.store()
    }

    /// Starts the background dispatcher and returns the HTTP router bound to
    /// it. Drain the handle after the listener stops.
    #[must_use]
    pub fn start(&self) -> (Router, DispatcherHandle) {
        let (dispatcher, handle) =
            VerificationDispatcher::spawn(Arc::clone(&self.workflow), self.max_concurrent_runs);
        let state = GatewayState::new(
            self.workflow.store(),
            dispatcher,
            self.workflow.telemetry().clone(),
        );
        (build_router(state), handle)
    }
}
