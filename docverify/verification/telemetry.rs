use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};

use crate::model::SubjectId;

/// Builder configuring telemetry for verification runs.
pub struct VerificationTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    sink: Option<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl VerificationTelemetryBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            sink: None,
            event_publisher: None,
        }
    }

    /// Sets the JSON audit log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Uses an arbitrary sink instead of a file.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Assigns the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<VerificationTelemetry> {
        let sink = match (self.sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(Arc::new(JsonLogger::new(path)?) as Arc<dyn LogSink>),
            (None, None) => None,
        };
        Ok(VerificationTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                sink,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle: mirrors every record to `tracing` and, when configured,
/// to an audit sink and an event bus.
#[derive(Clone)]
pub struct VerificationTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for VerificationTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationTelemetry")
            .field("module", &self.inner.module)
            .field("audit", &self.inner.sink.is_some())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    sink: Option<Arc<dyn LogSink>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl VerificationTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> VerificationTelemetryBuilder {
        VerificationTelemetryBuilder::new(module)
    }

    /// Telemetry that only reaches `tracing`.
    #[must_use]
    pub fn tracing_only(module: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: module.into(),
                sink: None,
                publisher: None,
            }),
        }
    }

    /// Logs a structured record. Sink failures are reported through `tracing`
    /// and never returned.
    pub fn log(&self, level: LogLevel, message: &str, subject: Option<&SubjectId>, metadata: Value) {
        let subject_label = subject.map_or("", SubjectId::as_str);
        match level {
            LogLevel::Debug => {
                tracing::debug!(module = %self.inner.module, subject = subject_label, fields = %metadata, "{message}");
            }
            LogLevel::Info => {
                tracing::info!(module = %self.inner.module, subject = subject_label, fields = %metadata, "{message}");
            }
            LogLevel::Warn => {
                tracing::warn!(module = %self.inner.module, subject = subject_label, fields = %metadata, "{message}");
            }
            LogLevel::Error => {
                tracing::error!(module = %self.inner.module, subject = subject_label, fields = %metadata, "{message}");
            }
        }
        if let Some(sink) = &self.inner.sink {
            let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(&metadata);
            if let Some(subject) = subject {
                record = record.with_subject(subject.as_str());
            }
            if let Err(err) = sink.write(&record) {
                tracing::warn!(module = %self.inner.module, error = %err, "audit sink write failed");
            }
        }
    }

    /// Emits an event via the configured bus.
    pub async fn event(&self, event_type: &str, payload: Value) {
        if let Some(publisher) = &self.inner.publisher {
            let record = EventRecord::new(&self.inner.module, event_type, payload);
            if let Err(err) = publisher.publish(record).await {
                tracing::warn!(module = %self.inner.module, event_type, error = %err, "event publish failed");
            }
        }
    }
}
