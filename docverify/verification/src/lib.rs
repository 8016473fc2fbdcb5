#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Background verification of submitted marksheets against stored records.

/// Subjects, record sets, and verdicts.
#[path = "../model.rs"]
pub mod model;

/// Subject persistence.
#[path = "../store/main.rs"]
pub mod store;

/// Document retrieval from the cloud file store.
#[path = "../fetcher/main.rs"]
pub mod fetcher;

/// Document text extraction.
#[path = "../extractor.rs"]
pub mod extractor;

/// Binary match oracles.
#[path = "../oracle/main.rs"]
pub mod oracle;

/// Outcome notifications.
#[path = "../notifier.rs"]
pub mod notifier;

/// Per-subject verification run.
#[path = "../workflow.rs"]
pub mod workflow;

/// Background run scheduling.
#[path = "../dispatcher.rs"]
pub mod dispatcher;

/// HTTP trigger surface.
#[path = "../gateway.rs"]
pub mod gateway;

/// Environment-driven configuration.
#[path = "../config.rs"]
pub mod config;

/// Structured audit telemetry.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Process-scoped runtime wiring.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use config::{ServiceArgs, ServiceConfig};
pub use orchestration_entry::VerificationRuntime;
pub use telemetry::{VerificationTelemetry, VerificationTelemetryBuilder};
pub use workflow::{RunReport, VerificationWorkflow};
