//! `meshcal-runtime` – Background Work & Process Plumbing
//!
//! Everything that runs outside the engine's single-context call flow.
//!
//! # Modules
//!
//! - [`bake_job`] – [`BakeJob`][bake_job::BakeJob]: rebuilds every
//!   landmark's canonical estimate from its full history on Tokio's blocking
//!   pool. Cancellable through a shared flag; commits under a single store
//!   lock and skips landmarks that changed since the snapshot.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   `tracing` subscriber with an optional OTLP span exporter. Set
//!   `OTEL_EXPORTER_OTLP_ENDPOINT` to export spans to any OTLP collector.

pub mod bake_job;
pub mod telemetry;

pub use bake_job::{BakeHandle, BakeJob, BakeJobError, BakeReport};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
