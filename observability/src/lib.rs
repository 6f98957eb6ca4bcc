//! # Observability
//!
//! Ambient instrumentation for the notebook substrate:
//! - [`audit`]: the bounded, non-blocking audit sink
//! - [`telemetry`]: tracing subscriber and Prometheus exporter setup
//! - [`metrics`]: metric names and recording helpers

pub mod audit;
pub mod metrics;
pub mod telemetry;

pub use audit::{AuditConsumer, AuditError, AuditSink};
pub use telemetry::{TelemetryError, init_metrics, init_tracing};
