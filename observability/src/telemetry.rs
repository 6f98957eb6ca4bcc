//! Process-wide tracing and metrics exporter setup.

use std::net::SocketAddr;

use config::ObservabilityConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Tracing subscriber already installed: {0}")]
    SubscriberInstalled(String),

    #[error("Failed to install metrics exporter: {0}")]
    Exporter(String),
}

/// `RUST_LOG` wins over the configured level when set.
pub fn env_filter(config: &ObservabilityConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.logging_level).map_err(|e| TelemetryError::InvalidFilter {
        filter: config.logging_level.clone(),
        reason: e.to_string(),
    })
}

pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), TelemetryError> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logs {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| TelemetryError::SubscriberInstalled(e.to_string()))
}

/// Serves `/metrics` on `0.0.0.0:<metrics_port>`. No-op unless metrics are
/// enabled.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<(), TelemetryError> {
    if !config.metrics_enabled {
        return Ok(());
    }
    let endpoint = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(endpoint)
        .install()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
    tracing::info!(%endpoint, "Metrics exporter listening");
    Ok(())
}
