//! # Configuration Validation
//!
//! Validates configuration structures using the `validator` crate.

use crate::config::Config;
use validator::Validate;

/// Validate a resolved configuration.
///
/// ## Validation Rules
/// ### PostgreSQL
/// - `host`: 1-255 characters
/// - `port`: 1-65535
/// - `pool_size`: 1-100
/// - `timeout_seconds`: 1-300
///
/// ### Jobs
/// - `default_timeout_seconds`: 1-86400
/// - `default_max_retries`: 0-100
/// - `poll_interval_ms`: 10-60000
///
/// ### Integration
/// - `similarity_threshold`, `friction_threshold`: 0.0-1.0
/// - `max_reference_depth`: 0-16
///
/// ### Observability
/// - `logging_level`: must be "trace", "debug", "info", "warn", or "error"
pub fn validate(config: &Config) -> Result<(), validator::ValidationErrors> {
    config.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_invalid_postgres_port() {
        let mut config = Config::default();
        config.providers.postgres.port = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_invalid_friction_threshold() {
        let mut config = Config::default();
        config.integration.friction_threshold = 1.5;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_invalid_timeout() {
        let mut config = Config::default();
        config.jobs.default_timeout_seconds = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_negative_retries() {
        let mut config = Config::default();
        config.jobs.default_max_retries = -1;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_invalid_logging_level() {
        let mut config = Config::default();
        config.observability.logging_level = "verbose".to_string();
        assert!(validate(&config).is_err());
    }
}
