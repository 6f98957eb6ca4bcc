//! # Configuration System
//!
//! Centralized configuration management for the notebook substrate.
//!
//! This crate provides:
//! - Configuration structures for all system components
//! - Environment variable loading (`NB_` prefix)
//! - Configuration file loading (TOML/YAML)
//! - Layered precedence through [`ConfigLayers`]
//! - Configuration validation

pub mod config;
pub mod file_loader;
pub mod loader;
pub mod precedence;
pub mod validation;

pub use config::{
    AuditConfig, Config, EntriesConfig, IntegrationConfig, JobsConfig, MirrorConfig,
    ObservabilityConfig, PostgresConfig, ProviderConfig,
};
pub use file_loader::{ConfigFileError, load_from_file, load_source_from_file};
pub use loader::{ENV_PREFIX, env_source, load_from_env};
pub use precedence::{ConfigError, ConfigLayers, ConfigSource};
pub use validation::validate;
