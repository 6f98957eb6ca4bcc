//! # Configuration Precedence
//!
//! Configuration is resolved from an ordered list of named layers. Each layer
//! is an untyped document; layers are deep-merged key by key and the last
//! layer to set a key wins. No layer knows the format of any other.
//!
//! The usual order is defaults, file, environment, command line:
//!
//! ```rust,no_run
//! use config::{ConfigLayers, load_from_env, load_source_from_file};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLayers::with_defaults()
//!         .layer(load_source_from_file(Path::new("notebooks.toml"))?)
//!         .layer(load_from_env())
//!         .resolve()?;
//!     println!("postgres host: {}", config.providers.postgres.host);
//!     Ok(())
//! }
//! ```

use crate::config::Config;
use crate::file_loader::ConfigFileError;
use serde_json::{Map, Value};
use validator::Validate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    File(#[from] ConfigFileError),

    #[error("Configuration layer {source_name} is not a table")]
    NotATable { source_name: String },

    #[error("Merged configuration does not match schema: {0}")]
    Schema(String),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// One named configuration layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSource {
    pub name: String,
    pub values: Value,
}

impl ConfigSource {
    pub fn new(name: impl Into<String>, values: Value) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Lowers a typed configuration into a layer. Every key is set.
    pub fn from_config(name: impl Into<String>, config: &Config) -> Result<Self, ConfigError> {
        let values =
            serde_json::to_value(config).map_err(|e| ConfigError::Schema(e.to_string()))?;
        Ok(Self::new(name, values))
    }

    /// Builds a layer from `dotted.key=value` overrides such as those passed
    /// on a command line.
    pub fn from_overrides<'a, I>(name: impl Into<String>, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut root = Value::Object(Map::new());
        for (key, value) in overrides {
            let mut cursor = &mut root;
            for segment in key.split('.') {
                if !cursor.is_object() {
                    *cursor = Value::Object(Map::new());
                }
                if let Value::Object(map) = cursor {
                    cursor = map
                        .entry(segment.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                }
            }
            *cursor = value;
        }
        Self::new(name, root)
    }
}

/// Ordered configuration layers, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    sources: Vec<ConfigSource>,
}

impl ConfigLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the built-in defaults.
    pub fn with_defaults() -> Self {
        let mut layers = Self::new();
        match ConfigSource::from_config("defaults", &Config::default()) {
            Ok(defaults) => layers.push(defaults),
            Err(e) => tracing::warn!(error = %e, "Failed to lower default configuration"),
        }
        layers
    }

    pub fn push(&mut self, source: ConfigSource) {
        self.sources.push(source);
    }

    pub fn layer(mut self, source: ConfigSource) -> Self {
        self.push(source);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    /// Deep-merges every layer in order, logging each override with the name
    /// of the layer that set it.
    pub fn merged(&self) -> Result<Value, ConfigError> {
        let mut merged = Value::Object(Map::new());
        for source in &self.sources {
            if !source.values.is_object() {
                return Err(ConfigError::NotATable {
                    source_name: source.name.clone(),
                });
            }
            let mut changes = Vec::new();
            deep_merge(&mut merged, &source.values, "", &mut changes);
            if !changes.is_empty() {
                tracing::info!("Configuration from {}: {:?}", source.name, changes);
            }
        }
        Ok(merged)
    }

    /// Merges, deserializes and validates.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let merged = self.merged()?;
        let config: Config =
            serde_json::from_value(merged).map_err(|e| ConfigError::Schema(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn deep_merge(base: &mut Value, overlay: &Value, prefix: &str, changes: &mut Vec<String>) {
    let Value::Object(overlay_map) = overlay else {
        return;
    };
    if !base.is_object() {
        *base = Value::Object(Map::new());
    }
    let Value::Object(base_map) = base else {
        return;
    };

    for (key, value) in overlay_map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        if value.is_null() {
            continue;
        }

        if value.is_object() {
            let slot = base_map
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            deep_merge(slot, value, &path, changes);
            continue;
        }

        if base_map.get(key) != Some(value) {
            changes.push(describe_change(&path, value));
            base_map.insert(key.clone(), value.clone());
        }
    }
}

fn describe_change(path: &str, value: &Value) -> String {
    if path.contains("password") {
        format!("{path} = ***")
    } else {
        format!("{path} = {value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_layer_wins_per_key() {
        let config = ConfigLayers::with_defaults()
            .layer(ConfigSource::new(
                "file",
                json!({ "providers": { "postgres": { "host": "file_host", "port": 5433 } } }),
            ))
            .layer(ConfigSource::new(
                "env",
                json!({ "providers": { "postgres": { "port": 9999 } } }),
            ))
            .resolve()
            .unwrap();

        assert_eq!(config.providers.postgres.host, "file_host");
        assert_eq!(config.providers.postgres.port, 9999);
        assert_eq!(config.providers.postgres.database, "notebooks");
    }

    #[test]
    fn test_cli_overrides_all() {
        let config = ConfigLayers::with_defaults()
            .layer(ConfigSource::new("file", json!({ "jobs": { "default_max_retries": 5 } })))
            .layer(ConfigSource::new("env", json!({ "jobs": { "default_max_retries": 6 } })))
            .layer(ConfigSource::from_overrides(
                "cli",
                [("jobs.default_max_retries", json!(7))],
            ))
            .resolve()
            .unwrap();

        assert_eq!(config.jobs.default_max_retries, 7);
    }

    #[test]
    fn test_explicit_default_value_still_overrides() {
        let config = ConfigLayers::with_defaults()
            .layer(ConfigSource::new("file", json!({ "jobs": { "default_max_retries": 8 } })))
            .layer(ConfigSource::new("env", json!({ "jobs": { "default_max_retries": 3 } })))
            .resolve()
            .unwrap();

        assert_eq!(config.jobs.default_max_retries, 3);
    }

    #[test]
    fn test_null_does_not_erase() {
        let config = ConfigLayers::with_defaults()
            .layer(ConfigSource::new("file", json!({ "mirror": { "batch_size": 10 } })))
            .layer(ConfigSource::new("env", json!({ "mirror": { "batch_size": null } })))
            .resolve()
            .unwrap();

        assert_eq!(config.mirror.batch_size, 10);
    }

    #[test]
    fn test_records_changes_with_masked_password() {
        let mut merged = json!({ "providers": { "postgres": { "password": "" } } });
        let mut changes = Vec::new();
        deep_merge(
            &mut merged,
            &json!({ "providers": { "postgres": { "password": "hunter2", "host": "h" } } }),
            "",
            &mut changes,
        );

        assert!(changes.contains(&"providers.postgres.password = ***".to_string()));
        assert!(changes.contains(&"providers.postgres.host = \"h\"".to_string()));
        assert_eq!(merged["providers"]["postgres"]["password"], json!("hunter2"));
    }

    #[test]
    fn test_non_table_layer_rejected() {
        let result = ConfigLayers::new()
            .layer(ConfigSource::new("broken", json!(42)))
            .resolve();
        assert!(matches!(result, Err(ConfigError::NotATable { .. })));
    }

    #[test]
    fn test_invalid_merged_value_fails_validation() {
        let result = ConfigLayers::with_defaults()
            .layer(ConfigSource::new(
                "cli",
                json!({ "integration": { "friction_threshold": 3.0 } }),
            ))
            .resolve();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_names_in_order() {
        let layers = ConfigLayers::with_defaults()
            .layer(ConfigSource::new("file", json!({})))
            .layer(ConfigSource::new("env", json!({})));
        assert_eq!(layers.names(), vec!["defaults", "file", "env"]);
    }
}
