//! # Configuration File Loading
//!
//! Loads configuration from TOML or YAML files, detecting the format from the
//! file extension.
//!
//! Files are read as untyped documents so that a partial file only overrides
//! the keys it names when layered over other sources.

use crate::config::Config;
use crate::precedence::ConfigSource;
use std::path::Path;

/// Configuration file loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(String),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(String),

    #[error("Config file has no extension")]
    NoExtension,

    #[error("Unsupported config file format: {0}")]
    UnsupportedFormat(String),

    #[error("Config file does not match schema: {0}")]
    Schema(String),
}

fn read(path: &Path) -> Result<String, ConfigFileError> {
    std::fs::read_to_string(path)
        .map_err(|_e| ConfigFileError::FileNotFound(path.display().to_string()))
}

/// Parses a TOML file into an untyped document.
pub fn load_toml_value(path: &Path) -> Result<serde_json::Value, ConfigFileError> {
    let contents = read(path)?;
    toml::from_str(&contents).map_err(|e| ConfigFileError::TomlParse(e.to_string()))
}

/// Parses a YAML file into an untyped document. An empty file is an empty
/// table.
pub fn load_yaml_value(path: &Path) -> Result<serde_json::Value, ConfigFileError> {
    let contents = read(path)?;
    let value: serde_json::Value =
        serde_yaml::from_str(&contents).map_err(|e| ConfigFileError::YamlParse(e.to_string()))?;
    if value.is_null() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    Ok(value)
}

/// Builds a named configuration layer from a file.
pub fn load_source_from_file(path: &Path) -> Result<ConfigSource, ConfigFileError> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or(ConfigFileError::NoExtension)?;

    let values = match extension.to_lowercase().as_str() {
        "toml" => load_toml_value(path)?,
        "yaml" | "yml" => load_yaml_value(path)?,
        other => return Err(ConfigFileError::UnsupportedFormat(other.to_string())),
    };

    Ok(ConfigSource::new(
        format!("file:{}", path.display()),
        values,
    ))
}

/// Loads a complete configuration from a single file, defaults filling the
/// gaps.
pub fn load_from_file(path: &Path) -> Result<Config, ConfigFileError> {
    let source = load_source_from_file(path)?;
    serde_json::from_value(source.values).map_err(|e| ConfigFileError::Schema(e.to_string()))
}
