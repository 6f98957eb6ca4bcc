//! # Environment Variable Loader
//!
//! Builds a configuration layer from environment variables following 12-factor
//! app principles.
//!
//! # Naming Convention
//! Variables carry the `NB_` prefix and use `__` to descend into nested
//! sections, so `NB_PROVIDERS__POSTGRES__HOST` sets `providers.postgres.host`.
//! Values are parsed as JSON scalars when possible (`5`, `true`, `0.8`) and
//! kept as strings otherwise.

use crate::precedence::ConfigSource;
use serde_json::{Map, Value};
use std::env;

pub const ENV_PREFIX: &str = "NB_";

/// Collects every `NB_*` variable of the current process into a layer.
pub fn load_from_env() -> ConfigSource {
    env_source(ENV_PREFIX, env::vars())
}

/// Builds a layer from an explicit set of variables.
pub fn env_source<I>(prefix: &str, vars: I) -> ConfigSource
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut root = Map::new();
    let mut vars: Vec<(String, String)> = vars
        .into_iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .collect();
    vars.sort();

    for (key, raw) in vars {
        let path: Vec<String> = key[prefix.len()..]
            .split("__")
            .map(str::to_lowercase)
            .collect();
        if path.iter().any(String::is_empty) {
            tracing::warn!(variable = %key, "Ignoring malformed configuration variable");
            continue;
        }
        insert_path(&mut root, &path, parse_value(&raw));
    }

    ConfigSource::new("env", Value::Object(root))
}

fn parse_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if !value.is_object() && !value.is_array() => value,
        _ => Value::String(raw.to_string()),
    }
}

fn insert_path(root: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = root;
    for segment in parents {
        let slot = cursor
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(next) = slot else {
            return;
        };
        cursor = next;
    }
    cursor.insert(last.clone(), value);
}
