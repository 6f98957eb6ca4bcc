pub mod migrate;
pub mod pump;
pub mod reclaim;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigLayers, ConfigSource, load_from_env, load_source_from_file};
use storage::PostgresBackend;
use tracing::debug;

#[derive(Parser)]
#[command(
    name = "nbctl",
    author,
    version,
    about = "Operate a notebook substrate deployment",
    long_about = "Applies schema migrations, sweeps expired job leases, runs the mirror pump \
                  and reports queue state.\n\nConfiguration is layered: built-in defaults, then \
                  --config, then NB_* environment variables, then --set overrides."
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// TOML or YAML configuration file
    #[arg(long, short, global = true, env = "NB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override a setting, e.g. --set jobs.default_max_retries=5
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    pub overrides: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Apply pending schema migrations")]
    Migrate,

    #[command(about = "Return expired job leases to the queue")]
    Reclaim,

    #[command(about = "Mirror claims into subscribing notebooks")]
    Pump(pump::PumpArgs),

    #[command(about = "Show job counts and subscription watermarks")]
    Status(status::StatusArgs),
}

/// Parses `key=value`. The value is read as JSON when it parses, otherwise
/// as a string.
pub fn parse_override(raw: &str) -> Result<(&str, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("override {raw:?} is not KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("override {raw:?} has an empty key"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key, value))
}

impl GlobalArgs {
    pub fn resolve(&self) -> Result<Config> {
        let mut layers = ConfigLayers::with_defaults();
        if let Some(path) = &self.config {
            layers.push(
                load_source_from_file(path)
                    .with_context(|| format!("loading {}", path.display()))?,
            );
        }
        layers.push(load_from_env());

        let overrides = self
            .overrides
            .iter()
            .map(|raw| parse_override(raw))
            .collect::<Result<Vec<_>>>()?;
        layers.push(ConfigSource::from_overrides("command line", overrides));

        debug!(layers = ?layers.names(), "Resolving configuration");
        Ok(layers.resolve()?)
    }
}

pub async fn connect(config: &Config) -> Result<Arc<PostgresBackend>> {
    let postgres = &config.providers.postgres;
    let backend = PostgresBackend::connect(&postgres.connection_url(), postgres.pool_size)
        .await
        .with_context(|| format!("connecting to {}:{}", postgres.host, postgres.port))?;
    Ok(Arc::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_override_reads_json_then_string() {
        assert_eq!(
            parse_override("jobs.default_max_retries=5").unwrap(),
            ("jobs.default_max_retries", json!(5))
        );
        assert_eq!(
            parse_override("providers.postgres.host=db.internal").unwrap(),
            ("providers.postgres.host", json!("db.internal"))
        );
        assert_eq!(
            parse_override("integration.cascade_rescore=false").unwrap(),
            ("integration.cascade_rescore", json!(false))
        );
        assert!(parse_override("no-equals").is_err());
        assert!(parse_override("=1").is_err());
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let args = GlobalArgs {
            config: None,
            overrides: vec!["integration.friction_threshold=0.35".to_string()],
        };
        let config = args.resolve().unwrap();
        assert_eq!(config.integration.friction_threshold, 0.35);
        assert_eq!(config.jobs.default_max_retries, 3);
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["nbctl", "--set", "mirror.batch_size=10", "pump", "--once"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Pump(ref a) if a.once));
        assert_eq!(cli.global.overrides, vec!["mirror.batch_size=10"]);
    }
}
