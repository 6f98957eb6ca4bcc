use anyhow::Result;
use colored::Colorize;
use config::Config;

pub async fn run(config: &Config) -> Result<()> {
    let backend = super::connect(config).await?;
    let applied = backend.migrate().await?;
    if applied.is_empty() {
        println!("{}", "Schema is up to date".green());
    } else {
        for version in applied {
            println!("{} migration {version}", "Applied".green().bold());
        }
    }
    Ok(())
}
