use anyhow::Result;
use clap::Args;
use colored::Colorize;
use config::Config;
use nb_core::{JobStore, MirrorStore};

#[derive(Args)]
pub struct StatusArgs {
    #[arg(long, help = "Output as JSON")]
    pub json: bool,
}

pub async fn run(config: &Config, args: StatusArgs) -> Result<()> {
    let backend = super::connect(config).await?;
    let counts = backend.job_counts().await?;
    let subscriptions = backend.list_subscriptions().await?;

    if args.json {
        let output = serde_json::json!({
            "jobs": counts
                .iter()
                .map(|(status, count)| (status.to_string(), serde_json::json!(count)))
                .collect::<serde_json::Map<_, _>>(),
            "subscriptions": subscriptions
                .iter()
                .map(|s| serde_json::json!({
                    "id": s.id,
                    "source": s.source_notebook_id,
                    "target": s.target_notebook_id,
                    "watermark": s.watermark,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "Jobs".bold().underline());
    if counts.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for (status, count) in &counts {
        println!("  {:<10} {count}", status.to_string().cyan());
    }

    println!();
    println!("{}", "Subscriptions".bold().underline());
    if subscriptions.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for s in &subscriptions {
        println!(
            "  {} {} -> {} at {}",
            s.id.to_string().dimmed(),
            s.source_notebook_id,
            s.target_notebook_id,
            s.watermark.to_string().green()
        );
    }
    Ok(())
}
