use anyhow::Result;
use colored::Colorize;
use config::Config;
use knowledge::{EventBus, NotebookService};
use observability::AuditSink;
use tokio_util::sync::CancellationToken;

pub async fn run(config: &Config) -> Result<()> {
    let backend = super::connect(config).await?;
    let cancel = CancellationToken::new();
    let (audit, audit_task) = AuditSink::spawn(backend.clone(), &config.audit, cancel.clone());
    let service = NotebookService::new(backend, config, audit, EventBus::default());

    let report = service.reclaim_expired().await;
    cancel.cancel();
    audit_task.await?;
    let report = report?;

    println!(
        "{} {} requeued, {} exhausted",
        "Reclaimed".bold(),
        report.requeued.len(),
        report.exhausted.len()
    );
    for job in &report.exhausted {
        println!(
            "  {} {} {} for entry {}",
            "failed".red(),
            job.job_type,
            job.id,
            job.entry_id
        );
    }
    Ok(())
}
