use anyhow::Result;
use clap::Args;
use config::Config;
use knowledge::EventBus;
use sync::{MirrorPump, MirrorReplicator};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args)]
pub struct PumpArgs {
    /// Run a single pass instead of looping until interrupted
    #[arg(long)]
    pub once: bool,
}

pub async fn run(config: &Config, args: PumpArgs) -> Result<()> {
    observability::init_metrics(&config.observability)?;
    let backend = super::connect(config).await?;
    let replicator =
        MirrorReplicator::new(backend, EventBus::default(), config.mirror.batch_size);
    let pump = MirrorPump::new(replicator, &config.mirror);

    if args.once {
        let mirrored = pump.tick().await;
        println!("Mirrored {mirrored} entries");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping pump");
        }
        signal.cancel();
    });
    pump.run(cancel).await;
    Ok(())
}
