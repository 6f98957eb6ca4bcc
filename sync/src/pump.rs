//! Background mirroring loop.

use std::time::Duration;

use config::MirrorConfig;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::replicator::MirrorReplicator;

pub struct MirrorPump {
    replicator: MirrorReplicator,
    interval: Duration,
}

impl MirrorPump {
    pub fn new(replicator: MirrorReplicator, config: &MirrorConfig) -> Self {
        Self {
            replicator,
            interval: Duration::from_secs(config.pump_interval_seconds.max(1)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass over every subscription. Returns the number of mirrors
    /// applied.
    pub async fn tick(&self) -> usize {
        match self.replicator.pump_all().await {
            Ok(reports) => {
                for (subscription_id, report) in &reports {
                    if let Some(blocked_at) = report.blocked_at {
                        debug!(
                            %subscription_id,
                            watermark = report.watermark,
                            blocked_at,
                            "Subscription waiting on source"
                        );
                    }
                }
                reports.iter().map(|(_, r)| r.mirrored).sum()
            }
            Err(e) => {
                warn!(error = %e, "Listing subscriptions failed");
                0
            }
        }
    }

    /// Pumps on an interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Mirror pump started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mirrored = self.tick().await;
                    if mirrored > 0 {
                        debug!(mirrored, "Pump pass complete");
                    }
                }
            }
        }
        info!("Mirror pump stopped");
    }
}
