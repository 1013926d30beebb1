// Periodic dashboard refresh
//
// A background task that rebuilds the snapshot on a fixed interval and
// publishes it on a watch channel. Subscribers always see the latest
// snapshot; intermediate ones may be skipped.
//
// INVARIANTS:
// 1. The first fetch starts immediately on spawn
// 2. Cancellation is observed both between ticks and during a fetch
// 3. A fetch never overlaps the next one; missed ticks are delayed, not burst

use crate::dashboard::{fetch_dashboard, DashboardSnapshot};
use cipherdash_core::{Address, DashboardConfig, Deployments};
use cipherdash_interop::ChainClient;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct DashboardPoller {
    client: Arc<dyn ChainClient>,
    deployments: Arc<Deployments>,
    account: Option<Address>,
    config: DashboardConfig,
    interval: Duration,
}

impl DashboardPoller {
    pub fn new(
        client: Arc<dyn ChainClient>,
        deployments: Arc<Deployments>,
        account: Option<Address>,
        config: DashboardConfig,
    ) -> Self {
        let interval = Duration::from_secs(config.poll_interval_secs.max(1));
        DashboardPoller { client, deployments, account, config, interval }
    }

    /// Override the configured poll interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start polling until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> PollerHandle {
        let (sender, receiver) = watch::channel(Arc::new(DashboardSnapshot::loading()));
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Dashboard poller started (every {:?})", self.interval);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let fetch = fetch_dashboard(self.client.as_ref(), &self.deployments, self.account, &self.config);
                let snapshot = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    snapshot = fetch => snapshot,
                };

                debug!(
                    "Dashboard refreshed at block {} ({} transactions)",
                    snapshot.block_number,
                    snapshot.recent_transactions.len()
                );
                sender.send_replace(Arc::new(snapshot));
            }

            info!("Dashboard poller stopping");
        });

        PollerHandle { receiver, cancel, task }
    }
}

pub struct PollerHandle {
    receiver: watch::Receiver<Arc<DashboardSnapshot>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn subscribe(&self) -> watch::Receiver<Arc<DashboardSnapshot>> {
        self.receiver.clone()
    }

    pub fn latest(&self) -> Arc<DashboardSnapshot> {
        self.receiver.borrow().clone()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            debug!("Dashboard poller task ended abnormally: {}", e);
        }
    }
}
