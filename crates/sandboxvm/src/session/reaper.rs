//! Background expiry reaper.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::service::SessionService;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired sessions torn down.
    pub expired: usize,
    /// Sessions left mid-transition that were failed or torn down.
    pub abandoned: usize,
    /// Live sessions whose instance vanished or stopped running.
    pub missing: usize,
    /// Leftover instances of ended sessions removed.
    pub destroyed: usize,
    /// Managed instances without a live session, removed.
    pub orphans: usize,
    /// Tombstones forgotten.
    pub purged: usize,
    /// Idle quota records dropped.
    pub pruned: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired == 0
            && self.abandoned == 0
            && self.missing == 0
            && self.destroyed == 0
            && self.orphans == 0
            && self.purged == 0
    }
}

/// Outcome of the startup reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Checkpointed sessions adopted again.
    pub restored: usize,
    /// Checkpointed live sessions that could not be restored.
    pub sessions_destroyed: usize,
    /// Managed instances without a session, removed.
    pub orphans_destroyed: usize,
    /// Instances that could not be removed.
    pub failed: usize,
}

/// Periodic sweeper converging expired and abandoned sessions.
#[derive(Clone)]
pub struct Reaper {
    service: Arc<SessionService>,
    interval: Duration,
}

impl Reaper {
    pub fn new(service: Arc<SessionService>) -> Self {
        let interval = service.reaper_config().interval();
        Self { service, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep now.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as if the clock read `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        self.service.sweep(now).await
    }

    /// Run the startup reconciliation pass, then start sweeping.
    ///
    /// Must run before the API accepts requests: an instance that is still
    /// being provisioned would look like an orphan.
    pub async fn start(self) -> ReaperHandle {
        if let Err(e) = self.service.reconcile_on_startup().await {
            error!("startup reconciliation failed: {}", e);
        }
        self.spawn()
    }

    /// Start the periodic sweep task.
    pub fn spawn(self) -> ReaperHandle {
        let token = CancellationToken::new();
        let child = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("reaper started (interval {:?})", self.interval);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }

            info!("reaper stopped");
        });

        ReaperHandle { token, task }
    }
}

/// Handle to a running reaper task.
pub struct ReaperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for an in-flight sweep to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("reaper task ended abnormally: {}", e);
        }
    }
}
