//! Scheduler module for polling devices and maintaining poll history.

mod poller;
mod retention;
mod transition;

pub use poller::*;
pub use retention::*;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs a batch poll of every device on a fixed interval.
pub struct Scheduler {
    poller: Poller,
    interval: Duration,
    retention_manager: Arc<RetentionManager>,
}

impl Scheduler {
    pub fn new(
        poller: Poller,
        interval: Duration,
        retention_manager: Arc<RetentionManager>,
    ) -> Self {
        Self {
            poller,
            interval,
            retention_manager,
        }
    }

    /// Start the periodic poll loop and the retention manager.
    ///
    /// Both stop when `shutdown` is cancelled.
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        tracing::info!("Starting scheduler, polling every {:?}", self.interval);

        self.retention_manager.start(shutdown.clone());

        let poller = self.poller.clone();
        let interval = self.interval;
        tokio::spawn(run_poll_loop(poller, interval, shutdown))
    }
}

/// Poll all devices on every tick until shutdown.
///
/// A batch runs inline, so a slow batch delays the next tick instead of
/// overlapping it; missed ticks are skipped.
async fn run_poll_loop(poller: Poller, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match poller.poll_all(&shutdown).await {
                    Ok(batch) => tracing::debug!(
                        "Scheduled poll: {}/{} devices online",
                        batch.successful_polls,
                        batch.total_devices
                    ),
                    Err(PollError::Cancelled) => break,
                    Err(e) => tracing::error!("Scheduled poll failed: {}", e),
                }
            }
        }
    }

    tracing::info!("Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::{DeviceStatus, DeviceStore, NewDevice, Store};
    use crate::probe::{ProbeOutcome, Prober};
    use async_trait::async_trait;
    use tempfile::NamedTempFile;

    struct AlwaysUp;

    #[async_trait]
    impl Prober for AlwaysUp {
        async fn probe(&self, _address: &str, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::reachable(Duration::from_millis(1))
        }
    }

    #[tokio::test]
    async fn test_scheduler_polls_and_stops() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let dev = store.add_device(&NewDevice::new("sw", "10.0.0.1")).unwrap();

        let poller = Poller::new(
            store.clone(),
            Arc::new(AlwaysUp),
            Arc::new(SystemClock),
            Duration::from_secs(1),
            2,
        );
        let retention = Arc::new(RetentionManager::new(store.clone(), Duration::from_secs(3600)));
        let scheduler = Scheduler::new(poller, Duration::from_millis(10), retention);

        let shutdown = CancellationToken::new();
        let handle = scheduler.start(shutdown.clone());

        // The first tick fires immediately.
        for _ in 0..100 {
            if store.get_device(dev.id).unwrap().unwrap().status == DeviceStatus::Online {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            store.get_device(dev.id).unwrap().unwrap().status,
            DeviceStatus::Online
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
