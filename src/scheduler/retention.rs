//! Retention manager for cleaning up old poll history.

use crate::db::Store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RETENTION_PERIOD: Duration = Duration::from_secs(60);

/// Manager for deleting poll history past its retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: Duration,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: Duration) -> Self {
        Self { store, retention }
    }

    /// Start the retention manager background task.
    pub fn start(&self, shutdown: CancellationToken) {
        let store = self.store.clone();
        let retention = self.retention;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_PERIOD);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention, Utc::now());
                    }
                }
            }
        });
    }
}

fn process_retention(store: &Store, retention: Duration, now: DateTime<Utc>) {
    let retention = match ChronoDuration::from_std(retention) {
        Ok(r) => r,
        Err(_) => return,
    };
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        return;
    };

    match store.delete_poll_history_before(cutoff) {
        Ok(0) => {}
        Ok(n) => tracing::info!("RetentionManager: Deleted {} poll history rows", n),
        Err(e) => tracing::error!("RetentionManager: Failed to delete poll history: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DeviceStatus, DeviceStore, NewDevice, PollRecord};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_process_retention() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let dev = store.add_device(&NewDevice::new("sw", "10.0.0.1")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();

        for days_ago in [9, 3, 1] {
            store
                .record_poll(&PollRecord {
                    device_id: dev.id,
                    time: now - ChronoDuration::days(days_ago),
                    status: DeviceStatus::Offline,
                    latency_ms: None,
                    detail: "no reply".to_string(),
                })
                .unwrap();
        }

        process_retention(&store, Duration::from_secs(7 * 86_400), now);

        let history = store.get_poll_history(dev.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.time > now - ChronoDuration::days(7)));
    }

    #[test]
    fn test_absurd_retention_is_ignored() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        process_retention(&store, Duration::from_secs(u64::MAX), Utc::now());
    }
}
