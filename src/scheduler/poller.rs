//! Poll orchestration: probe devices, apply status transitions, persist.

use crate::clock::Clock;
use crate::db::{
    BatchPollResult, DbError, DeviceStatus, DeviceStore, PingResult, PollRecord, PollResult,
};
use crate::probe::{ProbeError, ProbeOutcome, Prober, DEADLINE_OVERHEAD};

use super::transition::{describe, next_status};

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// Poll error types.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("device {0} not found")]
    DeviceNotFound(i64),
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("batch poll cancelled")]
    Cancelled,
}

/// Orchestrates probes against registered devices.
///
/// Cloning is cheap; clones share the store, prober and per-device locks.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    store: Arc<dyn DeviceStore>,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    concurrency: usize,
    /// One writer per device. Entries are dropped once nobody holds them.
    device_locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl Poller {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        prober: Arc<dyn Prober>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                store,
                prober,
                clock,
                timeout,
                concurrency: concurrency.max(1),
                device_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Poll a single device and persist its new status.
    ///
    /// Only a missing device is an error. Any other fault is reported as an
    /// `error` result and leaves the stored device untouched.
    pub async fn poll_one(&self, device_id: i64) -> Result<PollResult, PollError> {
        let lock = self.device_lock(device_id);
        let result = {
            let _guard = lock.lock().await;
            self.poll_locked(device_id).await
        };
        self.release_device_lock(device_id, lock);
        result
    }

    async fn poll_locked(&self, device_id: i64) -> Result<PollResult, PollError> {
        let device = match self.inner.store.get_device(device_id) {
            Ok(Some(device)) => device,
            Ok(None) => return Err(PollError::DeviceNotFound(device_id)),
            Err(e) => return Ok(self.fault(device_id, e)),
        };

        let outcome = match self.run_probe(&device.address).await {
            Ok(outcome) => outcome,
            Err(e) => return Ok(self.fault(device_id, e)),
        };

        let status = next_status(device.status, &outcome);
        let now = self.inner.clock.now();
        let polled_at = device.last_polled_at.map_or(now, |prev| prev.max(now));

        let record = PollRecord {
            device_id,
            time: polled_at,
            status,
            latency_ms: outcome.latency_ms,
            detail: outcome.detail.clone(),
        };
        if let Err(e) = self.inner.store.record_poll(&record) {
            return Ok(self.fault(device_id, e));
        }

        if outcome.is_unavailable() {
            tracing::warn!(
                "Device {} ({}) marked {}: {}",
                device.name,
                device.address,
                status,
                outcome.detail
            );
        } else {
            tracing::info!("Device {} ({}) is {}", device.name, device.address, status);
        }

        Ok(PollResult {
            device_id,
            status,
            message: describe(status, &outcome),
            timestamp: polled_at,
        })
    }

    /// Poll every registered device on a bounded worker pool.
    ///
    /// Results follow store order. Once `cancel` fires no further devices
    /// are started; in-flight polls finish and the batch fails as cancelled.
    pub async fn poll_all(&self, cancel: &CancellationToken) -> Result<BatchPollResult, PollError> {
        let devices = self.inner.store.list_devices()?;
        if devices.is_empty() {
            return Ok(BatchPollResult::from_results(Vec::new()));
        }

        tracing::info!(
            "Polling {} devices (concurrency {})",
            devices.len(),
            self.inner.concurrency
        );

        let semaphore = Arc::new(Semaphore::new(self.inner.concurrency));
        let mut handles = Vec::with_capacity(devices.len());
        let mut cancelled = false;

        for device in &devices {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| PollError::Cancelled)?
                }
            };

            let poller = self.clone();
            let device_id = device.id;
            let handle = tokio::spawn(async move {
                let _permit = permit; // Hold permit until done
                poller.poll_one(device_id).await
            });
            handles.push((device_id, handle));
        }

        let started = handles.len();
        let mut results = Vec::with_capacity(started);
        for (device_id, handle) in handles {
            let result = match handle.await {
                Ok(Ok(result)) => result,
                // Deleted between list and poll.
                Ok(Err(e)) => self.fault(device_id, e),
                Err(e) => self.fault(device_id, format!("poll task failed: {}", e)),
            };
            results.push(result);
        }

        if cancelled {
            tracing::warn!(
                "Batch poll cancelled after starting {} of {} devices",
                started,
                devices.len()
            );
            return Err(PollError::Cancelled);
        }

        let batch = BatchPollResult::from_results(results);
        tracing::info!(
            "Batch poll finished: {} online, {} not online, {} total",
            batch.successful_polls,
            batch.failed_polls,
            batch.total_devices
        );
        Ok(batch)
    }

    /// Probe an address without touching any device record.
    pub async fn ping_only(&self, address: &str) -> PingResult {
        let address = address.trim();
        let outcome = self
            .run_probe(address)
            .await
            .unwrap_or_else(|e| ProbeOutcome::unreachable(e));

        let message = if outcome.reachable {
            "Device is reachable via ICMP".to_string()
        } else {
            format!("Device not reachable: {}", outcome.detail)
        };

        PingResult {
            address: address.to_string(),
            reachable: outcome.reachable,
            latency_ms: outcome.latency_ms,
            message,
            timestamp: self.inner.clock.now(),
        }
    }

    /// Probe a registered device's address without changing its status.
    pub async fn test_connection(&self, device_id: i64) -> Result<PingResult, PollError> {
        let device = self
            .inner
            .store
            .get_device(device_id)?
            .ok_or(PollError::DeviceNotFound(device_id))?;
        Ok(self.ping_only(&device.address).await)
    }

    /// Run the prober on its own task under a hard deadline.
    ///
    /// A panicking prober surfaces as `Err`; a prober that overruns the
    /// deadline is aborted and reported unreachable.
    async fn run_probe(&self, address: &str) -> Result<ProbeOutcome, String> {
        let prober = self.inner.prober.clone();
        let timeout = self.inner.timeout;
        let owned = address.to_string();

        let mut task = tokio::spawn(async move { prober.probe(&owned, timeout).await });
        match tokio::time::timeout(timeout + DEADLINE_OVERHEAD, &mut task).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(format!("probe task failed: {}", e)),
            Err(_) => {
                task.abort();
                tracing::warn!("Probe of {} overran its {:?} deadline", address, timeout);
                Ok(ProbeOutcome::from(ProbeError::Timeout(timeout)))
            }
        }
    }

    fn fault(&self, device_id: i64, err: impl Display) -> PollResult {
        tracing::error!("Poll of device {} failed: {}", device_id, err);
        PollResult {
            device_id,
            status: DeviceStatus::Error,
            message: format!("Polling failed: {}", err),
            timestamp: self.inner.clock.now(),
        }
    }

    fn device_lock(&self, device_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .inner
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(device_id).or_default().clone()
    }

    fn release_device_lock(&self, device_id: i64, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self
            .inner
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Held by the map and by us only: nobody is waiting on it.
        let idle = locks
            .get(&device_id)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(&device_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.inner
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
