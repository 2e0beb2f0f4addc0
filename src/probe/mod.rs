//! Probe module for device reachability.
//!
//! A probe is one bounded ICMP echo attempt against an address. Failures of
//! the probe itself are folded into a [`ProbeOutcome`] so callers always get
//! an answer within the timeout.

mod ping;

pub use ping::*;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Slack allowed on top of the probe timeout before the hard deadline fires.
pub const DEADLINE_OVERHEAD: Duration = Duration::from_millis(500);

/// Prefix of [`ProbeOutcome::detail`] when the probe could not run at all.
pub const UNAVAILABLE_PREFIX: &str = "probe unavailable: ";

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Structured result of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub reachable: bool,
    /// Round-trip time, only present when a reply was measured.
    pub latency_ms: Option<f64>,
    pub detail: String,
}

impl ProbeOutcome {
    pub fn reachable(latency: Duration) -> Self {
        Self {
            reachable: true,
            latency_ms: Some(latency.as_secs_f64() * 1000.0),
            detail: "reachable".to_string(),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency_ms: None,
            detail: detail.into(),
        }
    }

    pub fn unavailable(reason: impl AsRef<str>) -> Self {
        Self::unreachable(format!("{}{}", UNAVAILABLE_PREFIX, reason.as_ref()))
    }

    /// True when the probe mechanism itself could not run.
    pub fn is_unavailable(&self) -> bool {
        self.detail.starts_with(UNAVAILABLE_PREFIX)
    }
}

impl ProbeOutcome {
    /// Fold a raw probe result into an outcome.
    pub fn from_result(result: Result<Duration, ProbeError>) -> Self {
        match result {
            Ok(latency) => ProbeOutcome::reachable(latency),
            Err(e) => ProbeOutcome::from(e),
        }
    }
}

impl From<ProbeError> for ProbeOutcome {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Timeout(timeout) => {
                ProbeOutcome::unreachable(format!("no reply within {:?}", timeout))
            }
            ProbeError::Unavailable(reason) => ProbeOutcome::unavailable(reason),
            other => ProbeOutcome::unreachable(other.to_string()),
        }
    }
}

/// A reachability check against a single address.
///
/// Implementations must be safe to call concurrently for different
/// addresses and must not hold shared mutable state.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome;
}

/// ICMP echo prober with `ping` command fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome {
        if let Err(e) = validate_address(address) {
            return ProbeOutcome::from(e);
        }

        let outcome = with_deadline(timeout, async {
            ProbeOutcome::from_result(run_ping_probe(address, timeout).await)
        })
        .await;

        if outcome.is_unavailable() {
            tracing::warn!("Ping probe for {} could not run: {}", address, outcome.detail);
        } else {
            tracing::debug!(
                "Ping probe for {}: reachable={} latency_ms={:?}",
                address,
                outcome.reachable,
                outcome.latency_ms
            );
        }

        outcome
    }
}

/// Run a probe future under a hard deadline of `timeout` plus a fixed overhead.
///
/// Expiry is reported as unreachable.
pub async fn with_deadline<F>(timeout: Duration, probe: F) -> ProbeOutcome
where
    F: Future<Output = ProbeOutcome>,
{
    match tokio::time::timeout(timeout + DEADLINE_OVERHEAD, probe).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome::from(ProbeError::Timeout(timeout)),
    }
}

/// Check that an address is a plausible IP literal or host name.
pub fn validate_address(address: &str) -> Result<(), ProbeError> {
    if address.is_empty() {
        return Err(ProbeError::InvalidAddress("address is empty".to_string()));
    }
    if address.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    if address.len() > 253 {
        return Err(ProbeError::InvalidAddress(format!("{} is too long", address)));
    }

    let labels_ok = address
        .trim_end_matches('.')
        .split('.')
        .all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if labels_ok {
        Ok(())
    } else {
        Err(ProbeError::InvalidAddress(format!(
            "{:?} is not an IP address or host name",
            address
        )))
    }
}
