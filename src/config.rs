//! Configuration module for netpoll.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::probe::DEFAULT_PROBE_TIMEOUT;

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "netpoll.db")
    pub db_path: String,
    /// Timeout for a single reachability probe (default: 2s)
    pub probe_timeout: Duration,
    /// Maximum number of devices probed at once during a batch (default: 10)
    pub poll_concurrency: usize,
    /// Interval between scheduled batch polls, `None` when disabled (default: 5m)
    pub poll_interval: Option<Duration>,
    /// How long poll history is kept (default: 7 days)
    pub history_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "netpoll.db".to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            poll_concurrency: 10,
            poll_interval: Some(Duration::from_secs(300)),
            history_retention: Duration::from_secs(604_800),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETPOLL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `NETPOLL_DB_PATH`: Database file path (default: "netpoll.db")
    /// - `NETPOLL_PROBE_TIMEOUT_MS`: Probe timeout in milliseconds, > 0 (default: 2000)
    /// - `NETPOLL_POLL_CONCURRENCY`: Batch worker pool size, > 0 (default: 10)
    /// - `NETPOLL_POLL_INTERVAL_SECS`: Scheduled poll interval, 0 disables (default: 300)
    /// - `NETPOLL_HISTORY_RETENTION_SECS`: Poll history retention (default: 604800)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Values that fail to parse or are out of range keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse_var::<u16, _>(&lookup, "NETPOLL_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("NETPOLL_DB_PATH") {
            cfg.db_path = db_path;
        }

        match parse_var::<u64, _>(&lookup, "NETPOLL_PROBE_TIMEOUT_MS") {
            Some(0) => tracing::warn!("NETPOLL_PROBE_TIMEOUT_MS must be positive, keeping default"),
            Some(ms) => cfg.probe_timeout = Duration::from_millis(ms),
            None => {}
        }

        match parse_var::<usize, _>(&lookup, "NETPOLL_POLL_CONCURRENCY") {
            Some(0) => tracing::warn!("NETPOLL_POLL_CONCURRENCY must be positive, keeping default"),
            Some(n) => cfg.poll_concurrency = n,
            None => {}
        }

        match parse_var::<u64, _>(&lookup, "NETPOLL_POLL_INTERVAL_SECS") {
            Some(0) => cfg.poll_interval = None,
            Some(secs) => cfg.poll_interval = Some(Duration::from_secs(secs)),
            None => {}
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "NETPOLL_HISTORY_RETENTION_SECS") {
            cfg.history_retention = Duration::from_secs(secs);
        }

        cfg
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "netpoll.db");
        assert_eq!(cfg.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(DEFAULT_PROBE_TIMEOUT, Duration::from_secs(2));
        assert_eq!(cfg.poll_concurrency, 10);
        assert_eq!(cfg.poll_interval, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_overrides() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("NETPOLL_HTTP_PORT", "9000"),
            ("NETPOLL_DB_PATH", "/tmp/devices.db"),
            ("NETPOLL_PROBE_TIMEOUT_MS", "500"),
            ("NETPOLL_POLL_CONCURRENCY", "4"),
            ("NETPOLL_POLL_INTERVAL_SECS", "0"),
        ]));
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.db_path, "/tmp/devices.db");
        assert_eq!(cfg.probe_timeout, Duration::from_millis(500));
        assert_eq!(cfg.poll_concurrency, 4);
        assert_eq!(cfg.poll_interval, None);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = ServerConfig::from_lookup(lookup_from(&[
            ("NETPOLL_HTTP_PORT", "not-a-port"),
            ("NETPOLL_PROBE_TIMEOUT_MS", "0"),
            ("NETPOLL_POLL_CONCURRENCY", "0"),
        ]));
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.probe_timeout, Duration::from_secs(2));
        assert_eq!(cfg.poll_concurrency, 10);
    }
}
