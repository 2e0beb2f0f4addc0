//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reachability status of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Never polled.
    #[default]
    Unknown,
    Online,
    Offline,
    /// Poll-level fault. Only ever reported in a [`PollResult`], never stored.
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(DeviceStatus::Unknown),
            "online" => Ok(DeviceStatus::Online),
            "offline" => Ok(DeviceStatus::Offline),
            "error" => Ok(DeviceStatus::Error),
            other => Err(format!("unknown device status: {}", other)),
        }
    }
}

/// A registered network device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub device_type: String,
    pub port: u16,
    pub protocol: String,
    pub status: DeviceStatus,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Registry fields for a device that has not been stored yet.
///
/// Status and poll time are not part of it: a new device always starts
/// as `unknown` and never polled.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[cfg(test)]
impl NewDevice {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            device_type: String::new(),
            port: default_port(),
            protocol: default_protocol(),
        }
    }
}

/// Partial change to a device's registry fields.
///
/// Status and poll time are absent on purpose: only a poll moves them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub device_type: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_protocol() -> String {
    "ssh".to_string()
}

/// A completed poll, written together with the device status update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollRecord {
    pub device_id: i64,
    pub time: DateTime<Utc>,
    pub status: DeviceStatus,
    pub latency_ms: Option<f64>,
    pub detail: String,
}

/// Outcome of polling one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResult {
    pub device_id: i64,
    pub status: DeviceStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate outcome of polling every registered device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchPollResult {
    pub total_devices: usize,
    pub successful_polls: usize,
    pub failed_polls: usize,
    pub results: Vec<PollResult>,
}

impl BatchPollResult {
    /// Aggregate per-device results. Only `online` counts as a success.
    pub fn from_results(results: Vec<PollResult>) -> Self {
        let successful_polls = results
            .iter()
            .filter(|r| r.status == DeviceStatus::Online)
            .count();
        Self {
            total_devices: results.len(),
            successful_polls,
            failed_polls: results.len() - successful_polls,
            results,
        }
    }
}

/// Result of an ad-hoc connectivity check that touches no device record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingResult {
    pub address: String,
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: i64, status: DeviceStatus) -> PollResult {
        PollResult {
            device_id: id,
            status,
            message: String::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            DeviceStatus::Unknown,
            DeviceStatus::Online,
            DeviceStatus::Offline,
            DeviceStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<DeviceStatus>().unwrap(), status);
        }
        assert!("degraded".parse::<DeviceStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DeviceStatus::Offline).unwrap();
        assert_eq!(json, "\"offline\"");
    }

    #[test]
    fn test_batch_counts_only_online_as_success() {
        let batch = BatchPollResult::from_results(vec![
            result(1, DeviceStatus::Online),
            result(2, DeviceStatus::Offline),
            result(3, DeviceStatus::Error),
            result(4, DeviceStatus::Online),
        ]);
        assert_eq!(batch.total_devices, 4);
        assert_eq!(batch.successful_polls, 2);
        assert_eq!(batch.failed_polls, 2);
        assert_eq!(batch.successful_polls + batch.failed_polls, batch.results.len());
    }

    #[test]
    fn test_empty_batch() {
        let batch = BatchPollResult::from_results(vec![]);
        assert_eq!(batch.total_devices, 0);
        assert_eq!(batch.successful_polls, 0);
        assert_eq!(batch.failed_polls, 0);
        assert!(batch.results.is_empty());
    }

    #[test]
    fn test_new_device_defaults_from_json() {
        let dev: NewDevice =
            serde_json::from_str(r#"{"name": "core-sw1", "address": "10.0.0.1"}"#).unwrap();
        assert_eq!(dev.port, 22);
        assert_eq!(dev.protocol, "ssh");
        assert_eq!(dev.device_type, "");
    }

    #[test]
    fn test_device_update_fields_are_optional() {
        let update: DeviceUpdate = serde_json::from_str(r#"{"address": "10.0.0.9"}"#).unwrap();
        assert_eq!(update.address.as_deref(), Some("10.0.0.9"));
        assert!(update.name.is_none());
        assert!(update.port.is_none());
        assert!(update.protocol.is_none());
    }
}
