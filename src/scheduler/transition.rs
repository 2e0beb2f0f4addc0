//! Status transitions for completed probes.

use crate::db::DeviceStatus;
use crate::probe::ProbeOutcome;

/// Status a device moves to after a completed probe.
///
/// Only depends on reachability: the previous status never changes the
/// answer, and `error`/`unknown` are never produced here.
pub fn next_status(_current: DeviceStatus, outcome: &ProbeOutcome) -> DeviceStatus {
    if outcome.reachable {
        DeviceStatus::Online
    } else {
        DeviceStatus::Offline
    }
}

/// Human readable summary of a status transition.
pub fn describe(status: DeviceStatus, outcome: &ProbeOutcome) -> String {
    match (status, outcome.latency_ms) {
        (DeviceStatus::Online, Some(ms)) => format!("Device is online ({:.1} ms)", ms),
        (DeviceStatus::Online, None) => "Device is online".to_string(),
        _ => format!("Device is offline: {}", outcome.detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ALL: [DeviceStatus; 4] = [
        DeviceStatus::Unknown,
        DeviceStatus::Online,
        DeviceStatus::Offline,
        DeviceStatus::Error,
    ];

    #[test]
    fn test_reachable_is_always_online() {
        let outcome = ProbeOutcome::reachable(Duration::from_millis(4));
        for current in ALL {
            assert_eq!(next_status(current, &outcome), DeviceStatus::Online);
        }
    }

    #[test]
    fn test_unreachable_is_always_offline() {
        let outcomes = [
            ProbeOutcome::unreachable("no reply within 2s"),
            ProbeOutcome::unavailable("ping command not found"),
        ];
        for outcome in &outcomes {
            for current in ALL {
                assert_eq!(next_status(current, outcome), DeviceStatus::Offline);
            }
        }
    }

    #[test]
    fn test_describe() {
        let up = ProbeOutcome::reachable(Duration::from_micros(3_240));
        assert_eq!(describe(DeviceStatus::Online, &up), "Device is online (3.2 ms)");

        let down = ProbeOutcome::unreachable("no reply within 2s");
        assert_eq!(
            describe(DeviceStatus::Offline, &down),
            "Device is offline: no reply within 2s"
        );
    }
}
