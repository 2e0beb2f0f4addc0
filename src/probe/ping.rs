//! Ping probe with native ICMP and `ping` command fallback.
//!
//! Native probes run on blocking sockets inside `spawn_blocking` so the
//! measured round trip is not skewed by the async scheduler.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier and sequence pair so concurrent pings to the same host can
/// tell their replies apart.
fn next_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where ping_group_range allows it.
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Send one echo request to `address` and return the round-trip time.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("ping task failed: {}", e)))?;

        return match result {
            Err(ProbeError::Unavailable(reason)) => {
                tracing::warn!(
                    "Native ping to {} not permitted ({}), falling back to command",
                    address,
                    reason
                );
                run_ping_command(address, timeout).await
            }
            other => other,
        };
    }

    run_ping_command(address, timeout).await
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

fn socket_error(context: &str, e: std::io::Error) -> ProbeError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ProbeError::Unavailable(format!("{}: {}", context, e))
    } else {
        ProbeError::Network(format!("{}: {}", context, e))
    }
}

/// Blocking ICMP echo exchange. Runs on a `spawn_blocking` thread.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMPV4_ECHO_REQUEST, ICMPV4_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };

    // Linux rewrites the identifier of DGRAM echo requests and filters replies
    // per socket, so only RAW sockets can check it.
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, true),
        Err(_) => (
            Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|e| socket_error("failed to create ICMP socket", e))?,
            false,
        ),
    };

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| socket_error("failed to set timeout", e))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| socket_error("failed to set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| socket_error("failed to connect", e))?;

    let (identifier, sequence) = next_ping_id();
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| socket_error("failed to send", e))?;

    // Other replies may share the socket; keep reading until ours or the timeout.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => socket_error("failed to receive", e),
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        let expected_id = if raw { Some(identifier) } else { None };
        if is_echo_reply(buf, reply_type, expected_id, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Match an echo reply, skipping the IPv4 header RAW sockets deliver.
fn is_echo_reply(buf: &[u8], reply_type: u8, identifier: Option<u16>, sequence: u16) -> bool {
    let offset = if reply_type == ICMPV4_ECHO_REPLY && !buf.is_empty() && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };

    let Some(icmp) = buf.get(offset..offset + 8) else {
        return false;
    };

    icmp[0] == reply_type
        && identifier.map_or(true, |id| u16::from_be_bytes([icmp[4], icmp[5]]) == id)
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// Build an echo request: 8 byte header plus 56 byte payload.
///
/// ICMPv6 checksums are filled in by the kernel.
fn build_echo_request(kind: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = kind;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via the system `ping` command.
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ProbeError::Unavailable("ping command not found".to_string())
            }
            std::io::ErrorKind::PermissionDenied => {
                ProbeError::Unavailable(format!("not permitted to run ping: {}", e))
            }
            _ => ProbeError::Command(format!("failed to execute ping: {}", e)),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        return Err(classify_ping_failure(&stdout, &stderr, timeout));
    }

    parse_ping_output(&stdout)
}

fn classify_ping_failure(stdout: &str, stderr: &str, timeout: Duration) -> ProbeError {
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        return ProbeError::Unavailable(stderr.trim().to_string());
    }
    if stderr.contains("timeout")
        || stdout.contains("100% packet loss")
        || stdout.contains("100.0% packet loss")
    {
        return ProbeError::Timeout(timeout);
    }

    let reason = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
    ProbeError::Command(format!("ping failed: {}", reason))
}

/// Parse ping command output for the round-trip time.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    // Per-packet "time=X.XXX ms" (Linux, macOS)
    static PER_PACKET: OnceLock<Regex> = OnceLock::new();
    let per_packet = PER_PACKET
        .get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("valid regex"));

    // Summary "round-trip min/avg/max/stddev" (macOS) or "rtt min/avg/max/mdev" (Linux)
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*[0-9.]+/(?P<val>[0-9.]+)/")
            .expect("valid regex")
    });

    [per_packet, summary]
        .iter()
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("val")?.as_str().parse::<f64>().ok())
        .next()
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_ms(latency: Duration, expected_ms: f64) {
        let ms = latency.as_secs_f64() * 1000.0;
        assert!((ms - expected_ms).abs() < 1e-6, "got {} ms", ms);
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_echo_request(ICMPV4_ECHO_REQUEST, 0x1234, 0x0001, true);
        // Summing a packet that carries its own checksum folds to zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_icmp_checksum_odd_length() {
        assert_eq!(icmp_checksum(&[0xFF]), !0xFF00u16);
    }

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(ICMPV4_ECHO_REQUEST, 0x1234, 0x0001, true);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_echo_request(ICMPV6_ECHO_REQUEST, 0x1234, 0x0001, false);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_is_echo_reply_with_ipv4_header() {
        let mut reply = vec![0u8; 28];
        reply[0] = 0x45;
        reply[20] = ICMPV4_ECHO_REPLY;
        reply[24..26].copy_from_slice(&0xBEEFu16.to_be_bytes());
        reply[26..28].copy_from_slice(&7u16.to_be_bytes());

        assert!(is_echo_reply(&reply, ICMPV4_ECHO_REPLY, Some(0xBEEF), 7));
        assert!(!is_echo_reply(&reply, ICMPV4_ECHO_REPLY, Some(0xBEEF), 8));
        assert!(!is_echo_reply(&reply, ICMPV4_ECHO_REPLY, Some(0xCAFE), 7));
        assert!(!is_echo_reply(&reply[..24], ICMPV4_ECHO_REPLY, Some(0xBEEF), 7));
    }

    #[test]
    fn test_is_echo_reply_dgram_ignores_identifier() {
        let mut reply = vec![0u8; 8];
        reply[0] = ICMPV6_ECHO_REPLY;
        // Kernel-assigned identifier, not the one we sent.
        reply[4..6].copy_from_slice(&0x0400u16.to_be_bytes());
        reply[6..8].copy_from_slice(&2u16.to_be_bytes());
        assert!(is_echo_reply(&reply, ICMPV6_ECHO_REPLY, None, 2));
        assert!(!is_echo_reply(&reply, ICMPV6_ECHO_REPLY, None, 3));
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        assert_ms(parse_ping_output(output).unwrap(), 12.345);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        assert_ms(parse_ping_output(output).unwrap(), 17.906);
    }

    #[test]
    fn test_parse_ping_output_linux_summary() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 12.300/12.300/12.300/0.000 ms"#;
        // The per-packet time wins over the summary line.
        assert_ms(parse_ping_output(output).unwrap(), 12.3);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(matches!(
            parse_ping_output("PING: unknown error"),
            Err(ProbeError::Command(_))
        ));
    }

    #[test]
    fn test_classify_ping_failure() {
        let timeout = Duration::from_secs(2);
        let lost = "1 packets transmitted, 0 received, 100% packet loss, time 0ms";
        assert!(matches!(
            classify_ping_failure(lost, "", timeout),
            ProbeError::Timeout(_)
        ));
        assert!(matches!(
            classify_ping_failure("", "ping: socket: Operation not permitted", timeout),
            ProbeError::Unavailable(_)
        ));
        match classify_ping_failure("", "ping: nosuchhost: Name or service not known", timeout) {
            ProbeError::Command(msg) => assert!(msg.contains("Name or service not known")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
