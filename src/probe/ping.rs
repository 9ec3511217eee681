//! ICMP echo implementation with native sockets and a `ping` command fallback.
//!
//! Native pings use blocking sockets in spawn_blocking for sub-millisecond
//! timing precision.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{is_valid_hostname, ProbeError};

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

const IPV6_HEADER_LEN: usize = 40;

// errno values for descriptor exhaustion, identical on Linux and the BSDs.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifies one echo request so concurrent pings to the same destination
/// can be told apart.
#[derive(Debug, Clone, Copy)]
struct EchoId {
    identifier: u16,
    sequence: u16,
    /// DGRAM sockets have the kernel rewrite the identifier and filter
    /// replies for us, so only the sequence number can be compared.
    check_identifier: bool,
}

impl EchoId {
    fn next(check_identifier: bool) -> Self {
        Self {
            identifier: rand::random(),
            sequence: PING_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            check_identifier,
        }
    }

    /// `header` is the 4-byte identifier/sequence part of an echo header.
    fn matches(&self, header: &[u8]) -> bool {
        if header.len() < 4 {
            return false;
        }
        let id = u16::from_be_bytes([header[0], header[1]]);
        let seq = u16::from_be_bytes([header[2], header[3]]);
        seq == self.sequence && (!self.check_identifier || id == self.identifier)
    }
}

/// What a received ICMP packet means for our request.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Reply {
    Echo,
    Unreachable(u8),
    Unrelated,
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on Linux with ping_group_range set, and on macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Send one echo request to `address` and wait up to `timeout` for the reply.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;

        let result = tokio::task::spawn_blocking(move || blocking_echo(ip, timeout))
            .await
            .map_err(|e| ProbeError::Fatal(format!("ping worker failed: {}", e)))?;

        return match result {
            Err(ProbeError::PermissionDenied(reason)) => {
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

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Resolution(format!("{}: {}", address, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses found for {}", address)))
}

/// Map a socket error onto the probe error classes.
fn classify_io_error(context: &str, e: std::io::Error) -> ProbeError {
    if matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE)) || e.kind() == ErrorKind::OutOfMemory
    {
        return ProbeError::Fatal(format!("{}: {}", context, e));
    }
    match e.kind() {
        ErrorKind::PermissionDenied => ProbeError::PermissionDenied(format!("{}: {}", context, e)),
        _ => ProbeError::Unreachable(format!("{}: {}", context, e)),
    }
}

/// Open an ICMP socket for `ip`, RAW first and DGRAM as the unprivileged
/// fallback. Returns whether the socket is RAW.
fn open_icmp_socket(ip: IpAddr) -> Result<(Socket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => Ok((socket, true)),
        Err(_) => Socket::new(domain, Type::DGRAM, Some(protocol))
            .map(|socket| (socket, false))
            .map_err(|e| classify_io_error("failed to create ICMP socket", e)),
    }
}

/// One echo exchange with precise timing. Runs on a blocking thread.
fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (mut socket, raw) = open_icmp_socket(ip)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| classify_io_error("failed to set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| classify_io_error("failed to connect", e))?;

    let echo = EchoId::next(raw);
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(echo.identifier, echo.sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(echo.identifier, echo.sequence),
    };

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| classify_io_error("failed to send", e))?;

    let mut buf = [0u8; 1500];
    loop {
        // Unrelated packets must not extend the overall wait.
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| classify_io_error("failed to set timeout", e))?;

        let len = match socket.read(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ProbeError::Timeout(timeout));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify_io_error("failed to receive", e)),
        };
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        let reply = match ip {
            IpAddr::V4(_) => classify_reply_v4(&buf[..len], &echo),
            IpAddr::V6(_) => classify_reply_v6(&buf[..len], &echo),
        };
        match reply {
            Reply::Echo => return Ok(elapsed),
            Reply::Unreachable(code) => {
                return Err(ProbeError::Unreachable(format!(
                    "destination unreachable (code {})",
                    code
                )))
            }
            Reply::Unrelated => {}
        }
    }
}

/// Interpret an ICMPv4 packet. RAW sockets deliver the IP header, DGRAM
/// sockets start at the ICMP header.
fn classify_reply_v4(packet: &[u8], echo: &EchoId) -> Reply {
    let offset = match packet.first() {
        Some(b) if b >> 4 == 4 => usize::from(b & 0x0f) * 4,
        _ => 0,
    };
    let icmp = match packet.get(offset..) {
        Some(icmp) if icmp.len() >= 8 => icmp,
        _ => return Reply::Unrelated,
    };

    match icmp[0] {
        ICMP_ECHO_REPLY if echo.matches(&icmp[4..8]) => Reply::Echo,
        ICMP_DEST_UNREACHABLE => {
            // Quoted datagram: original IP header, then our echo header.
            let quoted = &icmp[8..];
            let Some(first) = quoted.first() else {
                return Reply::Unrelated;
            };
            let ihl = usize::from(first & 0x0f) * 4;
            match quoted.get(ihl..ihl + 8) {
                Some(orig) if orig[0] == ICMP_ECHO_REQUEST && echo.matches(&orig[4..8]) => {
                    Reply::Unreachable(icmp[1])
                }
                _ => Reply::Unrelated,
            }
        }
        _ => Reply::Unrelated,
    }
}

/// Interpret an ICMPv6 packet (never carries the IPv6 header).
fn classify_reply_v6(packet: &[u8], echo: &EchoId) -> Reply {
    if packet.len() < 8 {
        return Reply::Unrelated;
    }
    match packet[0] {
        ICMPV6_ECHO_REPLY if echo.matches(&packet[4..8]) => Reply::Echo,
        ICMPV6_DEST_UNREACHABLE => {
            let start = 8 + IPV6_HEADER_LEN;
            match packet.get(start..start + 8) {
                Some(orig) if orig[0] == ICMPV6_ECHO_REQUEST && echo.matches(&orig[4..8]) => {
                    Reply::Unreachable(packet[1])
                }
                _ => Reply::Unrelated,
            }
        }
        _ => Reply::Unrelated,
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = echo_packet(ICMP_ECHO_REQUEST, identifier, sequence);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The checksum covers a pseudo-header and is filled in by the kernel.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    echo_packet(ICMPV6_ECHO_REQUEST, identifier, sequence)
}

/// 8 byte header + 56 byte payload, checksum left zero.
fn echo_packet(kind: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, byte) in packet[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    if !is_valid_hostname(address) {
        return Err(ProbeError::Resolution(format!("invalid hostname {:?}", address)));
    }

    let output = Command::new("ping")
        .args(ping_args(address, timeout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ProbeError::PermissionDenied(
                "no ICMP socket access and no ping command available".to_string(),
            ),
            _ => classify_io_error("failed to execute ping", e),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(classify_ping_failure(&stdout, &stderr, timeout));
    }

    parse_ping_output(&stdout)
}

/// Arguments for a single echo. `--` ends option parsing so the address is
/// never read as a flag.
fn ping_args(address: &str, timeout: Duration) -> Vec<String> {
    vec![
        "-c".to_string(),
        "1".to_string(),
        "-W".to_string(),
        ping_wait_arg(timeout),
        "--".to_string(),
        address.to_string(),
    ]
}

/// `-W` is whole seconds on Linux and milliseconds on macOS.
fn ping_wait_arg(timeout: Duration) -> String {
    if cfg!(target_os = "macos") {
        timeout.as_millis().max(1).to_string()
    } else {
        timeout.as_secs().max(1).to_string()
    }
}

/// Classify a non-zero `ping` exit from its output.
fn classify_ping_failure(stdout: &str, stderr: &str, timeout: Duration) -> ProbeError {
    let text = format!("{}\n{}", stdout, stderr);
    let lower = text.to_lowercase();

    if lower.contains("unknown host")
        || lower.contains("name or service not known")
        || lower.contains("cannot resolve")
        || lower.contains("temporary failure in name resolution")
    {
        return ProbeError::Resolution(stderr.trim().to_string());
    }
    if lower.contains("operation not permitted") || lower.contains("permission denied") {
        return ProbeError::PermissionDenied(stderr.trim().to_string());
    }
    if lower.contains("unreachable") {
        return ProbeError::Unreachable(first_matching_line(&text, "nreachable"));
    }
    if lower.contains("100% packet loss") || lower.contains("100.0% packet loss") || lower.contains("timeout") {
        return ProbeError::Timeout(timeout);
    }
    ProbeError::Unreachable(format!("ping failed: {}", text.trim()))
}

fn first_matching_line(text: &str, needle: &str) -> String {
    text.lines()
        .find(|line| line.contains(needle))
        .unwrap_or(text)
        .trim()
        .to_string()
}

/// Parse ping command output for latency.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    // Pattern 1: Per-packet response "time=X.XXX ms" (Linux, some macOS)
    static RE1: OnceLock<Regex> = OnceLock::new();
    let re1 = RE1.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").expect("valid regex"));

    if let Some(ms) = re1
        .captures(output)
        .and_then(|caps| caps.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(Duration::from_secs_f64(ms / 1000.0));
    }

    // Pattern 2: Summary line "round-trip min/avg/max/stddev = X/X/X/X ms" (macOS)
    // or "rtt min/avg/max/mdev = X/X/X/X ms" (Linux); use the average.
    static RE2: OnceLock<Regex> = OnceLock::new();
    let re2 = RE2.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)")
            .expect("valid regex")
    });

    if let Some(ms) = re2
        .captures(output)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(Duration::from_secs_f64(ms / 1000.0));
    }

    Err(ProbeError::Unreachable(format!(
        "failed to parse ping output: {}",
        output.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_echo() -> EchoId {
        EchoId { identifier: 0x1234, sequence: 7, check_identifier: true }
    }

    /// A minimal 20-byte IPv4 header.
    fn ipv4_header() -> Vec<u8> {
        let mut h = vec![0u8; 20];
        h[0] = 0x45;
        h[9] = 1;
        h
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // A packet including its checksum sums to zero.
        assert_eq!(icmp_checksum(&packet), 0);
        assert_eq!(icmp_checksum(&[0x08]), !0x0800u16);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);

        let v6 = build_icmpv6_echo_request(0x1234, 0x0001);
        assert_eq!(v6[0], 128);
        assert_eq!(v6[2..4], [0, 0]);
    }

    #[test]
    fn test_classify_raw_echo_reply() {
        let mut packet = ipv4_header();
        let mut icmp = echo_packet(ICMP_ECHO_REPLY, 0x1234, 7);
        packet.append(&mut icmp);
        assert_eq!(classify_reply_v4(&packet, &raw_echo()), Reply::Echo);

        let other = EchoId { identifier: 0x9999, ..raw_echo() };
        assert_eq!(classify_reply_v4(&packet, &other), Reply::Unrelated);
    }

    #[test]
    fn test_classify_dgram_echo_reply_ignores_identifier() {
        // The kernel rewrote the identifier; only the sequence is ours.
        let packet = echo_packet(ICMP_ECHO_REPLY, 0x4242, 7);
        let echo = EchoId { check_identifier: false, ..raw_echo() };
        assert_eq!(classify_reply_v4(&packet, &echo), Reply::Echo);
        assert_eq!(classify_reply_v4(&packet, &raw_echo()), Reply::Unrelated);
    }

    #[test]
    fn test_classify_unreachable_quoting_our_request() {
        let mut packet = ipv4_header();
        packet.extend_from_slice(&[ICMP_DEST_UNREACHABLE, 1, 0, 0, 0, 0, 0, 0]);
        packet.extend(ipv4_header());
        packet.extend(build_icmp_echo_request(0x1234, 7).into_iter().take(8));
        assert_eq!(classify_reply_v4(&packet, &raw_echo()), Reply::Unreachable(1));

        // Our own outgoing request seen on a RAW socket is not a reply.
        let mut looped = ipv4_header();
        looped.extend(build_icmp_echo_request(0x1234, 7));
        assert_eq!(classify_reply_v4(&looped, &raw_echo()), Reply::Unrelated);
    }

    #[test]
    fn test_classify_v6() {
        let reply = echo_packet(ICMPV6_ECHO_REPLY, 0x1234, 7);
        assert_eq!(classify_reply_v6(&reply, &raw_echo()), Reply::Echo);

        let mut unreachable = vec![ICMPV6_DEST_UNREACHABLE, 3, 0, 0, 0, 0, 0, 0];
        unreachable.extend(vec![0u8; IPV6_HEADER_LEN]);
        unreachable.extend(build_icmpv6_echo_request(0x1234, 7).into_iter().take(8));
        assert_eq!(classify_reply_v6(&unreachable, &raw_echo()), Reply::Unreachable(3));

        assert_eq!(classify_reply_v6(&[129, 0, 0], &raw_echo()), Reply::Unrelated);
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency.as_secs_f64() * 1000.0 - 12.345).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency.as_secs_f64() * 1000.0 - 17.906).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ping_output_linux_summary() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 1 received, 0% packet loss, time 0ms
rtt min/avg/max/mdev = 12.300/12.300/12.300/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        // Should match the per-packet time first
        assert!((latency.as_secs_f64() * 1000.0 - 12.3).abs() < 1e-6);
    }

    #[test]
    fn test_classify_ping_failures() {
        let timeout = Duration::from_secs(1);

        let dns = classify_ping_failure("", "ping: nosuch.invalid: Name or service not known", timeout);
        assert!(matches!(dns, ProbeError::Resolution(_)));

        let unreachable = classify_ping_failure(
            "From 192.168.1.1 icmp_seq=1 Destination Host Unreachable\n1 packets transmitted, 0 received, +1 errors, 100% packet loss",
            "",
            timeout,
        );
        assert!(matches!(unreachable, ProbeError::Unreachable(ref m) if m.contains("Destination Host Unreachable")));

        let lost = classify_ping_failure("1 packets transmitted, 0 received, 100% packet loss, time 0ms", "", timeout);
        assert_eq!(lost, ProbeError::Timeout(timeout));

        let denied = classify_ping_failure("", "ping: socket: Operation not permitted", timeout);
        assert!(matches!(denied, ProbeError::PermissionDenied(_)));
    }

    #[test]
    fn test_ping_args_end_option_parsing() {
        let args = ping_args("-h", Duration::from_secs(2));
        assert_eq!(args[args.len() - 2..], ["--".to_string(), "-h".to_string()]);
        assert_eq!(args[..2], ["-c".to_string(), "1".to_string()]);
    }

    #[tokio::test]
    async fn test_ping_command_rejects_flag_like_address() {
        let err = run_ping_command("-f", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Resolution(_)));
    }

    #[test]
    fn test_classify_io_errors() {
        let denied = std::io::Error::from(ErrorKind::PermissionDenied);
        assert!(matches!(classify_io_error("x", denied), ProbeError::PermissionDenied(_)));

        let exhausted = std::io::Error::from_raw_os_error(EMFILE);
        assert!(matches!(classify_io_error("x", exhausted), ProbeError::Fatal(_)));
    }
}
