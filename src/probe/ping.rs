//! ICMP echo probe.
//!
//! Whether this process may open ICMP sockets is decided once at startup by
//! [`detect_pinger`]. Without the capability a [`NoopPinger`] is installed
//! and every ICMP probe reports `unknown` instead of failing.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};

use super::ProbeError;

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Sends one ICMP echo request and reports the round trip time.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Pinger used when the process may not open ICMP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPinger;

#[async_trait]
impl Pinger for NoopPinger {
    async fn ping(&self, _ip: IpAddr, _timeout: Duration) -> Result<Duration, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

/// Native pinger over RAW (privileged) or DGRAM (unprivileged) ICMP sockets.
#[derive(Debug, Clone, Copy)]
pub struct NativePinger {
    socket_type: Type,
}

#[async_trait]
impl Pinger for NativePinger {
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
        let socket_type = self.socket_type;
        // Run blocking ICMP in a dedicated thread for precise timing
        tokio::task::spawn_blocking(move || run_blocking_ping(ip, socket_type, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
    }
}

/// Detect ICMP capability by attempting to create a socket.
pub fn detect_pinger() -> Arc<dyn Pinger> {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return Arc::new(NativePinger { socket_type: Type::RAW });
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return Arc::new(NativePinger { socket_type: Type::DGRAM });
    }

    tracing::warn!("Ping probe: ICMP sockets unavailable, ICMP checks will report unknown");
    Arc::new(NoopPinger)
}

fn io_err(what: &str) -> impl Fn(std::io::Error) -> ProbeError + '_ {
    move |e| ProbeError::Network(format!("{}: {}", what, e))
}

/// Blocking echo request/reply. Runs inside `spawn_blocking`.
fn run_blocking_ping(ip: IpAddr, socket_type: Type, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMPV4_ECHO_REQUEST, ICMPV4_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };

    let socket = Socket::new(domain, socket_type, Some(protocol))
        .map_err(io_err("failed to create ICMP socket"))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(io_err("failed to set timeout"))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(io_err("failed to connect"))?;

    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(io_err("failed to send"))?;

    // Receive replies until ours arrives or the deadline passes
    let mut buf = [0u8; 1500];
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(io_err("failed to set timeout"))?;

        let len = match (&socket).read(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ProbeError::Timeout(timeout));
            }
            Err(e) => return Err(ProbeError::Network(format!("failed to receive: {}", e))),
        };
        let elapsed = start.elapsed();

        // The kernel rewrites the identifier of DGRAM echo requests and
        // demultiplexes replies itself, so only RAW sockets compare it.
        let check_id = socket_type == Type::RAW;
        if is_our_reply(&buf[..len], reply_type, identifier, sequence, check_id) {
            return Ok(elapsed);
        }
    }
}

/// Whether `data` is the echo reply matching our request.
///
/// IPv4 RAW sockets deliver the IP header in front of the ICMP message.
fn is_our_reply(data: &[u8], reply_type: u8, identifier: u16, sequence: u16, check_id: bool) -> bool {
    let offset = if !data.is_empty() && data[0] >> 4 == 4 {
        usize::from(data[0] & 0x0f) * 4
    } else {
        0
    };
    let Some(icmp) = data.get(offset..) else {
        return false;
    };
    if icmp.len() < 8 || icmp[0] != reply_type {
        return false;
    }

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    reply_seq == sequence && (!check_id || reply_id == identifier)
}

/// Build an echo request: 8 byte header plus a 56 byte payload.
///
/// ICMPv6 checksums are computed by the kernel and left as zero here.
fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = request_type;
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

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

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}
