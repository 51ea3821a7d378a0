//! UDP echo probe with retries.

use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{host_port, ProbeError};
use crate::protocol::{UDP_PING, UDP_PONG};

/// Number of send/receive exchanges attempted before giving up.
pub const UDP_ATTEMPTS: u32 = 3;

/// Send `ping\n` to `addr:port` and wait for `pong\n`.
///
/// The timeout is one combined deadline split evenly across the attempts;
/// any correct reply within the budget is a success. Name resolution counts
/// against the same budget. Returns the time from the first send to the
/// successful reply.
pub async fn run_udp_probe(addr: &str, port: u16, timeout: Duration) -> Result<Duration, ProbeError> {
    let began = Instant::now();
    let target = host_port(addr, port);
    let bind = if target.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };

    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    tokio::time::timeout(timeout, socket.connect(&target))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let per_attempt = timeout.saturating_sub(began.elapsed()) / UDP_ATTEMPTS;
    let start = Instant::now();
    let mut last_err = ProbeError::Timeout(timeout);
    let mut buf = [0u8; 512];

    for attempt in 1..=UDP_ATTEMPTS {
        if let Err(e) = socket.send(UDP_PING).await {
            last_err = ProbeError::Network(format!("failed to send: {}", e));
            continue;
        }

        match tokio::time::timeout(per_attempt, socket.recv(&mut buf)).await {
            Ok(Ok(n)) if &buf[..n] == UDP_PONG => return Ok(start.elapsed()),
            Ok(Ok(n)) => {
                last_err = ProbeError::Protocol(format!(
                    "wrong response: {:?}",
                    String::from_utf8_lossy(&buf[..n])
                ));
            }
            Ok(Err(e)) => {
                last_err = ProbeError::Network(format!("failed to recv: {}", e));
                // Refused datagrams surface immediately; keep the attempt's time slot
                let spent = start.elapsed();
                let slot_end = per_attempt * attempt;
                if spent < slot_end {
                    tokio::time::sleep(slot_end - spent).await;
                }
            }
            Err(_) => last_err = ProbeError::Timeout(timeout),
        }
        tracing::debug!("UDP probe to {} failed attempt {}: {}", target, attempt, last_err);
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// A responder that ignores the first `drop_first` pings.
    async fn flaky_responder(drop_first: u32) -> (u16, Arc<AtomicU32>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if &buf[..n] == UDP_PING && count > drop_first {
                    socket.send_to(UDP_PONG, from).await.unwrap();
                }
            }
        });
        (port, seen)
    }

    #[tokio::test]
    async fn test_udp_probe_succeeds_on_third_attempt() {
        let (port, seen) = flaky_responder(2).await;
        let result = run_udp_probe("127.0.0.1", port, Duration::from_millis(900)).await;
        assert!(result.is_ok(), "expected success, got {:?}", result);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_udp_probe_fails_after_three_attempts() {
        let (port, seen) = flaky_responder(u32::MAX).await;
        let result = run_udp_probe("127.0.0.1", port, Duration::from_millis(600)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unresolvable_target_fails_within_budget() {
        let budget = Duration::from_millis(500);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            run_udp_probe("meshwatch-peer.invalid", 5500, budget),
        )
        .await
        .unwrap();
        assert!(
            matches!(result, Err(ProbeError::Network(_)) | Err(ProbeError::Timeout(_))),
            "{:?}",
            result
        );
    }

    #[tokio::test]
    async fn test_udp_probe_wrong_reply_is_an_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (_, from) = socket.recv_from(&mut buf).await.unwrap();
                socket.send_to(b"nope\n", from).await.unwrap();
            }
        });

        let result = run_udp_probe("127.0.0.1", port, Duration::from_millis(600)).await;
        assert!(matches!(result, Err(ProbeError::Protocol(_))));
    }
}
