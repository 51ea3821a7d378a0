//! UDP echo responder.

use crate::protocol::UDP_PONG;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// Receive datagrams until `stop` fires; each one is answered on its own task.
pub async fn serve_udp(socket: Arc<UdpSocket>, mut stop: broadcast::Receiver<()>) -> io::Result<()> {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    let payload = buf[..n].to_vec();
                    let socket = socket.clone();
                    tokio::spawn(async move { handle_datagram(&socket, &payload, from).await });
                }
                // ICMP port-unreachable from an earlier reply surfaces here on some platforms
                Err(e) => tracing::debug!("UDP receive failed: {}", e),
            },
        }
    }
    Ok(())
}

async fn handle_datagram(socket: &UdpSocket, payload: &[u8], from: SocketAddr) {
    if !is_ping(payload) {
        tracing::debug!("Ignoring {} byte datagram from {}", payload.len(), from);
        return;
    }
    if let Err(e) = socket.send_to(UDP_PONG, from).await {
        tracing::debug!("UDP reply to {} failed: {}", from, e);
    }
}

/// `ping`, with or without a trailing newline.
fn is_ping(payload: &[u8]) -> bool {
    payload.strip_suffix(b"\n").unwrap_or(payload) == b"ping"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_is_ping() {
        assert!(is_ping(b"ping\n"));
        assert!(is_ping(b"ping"));
        assert!(!is_ping(b"pong\n"));
        assert!(!is_ping(b""));
    }

    #[tokio::test]
    async fn test_only_ping_is_answered() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (_stop, rx) = broadcast::channel(1);
        tokio::spawn(serve_udp(Arc::new(server), rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        let mut buf = [0u8; 16];

        client.send(b"hello").await.unwrap();
        let silent = tokio::time::timeout(Duration::from_millis(200), client.recv(&mut buf)).await;
        assert!(silent.is_err());

        client.send(b"ping").await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], UDP_PONG);
    }
}
