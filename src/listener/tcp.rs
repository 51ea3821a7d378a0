//! TCP echo responder.

use crate::protocol::ServiceResponse;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Longest accepted line, newline excluded.
pub const MAX_LINE_LEN: usize = 4096;

/// A connection with no complete line for this long is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept connections until `stop` fires, one task per connection.
pub async fn serve_tcp(listener: TcpListener, mut stop: broadcast::Receiver<()>) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, IDLE_TIMEOUT).await {
                            tracing::debug!("TCP connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("TCP accept failed: {}", e),
            },
        }
    }
    Ok(())
}

/// Answer every line with an envelope echoing it, until the peer closes,
/// goes idle for `idle`, or sends a line longer than [`MAX_LINE_LEN`].
async fn handle_connection(stream: TcpStream, peer: SocketAddr, idle: Duration) -> io::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);
    let mut line = String::new();

    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64 + 1);
        let Ok(read) = tokio::time::timeout(idle, limited.read_line(&mut line)).await else {
            tracing::debug!("Closing idle TCP connection from {}", peer);
            return Ok(());
        };

        match read {
            Ok(0) => return Ok(()),
            Ok(_) if line.len() > MAX_LINE_LEN && !line.ends_with('\n') => {
                tracing::debug!("Line from {} exceeds {} bytes", peer, MAX_LINE_LEN);
                let message = format!("line exceeds {} bytes", MAX_LINE_LEN);
                reply(&mut wr, &ServiceResponse::error(message)).await?;
                return Ok(());
            }
            Ok(_) => {
                let input = line.trim_end_matches(['\r', '\n']);
                reply(&mut wr, &ServiceResponse::success(input)).await?;
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => {
                tracing::warn!("TCP read from {} failed: {}", peer, e);
                reply(&mut wr, &ServiceResponse::error(e.to_string())).await?;
                return Ok(());
            }
        }
    }
}

async fn reply<W: AsyncWrite + Unpin>(wr: &mut W, response: &ServiceResponse) -> io::Result<()> {
    wr.write_all(&response.to_line()).await?;
    wr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start() -> (u16, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (stop, rx) = broadcast::channel(1);
        tokio::spawn(serve_tcp(listener, rx));
        (port, stop)
    }

    #[tokio::test]
    async fn test_invalid_utf8_gets_error_envelope() {
        let (port, _stop) = start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        let resp: ServiceResponse = serde_json::from_str(out.trim_end()).unwrap();
        assert!(!resp.is_success());
        assert!(!resp.error.is_empty());
    }

    /// Accept one connection and hand back both ends.
    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[tokio::test]
    async fn test_lines_are_echoed_in_order() {
        let (port, _stop) = start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"a\r\nb\n").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        let replies: Vec<ServiceResponse> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies, vec![ServiceResponse::success("a"), ServiceResponse::success("b")]);
    }

    #[tokio::test]
    async fn test_overlong_line_gets_error_and_close() {
        let (port, _stop) = start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(&[b'a'; MAX_LINE_LEN + 100]).await.unwrap();

        let mut out = String::new();
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_string(&mut out))
            .await
            .unwrap();
        read.unwrap();
        let resp: ServiceResponse = serde_json::from_str(out.trim_end()).unwrap();
        assert!(!resp.is_success());
        assert!(resp.error.contains("exceeds"), "{}", resp.error);
    }

    #[tokio::test]
    async fn test_unterminated_stream_is_cut_off() {
        let (mut client, server, peer) = connected_pair().await;
        let writer = tokio::spawn(async move {
            let chunk = vec![b'a'; 1 << 20];
            for _ in 0..64 {
                if client.write_all(&chunk).await.is_err() {
                    return;
                }
            }
        });

        let handled = tokio::time::timeout(
            Duration::from_secs(5),
            handle_connection(server, peer, IDLE_TIMEOUT),
        )
        .await;
        assert!(handled.is_ok(), "handler kept reading an unterminated line");
        writer.abort();
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (mut client, server, peer) = connected_pair().await;
        let handled = tokio::time::timeout(
            Duration::from_secs(2),
            handle_connection(server, peer, Duration::from_millis(100)),
        )
        .await
        .unwrap();
        assert!(handled.is_ok());

        let mut out = Vec::new();
        assert_eq!(client.read_to_end(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_by_peer_is_a_normal_close() {
        let (client, server, peer) = connected_pair().await;
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);

        let handled = tokio::time::timeout(
            Duration::from_secs(2),
            handle_connection(server, peer, IDLE_TIMEOUT),
        )
        .await
        .unwrap();
        assert!(handled.is_ok(), "{:?}", handled);
    }

    #[tokio::test]
    async fn test_stop_ends_accept_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop, rx) = broadcast::channel(1);
        let handle = tokio::spawn(serve_tcp(listener, rx));
        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
