//! Peer listener: answers probes from other nodes.
//!
//! Three servers share one stop channel: the TCP and UDP echo responders on
//! the service port and the identity HTTP endpoints on the web port.

mod http;
mod tcp;
mod udp;

pub use http::*;
pub use tcp::*;
pub use udp::*;

use crate::db::Store;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;

/// Bound sockets of the peer listener, ready to serve.
pub struct PeerListener {
    store: Store,
    web: TcpListener,
    tcp: TcpListener,
    udp: UdpSocket,
}

impl PeerListener {
    /// Bind all three sockets on `ip`.
    ///
    /// A zero `service_port` picks a free port for TCP and binds UDP to the
    /// same number.
    pub async fn bind(ip: IpAddr, web_port: u16, service_port: u16, store: Store) -> io::Result<Self> {
        let web = TcpListener::bind(SocketAddr::new(ip, web_port)).await?;
        let tcp = TcpListener::bind(SocketAddr::new(ip, service_port)).await?;
        let service_port = tcp.local_addr()?.port();
        let udp = UdpSocket::bind(SocketAddr::new(ip, service_port)).await?;

        Ok(Self { store, web, tcp, udp })
    }

    pub fn web_port(&self) -> io::Result<u16> {
        Ok(self.web.local_addr()?.port())
    }

    pub fn service_port(&self) -> io::Result<u16> {
        Ok(self.tcp.local_addr()?.port())
    }

    /// Serve until `stop` fires. Returns the first server error.
    pub async fn run(self, stop: &broadcast::Sender<()>) -> io::Result<()> {
        tracing::info!(
            "Peer listener on web {} service {}",
            self.web.local_addr()?,
            self.tcp.local_addr()?
        );

        let web = tokio::spawn(serve_http(self.web, self.store, stop.subscribe()));
        let tcp = tokio::spawn(serve_tcp(self.tcp, stop.subscribe()));
        let udp = tokio::spawn(serve_udp(Arc::new(self.udp), stop.subscribe()));

        for handle in [web, tcp, udp] {
            handle.await.map_err(io::Error::other)??;
        }
        Ok(())
    }

    /// Spawn [`Self::run`] onto the runtime.
    pub fn spawn(self, stop: broadcast::Sender<()>) -> tokio::task::JoinHandle<io::Result<()>> {
        tokio::spawn(async move { self.run(&stop).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{identity, temp_store};
    use crate::protocol::{IdentityDocument, ServiceResponse, UDP_PING, UDP_PONG};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_listener_answers_all_protocols() {
        let (_tmp, store) = temp_store();
        store.register_start(&identity("b", "10.0.0.2", "1.2.3.4")).unwrap();

        let listener = PeerListener::bind("127.0.0.1".parse().unwrap(), 0, 0, store)
            .await
            .unwrap();
        let web_port = listener.web_port().unwrap();
        let service_port = listener.service_port().unwrap();
        let (stop, _) = broadcast::channel(1);
        let handle = listener.spawn(stop.clone());

        // Identity endpoint
        let url = format!("http://127.0.0.1:{}/api/health", web_port);
        let doc: IdentityDocument = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(doc.hostname, "b");
        assert_eq!(doc.addresses.internal, "10.0.0.2");

        // TCP echo, two lines on one connection
        let stream = TcpStream::connect(("127.0.0.1", service_port)).await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut lines = BufReader::new(rd).lines();
        for input in ["a", "again"] {
            wr.write_all(format!("{}\n", input).as_bytes()).await.unwrap();
            let line = lines.next_line().await.unwrap().unwrap();
            let resp: ServiceResponse = serde_json::from_str(&line).unwrap();
            assert_eq!(resp, ServiceResponse::success(input));
        }

        // UDP echo
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(("127.0.0.1", service_port)).await.unwrap();
        socket.send(UDP_PING).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], UDP_PONG);

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
