//! TCP echo probe.

use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::{host_port, ProbeError};
use crate::protocol::ServiceResponse;

#[derive(Debug, Clone)]
pub struct TcpReport {
    pub latency: Duration,
    /// The raw envelope line returned by the peer.
    pub response_line: String,
}

/// Dial `addr:port`, send `hostname\n` and read one envelope line back.
///
/// The whole exchange shares a single deadline.
pub async fn run_tcp_probe(
    addr: &str,
    port: u16,
    hostname: &str,
    timeout: Duration,
) -> Result<TcpReport, ProbeError> {
    let start = Instant::now();
    tokio::time::timeout(timeout, exchange(addr, port, hostname))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map(|response_line| TcpReport {
            latency: start.elapsed(),
            response_line,
        })
}

async fn exchange(addr: &str, port: u16, hostname: &str) -> Result<String, ProbeError> {
    let mut stream = TcpStream::connect(host_port(addr, port))
        .await
        .map_err(|e| ProbeError::Network(format!("dial failed: {}", e)))?;

    let mut line = hostname.as_bytes().to_vec();
    line.push(b'\n');
    stream
        .write_all(&line)
        .await
        .map_err(|e| ProbeError::Network(format!("write failed: {}", e)))?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    let n = reader
        .read_line(&mut response)
        .await
        .map_err(|e| ProbeError::Network(format!("read failed: {}", e)))?;
    if n == 0 {
        return Err(ProbeError::Protocol("connection closed without response".to_string()));
    }

    let envelope: ServiceResponse = serde_json::from_str(response.trim_end())
        .map_err(|e| ProbeError::Protocol(format!("malformed response: {}", e)))?;
    if !envelope.is_success() {
        let message = if envelope.error.is_empty() {
            format!("peer reported status {:?}", envelope.status)
        } else {
            envelope.error
        };
        return Err(ProbeError::Protocol(message));
    }

    Ok(response.trim_end().to_string())
}
