//! Probe module for peer reachability checks.
//!
//! Supports HTTP, TCP, UDP and ICMP probes. Every probe resolves to a
//! [`ProbeOutcome`]; failures are data, never propagated errors.

mod http;
mod ping;
mod tcp;
mod udp;

pub use http::*;
pub use ping::*;
pub use tcp::*;
pub use udp::*;

use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{CheckStatus, CheckType, Network, NewCheck};
use crate::protocol::IdentityDocument;

/// Status code recorded for a successful non-HTTP probe.
pub const CODE_OK: u16 = 200;
/// Status code recorded when an HTTP request never produced a response.
pub const CODE_NO_RESPONSE: u16 = 408;
/// Status code recorded for a failed non-HTTP probe.
pub const CODE_FAILED: u16 = 500;
/// Status code recorded when a probe cannot run on this node.
pub const CODE_UNSUPPORTED: u16 = 501;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("bad status response: {code}")]
    Status { code: u16, message: Option<String> },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unsupported")]
    Unsupported,
}

/// The result of one probe, ready to be stored as a check.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub status_code: u16,
    pub latency: Duration,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn success(status_code: u16, latency: Duration, response_body: Option<String>) -> Self {
        Self {
            status: CheckStatus::Success,
            status_code,
            latency,
            response_body,
            error: None,
        }
    }

    /// Map a probe error onto a stored status.
    pub fn failure(err: &ProbeError, latency: Duration) -> Self {
        let (status, status_code, error) = match err {
            ProbeError::Unsupported => (CheckStatus::Unknown, CODE_UNSUPPORTED, err.to_string()),
            ProbeError::Status { code, message } => (
                CheckStatus::Error,
                *code,
                message.clone().unwrap_or_else(|| err.to_string()),
            ),
            _ => (CheckStatus::Error, CODE_FAILED, err.to_string()),
        };
        Self {
            status,
            status_code,
            latency,
            response_body: None,
            error: Some(error),
        }
    }

    pub fn into_check(self, network: Network, check_type: CheckType) -> NewCheck {
        NewCheck {
            network,
            check_type,
            status: self.status,
            status_code: self.status_code,
            latency: self.latency,
            response_body: self.response_body,
            error: self.error,
        }
    }
}

/// Probe settings shared by every check job.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Port of the peers' identity endpoints.
    pub web_port: u16,
    pub timeout: Duration,
    /// Written to peers on the TCP probe.
    pub local_hostname: String,
}

/// Runs the four protocol probes against a peer address.
#[derive(Clone)]
pub struct Prober {
    settings: ProbeSettings,
    http: reqwest::Client,
    pinger: Arc<dyn Pinger>,
}

impl Prober {
    pub fn new(settings: ProbeSettings, pinger: Arc<dyn Pinger>) -> Result<Self, ProbeError> {
        let http = build_http_client(settings.timeout)?;
        Ok(Self {
            settings,
            http,
            pinger,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Run one probe of `check_type` against `addr`.
    pub async fn probe(&self, check_type: CheckType, addr: &str, service_port: u16) -> ProbeOutcome {
        let timeout = self.settings.timeout;
        let start = std::time::Instant::now();

        let result = match check_type {
            CheckType::Http => run_http_probe(&self.http, addr, self.settings.web_port)
                .await
                .map(|r| ProbeOutcome::success(r.status_code, r.latency, Some(r.body))),
            CheckType::Tcp => {
                run_tcp_probe(addr, service_port, &self.settings.local_hostname, timeout)
                    .await
                    .map(|r| ProbeOutcome::success(CODE_OK, r.latency, Some(r.response_line)))
            }
            CheckType::Udp => run_udp_probe(addr, service_port, timeout)
                .await
                .map(|latency| ProbeOutcome::success(CODE_OK, latency, None)),
            CheckType::Icmp => match resolve_ip(addr, timeout).await {
                Ok(ip) => self
                    .pinger
                    .ping(ip, timeout.saturating_sub(start.elapsed()))
                    .await
                    .map(|latency| ProbeOutcome::success(CODE_OK, latency, None)),
                Err(e) => Err(e),
            },
        };

        result.unwrap_or_else(|e| {
            let mut outcome = ProbeOutcome::failure(&e, start.elapsed());
            if check_type == CheckType::Http && !matches!(e, ProbeError::Status { .. }) {
                outcome.status_code = CODE_NO_RESPONSE;
            }
            outcome
        })
    }

    /// Fetch a peer's identity document.
    pub async fn fetch_identity(&self, addr: &str) -> Result<IdentityDocument, ProbeError> {
        fetch_identity(&self.http, addr, self.settings.web_port).await
    }

    /// Fetch the hosts a peer knows about.
    pub async fn fetch_known_hosts(&self, addr: &str) -> Result<Vec<IdentityDocument>, ProbeError> {
        fetch_known_hosts(&self.http, addr, self.settings.web_port).await
    }
}

/// Format `addr:port`, bracketing IPv6 literals.
pub fn host_port(addr: &str, port: u16) -> String {
    match addr.parse::<Ipv6Addr>() {
        Ok(v6) => format!("[{}]:{}", v6, port),
        Err(_) => format!("{}:{}", addr, port),
    }
}

/// Resolve hostname to IP address, giving up after `timeout`.
pub async fn resolve_ip(address: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::time::timeout(timeout, tokio::net::lookup_host(format!("{}:0", address)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}
