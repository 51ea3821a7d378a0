//! HTTP probe and identity endpoint client.

use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

use super::{host_port, ProbeError};
use crate::protocol::{ErrorBody, IdentityDocument};

pub const HEALTH_PATH: &str = "/api/health";
pub const HOSTS_PATH: &str = "/api/hosts";

/// A completed HTTP exchange with a status below 400.
#[derive(Debug, Clone)]
pub struct HttpReport {
    pub status_code: u16,
    pub body: String,
    /// Full round trip including the body read.
    pub latency: Duration,
}

/// Build the shared client used by HTTP probes and discovery calls.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .no_proxy()
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))
}

/// GET the identity endpoint of `addr`.
pub async fn run_http_probe(
    client: &reqwest::Client,
    addr: &str,
    port: u16,
) -> Result<HttpReport, ProbeError> {
    get(client, addr, port, HEALTH_PATH).await
}

/// Fetch and validate a peer's identity document.
pub async fn fetch_identity(
    client: &reqwest::Client,
    addr: &str,
    port: u16,
) -> Result<IdentityDocument, ProbeError> {
    let doc: IdentityDocument = get_json(client, addr, port, HEALTH_PATH).await?;
    if doc.hostname.trim().is_empty() {
        return Err(ProbeError::Protocol("identity without hostname".to_string()));
    }
    Ok(doc)
}

/// Fetch the list of hosts a peer knows about.
pub async fn fetch_known_hosts(
    client: &reqwest::Client,
    addr: &str,
    port: u16,
) -> Result<Vec<IdentityDocument>, ProbeError> {
    get_json(client, addr, port, HOSTS_PATH).await
}

async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    addr: &str,
    port: u16,
    path: &str,
) -> Result<T, ProbeError> {
    let report = get(client, addr, port, path).await?;
    serde_json::from_str(&report.body)
        .map_err(|e| ProbeError::Protocol(format!("invalid JSON from {}: {}", addr, e)))
}

async fn get(
    client: &reqwest::Client,
    addr: &str,
    port: u16,
    path: &str,
) -> Result<HttpReport, ProbeError> {
    let url = format!("http://{}{}", host_port(addr, port), path);
    let start = Instant::now();

    let response = client.get(&url).send().await.map_err(map_reqwest)?;
    let status_code = response.status().as_u16();

    // Read the full body to measure complete transfer time
    let body = response.text().await.map_err(map_reqwest)?;
    let latency = start.elapsed();

    if status_code >= 400 {
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .map(|e| e.message)
            .filter(|m| !m.is_empty());
        return Err(ProbeError::Status {
            code: status_code,
            message,
        });
    }

    Ok(HttpReport {
        status_code,
        body,
        latency,
    })
}

fn map_reqwest(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Network(format!("request timed out: {}", e))
    } else {
        ProbeError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get as get_route, Json, Router};

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_http_probe_success_and_identity() {
        let router = Router::new().route(
            HEALTH_PATH,
            get_route(|| async {
                Json(serde_json::json!({
                    "hostname": "b",
                    "addresses": {"internal": "10.0.0.2", "public": "1.2.3.4"}
                }))
            }),
        );
        let port = serve(router).await;
        let client = build_http_client(Duration::from_secs(2)).unwrap();

        let report = run_http_probe(&client, "127.0.0.1", port).await.unwrap();
        assert_eq!(report.status_code, 200);
        assert!(report.body.contains("\"hostname\":\"b\""));

        let doc = fetch_identity(&client, "127.0.0.1", port).await.unwrap();
        assert_eq!(doc.addresses.internal, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_http_probe_error_status_captures_message() {
        let router = Router::new().route(
            HEALTH_PATH,
            get_route(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({"type": "error", "message": "draining"})),
                )
            }),
        );
        let port = serve(router).await;
        let client = build_http_client(Duration::from_secs(2)).unwrap();

        match run_http_probe(&client, "127.0.0.1", port).await {
            Err(ProbeError::Status { code, message }) => {
                assert_eq!(code, 503);
                assert_eq!(message.as_deref(), Some("draining"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identity_rejects_invalid_json() {
        let router = Router::new().route(HEALTH_PATH, get_route(|| async { "not json" }));
        let port = serve(router).await;
        let client = build_http_client(Duration::from_secs(2)).unwrap();

        let err = fetch_identity(&client, "127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        // Bind then drop to obtain a port nothing listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = build_http_client(Duration::from_millis(500)).unwrap();
        let err = run_http_probe(&client, "127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ProbeError::Network(_)));
    }
}
