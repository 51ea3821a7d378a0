//! Configuration module for meshwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("no discovery configured: set MESHWATCH_HOSTS or MESHWATCH_DISCOVERY_NAME")]
    NoDiscovery,
    #[error("failed to read hosts file: {0}")]
    Io(#[from] std::io::Error),
}

/// How candidate peer addresses are found on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// A fixed list of addresses.
    Static(Vec<String>),
    /// IPv4 addresses behind a DNS A record.
    ARecord(String),
    /// Targets of a DNS SRV record, resolved to IPv4 addresses.
    Srv(String),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port serving the identity endpoints; the same on every node (default: 80)
    pub web_port: u16,
    /// Port of the TCP and UDP echo responders (default: 5500)
    pub service_port: u16,
    /// Path to the SQLite database file (default: "meshwatch.db")
    pub db_path: String,
    pub discovery: Discovery,
    /// Time between scheduler ticks (default: 10s)
    pub check_interval: Duration,
    /// Worker pool size (default: 20)
    pub parallel_checks: usize,
    /// Per-probe timeout (default: 3s)
    pub check_timeout: Duration,
    /// Checks kept per (host, network, type) bucket (default: 100)
    pub history_limit: usize,
    pub internal_metadata_name: String,
    pub public_metadata_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            web_port: 80,
            service_port: 5500,
            db_path: "meshwatch.db".to_string(),
            discovery: Discovery::Static(Vec::new()),
            check_interval: Duration::from_secs(10),
            parallel_checks: 20,
            check_timeout: Duration::from_secs(3),
            history_limit: 100,
            internal_metadata_name: "self.metadata.edgeengine.internal".to_string(),
            public_metadata_name: "self.metadata.compute.edgeengine.io".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MESHWATCH_WEB_PORT`: identity HTTP port (default: 80)
    /// - `MESHWATCH_SERVICE_PORT`: TCP/UDP echo port (default: 5500)
    /// - `MESHWATCH_DB_PATH`: database file path (default: "meshwatch.db")
    /// - `MESHWATCH_HOSTS`: comma separated addresses, or a file with one per line
    /// - `MESHWATCH_DISCOVERY_NAME`: DNS name used when no static hosts are set
    /// - `MESHWATCH_DISCOVERY_MODE`: `a` or `srv` (default: `a`)
    /// - `MESHWATCH_CHECK_INTERVAL`: seconds between ticks (default: 10)
    /// - `MESHWATCH_PARALLEL_CHECKS`: concurrent host jobs (default: 20)
    /// - `MESHWATCH_CHECK_TIMEOUT`: per-probe timeout in seconds (default: 3)
    /// - `MESHWATCH_HISTORY_LIMIT`: checks kept per bucket (default: 100)
    /// - `MESHWATCH_INTERNAL_METADATA_NAME` / `MESHWATCH_PUBLIC_METADATA_NAME`
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MESHWATCH_WEB_PORT") {
            cfg.web_port = parse("MESHWATCH_WEB_PORT", &v)?;
        }
        if let Some(v) = get("MESHWATCH_SERVICE_PORT") {
            cfg.service_port = parse("MESHWATCH_SERVICE_PORT", &v)?;
        }
        if let Some(v) = get("MESHWATCH_DB_PATH") {
            cfg.db_path = v;
        }
        if let Some(v) = get("MESHWATCH_CHECK_INTERVAL") {
            cfg.check_interval = parse_seconds("MESHWATCH_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = get("MESHWATCH_PARALLEL_CHECKS") {
            cfg.parallel_checks = parse("MESHWATCH_PARALLEL_CHECKS", &v)?;
            if cfg.parallel_checks == 0 {
                return Err(ConfigError::Invalid {
                    key: "MESHWATCH_PARALLEL_CHECKS",
                    value: v,
                });
            }
        }
        if let Some(v) = get("MESHWATCH_CHECK_TIMEOUT") {
            cfg.check_timeout = parse_seconds("MESHWATCH_CHECK_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MESHWATCH_HISTORY_LIMIT") {
            cfg.history_limit = parse("MESHWATCH_HISTORY_LIMIT", &v)?;
        }
        if let Some(v) = get("MESHWATCH_INTERNAL_METADATA_NAME") {
            cfg.internal_metadata_name = v;
        }
        if let Some(v) = get("MESHWATCH_PUBLIC_METADATA_NAME") {
            cfg.public_metadata_name = v;
        }

        let hosts = match get("MESHWATCH_HOSTS") {
            Some(v) => parse_hosts(&v)?,
            None => Vec::new(),
        };

        cfg.discovery = if !hosts.is_empty() {
            Discovery::Static(hosts)
        } else if let Some(name) = get("MESHWATCH_DISCOVERY_NAME") {
            match get("MESHWATCH_DISCOVERY_MODE").as_deref() {
                None | Some("a") | Some("A") => Discovery::ARecord(name),
                Some("srv") | Some("SRV") => Discovery::Srv(name),
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "MESHWATCH_DISCOVERY_MODE",
                        value: other.to_string(),
                    })
                }
            }
        } else {
            return Err(ConfigError::NoDiscovery);
        };

        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_seconds(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(key, value)?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

/// A value naming an existing file is read one address per line.
fn parse_hosts(value: &str) -> Result<Vec<String>, ConfigError> {
    let raw = if Path::new(value).is_file() {
        std::fs::read_to_string(value)?
    } else {
        value.replace(',', "\n")
    };

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::from_lookup(lookup(&[("MESHWATCH_HOSTS", "10.0.0.1")])).unwrap();
        assert_eq!(cfg.web_port, 80);
        assert_eq!(cfg.service_port, 5500);
        assert_eq!(cfg.db_path, "meshwatch.db");
        assert_eq!(cfg.check_interval, Duration::from_secs(10));
        assert_eq!(cfg.parallel_checks, 20);
        assert_eq!(cfg.history_limit, 100);
        assert_eq!(cfg.discovery, Discovery::Static(vec!["10.0.0.1".to_string()]));
    }

    #[test]
    fn test_requires_discovery() {
        let err = ServerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::NoDiscovery));
    }

    #[test]
    fn test_discovery_modes() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("MESHWATCH_DISCOVERY_NAME", "peers.example.com"),
        ]))
        .unwrap();
        assert_eq!(cfg.discovery, Discovery::ARecord("peers.example.com".into()));

        let cfg = ServerConfig::from_lookup(lookup(&[
            ("MESHWATCH_DISCOVERY_NAME", "_svc._tcp.example.com"),
            ("MESHWATCH_DISCOVERY_MODE", "srv"),
        ]))
        .unwrap();
        assert_eq!(cfg.discovery, Discovery::Srv("_svc._tcp.example.com".into()));

        let err = ServerConfig::from_lookup(lookup(&[
            ("MESHWATCH_DISCOVERY_NAME", "x"),
            ("MESHWATCH_DISCOVERY_MODE", "mdns"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MESHWATCH_DISCOVERY_MODE", .. }));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("MESHWATCH_HOSTS", "10.0.0.1, 10.0.0.2,,"),
            ("MESHWATCH_WEB_PORT", "8080"),
            ("MESHWATCH_CHECK_TIMEOUT", "0.5"),
            ("MESHWATCH_PARALLEL_CHECKS", "4"),
        ]))
        .unwrap();
        assert_eq!(cfg.web_port, 8080);
        assert_eq!(cfg.check_timeout, Duration::from_millis(500));
        assert_eq!(cfg.parallel_checks, 4);
        assert_eq!(
            cfg.discovery,
            Discovery::Static(vec!["10.0.0.1".into(), "10.0.0.2".into()])
        );

        let err = ServerConfig::from_lookup(lookup(&[
            ("MESHWATCH_HOSTS", "10.0.0.1"),
            ("MESHWATCH_SERVICE_PORT", "seventy"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MESHWATCH_SERVICE_PORT", .. }));
    }

    #[test]
    fn test_hosts_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.1.0.1\n# comment\n\n10.1.0.2").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let cfg = ServerConfig::from_lookup(lookup(&[("MESHWATCH_HOSTS", path.as_str())])).unwrap();
        assert_eq!(
            cfg.discovery,
            Discovery::Static(vec!["10.1.0.1".into(), "10.1.0.2".into()])
        );
    }
}
