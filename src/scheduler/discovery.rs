//! Peer discovery: candidate resolution, admission and gossip expansion.

use crate::config::Discovery;
use crate::db::{DbError, Host, HostFilter, Store};
use crate::probe::Prober;
use crate::protocol::IdentityDocument;

use futures::future::join_all;
use hickory_resolver::TokioAsyncResolver;
use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;

/// Discovery error types.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to resolve {name}: {source}")]
    Resolve {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("SRV lookup of {name} failed: {message}")]
    Srv { name: String, message: String },
    #[error("storage error: {0}")]
    Store(#[from] DbError),
}

/// Turn the configured discovery mechanism into candidate addresses.
pub async fn resolve_candidates(discovery: &Discovery) -> Result<Vec<String>, DiscoveryError> {
    match discovery {
        Discovery::Static(hosts) => Ok(hosts.clone()),
        Discovery::ARecord(name) => {
            let ips = lookup_ipv4(name).await?;
            Ok(ips.into_iter().map(|ip| ip.to_string()).collect())
        }
        Discovery::Srv(name) => {
            let srv_err = |message: String| DiscoveryError::Srv {
                name: name.clone(),
                message,
            };
            let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| srv_err(e.to_string()))?;
            let lookup = resolver.srv_lookup(name.as_str()).await.map_err(|e| srv_err(e.to_string()))?;

            let mut ips = BTreeSet::new();
            for srv in lookup.iter() {
                let target = srv.target().to_utf8();
                match lookup_ipv4(&target).await {
                    Ok(found) => ips.extend(found),
                    Err(e) => tracing::warn!("SRV target {} of {}: {}", target, name, e),
                }
            }
            Ok(ips.into_iter().map(|ip| ip.to_string()).collect())
        }
    }
}

async fn lookup_ipv4(name: &str) -> Result<BTreeSet<IpAddr>, DiscoveryError> {
    let addrs = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|source| DiscoveryError::Resolve {
            name: name.to_string(),
            source,
        })?;
    Ok(addrs.map(|sa| sa.ip()).filter(IpAddr::is_ipv4).collect())
}

/// Admits verified peers into the registry.
///
/// A candidate is only persisted after its identity endpoint answered; an
/// unreachable candidate leaves no trace.
#[derive(Clone)]
pub struct Discoverer {
    store: Store,
    prober: Prober,
    discovery: Discovery,
    service_port: u16,
}

impl Discoverer {
    pub fn new(store: Store, prober: Prober, discovery: Discovery, service_port: u16) -> Self {
        Self {
            store,
            prober,
            discovery,
            service_port,
        }
    }

    /// Resolve candidates and admit every one not already known.
    /// Returns the number of hosts admitted.
    pub async fn discover(&self) -> Result<usize, DiscoveryError> {
        let candidates = resolve_candidates(&self.discovery).await?;
        let known = self.known_hosts()?;

        let unknown: Vec<String> = candidates
            .into_iter()
            .filter(|addr| !addr.is_empty() && !known.iter().any(|h| h.has_address(addr)))
            .collect();
        if unknown.is_empty() {
            return Ok(0);
        }

        let admitted = join_all(unknown.iter().map(|addr| self.admit(addr))).await;
        Ok(admitted.into_iter().flatten().count())
    }

    /// Ask `peer` for the hosts it knows and admit those this node does not.
    ///
    /// Each gossiped host is verified through its own identity endpoint,
    /// public address first, before it is persisted.
    pub async fn expand_from(&self, peer: &Host) -> usize {
        let Some(addr) = peer.address(crate::db::Network::Public) else {
            return 0;
        };
        let docs = match self.prober.fetch_known_hosts(addr).await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::debug!("Gossip from {} failed: {}", peer.hostname, e);
                return 0;
            }
        };
        let known = match self.known_hosts() {
            Ok(known) => known,
            Err(e) => {
                tracing::error!("Gossip from {}: {}", peer.hostname, e);
                return 0;
            }
        };

        let fresh: Vec<IdentityDocument> = docs
            .into_iter()
            .filter(|doc| !doc.hostname.trim().is_empty() && !is_known(&known, doc))
            .collect();

        let admitted = join_all(fresh.iter().map(|doc| self.admit_gossiped(doc))).await;
        let count = admitted.into_iter().flatten().count();
        if count > 0 {
            tracing::info!("Learned {} hosts from {}", count, peer.hostname);
        }
        count
    }

    async fn admit_gossiped(&self, doc: &IdentityDocument) -> Option<Host> {
        for addr in [&doc.addresses.public, &doc.addresses.internal] {
            if addr.is_empty() {
                continue;
            }
            if let Some(host) = self.admit(addr).await {
                return Some(host);
            }
        }
        None
    }

    /// Fetch the identity behind `addr` and upsert it.
    async fn admit(&self, addr: &str) -> Option<Host> {
        let doc = match self.prober.fetch_identity(addr).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::debug!("Candidate {} not admitted: {}", addr, e);
                return None;
            }
        };

        match self.store.upsert_host(&doc.into_identity(addr, self.service_port)) {
            Ok(host) => {
                tracing::info!("Admitted host {} via {}", host.hostname, addr);
                Some(host)
            }
            Err(DbError::Conflict(_)) => {
                tracing::debug!("Candidate {} is this node", addr);
                None
            }
            Err(e) => {
                tracing::error!("Failed to store host from {}: {}", addr, e);
                None
            }
        }
    }

    fn known_hosts(&self) -> Result<Vec<Host>, DbError> {
        self.store.list_hosts(&HostFilter {
            include_local: true,
            ..Default::default()
        })
    }
}

fn is_known(known: &[Host], doc: &IdentityDocument) -> bool {
    known.iter().any(|h| {
        h.hostname == doc.hostname
            || h.has_address(&doc.addresses.internal)
            || h.has_address(&doc.addresses.public)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{identity, temp_store};
    use crate::probe::{NoopPinger, ProbeSettings};
    use std::sync::Arc;
    use std::time::Duration;

    fn prober(web_port: u16) -> Prober {
        Prober::new(
            ProbeSettings {
                web_port,
                timeout: Duration::from_millis(500),
                local_hostname: "a".into(),
            },
            Arc::new(NoopPinger),
        )
        .unwrap()
    }

    fn closed_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_static_and_a_record_candidates() {
        let hosts = vec!["10.0.0.2".to_string(), "node-c".to_string()];
        assert_eq!(resolve_candidates(&Discovery::Static(hosts.clone())).await.unwrap(), hosts);

        let resolved = resolve_candidates(&Discovery::ARecord("localhost".into())).await.unwrap();
        assert!(resolved.contains(&"127.0.0.1".to_string()), "{:?}", resolved);
        assert!(resolved.iter().all(|a| a.parse::<std::net::Ipv4Addr>().is_ok()));
    }

    #[tokio::test]
    async fn test_unreachable_candidate_is_not_persisted() {
        let (_tmp, store) = temp_store();
        let discoverer = Discoverer::new(
            store.clone(),
            prober(closed_port()),
            Discovery::Static(vec!["127.0.0.1".into()]),
            5500,
        );

        assert_eq!(discoverer.discover().await.unwrap(), 0);
        let all = store
            .list_hosts(&HostFilter {
                include_local: true,
                ..Default::default()
            })
            .unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn test_is_known_matches_name_or_address() {
        let (_tmp, store) = temp_store();
        let b = store.upsert_host(&identity("b", "10.0.0.2", "1.2.3.4")).unwrap();
        let known = vec![b];

        let doc = |name: &str, internal: &str, public: &str| IdentityDocument {
            hostname: name.into(),
            addresses: crate::protocol::Addresses {
                internal: internal.into(),
                public: public.into(),
            },
        };
        assert!(is_known(&known, &doc("b", "", "")));
        assert!(is_known(&known, &doc("b2", "", "1.2.3.4")));
        assert!(!is_known(&known, &doc("c", "10.0.0.3", "")));
        assert!(!is_known(&known, &doc("c", "", "")));
    }
}
