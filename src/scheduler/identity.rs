//! Resolution of this node's own hostname and addresses.

use crate::config::ServerConfig;
use crate::db::{HostIdentity, Network};

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

const METADATA_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Work out who this node is.
///
/// Each address comes from its metadata DNS name when that resolves, and
/// otherwise from the first matching local interface.
pub async fn resolve_self_identity(config: &ServerConfig) -> HostIdentity {
    let hostname = local_hostname();

    let mut internal = lookup_metadata(&config.internal_metadata_name).await;
    let mut public = lookup_metadata(&config.public_metadata_name).await;

    if internal.is_none() || public.is_none() {
        let (if_internal, if_public) = interface_addresses();
        internal = internal.or(if_internal);
        public = public.or(if_public);
    }

    let identity = HostIdentity {
        hostname,
        internal_address: internal.map(|ip| ip.to_string()).unwrap_or_default(),
        public_address: public.map(|ip| ip.to_string()).unwrap_or_default(),
        discovered_address: String::new(),
        service_port: config.service_port,
    };
    tracing::info!(
        "Local identity: {} internal={:?} public={:?}",
        identity.hostname,
        identity.internal_address,
        identity.public_address
    );
    identity
}

fn local_hostname() -> String {
    match hostname::get().map(|h| h.into_string()) {
        Ok(Ok(name)) if !name.is_empty() => name,
        _ => {
            tracing::warn!("Could not read the system hostname, using \"localhost\"");
            "localhost".to_string()
        }
    }
}

async fn lookup_metadata(name: &str) -> Option<Ipv4Addr> {
    if name.is_empty() {
        return None;
    }
    let lookup = tokio::net::lookup_host((name, 0));
    match tokio::time::timeout(METADATA_LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(addrs)) => addrs.into_iter().find_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }),
        Ok(Err(e)) => {
            tracing::debug!("Metadata name {} did not resolve: {}", name, e);
            None
        }
        Err(_) => {
            tracing::debug!("Metadata lookup of {} timed out", name);
            None
        }
    }
}

fn interface_addresses() -> (Option<Ipv4Addr>, Option<Ipv4Addr>) {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => pick_addresses(ifaces.iter().map(|iface| iface.ip())),
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            (None, None)
        }
    }
}

/// First internal and first public IPv4 address, skipping loopback and
/// link-local ones.
pub fn pick_addresses<I>(ips: I) -> (Option<Ipv4Addr>, Option<Ipv4Addr>)
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut internal = None;
    let mut public = None;
    for ip in ips {
        let IpAddr::V4(v4) = ip else { continue };
        if v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() {
            continue;
        }
        let slot = match classify(v4) {
            Network::Internal => &mut internal,
            Network::Public => &mut public,
        };
        slot.get_or_insert(v4);
    }
    (internal, public)
}

/// Internal if within 10/8, 172.16/12 or 192.168/16.
pub fn classify(ip: Ipv4Addr) -> Network {
    if ip.is_private() {
        Network::Internal
    } else {
        Network::Public
    }
}
