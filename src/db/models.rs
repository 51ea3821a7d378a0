//! Database model types.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The network an address (and therefore a check) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Internal,
    Public,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Internal, Network::Public];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Internal => "internal",
            Network::Public => "public",
        }
    }
}

/// Protocol used by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckType {
    Http,
    Tcp,
    Udp,
    Icmp,
}

impl CheckType {
    pub const ALL: [CheckType; 4] = [CheckType::Http, CheckType::Tcp, CheckType::Udp, CheckType::Icmp];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Http => "HTTP",
            CheckType::Tcp => "TCP",
            CheckType::Udp => "UDP",
            CheckType::Icmp => "ICMP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Error,
    Unknown,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Success => "success",
            CheckStatus::Error => "error",
            CheckStatus::Unknown => "unknown",
        }
    }
}

/// Error returned when a stored enum column holds an unexpected value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant {:?}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! str_enum {
    ($ty:ty, $($s:literal => $v:expr),+ $(,)?) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($v),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(Network, "internal" => Network::Internal, "public" => Network::Public);
str_enum!(
    CheckType,
    "HTTP" => CheckType::Http,
    "TCP" => CheckType::Tcp,
    "UDP" => CheckType::Udp,
    "ICMP" => CheckType::Icmp,
);
str_enum!(
    CheckStatus,
    "success" => CheckStatus::Success,
    "error" => CheckStatus::Error,
    "unknown" => CheckStatus::Unknown,
);

/// A known peer, or the local node when `is_local` is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: i64,
    pub hostname: String,
    /// Empty when unknown.
    pub internal_address: String,
    /// Empty when unknown.
    pub public_address: String,
    /// The candidate address this host was admitted through.
    #[serde(skip)]
    pub discovered_address: String,
    pub service_port: u16,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(skip)]
    pub is_local: bool,
}

impl Host {
    pub fn address(&self, network: Network) -> Option<&str> {
        let addr = match network {
            Network::Internal => &self.internal_address,
            Network::Public => &self.public_address,
        };
        (!addr.is_empty()).then_some(addr.as_str())
    }

    /// Whether `addr` is one of the addresses this host is known by.
    pub fn has_address(&self, addr: &str) -> bool {
        !addr.is_empty()
            && (self.internal_address == addr
                || self.public_address == addr
                || self.discovered_address == addr)
    }
}

/// What a peer says about itself; the input to a host upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    pub internal_address: String,
    pub public_address: String,
    /// The address the identity was fetched from, if it was a discovery candidate.
    pub discovered_address: String,
    pub service_port: u16,
}

/// The local node's record plus its process lifecycle data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfIdentity {
    #[serde(flatten)]
    pub host: Host,
    pub restarts: i64,
    pub first_start_at: DateTime<Utc>,
    pub last_start_at: DateTime<Utc>,
}

/// Filter for listing hosts.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    pub include_local: bool,
    pub seen_since: Option<DateTime<Utc>>,
    pub with_public_address: bool,
}

/// A probe outcome about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCheck {
    pub network: Network,
    pub check_type: CheckType,
    pub status: CheckStatus,
    pub status_code: u16,
    pub latency: Duration,
    pub response_body: Option<String>,
    pub error: Option<String>,
}

/// A stored probe outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub id: i64,
    pub host_id: i64,
    pub network: Network,
    pub check_type: CheckType,
    pub status: CheckStatus,
    pub status_code: u16,
    pub latency_ns: i64,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl Check {
    pub fn latency(&self) -> Duration {
        Duration::from_nanos(self.latency_ns.max(0) as u64)
    }
}

/// A running success/total pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UptimeCounts {
    pub success_count: u64,
    pub total_count: u64,
}

impl UptimeCounts {
    /// Availability in percent, 0 for an empty bucket.
    pub fn percent(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.total_count as f64 * 100.0
    }

    pub fn add(&mut self, other: UptimeCounts) {
        self.success_count += other.success_count;
        self.total_count += other.total_count;
    }
}

impl Serialize for UptimeCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("UptimeCounts", 3)?;
        s.serialize_field("successCount", &self.success_count)?;
        s.serialize_field("totalCount", &self.total_count)?;
        s.serialize_field("percent", &self.percent())?;
        s.end()
    }
}

/// Per-network rollup: the sum of its four probe types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkUptime {
    pub total: UptimeCounts,
    pub http: UptimeCounts,
    pub tcp: UptimeCounts,
    pub udp: UptimeCounts,
    pub icmp: UptimeCounts,
}

impl NetworkUptime {
    pub fn by_type(&self, check_type: CheckType) -> UptimeCounts {
        match check_type {
            CheckType::Http => self.http,
            CheckType::Tcp => self.tcp,
            CheckType::Udp => self.udp,
            CheckType::Icmp => self.icmp,
        }
    }

    fn slot(&mut self, check_type: CheckType) -> &mut UptimeCounts {
        match check_type {
            CheckType::Http => &mut self.http,
            CheckType::Tcp => &mut self.tcp,
            CheckType::Udp => &mut self.udp,
            CheckType::Icmp => &mut self.icmp,
        }
    }
}

/// Host-level rollup over both networks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeSummary {
    pub host_id: i64,
    pub total: UptimeCounts,
    pub internal: NetworkUptime,
    pub public: NetworkUptime,
}

impl UptimeSummary {
    /// Build a summary by summing leaf counters upward.
    pub fn from_leaves<I>(host_id: i64, leaves: I) -> Self
    where
        I: IntoIterator<Item = (Network, CheckType, UptimeCounts)>,
    {
        let mut summary = Self {
            host_id,
            ..Default::default()
        };
        for (network, check_type, counts) in leaves {
            let net = match network {
                Network::Internal => &mut summary.internal,
                Network::Public => &mut summary.public,
            };
            net.slot(check_type).add(counts);
            net.total.add(counts);
            summary.total.add(counts);
        }
        summary
    }

    pub fn network(&self, network: Network) -> &NetworkUptime {
        match network {
            Network::Internal => &self.internal,
            Network::Public => &self.public,
        }
    }
}

/// A diagnostic log line persisted by the log sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: String,
    pub target: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip_through_column_text() {
        for t in CheckType::ALL {
            assert_eq!(t.as_str().parse::<CheckType>().unwrap(), t);
        }
        assert_eq!("public".parse::<Network>().unwrap(), Network::Public);
        assert!("PUBLIC".parse::<Network>().is_err());
        assert_eq!(
            serde_json::to_string(&CheckType::Icmp).unwrap(),
            "\"ICMP\""
        );
    }

    #[test]
    fn test_percent_of_empty_bucket_is_zero() {
        assert_eq!(UptimeCounts::default().percent(), 0.0);
        let c = UptimeCounts { success_count: 1, total_count: 3 };
        assert!((c.percent() - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_summary_sums_leaves() {
        let c = |s, t| UptimeCounts { success_count: s, total_count: t };
        let summary = UptimeSummary::from_leaves(
            7,
            vec![
                (Network::Internal, CheckType::Http, c(1, 3)),
                (Network::Internal, CheckType::Tcp, c(2, 3)),
                (Network::Public, CheckType::Icmp, c(0, 5)),
            ],
        );
        assert_eq!(summary.internal.total, c(3, 6));
        assert_eq!(summary.public.total, c(0, 5));
        assert_eq!(summary.total, c(3, 11));
        assert_eq!(summary.public.by_type(CheckType::Udp), c(0, 0));

        let json = serde_json::to_value(summary).unwrap();
        assert_eq!(json["internal"]["total"]["percent"], 50.0);
    }
}
