//! Peer wire protocol shared by the probes and the listener.
//!
//! These shapes must stay byte-compatible across independently built nodes.

use serde::{Deserialize, Serialize};

use crate::db::{Host, HostIdentity};

/// Probe payload sent to the UDP responder.
pub const UDP_PING: &[u8] = b"ping\n";
/// Reply expected from the UDP responder.
pub const UDP_PONG: &[u8] = b"pong\n";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

/// Addresses advertised by a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addresses {
    #[serde(default)]
    pub internal: String,
    #[serde(default)]
    pub public: String,
}

/// Body of `GET /api/health`, and element of `GET /api/hosts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDocument {
    pub hostname: String,
    #[serde(default)]
    pub addresses: Addresses,
}

impl IdentityDocument {
    /// Turn an advertised identity into an upsert input.
    pub fn into_identity(self, discovered_address: &str, service_port: u16) -> HostIdentity {
        HostIdentity {
            hostname: self.hostname,
            internal_address: self.addresses.internal,
            public_address: self.addresses.public,
            discovered_address: discovered_address.to_string(),
            service_port,
        }
    }
}

impl From<&Host> for IdentityDocument {
    fn from(host: &Host) -> Self {
        Self {
            hostname: host.hostname.clone(),
            addresses: Addresses {
                internal: host.internal_address.clone(),
                public: host.public_address.clone(),
            },
        }
    }
}

/// One JSON line answering a TCP probe line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub status: String,
    #[serde(default)]
    pub received_input: String,
    #[serde(default)]
    pub error: String,
}

impl ServiceResponse {
    pub fn success(input: &str) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            received_input: input.to_string(),
            error: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            received_input: String::new(),
            error: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"status":"error","receivedInput":"","error":"encode failed"}"#.to_vec()
        });
        line.push(b'\n');
        line
    }
}

/// Error body returned by the identity endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_document_wire_shape() {
        let doc: IdentityDocument = serde_json::from_str(
            r#"{"hostname":"b","addresses":{"internal":"10.0.0.2","public":"1.2.3.4"}}"#,
        )
        .unwrap();
        assert_eq!(doc.hostname, "b");
        assert_eq!(doc.addresses.public, "1.2.3.4");

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["addresses"]["internal"], "10.0.0.2");

        // Older peers may omit addresses entirely
        let bare: IdentityDocument = serde_json::from_str(r#"{"hostname":"c"}"#).unwrap();
        assert_eq!(bare.addresses, Addresses::default());
    }

    #[test]
    fn test_service_response_line() {
        let line = ServiceResponse::success("node-a").to_line();
        assert_eq!(
            line,
            b"{\"status\":\"success\",\"receivedInput\":\"node-a\",\"error\":\"\"}\n".to_vec()
        );
        let parsed: ServiceResponse = serde_json::from_slice(&line).unwrap();
        assert!(parsed.is_success());
    }
}
