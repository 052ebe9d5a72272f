//! The extension API between the boot server and extension services.
//!
//! An extension is a named operation routed by the server to a registered
//! backend URL. The server vouches for the booting machine: by the time an
//! extension request is forwarded, the host record exists, the source IP
//! matched, and the session ID was valid. The envelope below is the entire
//! request body the backend receives; the original client body is discarded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::host::Host;

/// The request body sent to every extension backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionRequest {
    /// Versioned payload.
    pub v1: ExtensionV1,
}

/// Information about a booting machine, as vouched for by the boot server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionV1 {
    /// FQDN of the booting machine.
    pub hostname: String,

    /// IPv4 address of the booting machine.
    pub ipv4_address: String,

    /// IPv6 address of the booting machine. Not yet collected.
    pub ipv6_address: String,

    /// When the machine most recently reached stage 1.
    pub last_boot: DateTime<Utc>,

    /// The raw query string of the client's request, percent-encoded.
    /// Extensions may use this to receive arbitrary client data.
    pub raw_query: String,
}

impl ExtensionRequest {
    /// Builds the envelope for `host`, carrying the client's query string.
    #[must_use]
    pub fn for_host(host: &Host, raw_query: &str) -> Self {
        Self {
            v1: ExtensionV1 {
                hostname: host.name.clone(),
                ipv4_address: host.ipv4.clone(),
                ipv6_address: String::new(),
                last_boot: host.last_session_creation.unwrap_or(DateTime::UNIX_EPOCH),
                raw_query: raw_query.to_string(),
            },
        }
    }

    /// Serializes the envelope for the backend request body.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| format!("<unserializable: {err}>"))
    }

    /// Parses an envelope, as an extension service would.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Placeholder in a registered backend URL, replaced with the configured
/// project id at startup.
pub const PROJECT_PLACEHOLDER: &str = "{{PROJECT}}";

/// The process-local mapping from extension operation name to backend URL.
/// Built once at startup and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    operations: BTreeMap<String, String>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `operation`, substituting the project placeholder in the
    /// URL template.
    pub fn register(&mut self, operation: &str, url_template: &str, project: &str) {
        let url = url_template.replace(PROJECT_PLACEHOLDER, project);
        self.operations.insert(operation.to_string(), url);
    }

    /// The backend URL for `operation`, if registered.
    #[must_use]
    pub fn backend_url(&self, operation: &str) -> Option<&str> {
        self.operations.get(operation).map(String::as_str)
    }

    /// Registered operation names, for startup logging.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_matches_wire_contract() {
        let mut host = Host {
            name: "m1.example.org".to_string(),
            ipv4: "10.0.0.2".to_string(),
            ..Host::default()
        };
        host.last_session_creation =
            Some("2026-08-02T10:00:00Z".parse::<DateTime<Utc>>().unwrap());

        let envelope = ExtensionRequest::for_host(&host, "");
        let value: serde_json::Value = serde_json::from_str(&envelope.encode()).unwrap();
        assert_eq!(value["v1"]["hostname"], "m1.example.org");
        assert_eq!(value["v1"]["ipv4_address"], "10.0.0.2");
        assert_eq!(value["v1"]["ipv6_address"], "");
        assert_eq!(value["v1"]["raw_query"], "");
        let last_boot = value["v1"]["last_boot"].as_str().unwrap();
        assert!(last_boot.starts_with("2026-08-02T10:00:00"));
    }

    #[test]
    fn envelope_round_trips() {
        let host = Host { name: "m1".to_string(), ipv4: "10.0.0.2".to_string(), ..Host::default() };
        let envelope = ExtensionRequest::for_host(&host, "a=b&c=d");
        let decoded = ExtensionRequest::decode(envelope.encode().as_bytes()).unwrap();
        assert_eq!(decoded.v1.hostname, "m1");
        assert_eq!(decoded.v1.raw_query, "a=b&c=d");
    }

    #[test]
    fn registry_substitutes_project_placeholder() {
        let mut registry = ExtensionRegistry::new();
        registry.register(
            "allocate_k8s_token",
            "http://master.{{PROJECT}}.internal:8800/v1/allocate_k8s_token",
            "mlab-sandbox",
        );
        assert_eq!(
            registry.backend_url("allocate_k8s_token"),
            Some("http://master.mlab-sandbox.internal:8800/v1/allocate_k8s_token")
        );
        assert_eq!(registry.backend_url("unknown"), None);
    }
}
