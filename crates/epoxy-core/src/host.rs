//! Host records and the per-boot session authority.
//!
//! A host record represents one managed machine and stores its next-stage
//! configuration. Records are created by administrative tooling, mutated by
//! the session authority (fresh session IDs on every stage-1 request) and by
//! the report handler (timestamps and the update flag), and never deleted by
//! the boot path.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Stage key for the iPXE variant of stage 1.
pub const STAGE1_IPXE: &str = "stage1.ipxe";
/// Stage key for the JSON variant of stage 1.
pub const STAGE1_JSON: &str = "stage1.json";
/// Stage key for the network-boot environment.
pub const STAGE2: &str = "stage2";
/// Stage key for the final system image.
pub const STAGE3: &str = "stage3";

/// Form keys a booting machine may persist into `collected_information`.
/// Everything else sent by a client is dropped.
pub const COLLECTED_INFORMATION_KEYS: &[&str] = &[
    "platform",
    "buildarch",
    "serial",
    "asset",
    "uuid",
    "manufacturer",
    "product",
    "chip",
    "mac",
    "ip",
    "version",
    "public_ssh_host_key",
];

/// Number of random bytes behind each session ID (160 bits).
const SESSION_ID_BYTES: usize = 20;

/// An ordered stage-name → URL mapping. One of these is selected per boot:
/// `boot` normally, `update` when the update flag is set.
pub type Sequence = BTreeMap<String, String>;

/// The operating-system random source failed to produce bytes. Fatal for the
/// request that needed a session.
#[derive(Debug, Error)]
#[error("system random source failed: {0}")]
pub struct EntropyError(#[from] rand::Error);

/// The four session IDs minted on each stage-1 request. Each authorizes
/// exactly one category of follow-up request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIds {
    /// Authorizes the stage2 target.
    pub stage2: String,
    /// Authorizes the stage3 target.
    pub stage3: String,
    /// Authorizes the report target.
    pub report: String,
    /// Authorizes extension targets.
    pub extension: String,
}

/// The configuration of one server managed by ePoxy, keyed by FQDN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    /// Fully qualified machine name. Unique and immutable.
    pub name: String,

    /// The IPv4 address the booting machine will use to contact the API.
    /// Requests from any other source are rejected.
    pub ipv4: String,

    /// The typical boot sequence for this host.
    pub boot: Sequence,

    /// An alternate sequence, typically used to reinstall or reflash.
    pub update: Sequence,

    /// Version tag of the boot images, injected into kernel args as
    /// `epoxy.images_version`. May be empty.
    #[serde(default)]
    pub images_version: String,

    /// When true the host is served the `update` sequence. Cleared on a
    /// successful report.
    #[serde(default)]
    pub update_enabled: bool,

    /// Extension operation names this host may invoke.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// The most recently minted session IDs.
    #[serde(default)]
    pub current_session_ids: SessionIds,

    /// When `current_session_ids` was generated.
    #[serde(default)]
    pub last_session_creation: Option<DateTime<Utc>>,

    /// Time of the most recent report, success or not.
    #[serde(default)]
    pub last_report: Option<DateTime<Utc>>,

    /// Time of the most recent successful report.
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,

    /// Free-form information reported by the machine. Only allow-listed keys
    /// are ever stored.
    #[serde(default)]
    pub collected_information: BTreeMap<String, String>,
}

impl Host {
    /// Replaces all four session IDs with fresh random values and stamps
    /// `last_session_creation`. Persistence is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Fails only when the OS random source cannot provide bytes.
    pub fn generate_session_ids(&mut self) -> Result<(), EntropyError> {
        self.current_session_ids = SessionIds {
            stage2: generate_session_id()?,
            stage3: generate_session_id()?,
            report: generate_session_id()?,
            extension: generate_session_id()?,
        };
        self.last_session_creation = Some(Utc::now());
        Ok(())
    }

    /// The sequence in effect for this boot.
    #[must_use]
    pub fn current_sequence(&self) -> &Sequence {
        if self.update_enabled {
            &self.update
        } else {
            &self.boot
        }
    }

    /// Absorbs reported form values into `collected_information`. Multiple
    /// values for one key are joined with a single space; values are trimmed
    /// and empty results skipped. Keys outside the allow-list are dropped.
    pub fn add_information<'a, I>(&mut self, values: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut joined: BTreeMap<&str, String> = BTreeMap::new();
        for (key, value) in values {
            if !COLLECTED_INFORMATION_KEYS.contains(&key) {
                warn!(host = %self.name, key, "dropping non-allow-listed collected information");
                continue;
            }
            let entry = joined.entry(key).or_default();
            if !entry.is_empty() {
                entry.push(' ');
            }
            entry.push_str(value);
        }
        for (key, value) in joined {
            let value = value.trim();
            if !value.is_empty() {
                self.collected_information.insert(key.to_string(), value.to_string());
            }
        }
    }

    /// Pretty-printed JSON form of the record, for logs and admin output.
    #[must_use]
    pub fn to_pretty_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| format!("<unserializable: {err}>"))
    }
}

/// Mints one URL-safe random session ID without padding.
fn generate_session_id() -> Result<String, EntropyError> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
