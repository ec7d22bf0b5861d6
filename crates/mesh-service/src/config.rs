// SPDX-License-Identifier: Apache-2.0
//! Configuration surface for a running [`crate::Service`] (spec.md §6),
//! loadable through `mesh_config::ConfigService` since every field here is
//! `Serialize`/`Deserialize`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backing store for the graph/actor/substrate layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Nothing survives a restart; suitable for tests and ephemeral nodes.
    Memory,
    /// Persisted under `StorageConfig::path`.
    Disk,
    /// A caller-supplied `Substrate` adapter outside the built-in two; the
    /// name is reported as-is in [`crate::ServiceMetrics::storage_type`].
    Custom {
        /// The adapter's self-reported name.
        name: String,
    },
}

impl StorageKind {
    /// The label reported in [`crate::ServiceMetrics::storage_type`].
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Custom { name } => name,
        }
    }
}

/// Where and how actor/graph state is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Which backend to use.
    pub kind: StorageKind,
    /// Required when `kind` is [`StorageKind::Disk`].
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { kind: StorageKind::Memory, path: None }
    }
}

/// Peer dialing policy (spec.md §4.6). `Duration` fields round-trip through
/// JSON as milliseconds so the whole config loads through
/// `mesh_config::ConfigService`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Addresses to dial at `start()`.
    pub endpoints: Vec<String>,
    /// Dial attempts per endpoint before giving up and marking it
    /// disconnected.
    pub max_retries: u32,
    /// Base delay for the exponential backoff between attempts.
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Per-attempt dial timeout, and the backoff cap.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_retries: 5,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Settings for the (out-of-scope) websocket transport that would carry
/// substrate replication between nodes; carried here so a full node config
/// round-trips even though this crate does not dial it itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Whether the transport should be brought up at all.
    pub enabled: bool,
    /// Listen port.
    pub port: u16,
    /// Listen host.
    pub host: String,
    /// Path to a TLS cert/key pair, when terminating TLS directly.
    pub tls: Option<TlsConfig>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { enabled: true, port: 8765, host: "0.0.0.0".to_string(), tls: None }
    }
}

/// TLS material for [`WebSocketConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate path.
    pub cert_path: PathBuf,
    /// PEM private key path.
    pub key_path: PathBuf,
}

/// Top-level configuration for one mesh node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node name, used as a substrate path segment and in log fields.
    pub name: String,
    /// Storage backend settings.
    pub storage: StorageConfig,
    /// Peer dialing settings.
    pub peers: PeersConfig,
    /// Websocket transport settings.
    pub web_socket: WebSocketConfig,
    /// How often a caller should poll `get_metrics` for external reporting.
    #[serde(with = "duration_millis")]
    pub metrics_interval: Duration,
    /// Verbose logging toggle, mirrored into `RUST_LOG` by callers.
    pub debug: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            name: "mesh-node".to_string(),
            storage: StorageConfig::default(),
            peers: PeersConfig::default(),
            web_socket: WebSocketConfig::default(),
            metrics_interval: Duration::from_secs(5),
            debug: false,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

#[cfg(test)]
mod tests {
    use super::{MeshConfig, StorageKind};

    #[test]
    fn default_round_trips_through_json() {
        let config = MeshConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, config.name);
        assert_eq!(back.peers.max_retries, config.peers.max_retries);
        assert_eq!(back.peers.retry_delay, config.peers.retry_delay);
    }

    #[test]
    fn storage_kind_label() {
        assert_eq!(StorageKind::Memory.label(), "memory");
        assert_eq!(StorageKind::Disk.label(), "disk");
        assert_eq!(StorageKind::Custom { name: "s3".to_string() }.label(), "s3");
    }
}
