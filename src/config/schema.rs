use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::transport::PeerRole;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Identity advertised to peers
    pub node: NodeConfig,
    /// Discovery, signaling and channel settings
    pub transport: TransportConfig,
    /// Handshake and liveness settings
    pub session: SessionConfig,
    /// Encoder/decoder settings
    pub codec: CodecConfig,
    /// Where received resources are written
    pub storage: StorageConfig,
}

/// Local node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable peer id; generated on first start when empty
    pub peer_id: String,
    /// Name shown to other peers
    pub display_name: String,
    pub role: PeerRole,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let display_name = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "peercam".to_string());
        Self {
            peer_id: String::new(),
            display_name,
            role: PeerRole::Phone,
        }
    }
}

/// Transport backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process network (demo and tests)
    Memory,
    /// WebRTC data channels with mDNS discovery
    #[default]
    Rtc,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// TCP port for invitation signaling (0 = ephemeral)
    pub listen_port: u16,
    /// mDNS service type
    pub service_type: String,
    /// STUN servers for ICE; empty means host candidates only
    pub stun_servers: Vec<String>,
    /// How long an invitation may stay unanswered
    pub invite_timeout_ms: u64,
    /// Chunk size for resource transfers
    pub resource_chunk_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Rtc,
            listen_port: 0,
            service_type: "_peercam._tcp.local.".to_string(),
            stun_servers: Vec::new(),
            invite_timeout_ms: 10_000,
            resource_chunk_size: 16 * 1024,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep-alive interval
    pub heartbeat_interval_ms: u64,
    /// Liveness timeout; 0 means 2.5 x the heartbeat interval
    pub liveness_timeout_ms: u64,
    /// Roles that only ever open the command channel
    pub single_channel_roles: Vec<PeerRole>,
    /// Tear the relationship down when liveness times out
    pub teardown_on_unreachable: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            liveness_timeout_ms: 0,
            single_channel_roles: vec![PeerRole::Watch],
            teardown_on_unreachable: true,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn liveness_timeout(&self) -> std::time::Duration {
        if self.liveness_timeout_ms == 0 {
            self.heartbeat_interval().mul_f64(2.5)
        } else {
            std::time::Duration::from_millis(self.liveness_timeout_ms)
        }
    }

    pub fn is_single_channel(&self, role: PeerRole) -> bool {
        self.single_channel_roles.contains(&role)
    }
}

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Key picture interval in frames
    pub gop_size: u32,
    pub bitrate_kbps: u32,
    /// Prefix picture payloads with a 2-byte orientation
    pub orientation_prefix: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            gop_size: 30,
            bitrate_kbps: 2000,
            orientation_prefix: false,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for received resources; empty means the system temp dir
    pub resource_dir: String,
}

impl StorageConfig {
    pub fn resource_dir(&self) -> PathBuf {
        if self.resource_dir.trim().is_empty() {
            std::env::temp_dir().join("peercam")
        } else {
            PathBuf::from(&self.resource_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_liveness_timeout_defaults_to_two_and_a_half_intervals() {
        let mut session = SessionConfig::default();
        assert_eq!(session.liveness_timeout(), Duration::from_millis(2500));

        session.heartbeat_interval_ms = 200;
        assert_eq!(session.liveness_timeout(), Duration::from_millis(500));

        session.liveness_timeout_ms = 900;
        assert_eq!(session.liveness_timeout(), Duration::from_millis(900));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"codec":{"fps":15},"node":{"role":"watch"}}"#).unwrap();
        assert_eq!(config.codec.fps, 15);
        assert_eq!(config.codec.width, 1280);
        assert_eq!(config.node.role, PeerRole::Watch);
        assert_eq!(config.transport.service_type, "_peercam._tcp.local.");
        assert!(config.session.is_single_channel(PeerRole::Watch));
        assert!(!config.session.is_single_channel(PeerRole::Phone));
    }
}
