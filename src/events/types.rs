//! Session event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::protocol::RemoteCommand;

/// Session event enumeration
///
/// Serialized with `serde(tag = "event", content = "data")`:
/// ```json
/// {
///   "event": "session.established",
///   "data": { "peer_id": "a1b2", "channels": 2 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    // ============================================================================
    // Discovery
    // ============================================================================
    /// A peer advertising the service was found
    #[serde(rename = "peer.found")]
    PeerFound {
        peer_id: String,
        display_name: String,
        /// "phone", "tablet", "watch" or "unknown"
        role: String,
    },

    /// A peer stopped advertising
    #[serde(rename = "peer.lost")]
    PeerLost { peer_id: String },

    // ============================================================================
    // Session lifecycle
    // ============================================================================
    /// Handshake state changed
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        peer_id: String,
        /// "discovered", "command_inviting", "command_connected",
        /// "streaming_inviting", "streaming_connected", "disconnected"
        state: String,
    },

    /// All channels of the relationship are connected
    #[serde(rename = "session.established")]
    SessionEstablished {
        peer_id: String,
        /// 1 for single-channel relationships, 2 otherwise
        channels: u8,
    },

    /// Invitation timed out, was rejected or could not be issued
    #[serde(rename = "session.connection_failed")]
    ConnectionFailed { peer_id: String, reason: String },

    /// No heartbeat within the liveness timeout
    #[serde(rename = "session.peer_unreachable")]
    PeerUnreachable { peer_id: String, timeout_ms: u64 },

    /// A channel of an active relationship went away
    #[serde(rename = "session.disconnected")]
    Disconnected { peer_id: String, reason: String },

    // ============================================================================
    // Payloads
    // ============================================================================
    /// Non-heartbeat command from a peer
    #[serde(rename = "command.received")]
    CommandReceived {
        peer_id: String,
        command: RemoteCommand,
    },

    /// A still photo was written to local storage
    #[serde(rename = "photo.received")]
    PhotoReceived {
        peer_id: String,
        name: String,
        path: PathBuf,
        size: u64,
        received_at: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PeerFound { .. } => "peer.found",
            Self::PeerLost { .. } => "peer.lost",
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::SessionEstablished { .. } => "session.established",
            Self::ConnectionFailed { .. } => "session.connection_failed",
            Self::PeerUnreachable { .. } => "session.peer_unreachable",
            Self::Disconnected { .. } => "session.disconnected",
            Self::CommandReceived { .. } => "command.received",
            Self::PhotoReceived { .. } => "photo.received",
        }
    }

    /// Peer the event is about
    pub fn peer_id(&self) -> &str {
        match self {
            Self::PeerFound { peer_id, .. }
            | Self::PeerLost { peer_id }
            | Self::SessionStateChanged { peer_id, .. }
            | Self::SessionEstablished { peer_id, .. }
            | Self::ConnectionFailed { peer_id, .. }
            | Self::PeerUnreachable { peer_id, .. }
            | Self::Disconnected { peer_id, .. }
            | Self::CommandReceived { peer_id, .. }
            | Self::PhotoReceived { peer_id, .. } => peer_id,
        }
    }

    /// Check if event matches a topic filter
    ///
    /// Supports wildcards: `session.*` matches all session events, `*` matches all.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches('*');
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name() {
        let event = SessionEvent::PeerUnreachable {
            peer_id: "a".to_string(),
            timeout_ms: 2500,
        };
        assert_eq!(event.event_name(), "session.peer_unreachable");
        assert_eq!(event.peer_id(), "a");

        let event = SessionEvent::CommandReceived {
            peer_id: "b".to_string(),
            command: RemoteCommand::CapturePhoto,
        };
        assert_eq!(event.event_name(), "command.received");
    }

    #[test]
    fn test_matches_topic() {
        let event = SessionEvent::SessionEstablished {
            peer_id: "a".to_string(),
            channels: 2,
        };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("session.*"));
        assert!(event.matches_topic("session.established"));
        assert!(!event.matches_topic("peer.*"));
        assert!(!event.matches_topic("session.disconnected"));
    }

    #[test]
    fn test_serialization() {
        let event = SessionEvent::ConnectionFailed {
            peer_id: "phone-1".to_string(),
            reason: "invitation timed out".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"session.connection_failed\""));
        assert!(json.contains("phone-1"));

        let deserialized: SessionEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(deserialized, SessionEvent::ConnectionFailed { .. }));
    }
}
