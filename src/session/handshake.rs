//! Per-peer handshake state machine
//!
//! The machine does no IO. The session manager feeds it [`HandshakeEvent`]s
//! (user intent, channel state changes, invitation outcomes, discovery) and
//! executes the [`HandshakeAction`]s it returns, in order.
//!
//! Active side:
//!
//! ```text
//! Discovered -> CommandInviting -> CommandConnected -> StreamingInviting -> StreamingConnected
//!      ^                                                                          |
//!      +---------------- channel lost / invite failed (tear down both) ----------+
//!
//! any -> Disconnected (peer lost) -> Discovered (rediscovered)
//! ```
//!
//! The passive side only tracks which channels it accepted
//! ([`PassiveRelationship`]).

use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::transport::{ChannelState, PeerId};

/// The two channels of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Reliable control channel, always opened first
    Command,
    /// Media channel, opened once the command channel is connected
    Streaming,
}

impl ChannelKind {
    /// Invitation context marker
    pub fn context(self) -> &'static str {
        match self {
            ChannelKind::Command => "command",
            ChannelKind::Streaming => "streaming",
        }
    }

    /// Parse an invitation context marker; anything else is rejected
    pub fn from_context(context: &str) -> Option<Self> {
        match context {
            "command" => Some(ChannelKind::Command),
            "streaming" => Some(ChannelKind::Streaming),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.context())
    }
}

/// Which channels a relationship uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPlan {
    /// Command channel, then streaming channel
    #[default]
    Split,
    /// Command channel only (remote trigger)
    Single,
}

/// Active-side handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    Discovered,
    CommandInviting,
    CommandConnected,
    StreamingInviting,
    StreamingConnected,
    /// Peer lost; left only by rediscovery
    Disconnected,
}

impl HandshakeState {
    /// Whether `next` is a legal successor
    pub fn can_transition_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;

        match (self, next) {
            (_, Disconnected) => self != Disconnected,
            (Disconnected, Discovered) => true,
            (Disconnected, _) => false,
            (Discovered, CommandInviting) => true,
            (CommandInviting, CommandConnected) => true,
            (CommandConnected, StreamingInviting) => true,
            (StreamingInviting, StreamingConnected) => true,
            // teardown from anything past Discovered
            (
                CommandInviting | CommandConnected | StreamingInviting | StreamingConnected,
                Discovered,
            ) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HandshakeState::Discovered => "discovered",
            HandshakeState::CommandInviting => "command_inviting",
            HandshakeState::CommandConnected => "command_connected",
            HandshakeState::StreamingInviting => "streaming_inviting",
            HandshakeState::StreamingConnected => "streaming_connected",
            HandshakeState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Upper layer wants a relationship
    Connect,
    ChannelConnected(ChannelKind),
    ChannelDisconnected(ChannelKind),
    /// Invitation rejected, timed out or abandoned
    InviteFailed { channel: ChannelKind, reason: String },
    /// Peer disappeared from discovery
    PeerLost,
    /// Peer reappeared after being lost
    Rediscovered,
}

/// Output of the machine, executed in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    Invite { channel: ChannelKind, context: &'static str },
    CancelInvite { channel: ChannelKind },
    /// Close every channel of the relationship
    TearDown,
    /// Relationship usable; notify the upper layer
    Established,
    Failed { reason: String },
    /// State went back to `Discovered`; re-invitation is possible
    Reset,
}

impl HandshakeAction {
    fn invite(channel: ChannelKind) -> Self {
        HandshakeAction::Invite {
            channel,
            context: channel.context(),
        }
    }
}

/// Active-side machine for one peer
#[derive(Debug, Clone)]
pub struct HandshakeMachine {
    peer: PeerId,
    plan: ChannelPlan,
    state: HandshakeState,
}

impl HandshakeMachine {
    pub fn new(peer: impl Into<PeerId>, plan: ChannelPlan) -> Self {
        Self {
            peer: peer.into(),
            plan,
            state: HandshakeState::Discovered,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn plan(&self) -> ChannelPlan {
        self.plan
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Relationship fully usable
    pub fn is_established(&self) -> bool {
        match self.plan {
            ChannelPlan::Split => self.state == HandshakeState::StreamingConnected,
            ChannelPlan::Single => self.state == HandshakeState::CommandConnected,
        }
    }

    /// Derived lifecycle of one channel
    pub fn channel_state(&self, kind: ChannelKind) -> ChannelState {
        use HandshakeState::*;

        match (kind, self.state) {
            (ChannelKind::Command, CommandInviting) => ChannelState::Connecting,
            (ChannelKind::Command, CommandConnected | StreamingInviting | StreamingConnected) => {
                ChannelState::Connected
            }
            (ChannelKind::Streaming, StreamingInviting) => ChannelState::Connecting,
            (ChannelKind::Streaming, StreamingConnected) => ChannelState::Connected,
            _ => ChannelState::NotConnected,
        }
    }

    fn transition(&mut self, next: HandshakeState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                "Peer {}: illegal handshake transition {} -> {}",
                self.peer, self.state, next
            );
            return false;
        }
        debug!("Peer {}: {} -> {}", self.peer, self.state, next);
        self.state = next;
        true
    }

    /// Invitation outstanding in the current state
    fn pending_invite(&self) -> Option<ChannelKind> {
        match self.state {
            HandshakeState::CommandInviting => Some(ChannelKind::Command),
            HandshakeState::StreamingInviting => Some(ChannelKind::Streaming),
            _ => None,
        }
    }

    /// Tear everything down and go back to `Discovered`
    fn reset(&mut self, mut actions: Vec<HandshakeAction>) -> Vec<HandshakeAction> {
        if let Some(channel) = self.pending_invite() {
            actions.push(HandshakeAction::CancelInvite { channel });
        }
        actions.push(HandshakeAction::TearDown);
        if self.transition(HandshakeState::Discovered) {
            actions.push(HandshakeAction::Reset);
        }
        actions
    }

    /// Feed one event. Events that do not apply in the current state are
    /// ignored and produce no actions.
    pub fn handle(&mut self, event: HandshakeEvent) -> Vec<HandshakeAction> {
        use HandshakeState::*;

        match (self.state, event) {
            (Discovered, HandshakeEvent::Connect) => {
                if self.transition(CommandInviting) {
                    vec![HandshakeAction::invite(ChannelKind::Command)]
                } else {
                    Vec::new()
                }
            }

            (CommandInviting, HandshakeEvent::ChannelConnected(ChannelKind::Command)) => {
                if !self.transition(CommandConnected) {
                    return Vec::new();
                }
                match self.plan {
                    ChannelPlan::Single => vec![HandshakeAction::Established],
                    ChannelPlan::Split => {
                        // the only place the streaming invitation is issued
                        if self.transition(StreamingInviting) {
                            vec![HandshakeAction::invite(ChannelKind::Streaming)]
                        } else {
                            Vec::new()
                        }
                    }
                }
            }

            (StreamingInviting, HandshakeEvent::ChannelConnected(ChannelKind::Streaming)) => {
                if self.transition(StreamingConnected) {
                    vec![HandshakeAction::Established]
                } else {
                    Vec::new()
                }
            }

            (
                CommandInviting | CommandConnected | StreamingInviting | StreamingConnected,
                HandshakeEvent::ChannelDisconnected(kind),
            ) => {
                if self.channel_state(kind) == ChannelState::NotConnected {
                    // stale notification for a channel this relationship no longer has
                    return Vec::new();
                }
                self.reset(Vec::new())
            }

            (state, HandshakeEvent::InviteFailed { channel, reason }) => {
                if self.pending_invite() != Some(channel) {
                    debug!(
                        "Peer {}: ignoring {} invite failure in {}",
                        self.peer, channel, state
                    );
                    return Vec::new();
                }
                // the failed invitation is already gone; no cancel needed
                let mut actions = vec![
                    HandshakeAction::Failed { reason },
                    HandshakeAction::TearDown,
                ];
                if self.transition(Discovered) {
                    actions.push(HandshakeAction::Reset);
                }
                actions
            }

            (Disconnected, HandshakeEvent::PeerLost) => Vec::new(),
            (state, HandshakeEvent::PeerLost) => {
                let mut actions = Vec::new();
                if let Some(channel) = self.pending_invite() {
                    actions.push(HandshakeAction::CancelInvite { channel });
                }
                if state != Discovered {
                    actions.push(HandshakeAction::TearDown);
                }
                self.transition(Disconnected);
                actions
            }

            (Disconnected, HandshakeEvent::Rediscovered) => {
                self.transition(Discovered);
                Vec::new()
            }

            (state, event) => {
                debug!("Peer {}: {:?} ignored in {}", self.peer, event, state);
                Vec::new()
            }
        }
    }
}

/// Why a passive-side invitation is refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    UnknownContext(String),
    /// Streaming before the command channel is connected
    CommandFirst,
    /// Streaming offered to a single-channel relationship
    SingleChannel,
}

impl fmt::Display for AdmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmitError::UnknownContext(ctx) => write!(f, "unknown invitation context '{}'", ctx),
            AdmitError::CommandFirst => write!(f, "command channel must be connected first"),
            AdmitError::SingleChannel => write!(f, "relationship uses a single channel"),
        }
    }
}

/// Passive-side view of one relationship
#[derive(Debug, Clone, Default)]
pub struct PassiveRelationship {
    plan: ChannelPlan,
    command: ChannelState,
    streaming: ChannelState,
}

impl PassiveRelationship {
    pub fn new(plan: ChannelPlan) -> Self {
        Self {
            plan,
            ..Default::default()
        }
    }

    pub fn plan(&self) -> ChannelPlan {
        self.plan
    }

    /// Decide whether an invitation with `context` may be accepted
    pub fn admit(&self, context: &str) -> std::result::Result<ChannelKind, AdmitError> {
        let kind = ChannelKind::from_context(context)
            .ok_or_else(|| AdmitError::UnknownContext(context.to_string()))?;
        if kind == ChannelKind::Streaming {
            if self.plan == ChannelPlan::Single {
                return Err(AdmitError::SingleChannel);
            }
            if self.command != ChannelState::Connected {
                return Err(AdmitError::CommandFirst);
            }
        }
        Ok(kind)
    }

    /// An admitted invitation is being accepted
    pub fn accepting(&mut self, kind: ChannelKind) {
        match kind {
            ChannelKind::Command => {
                self.command = ChannelState::Connecting;
                self.streaming = ChannelState::NotConnected;
            }
            ChannelKind::Streaming => self.streaming = ChannelState::Connecting,
        }
    }

    /// An accepted channel is connected. A new command channel replaces the
    /// whole relationship (the inviter restarted its handshake).
    pub fn accepted(&mut self, kind: ChannelKind) {
        match kind {
            ChannelKind::Command => {
                self.command = ChannelState::Connected;
                self.streaming = ChannelState::NotConnected;
            }
            ChannelKind::Streaming => self.streaming = ChannelState::Connected,
        }
    }

    /// Losing either channel tears down both
    pub fn lost(&mut self) {
        self.command = ChannelState::NotConnected;
        self.streaming = ChannelState::NotConnected;
    }

    pub fn channel_state(&self, kind: ChannelKind) -> ChannelState {
        match kind {
            ChannelKind::Command => self.command,
            ChannelKind::Streaming => self.streaming,
        }
    }

    pub fn is_established(&self) -> bool {
        match self.plan {
            ChannelPlan::Split => {
                self.command == ChannelState::Connected && self.streaming == ChannelState::Connected
            }
            ChannelPlan::Single => self.command == ChannelState::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite(channel: ChannelKind) -> HandshakeAction {
        HandshakeAction::Invite {
            channel,
            context: channel.context(),
        }
    }

    #[test]
    fn test_split_handshake_sequence() {
        let mut m = HandshakeMachine::new("phone", ChannelPlan::Split);
        assert_eq!(m.handle(HandshakeEvent::Connect), vec![invite(ChannelKind::Command)]);
        assert_eq!(m.state(), HandshakeState::CommandInviting);
        assert_eq!(m.channel_state(ChannelKind::Command), ChannelState::Connecting);

        // streaming never connects before it was invited
        assert!(m
            .handle(HandshakeEvent::ChannelConnected(ChannelKind::Streaming))
            .is_empty());

        assert_eq!(
            m.handle(HandshakeEvent::ChannelConnected(ChannelKind::Command)),
            vec![invite(ChannelKind::Streaming)]
        );
        assert_eq!(m.state(), HandshakeState::StreamingInviting);
        assert!(!m.is_established());

        assert_eq!(
            m.handle(HandshakeEvent::ChannelConnected(ChannelKind::Streaming)),
            vec![HandshakeAction::Established]
        );
        assert!(m.is_established());
        assert_eq!(m.channel_state(ChannelKind::Streaming), ChannelState::Connected);

        // duplicate connect is ignored
        assert!(m.handle(HandshakeEvent::Connect).is_empty());
    }

    #[test]
    fn test_single_channel_plan_establishes_on_command() {
        let mut m = HandshakeMachine::new("watch", ChannelPlan::Single);
        m.handle(HandshakeEvent::Connect);
        assert_eq!(
            m.handle(HandshakeEvent::ChannelConnected(ChannelKind::Command)),
            vec![HandshakeAction::Established]
        );
        assert!(m.is_established());
        assert_eq!(m.state(), HandshakeState::CommandConnected);
        assert_eq!(m.channel_state(ChannelKind::Streaming), ChannelState::NotConnected);
    }

    #[test]
    fn test_disconnect_while_inviting_streaming_cancels_and_resets() {
        let mut m = HandshakeMachine::new("phone", ChannelPlan::Split);
        m.handle(HandshakeEvent::Connect);
        m.handle(HandshakeEvent::ChannelConnected(ChannelKind::Command));

        assert_eq!(
            m.handle(HandshakeEvent::ChannelDisconnected(ChannelKind::Command)),
            vec![
                HandshakeAction::CancelInvite {
                    channel: ChannelKind::Streaming
                },
                HandshakeAction::TearDown,
                HandshakeAction::Reset,
            ]
        );
        assert_eq!(m.state(), HandshakeState::Discovered);

        // re-invitation without rediscovery
        assert_eq!(m.handle(HandshakeEvent::Connect), vec![invite(ChannelKind::Command)]);
    }

    #[test]
    fn test_disconnect_of_either_channel_tears_down_both() {
        let mut m = HandshakeMachine::new("phone", ChannelPlan::Split);
        m.handle(HandshakeEvent::Connect);
        m.handle(HandshakeEvent::ChannelConnected(ChannelKind::Command));
        m.handle(HandshakeEvent::ChannelConnected(ChannelKind::Streaming));

        assert_eq!(
            m.handle(HandshakeEvent::ChannelDisconnected(ChannelKind::Streaming)),
            vec![HandshakeAction::TearDown, HandshakeAction::Reset]
        );
        assert_eq!(m.channel_state(ChannelKind::Command), ChannelState::NotConnected);

        // the other channel's close notification arrives late and is ignored
        assert!(m
            .handle(HandshakeEvent::ChannelDisconnected(ChannelKind::Command))
            .is_empty());
    }

    #[test]
    fn test_invite_failure_resets() {
        let mut m = HandshakeMachine::new("phone", ChannelPlan::Split);
        m.handle(HandshakeEvent::Connect);
        let actions = m.handle(HandshakeEvent::InviteFailed {
            channel: ChannelKind::Command,
            reason: "rejected".to_string(),
        });
        assert_eq!(
            actions,
            vec![
                HandshakeAction::Failed {
                    reason: "rejected".to_string()
                },
                HandshakeAction::TearDown,
                HandshakeAction::Reset,
            ]
        );
        assert_eq!(m.state(), HandshakeState::Discovered);

        // failure of an invitation that is no longer pending
        assert!(m
            .handle(HandshakeEvent::InviteFailed {
                channel: ChannelKind::Streaming,
                reason: "late".to_string(),
            })
            .is_empty());
    }

    #[test]
    fn test_peer_lost_and_rediscovered() {
        let mut m = HandshakeMachine::new("phone", ChannelPlan::Split);
        assert!(m.handle(HandshakeEvent::PeerLost).is_empty());
        assert_eq!(m.state(), HandshakeState::Disconnected);

        // nothing but rediscovery leaves Disconnected
        assert!(m.handle(HandshakeEvent::Connect).is_empty());
        assert_eq!(m.state(), HandshakeState::Disconnected);
        m.handle(HandshakeEvent::Rediscovered);
        assert_eq!(m.state(), HandshakeState::Discovered);

        m.handle(HandshakeEvent::Connect);
        m.handle(HandshakeEvent::ChannelConnected(ChannelKind::Command));
        assert_eq!(
            m.handle(HandshakeEvent::PeerLost),
            vec![
                HandshakeAction::CancelInvite {
                    channel: ChannelKind::Streaming
                },
                HandshakeAction::TearDown,
            ]
        );
        assert_eq!(m.state(), HandshakeState::Disconnected);
    }

    #[test]
    fn test_transition_table() {
        use HandshakeState::*;

        assert!(Discovered.can_transition_to(CommandInviting));
        assert!(!Discovered.can_transition_to(StreamingInviting));
        assert!(!CommandInviting.can_transition_to(StreamingInviting));
        assert!(!Discovered.can_transition_to(Discovered));
        assert!(StreamingConnected.can_transition_to(Discovered));
        assert!(StreamingConnected.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(CommandInviting));
        assert!(Disconnected.can_transition_to(Discovered));
    }

    #[test]
    fn test_context_parsing() {
        assert_eq!(ChannelKind::from_context("command"), Some(ChannelKind::Command));
        assert_eq!(ChannelKind::from_context("streaming"), Some(ChannelKind::Streaming));
        assert_eq!(ChannelKind::from_context("Command"), None);
        assert_eq!(ChannelKind::from_context(""), None);
    }

    #[test]
    fn test_passive_relationship() {
        let mut rel = PassiveRelationship::new(ChannelPlan::Split);
        assert_eq!(rel.admit("streaming"), Err(AdmitError::CommandFirst));
        assert!(matches!(rel.admit("video"), Err(AdmitError::UnknownContext(_))));
        assert_eq!(rel.admit("command"), Ok(ChannelKind::Command));
        rel.accepting(ChannelKind::Command);
        assert_eq!(rel.channel_state(ChannelKind::Command), ChannelState::Connecting);
        assert_eq!(rel.admit("streaming"), Err(AdmitError::CommandFirst));

        rel.accepted(ChannelKind::Command);
        assert!(!rel.is_established());
        assert_eq!(rel.admit("streaming"), Ok(ChannelKind::Streaming));
        rel.accepted(ChannelKind::Streaming);
        assert!(rel.is_established());

        rel.lost();
        assert_eq!(rel.channel_state(ChannelKind::Command), ChannelState::NotConnected);
        assert!(!rel.is_established());

        let mut single = PassiveRelationship::new(ChannelPlan::Single);
        single.accepted(ChannelKind::Command);
        assert!(single.is_established());
        assert_eq!(single.admit("streaming"), Err(AdmitError::SingleChannel));
    }
}
