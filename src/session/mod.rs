//! Peer relationships
//!
//! - [`handshake`]: the two-channel handshake state machine and its passive counterpart
//! - [`liveness`]: keep-alive sender and silence watchdog
//! - [`link`]: handle to an established relationship
//! - [`manager`]: actor that drives all of the above over a transport

pub mod handshake;
pub mod liveness;
pub mod link;
pub mod manager;

pub use handshake::{
    AdmitError, ChannelKind, ChannelPlan, HandshakeAction, HandshakeEvent, HandshakeMachine,
    HandshakeState, PassiveRelationship,
};
pub use link::PeerLink;
pub use liveness::{KeepAliveSender, LivenessMonitor};
pub use manager::{PeerStatus, SessionManager, Side};
