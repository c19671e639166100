//! Peer-to-peer transport abstraction
//!
//! A transport advertises the local node, browses for peers and opens
//! channels to them through invitations carrying a context string. Two
//! implementations exist: an in-process network ([`memory`]) and WebRTC
//! data channels with mDNS discovery and TCP signaling ([`rtc`]).

pub mod discovery;
pub mod memory;
pub mod rtc;
pub mod signaling;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{AppError, Result};
use crate::protocol::SendMode;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use rtc::RtcTransport;

/// Peer identifier (stable per installation)
pub type PeerId = String;

/// Device role advertised in discovery metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PeerRole {
    Phone,
    Tablet,
    /// Remote trigger; uses a single command channel
    Watch,
    #[default]
    Unknown,
}

impl PeerRole {
    /// Parse a `role=` value; anything unrecognised is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "phone" => PeerRole::Phone,
            "tablet" => PeerRole::Tablet,
            "watch" => PeerRole::Watch,
            _ => PeerRole::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Phone => "phone",
            PeerRole::Tablet => "tablet",
            PeerRole::Watch => "watch",
            PeerRole::Unknown => "unknown",
        }
    }
}

impl From<String> for PeerRole {
    fn from(value: String) -> Self {
        PeerRole::parse(&value)
    }
}

impl From<PeerRole> for String {
    fn from(role: PeerRole) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer as seen through discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
    pub role: PeerRole,
}

impl PeerInfo {
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>, role: PeerRole) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

/// Discovery notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(PeerInfo),
    Lost(PeerId),
}

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::NotConnected => write!(f, "not_connected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
        }
    }
}

/// Message delivered on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// One framed packet
    Data(Bytes),
    /// A named resource written to local storage
    Resource { name: String, path: PathBuf, size: u64 },
}

/// One connected channel to a peer
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &str;

    /// Remote peer
    fn peer(&self) -> &PeerInfo;

    /// Invitation context the channel was opened with
    fn context(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Watch state changes; `NotConnected` after `Connected` means the channel is gone
    fn state_watch(&self) -> watch::Receiver<ChannelState>;

    /// Send one message with the given delivery mode
    async fn send(&self, data: Bytes, mode: SendMode) -> Result<()>;

    /// Transfer a named resource; resolves once the receiver has stored it
    async fn send_resource(&self, name: &str, data: Bytes) -> Result<()>;

    /// Incoming messages; can be taken once
    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("context", &self.context())
            .finish()
    }
}

/// Responds to an incoming invitation
#[async_trait]
pub trait InvitationResponder: Send {
    async fn accept(self: Box<Self>) -> Result<Arc<dyn Channel>>;

    async fn reject(self: Box<Self>, reason: String);
}

/// Incoming invitation
pub struct Invitation {
    pub from: PeerInfo,
    pub context: String,
    responder: Box<dyn InvitationResponder>,
}

impl Invitation {
    pub fn new(
        from: PeerInfo,
        context: impl Into<String>,
        responder: Box<dyn InvitationResponder>,
    ) -> Self {
        Self {
            from,
            context: context.into(),
            responder,
        }
    }

    pub async fn accept(self) -> Result<Arc<dyn Channel>> {
        self.responder.accept().await
    }

    pub async fn reject(self, reason: impl Into<String>) {
        self.responder.reject(reason.into()).await
    }
}

impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invitation")
            .field("from", &self.from.id)
            .field("context", &self.context)
            .finish()
    }
}

/// An issued invitation waiting for the peer's answer.
///
/// Dropping it abandons the invitation.
pub struct PendingInvite {
    peer: PeerId,
    context: String,
    rx: oneshot::Receiver<Result<Arc<dyn Channel>>>,
}

impl PendingInvite {
    pub fn new(
        peer: impl Into<PeerId>,
        context: impl Into<String>,
        rx: oneshot::Receiver<Result<Arc<dyn Channel>>>,
    ) -> Self {
        Self {
            peer: peer.into(),
            context: context.into(),
            rx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Wait for acceptance. Rejection, abandonment and timeout are handshake errors.
    pub async fn wait(self, timeout: Duration) -> Result<Arc<dyn Channel>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::handshake(
                &self.peer,
                format!("{} invitation abandoned", self.context),
            )),
            Err(_) => Err(AppError::handshake(
                &self.peer,
                format!(
                    "{} invitation timed out after {} ms",
                    self.context,
                    timeout.as_millis()
                ),
            )),
        }
    }
}

/// Write a received resource under `dir` as `<uuid>-<basename>`
pub async fn store_resource(dir: &Path, name: &str, data: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "resource".to_string());
    let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), file_name));
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

/// Peer-to-peer transport
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> &PeerInfo;

    /// Make the local node discoverable
    async fn start_advertising(&self) -> Result<()>;

    async fn stop_advertising(&self);

    /// Browse for peers. Peers already visible are reported first.
    async fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>>;

    /// Issue an invitation. Fails immediately if it cannot be sent.
    async fn invite(&self, peer: &PeerInfo, context: &str) -> Result<PendingInvite>;

    /// Incoming invitations; can be taken once
    fn take_incoming(&self) -> Option<mpsc::Receiver<Invitation>>;

    /// Stop advertising, close all channels and release sockets
    async fn shutdown(&self);
}
