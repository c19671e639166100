//! Handle to an established relationship

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::handshake::ChannelPlan;
use crate::error::{AppError, Result};
use crate::protocol::{choose_mode, Packet, PacketTag, RemoteCommand, SendMode};
use crate::transport::{Channel, ChannelMessage, ChannelState, PeerInfo};

/// What the capture and rendering pipelines use once a peer is established
///
/// Cloning is cheap; all clones share the channels and the stream receiver.
#[derive(Clone)]
pub struct PeerLink {
    peer: PeerInfo,
    plan: ChannelPlan,
    command: Arc<dyn Channel>,
    streaming: Option<Arc<dyn Channel>>,
    stream_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>>,
}

impl PeerLink {
    pub(crate) fn new(
        peer: PeerInfo,
        plan: ChannelPlan,
        command: Arc<dyn Channel>,
        streaming: Option<Arc<dyn Channel>>,
        stream_rx: mpsc::UnboundedReceiver<ChannelMessage>,
    ) -> Self {
        Self {
            peer,
            plan,
            command,
            streaming,
            stream_rx: Arc::new(Mutex::new(Some(stream_rx))),
        }
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn plan(&self) -> ChannelPlan {
        self.plan
    }

    /// Both channels (or the single one) still connected
    pub fn is_connected(&self) -> bool {
        self.command.state() == ChannelState::Connected
            && self
                .streaming
                .as_ref()
                .map_or(true, |s| s.state() == ChannelState::Connected)
    }

    /// Channel a packet with `tag` travels on
    fn route(&self, tag: PacketTag) -> &Arc<dyn Channel> {
        match (tag, &self.streaming) {
            (PacketTag::Command | PacketTag::CaptureRequest, _) => &self.command,
            (_, Some(streaming)) => streaming,
            (_, None) => &self.command,
        }
    }

    /// Send one packet; the delivery mode follows the packet's tag
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let data = packet.to_bytes();
        let mode = choose_mode(&data);
        self.route(packet.tag()).send(data, mode).await
    }

    /// Send a command on the command channel (always reliable)
    pub async fn send_command(&self, command: &RemoteCommand) -> Result<()> {
        let packet = command.to_packet()?;
        self.command.send(packet.to_bytes(), SendMode::Reliable).await
    }

    /// Transfer a still photo; resolves once the peer has stored it
    pub async fn send_photo(&self, name: &str, data: Bytes) -> Result<()> {
        let streaming = self.streaming.as_ref().ok_or_else(|| {
            AppError::Transport(format!(
                "relationship with {} has no streaming channel",
                self.peer.id
            ))
        })?;
        streaming.send_resource(name, data).await
    }

    /// Incoming pictures, photos and non-command packets; can be taken once
    pub fn take_stream_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        self.stream_rx.lock().take()
    }

    /// Close both channels; the session manager notices and tears down
    pub async fn close(&self) {
        if let Some(streaming) = &self.streaming {
            streaming.close().await;
        }
        self.command.close().await;
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer.id)
            .field("plan", &self.plan)
            .field("connected", &self.is_connected())
            .finish()
    }
}
