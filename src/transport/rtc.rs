//! WebRTC data-channel transport
//!
//! Peers are found through mDNS ([`super::discovery`]) and invited over a
//! one-shot TCP signaling exchange ([`super::signaling`]). Every accepted
//! invitation becomes its own peer connection carrying three data channels:
//!
//! - `reliable`: ordered, retransmitted
//! - `unreliable`: unordered, no retransmits
//! - `resource`: named file transfers (JSON control text + binary chunks)

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::discovery::{MdnsDiscovery, MdnsEvent};
use super::signaling::{SignalingConnection, SignalingListener, SignalingMessage};
use super::{
    store_resource, Channel, ChannelMessage, ChannelState, DiscoveryEvent, Invitation,
    InvitationResponder, PeerId, PeerInfo, PendingInvite, Transport,
};
use crate::config::TransportConfig;
use crate::error::{AppError, Result};
use crate::protocol::SendMode;

const LABEL_RELIABLE: &str = "reliable";
const LABEL_UNRELIABLE: &str = "unreliable";
const LABEL_RESOURCE: &str = "resource";

/// Incoming invitation queue capacity
const INVITATION_QUEUE_CAPACITY: usize = 16;

/// How long a fresh signaling connection may take to send its invite
const SIGNALING_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long data channels may take to open after the answer
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the sender waits for a resource to be stored remotely
const RESOURCE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

fn rtc_error(what: &'static str) -> impl FnOnce(webrtc::Error) -> AppError {
    move |e| AppError::Transport(format!("{}: {}", what, e))
}

/// Control messages on the resource channel (sent as text)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResourceControl {
    /// A resource of `size` bytes follows as binary chunks
    Begin { name: String, size: u64 },
    /// The receiver stored the last resource
    Done,
}

/// Resource being received
#[derive(Debug)]
struct ResourceAssembly {
    name: String,
    size: u64,
    data: BytesMut,
}

impl ResourceAssembly {
    fn new(name: String, size: u64) -> Self {
        Self {
            name,
            size,
            data: BytesMut::new(),
        }
    }

    /// Append a chunk; true once `size` bytes have arrived
    fn push(&mut self, chunk: &[u8]) -> bool {
        self.data.extend_from_slice(chunk);
        self.is_complete()
    }

    fn is_complete(&self) -> bool {
        self.data.len() as u64 >= self.size
    }
}

/// Opened data channels of one connection
struct DataChannels {
    reliable: Arc<RTCDataChannel>,
    unreliable: Arc<RTCDataChannel>,
    resource: Arc<RTCDataChannel>,
}

/// Handlers and queues shared by the data channels of one connection
#[derive(Clone)]
struct Wiring {
    peer: PeerId,
    state: Arc<watch::Sender<ChannelState>>,
    inbox: mpsc::UnboundedSender<ChannelMessage>,
    acks: mpsc::UnboundedSender<()>,
    assembly: Arc<Mutex<Option<ResourceAssembly>>>,
    opened: mpsc::UnboundedSender<Arc<RTCDataChannel>>,
    resource_dir: PathBuf,
}

/// Receiving halves that end up in the channel (or in the open wait)
struct WiringEnds {
    inbox: mpsc::UnboundedReceiver<ChannelMessage>,
    acks: mpsc::UnboundedReceiver<()>,
    opened: mpsc::UnboundedReceiver<Arc<RTCDataChannel>>,
}

impl Wiring {
    fn new(peer: &PeerInfo, resource_dir: PathBuf) -> (Self, WiringEnds) {
        let (state, _) = watch::channel(ChannelState::Connecting);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let wiring = Self {
            peer: peer.id.clone(),
            state: Arc::new(state),
            inbox: inbox_tx,
            acks: acks_tx,
            assembly: Arc::new(Mutex::new(None)),
            opened: opened_tx,
            resource_dir,
        };
        let ends = WiringEnds {
            inbox: inbox_rx,
            acks: acks_rx,
            opened: opened_rx,
        };
        (wiring, ends)
    }

    fn mark_disconnected(state: &watch::Sender<ChannelState>) {
        state.send_if_modified(|s| {
            if *s == ChannelState::NotConnected {
                false
            } else {
                *s = ChannelState::NotConnected;
                true
            }
        });
    }

    /// Follow the peer connection state
    fn watch_connection(&self, pc: &RTCPeerConnection) {
        let state = self.state.clone();
        let peer = self.peer.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = state.clone();
            let peer = peer.clone();
            Box::pin(async move {
                debug!("Peer {} connection state: {}", peer, s);
                if matches!(
                    s,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    Wiring::mark_disconnected(&state);
                }
            })
        }));
    }

    /// Install handlers on one data channel
    fn attach(&self, dc: &Arc<RTCDataChannel>) {
        let label = dc.label().to_string();

        let opened = self.opened.clone();
        let weak = Arc::downgrade(dc);
        dc.on_open(Box::new(move || {
            if let Some(dc) = weak.upgrade() {
                let _ = opened.send(dc);
            }
            Box::pin(async {})
        }));

        let state = self.state.clone();
        let peer = self.peer.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            debug!("Data channel {} to {} closed", close_label, peer);
            Wiring::mark_disconnected(&state);
            Box::pin(async {})
        }));

        match label.as_str() {
            LABEL_RELIABLE | LABEL_UNRELIABLE => {
                let inbox = self.inbox.clone();
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    if !msg.is_string {
                        let _ = inbox.send(ChannelMessage::Data(msg.data));
                    }
                    Box::pin(async {})
                }));
            }
            LABEL_RESOURCE => {
                let wiring = self.clone();
                let weak = Arc::downgrade(dc);
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let wiring = wiring.clone();
                    let weak = weak.clone();
                    Box::pin(async move { wiring.on_resource_message(msg, weak).await })
                }));
            }
            other => warn!("Ignoring unexpected data channel '{}' from {}", other, self.peer),
        }
    }

    async fn on_resource_message(&self, msg: DataChannelMessage, dc: Weak<RTCDataChannel>) {
        let complete = if msg.is_string {
            match serde_json::from_slice::<ResourceControl>(&msg.data) {
                Ok(ResourceControl::Begin { name, size }) => {
                    debug!("Receiving resource {} ({} bytes) from {}", name, size, self.peer);
                    let assembly = ResourceAssembly::new(name, size);
                    if assembly.is_complete() {
                        Some(assembly)
                    } else {
                        *self.assembly.lock() = Some(assembly);
                        None
                    }
                }
                Ok(ResourceControl::Done) => {
                    let _ = self.acks.send(());
                    None
                }
                Err(e) => {
                    warn!("Bad resource control message from {}: {}", self.peer, e);
                    None
                }
            }
        } else {
            let mut guard = self.assembly.lock();
            match guard.as_mut() {
                Some(assembly) => {
                    if assembly.push(&msg.data) {
                        guard.take()
                    } else {
                        None
                    }
                }
                None => {
                    warn!("Resource chunk from {} without header", self.peer);
                    None
                }
            }
        };

        if let Some(assembly) = complete {
            self.finish_resource(assembly, dc).await;
        }
    }

    async fn finish_resource(&self, assembly: ResourceAssembly, dc: Weak<RTCDataChannel>) {
        let path = match store_resource(&self.resource_dir, &assembly.name, &assembly.data).await {
            Ok(path) => path,
            Err(e) => {
                warn!("Failed to store resource {}: {}", assembly.name, e);
                return;
            }
        };
        info!("Resource {} from {} stored at {}", assembly.name, self.peer, path.display());
        let _ = self.inbox.send(ChannelMessage::Resource {
            name: assembly.name,
            path,
            size: assembly.data.len() as u64,
        });

        if let Some(dc) = dc.upgrade() {
            match serde_json::to_string(&ResourceControl::Done) {
                Ok(text) => {
                    if let Err(e) = dc.send_text(text).await {
                        debug!("Resource ack to {} failed: {}", self.peer, e);
                    }
                }
                Err(e) => warn!("Resource ack encoding failed: {}", e),
            }
        }
    }

    /// Wait until all three channels are open, or the connection fails
    async fn wait_open(
        &self,
        opened: &mut mpsc::UnboundedReceiver<Arc<RTCDataChannel>>,
    ) -> Result<DataChannels> {
        let mut state = self.state.subscribe();
        let collect = async {
            let mut reliable = None;
            let mut unreliable = None;
            let mut resource = None;
            loop {
                if let (Some(r), Some(u), Some(f)) = (&reliable, &unreliable, &resource) {
                    return Ok(DataChannels {
                        reliable: Arc::clone(r),
                        unreliable: Arc::clone(u),
                        resource: Arc::clone(f),
                    });
                }
                tokio::select! {
                    dc = opened.recv() => {
                        let Some(dc) = dc else {
                            return Err(AppError::handshake(&self.peer, "connection dropped"));
                        };
                        match dc.label() {
                            LABEL_RELIABLE => reliable = Some(dc),
                            LABEL_UNRELIABLE => unreliable = Some(dc),
                            LABEL_RESOURCE => resource = Some(dc),
                            _ => {}
                        }
                    }
                    changed = state.changed() => {
                        if changed.is_err() || *state.borrow() == ChannelState::NotConnected {
                            return Err(AppError::handshake(&self.peer, "connection failed"));
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(OPEN_TIMEOUT, collect).await {
            Ok(result) => result,
            Err(_) => Err(AppError::handshake(
                &self.peer,
                format!("data channels not open after {} ms", OPEN_TIMEOUT.as_millis()),
            )),
        }
    }
}

/// One connected peer connection
pub struct RtcChannel {
    id: String,
    peer: PeerInfo,
    context: String,
    pc: Arc<RTCPeerConnection>,
    channels: DataChannels,
    state: Arc<watch::Sender<ChannelState>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    /// Serialises resource transfers and collects their acks
    acks: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    chunk_size: usize,
}

impl RtcChannel {
    fn ensure_connected(&self) -> Result<()> {
        if *self.state.borrow() == ChannelState::Connected {
            Ok(())
        } else {
            Err(AppError::Transport(format!(
                "{} channel to {} is not connected",
                self.context, self.peer.id
            )))
        }
    }
}

#[async_trait]
impl Channel for RtcChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    fn context(&self) -> &str {
        &self.context
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    async fn send(&self, data: Bytes, mode: SendMode) -> Result<()> {
        self.ensure_connected()?;
        let dc = match mode {
            SendMode::Reliable => &self.channels.reliable,
            SendMode::Unreliable => &self.channels.unreliable,
        };
        dc.send(&data).await.map_err(rtc_error("data channel send failed"))?;
        Ok(())
    }

    async fn send_resource(&self, name: &str, data: Bytes) -> Result<()> {
        self.ensure_connected()?;
        let mut acks = self.acks.lock().await;
        while acks.try_recv().is_ok() {}

        let header = serde_json::to_string(&ResourceControl::Begin {
            name: name.to_string(),
            size: data.len() as u64,
        })?;
        let dc = &self.channels.resource;
        dc.send_text(header)
            .await
            .map_err(rtc_error("resource header send failed"))?;

        let chunk_size = self.chunk_size.max(1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk_size).min(data.len());
            dc.send(&data.slice(offset..end))
                .await
                .map_err(rtc_error("resource chunk send failed"))?;
            offset = end;
        }

        match tokio::time::timeout(RESOURCE_ACK_TIMEOUT, acks.recv()).await {
            Ok(Some(())) => {
                debug!("Resource {} delivered to {}", name, self.peer.id);
                Ok(())
            }
            Ok(None) => Err(AppError::Transport("resource channel closed".to_string())),
            Err(_) => Err(AppError::Transport(format!(
                "resource {} not acknowledged by {}",
                name, self.peer.id
            ))),
        }
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        self.receiver.lock().take()
    }

    async fn close(&self) {
        Wiring::mark_disconnected(&self.state);
        if let Err(e) = self.pc.close().await {
            debug!("Closing connection to {} failed: {}", self.peer.id, e);
        }
    }
}

/// State shared by the transport, its accept loop and invitation tasks
struct RtcShared {
    local: PeerInfo,
    api: API,
    ice_servers: Vec<RTCIceServer>,
    resource_dir: PathBuf,
    chunk_size: usize,
    /// Signaling addresses learned from discovery
    addresses: Mutex<HashMap<PeerId, SocketAddr>>,
    channels: Mutex<Vec<Weak<RtcChannel>>>,
}

impl RtcShared {
    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(rtc_error("failed to create peer connection"))?;
        Ok(Arc::new(pc))
    }

    /// Gather all candidates and return the complete local SDP
    async fn finish_local_description(
        &self,
        pc: &RTCPeerConnection,
        description: RTCSessionDescription,
    ) -> Result<String> {
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(description)
            .await
            .map_err(rtc_error("failed to set local description"))?;
        let _ = gathered.recv().await;
        pc.local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| AppError::Transport("no local description".to_string()))
    }

    fn register(&self, channel: &Arc<RtcChannel>) {
        let mut channels = self.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels.push(Arc::downgrade(channel));
    }

    fn build_channel(
        &self,
        wiring: &Wiring,
        ends: WiringEnds,
        pc: Arc<RTCPeerConnection>,
        channels: DataChannels,
        peer: &PeerInfo,
        context: &str,
    ) -> Arc<RtcChannel> {
        wiring.state.send_replace(ChannelState::Connected);
        let channel = Arc::new(RtcChannel {
            id: uuid::Uuid::new_v4().to_string(),
            peer: peer.clone(),
            context: context.to_string(),
            pc,
            channels,
            state: wiring.state.clone(),
            receiver: Mutex::new(Some(ends.inbox)),
            acks: tokio::sync::Mutex::new(ends.acks),
            chunk_size: self.chunk_size,
        });
        self.register(&channel);
        info!("{} channel to {} connected", context, peer.id);
        channel
    }

    /// Inviter side: offer, send the invite and wait for the channels
    async fn dial(
        &self,
        pc: Arc<RTCPeerConnection>,
        mut conn: SignalingConnection,
        peer: &PeerInfo,
        context: &str,
    ) -> Result<Arc<RtcChannel>> {
        let (wiring, mut ends) = Wiring::new(peer, self.resource_dir.clone());
        wiring.watch_connection(&pc);

        let unreliable_init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        for (label, init) in [
            (LABEL_RELIABLE, None),
            (LABEL_UNRELIABLE, Some(unreliable_init)),
            (LABEL_RESOURCE, None),
        ] {
            let dc = pc
                .create_data_channel(label, init)
                .await
                .map_err(rtc_error("failed to create data channel"))?;
            wiring.attach(&dc);
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(rtc_error("failed to create offer"))?;
        let sdp = self.finish_local_description(&pc, offer).await?;
        conn.send(&SignalingMessage::Invite {
            from: self.local.clone(),
            context: context.to_string(),
            sdp,
        })
        .await?;

        match conn.recv().await? {
            Some(SignalingMessage::Accept { sdp }) => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| AppError::handshake(&peer.id, format!("invalid answer: {}", e)))?;
                pc.set_remote_description(answer).await.map_err(|e| {
                    AppError::handshake(&peer.id, format!("answer not applied: {}", e))
                })?;
            }
            Some(SignalingMessage::Reject { reason }) => {
                return Err(AppError::handshake(&peer.id, reason));
            }
            Some(SignalingMessage::Invite { .. }) => {
                return Err(AppError::handshake(&peer.id, "unexpected invite in reply"));
            }
            None => {
                return Err(AppError::handshake(&peer.id, "signaling closed before reply"));
            }
        }

        let channels = wiring.wait_open(&mut ends.opened).await?;
        Ok(self.build_channel(&wiring, ends, pc, channels, peer, context))
    }

    /// Invitee side: answer the offer and wait for the channels
    async fn answer(
        &self,
        pc: Arc<RTCPeerConnection>,
        conn: &mut SignalingConnection,
        from: &PeerInfo,
        context: &str,
        offer: String,
    ) -> Result<Arc<RtcChannel>> {
        let (wiring, mut ends) = Wiring::new(from, self.resource_dir.clone());
        wiring.watch_connection(&pc);

        let on_channel = wiring.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            on_channel.attach(&dc);
            Box::pin(async {})
        }));

        let offer = RTCSessionDescription::offer(offer)
            .map_err(|e| AppError::handshake(&from.id, format!("invalid offer: {}", e)))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| AppError::handshake(&from.id, format!("offer not applied: {}", e)))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(rtc_error("failed to create answer"))?;
        let sdp = self.finish_local_description(&pc, answer).await?;
        conn.send(&SignalingMessage::Accept { sdp }).await?;

        let channels = wiring.wait_open(&mut ends.opened).await?;
        Ok(self.build_channel(&wiring, ends, pc, channels, from, context))
    }

    async fn handle_signaling(
        self: Arc<Self>,
        mut conn: SignalingConnection,
        incoming: mpsc::Sender<Invitation>,
    ) {
        let remote = conn.remote();
        let message = match tokio::time::timeout(SIGNALING_READ_TIMEOUT, conn.recv()).await {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!("Signaling from {} failed: {}", remote, e);
                return;
            }
            Err(_) => {
                debug!("Signaling from {} timed out", remote);
                return;
            }
        };

        let SignalingMessage::Invite { from, context, sdp } = message else {
            debug!("Unexpected first signaling message from {}", remote);
            return;
        };
        debug!("Invitation from {} ({}) via {}", from.id, context, remote);

        let responder = RtcResponder {
            shared: self.clone(),
            conn,
            from: from.clone(),
            context: context.clone(),
            offer: sdp,
        };
        if let Err(e) = incoming.try_send(Invitation::new(from, context, Box::new(responder))) {
            let invitation = match e {
                mpsc::error::TrySendError::Full(invitation) => invitation,
                mpsc::error::TrySendError::Closed(invitation) => invitation,
            };
            warn!("Rejecting invitation from {}: queue unavailable", invitation.from.id);
            invitation.reject("busy").await;
        }
    }
}

/// WebRTC transport
pub struct RtcTransport {
    shared: Arc<RtcShared>,
    service_type: String,
    signaling_port: u16,
    discovery: Mutex<Option<Arc<MdnsDiscovery>>>,
    incoming: Mutex<Option<mpsc::Receiver<Invitation>>>,
    cancel: CancellationToken,
}

impl RtcTransport {
    /// Bind the signaling listener and start accepting invitations
    pub async fn bind(
        local: PeerInfo,
        config: &TransportConfig,
        resource_dir: PathBuf,
    ) -> Result<Self> {
        let listener =
            SignalingListener::bind(SocketAddr::from(([0, 0, 0, 0], config.listen_port))).await?;
        let signaling_port = listener.local_addr()?.port();

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::QueryOnly);
        setting_engine.set_include_loopback_candidate(true);
        let api = APIBuilder::new().with_setting_engine(setting_engine).build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let shared = Arc::new(RtcShared {
            local,
            api,
            ice_servers,
            resource_dir,
            chunk_size: config.resource_chunk_size,
            addresses: Mutex::new(HashMap::new()),
            channels: Mutex::new(Vec::new()),
        });

        let (incoming_tx, incoming_rx) = mpsc::channel(INVITATION_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let accept_shared = shared.clone();
        let accept_cancel = cancel.clone();
        tokio::spawn(
            async move {
                loop {
                    let conn = tokio::select! {
                        _ = accept_cancel.cancelled() => break,
                        conn = listener.accept() => conn,
                    };
                    match conn {
                        Ok(conn) => {
                            let handler =
                                accept_shared.clone().handle_signaling(conn, incoming_tx.clone());
                            tokio::spawn(handler);
                        }
                        Err(e) => warn!("Signaling accept failed: {}", e),
                    }
                }
                debug!("Signaling listener stopped");
            }
            .instrument(debug_span!("signaling", port = signaling_port)),
        );

        info!("WebRTC transport listening for invitations on port {}", signaling_port);
        Ok(Self {
            shared,
            service_type: config.service_type.clone(),
            signaling_port,
            discovery: Mutex::new(None),
            incoming: Mutex::new(Some(incoming_rx)),
            cancel,
        })
    }

    pub fn signaling_port(&self) -> u16 {
        self.signaling_port
    }

    /// Make a peer reachable without discovery
    pub fn add_peer_address(&self, peer: &str, addr: SocketAddr) {
        self.shared.addresses.lock().insert(peer.to_string(), addr);
    }

    fn discovery(&self) -> Result<Arc<MdnsDiscovery>> {
        let mut guard = self.discovery.lock();
        if let Some(discovery) = guard.as_ref() {
            return Ok(discovery.clone());
        }
        let discovery = Arc::new(MdnsDiscovery::new(&self.service_type)?);
        *guard = Some(discovery.clone());
        Ok(discovery)
    }
}

#[async_trait]
impl Transport for RtcTransport {
    fn local_peer(&self) -> &PeerInfo {
        &self.shared.local
    }

    async fn start_advertising(&self) -> Result<()> {
        self.discovery()?
            .advertise(&self.shared.local, self.signaling_port)
    }

    async fn stop_advertising(&self) {
        if let Some(discovery) = self.discovery.lock().as_ref() {
            discovery.withdraw();
        }
    }

    async fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let mut mdns = self.discovery()?.browse(&self.shared.local.id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::downgrade(&self.shared);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = mdns.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let out = match event {
                    MdnsEvent::Resolved { peer, addr } => {
                        shared.addresses.lock().insert(peer.id.clone(), addr);
                        DiscoveryEvent::Found(peer)
                    }
                    MdnsEvent::Removed(id) => {
                        shared.addresses.lock().remove(&id);
                        DiscoveryEvent::Lost(id)
                    }
                };
                if tx.send(out).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn invite(&self, peer: &PeerInfo, context: &str) -> Result<PendingInvite> {
        let addr = self
            .shared
            .addresses
            .lock()
            .get(&peer.id)
            .copied()
            .ok_or_else(|| AppError::handshake(&peer.id, "no signaling address for peer"))?;
        let conn = SignalingConnection::connect(addr)
            .await
            .map_err(|e| AppError::handshake(&peer.id, e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let shared = self.shared.clone();
        let target = peer.clone();
        let context_owned = context.to_string();
        let span = debug_span!("invite", peer = %peer.id, context = %context);

        tokio::spawn(
            async move {
                let mut tx = tx;
                let pc = match shared.new_peer_connection().await {
                    Ok(pc) => pc,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };

                let outcome = tokio::select! {
                    result = shared.dial(pc.clone(), conn, &target, &context_owned) => Some(result),
                    _ = tx.closed() => None,
                };

                match outcome {
                    Some(Ok(channel)) => {
                        let channel: Arc<dyn Channel> = channel;
                        if let Err(Ok(channel)) = tx.send(Ok(channel)) {
                            debug!("Inviter gave up; closing fresh channel");
                            channel.close().await;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = pc.close().await;
                        let _ = tx.send(Err(e));
                    }
                    None => {
                        debug!("Invitation abandoned");
                        let _ = pc.close().await;
                    }
                }
            }
            .instrument(span),
        );

        Ok(PendingInvite::new(peer.id.clone(), context, rx))
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<Invitation>> {
        self.incoming.lock().take()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let discovery = self.discovery.lock().take();
        if let Some(discovery) = discovery {
            discovery.shutdown();
        }
        let channels: Vec<Arc<RtcChannel>> = self
            .shared
            .channels
            .lock()
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for channel in channels {
            channel.close().await;
        }
    }
}

struct RtcResponder {
    shared: Arc<RtcShared>,
    conn: SignalingConnection,
    from: PeerInfo,
    context: String,
    offer: String,
}

#[async_trait]
impl InvitationResponder for RtcResponder {
    async fn accept(self: Box<Self>) -> Result<Arc<dyn Channel>> {
        let RtcResponder {
            shared,
            mut conn,
            from,
            context,
            offer,
        } = *self;
        let pc = shared.new_peer_connection().await?;
        match shared.answer(pc.clone(), &mut conn, &from, &context, offer).await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                let _ = pc.close().await;
                Err(e)
            }
        }
    }

    async fn reject(self: Box<Self>, reason: String) {
        let RtcResponder { mut conn, from, .. } = *self;
        if let Err(e) = conn.send(&SignalingMessage::Reject { reason }).await {
            debug!("Reject to {} not delivered: {}", from.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerRole;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo::new(id, id.to_uppercase(), PeerRole::Phone)
    }

    fn loopback_config() -> TransportConfig {
        TransportConfig {
            listen_port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_resource_control_format() {
        let begin = ResourceControl::Begin {
            name: "photo.jpg".to_string(),
            size: 42,
        };
        assert_eq!(
            serde_json::to_string(&begin).unwrap(),
            r#"{"type":"begin","name":"photo.jpg","size":42}"#
        );
        let done: ResourceControl = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(done, ResourceControl::Done);
    }

    #[test]
    fn test_resource_assembly() {
        let mut assembly = ResourceAssembly::new("a".to_string(), 5);
        assert!(!assembly.push(&[1, 2]));
        assert!(assembly.push(&[3, 4, 5]));
        assert_eq!(&assembly.data[..], &[1, 2, 3, 4, 5]);

        assert!(ResourceAssembly::new("empty".to_string(), 0).is_complete());
    }

    #[tokio::test]
    async fn test_invite_unknown_peer_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let transport = RtcTransport::bind(peer("a"), &loopback_config(), dir.path().to_path_buf())
            .await
            .unwrap();
        let err = transport.invite(&peer("ghost"), "command").await.err().unwrap();
        assert!(matches!(err, AppError::Handshake { .. }));
        transport.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_invitation_reaches_inviter() {
        let dir = tempfile::tempdir().unwrap();
        let a = RtcTransport::bind(peer("a"), &loopback_config(), dir.path().to_path_buf())
            .await
            .unwrap();
        let b = RtcTransport::bind(peer("b"), &loopback_config(), dir.path().to_path_buf())
            .await
            .unwrap();
        a.add_peer_address("b", SocketAddr::from(([127, 0, 0, 1], b.signaling_port())));
        let mut incoming = b.take_incoming().unwrap();

        let pending = a.invite(&peer("b"), "bogus").await.unwrap();
        let invitation = incoming.recv().await.unwrap();
        assert_eq!(invitation.from.id, "a");
        assert_eq!(invitation.context, "bogus");
        invitation.reject("unknown context").await;

        let err = pending.wait(Duration::from_secs(10)).await.err().unwrap();
        assert!(err.to_string().contains("unknown context"));

        a.shutdown().await;
        b.shutdown().await;
    }

    async fn next_data(rx: &mut mpsc::UnboundedReceiver<ChannelMessage>) -> Bytes {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(ChannelMessage::Data(data))) => data,
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loopback_reliable_and_unreliable_channels() {
        let dir = tempfile::tempdir().unwrap();
        let a = RtcTransport::bind(peer("a"), &loopback_config(), dir.path().to_path_buf())
            .await
            .unwrap();
        let b = RtcTransport::bind(peer("b"), &loopback_config(), dir.path().to_path_buf())
            .await
            .unwrap();
        a.add_peer_address("b", SocketAddr::from(([127, 0, 0, 1], b.signaling_port())));
        let mut incoming = b.take_incoming().unwrap();

        let pending = a.invite(&peer("b"), "streaming").await.unwrap();
        let invitation = incoming.recv().await.unwrap();
        let accepted = tokio::spawn(invitation.accept());
        let a_end = pending.wait(Duration::from_secs(20)).await.unwrap();
        let b_end = accepted.await.unwrap().unwrap();
        assert_eq!(a_end.state(), ChannelState::Connected);
        assert_eq!(b_end.state(), ChannelState::Connected);
        assert_eq!(b_end.context(), "streaming");

        let rtc = a.shared.channels.lock()[0].upgrade().unwrap();
        assert!(rtc.channels.reliable.ordered());
        assert!(!rtc.channels.unreliable.ordered());
        assert_eq!(rtc.channels.unreliable.max_retransmits(), Some(0));

        let mut a_rx = a_end.take_receiver().unwrap();
        let mut b_rx = b_end.take_receiver().unwrap();

        a_end
            .send(Bytes::from_static(&[0x01, 0x67, 0x42]), SendMode::Reliable)
            .await
            .unwrap();
        assert_eq!(next_data(&mut b_rx).await.as_ref(), &[0x01, 0x67, 0x42]);

        a_end
            .send(Bytes::from_static(&[0x04, 0x41, 0x9A]), SendMode::Unreliable)
            .await
            .unwrap();
        assert_eq!(next_data(&mut b_rx).await.as_ref(), &[0x04, 0x41, 0x9A]);

        b_end
            .send(Bytes::from_static(&[0x10, b'{', b'}']), SendMode::Unreliable)
            .await
            .unwrap();
        assert_eq!(next_data(&mut a_rx).await.as_ref(), &[0x10, b'{', b'}']);

        a.shutdown().await;
        b.shutdown().await;
    }
}
