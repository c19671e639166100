//! Session manager
//!
//! Drives handshakes over a [`Transport`]. One actor task owns every peer
//! entry; discovery, invitations, invitation outcomes, channel closures and
//! liveness timeouts all arrive as messages on its queue, so no peer state is
//! shared between tasks. Public methods marshal onto the queue and wait for
//! a oneshot reply where they return something.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::handshake::{
    ChannelKind, ChannelPlan, HandshakeAction, HandshakeEvent, HandshakeMachine, HandshakeState,
    PassiveRelationship,
};
use super::link::PeerLink;
use super::liveness::{KeepAliveSender, LivenessMonitor};
use crate::config::SessionConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::protocol::{Packet, PacketTag, RemoteCommand};
use crate::transport::{
    Channel, ChannelMessage, ChannelState, DiscoveryEvent, Invitation, PeerId, PeerInfo, Transport,
};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Which end started the current relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// We invited the peer
    Active,
    /// The peer invited us
    Passive,
}

/// Snapshot of one peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub peer: PeerInfo,
    /// Currently advertised
    pub visible: bool,
    pub side: Option<Side>,
    pub state: String,
    pub command: ChannelState,
    pub streaming: ChannelState,
    pub established: bool,
}

enum ManagerMsg {
    Discovery(DiscoveryEvent),
    Invitation(Invitation),
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    InviteResolved {
        peer: PeerId,
        kind: ChannelKind,
        generation: u64,
        result: Result<Arc<dyn Channel>>,
    },
    Accepted {
        peer: PeerId,
        kind: ChannelKind,
        generation: u64,
        result: Result<Arc<dyn Channel>>,
    },
    ChannelClosed {
        peer: PeerId,
        kind: ChannelKind,
        generation: u64,
    },
    Unreachable {
        peer: PeerId,
        generation: u64,
    },
    Status(oneshot::Sender<Vec<PeerStatus>>),
    Link {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerLink>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the session actor
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    tx: mpsc::UnboundedSender<ManagerMsg>,
    established: Mutex<Option<mpsc::UnboundedReceiver<PeerLink>>>,
    cancel: CancellationToken,
    span: Span,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
        config: SessionConfig,
        invite_timeout: Duration,
        parent: &Span,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (established_tx, established_rx) = mpsc::unbounded_channel();
        let local = transport.local_peer().clone();
        let span = tracing::info_span!(parent: parent, "session", local = %local.id);

        let actor = ManagerActor {
            local,
            transport: transport.clone(),
            events,
            config,
            invite_timeout,
            peers: HashMap::new(),
            tx: tx.clone(),
            established: established_tx,
            span: span.clone(),
        };
        tokio::spawn(actor.run(rx).instrument(span.clone()));

        Self {
            transport,
            tx,
            established: Mutex::new(Some(established_rx)),
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Start discovery and invitation handling; optionally advertise
    pub async fn start(&self, advertise: bool) -> Result<()> {
        if advertise {
            self.transport.start_advertising().await?;
        }

        let mut discovery = self.transport.browse().await?;
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = discovery.recv() => match event {
                            Some(event) => event,
                            None => break,
                        },
                    };
                    if tx.send(ManagerMsg::Discovery(event)).is_err() {
                        break;
                    }
                }
            }
            .instrument(self.span.clone()),
        );

        if let Some(mut incoming) = self.transport.take_incoming() {
            let tx = self.tx.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(
                async move {
                    loop {
                        let invitation = tokio::select! {
                            _ = cancel.cancelled() => break,
                            invitation = incoming.recv() => match invitation {
                                Some(invitation) => invitation,
                                None => break,
                            },
                        };
                        if tx.send(ManagerMsg::Invitation(invitation)).is_err() {
                            break;
                        }
                    }
                }
                .instrument(self.span.clone()),
            );
        }

        info!("Session manager started (advertising: {})", advertise);
        Ok(())
    }

    fn stopped() -> AppError {
        AppError::Internal("session manager stopped".to_string())
    }

    /// Start a relationship with a discovered peer.
    ///
    /// Fails with a handshake error when the invitation cannot be issued;
    /// later failures are published as `ConnectionFailed`.
    pub async fn connect(&self, peer: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Connect {
                peer: peer.to_string(),
                reply,
            })
            .map_err(|_| Self::stopped())?;
        rx.await.map_err(|_| Self::stopped())?
    }

    /// Tear down the relationship with `peer`
    pub async fn disconnect(&self, peer: &str) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerMsg::Disconnect {
                peer: peer.to_string(),
                reply,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn peers(&self) -> Vec<PeerStatus> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerMsg::Status(reply)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Link of an established relationship
    pub async fn link(&self, peer: &str) -> Option<PeerLink> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Link {
                peer: peer.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Links as relationships become established; can be taken once
    pub fn take_established(&self) -> Option<mpsc::UnboundedReceiver<PeerLink>> {
        self.established.lock().take()
    }

    /// Tear down every relationship, then shut the transport down
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerMsg::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
        self.transport.shutdown().await;
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PeerEntry {
    info: PeerInfo,
    visible: bool,
    side: Option<Side>,
    machine: HandshakeMachine,
    passive: PassiveRelationship,
    /// Bumped on every teardown; messages from older channels are ignored
    generation: u64,
    command: Option<Arc<dyn Channel>>,
    streaming: Option<Arc<dyn Channel>>,
    invite: Option<(ChannelKind, AbortHandle)>,
    /// Streaming invitation that arrived while the command accept was running
    deferred: Option<Invitation>,
    liveness: Option<LivenessMonitor>,
    keepalive: Option<KeepAliveSender>,
    stream_tx: Option<mpsc::UnboundedSender<ChannelMessage>>,
    stream_rx: Option<mpsc::UnboundedReceiver<ChannelMessage>>,
    link: Option<PeerLink>,
}

impl PeerEntry {
    fn new(info: PeerInfo, plan: ChannelPlan) -> Self {
        Self {
            machine: HandshakeMachine::new(info.id.clone(), plan),
            passive: PassiveRelationship::new(plan),
            info,
            visible: false,
            side: None,
            generation: 0,
            command: None,
            streaming: None,
            invite: None,
            deferred: None,
            liveness: None,
            keepalive: None,
            stream_tx: None,
            stream_rx: None,
            link: None,
        }
    }

    fn plan(&self) -> ChannelPlan {
        match self.side {
            Some(Side::Passive) => self.passive.plan(),
            _ => self.machine.plan(),
        }
    }

    fn channel_state(&self, kind: ChannelKind) -> ChannelState {
        match self.side {
            Some(Side::Passive) => self.passive.channel_state(kind),
            _ => self.machine.channel_state(kind),
        }
    }

    fn is_established(&self) -> bool {
        match self.side {
            Some(Side::Passive) => self.passive.is_established(),
            _ => self.machine.is_established(),
        }
    }

    fn state_label(&self) -> String {
        if self.side != Some(Side::Passive) {
            return self.machine.state().to_string();
        }
        let connected = |kind| self.passive.channel_state(kind) == ChannelState::Connected;
        let label = if connected(ChannelKind::Streaming) {
            HandshakeState::StreamingConnected
        } else if connected(ChannelKind::Command) {
            HandshakeState::CommandConnected
        } else {
            HandshakeState::Discovered
        };
        label.to_string()
    }

    fn status(&self) -> PeerStatus {
        PeerStatus {
            peer: self.info.clone(),
            visible: self.visible,
            side: self.side,
            state: self.state_label(),
            command: self.channel_state(ChannelKind::Command),
            streaming: self.channel_state(ChannelKind::Streaming),
            established: self.is_established(),
        }
    }
}

struct ManagerActor {
    local: PeerInfo,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    config: SessionConfig,
    invite_timeout: Duration,
    peers: HashMap<PeerId, PeerEntry>,
    tx: mpsc::UnboundedSender<ManagerMsg>,
    established: mpsc::UnboundedSender<PeerLink>,
    span: Span,
}

/// Reason string of an error, without the handshake wrapper
fn failure_reason(error: &AppError) -> String {
    match error {
        AppError::Handshake { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

impl ManagerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ManagerMsg::Discovery(DiscoveryEvent::Found(info)) => self.on_found(info).await,
                ManagerMsg::Discovery(DiscoveryEvent::Lost(id)) => self.on_lost(id).await,
                ManagerMsg::Invitation(invitation) => self.on_invitation(invitation),
                ManagerMsg::Connect { peer, reply } => {
                    let result = self.connect(&peer).await;
                    let _ = reply.send(result);
                }
                ManagerMsg::Disconnect { peer, reply } => {
                    self.disconnect(&peer).await;
                    let _ = reply.send(());
                }
                ManagerMsg::InviteResolved {
                    peer,
                    kind,
                    generation,
                    result,
                } => self.on_invite_resolved(peer, kind, generation, result).await,
                ManagerMsg::Accepted {
                    peer,
                    kind,
                    generation,
                    result,
                } => self.on_accepted(peer, kind, generation, result).await,
                ManagerMsg::ChannelClosed {
                    peer,
                    kind,
                    generation,
                } => self.on_channel_closed(peer, kind, generation).await,
                ManagerMsg::Unreachable { peer, generation } => {
                    self.on_unreachable(peer, generation).await
                }
                ManagerMsg::Status(reply) => {
                    let mut peers: Vec<PeerStatus> =
                        self.peers.values().map(PeerEntry::status).collect();
                    peers.sort_by(|a, b| a.peer.id.cmp(&b.peer.id));
                    let _ = reply.send(peers);
                }
                ManagerMsg::Link { peer, reply } => {
                    let link = self.peers.get(&peer).and_then(|e| e.link.clone());
                    let _ = reply.send(link);
                }
                ManagerMsg::Shutdown(reply) => {
                    let ids: Vec<PeerId> = self.peers.keys().cloned().collect();
                    for id in ids {
                        self.tear_down(&id, "shutting down");
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("Session actor finished");
    }

    /// Remote-trigger relationships use the command channel only
    fn plan_for(&self, remote: &PeerInfo) -> ChannelPlan {
        if self.config.is_single_channel(remote.role)
            || self.config.is_single_channel(self.local.role)
        {
            ChannelPlan::Single
        } else {
            ChannelPlan::Split
        }
    }

    fn publish_state(&self, peer: &str) {
        if let Some(entry) = self.peers.get(peer) {
            self.events.publish(SessionEvent::SessionStateChanged {
                peer_id: peer.to_string(),
                state: entry.state_label(),
            });
        }
    }

    /// Publish failures that need an app-level decision, log the rest
    fn surface(&self, error: AppError) {
        if !error.propagates() {
            debug!("Not surfaced: {}", error);
            return;
        }
        warn!("{}", error);
        let event = match error {
            AppError::LivenessTimeout { peer } => SessionEvent::PeerUnreachable {
                peer_id: peer,
                timeout_ms: self.config.liveness_timeout().as_millis() as u64,
            },
            AppError::Handshake { peer, reason } => SessionEvent::ConnectionFailed {
                peer_id: peer,
                reason,
            },
            _ => return,
        };
        self.events.publish(event);
    }

    async fn on_found(&mut self, info: PeerInfo) {
        let plan = self.plan_for(&info);
        let id = info.id.clone();
        let entry = self
            .peers
            .entry(id.clone())
            .or_insert_with(|| PeerEntry::new(info.clone(), plan));
        entry.info = info.clone();
        entry.visible = true;
        let rediscovered = entry.machine.state() == HandshakeState::Disconnected;

        info!("Found peer {} ({}, {})", info.id, info.display_name, info.role);
        self.events.publish(SessionEvent::PeerFound {
            peer_id: info.id,
            display_name: info.display_name,
            role: info.role.to_string(),
        });
        if rediscovered {
            let _ = self.apply(&id, HandshakeEvent::Rediscovered, None).await;
        }
    }

    async fn on_lost(&mut self, id: PeerId) {
        let Some(entry) = self.peers.get_mut(&id) else {
            return;
        };
        entry.visible = false;
        let passive = entry.side == Some(Side::Passive);
        info!("Lost peer {}", id);
        self.events.publish(SessionEvent::PeerLost { peer_id: id.clone() });

        // passive relationships follow their channels, not discovery
        if !passive {
            let _ = self.apply(&id, HandshakeEvent::PeerLost, Some("peer lost")).await;
        }
    }

    async fn connect(&mut self, peer: &str) -> Result<()> {
        let Some(entry) = self.peers.get(peer) else {
            return Err(AppError::handshake(peer, "peer has not been discovered"));
        };
        if entry.side == Some(Side::Passive) && entry.command.is_some() {
            return Err(AppError::handshake(peer, "peer already has a relationship with us"));
        }
        match entry.machine.state() {
            HandshakeState::Disconnected => {
                return Err(AppError::handshake(peer, "peer is no longer visible"));
            }
            HandshakeState::Discovered => {}
            state => {
                debug!("Connect to {} ignored in {}", peer, state);
                return Ok(());
            }
        }

        let plan = self.plan_for(&entry.info);
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.side = Some(Side::Active);
            entry.machine = HandshakeMachine::new(peer, plan);
        }
        self.apply(peer, HandshakeEvent::Connect, None).await
    }

    async fn disconnect(&mut self, peer: &str) {
        let Some(entry) = self.peers.get(peer) else {
            return;
        };
        match entry.side {
            Some(Side::Passive) => {
                self.tear_down(peer, "closed locally");
                self.publish_state(peer);
            }
            _ => {
                let _ = self
                    .apply(
                        peer,
                        HandshakeEvent::ChannelDisconnected(ChannelKind::Command),
                        Some("closed locally"),
                    )
                    .await;
            }
        }
    }

    /// Run the active-side machine and execute its actions. Returns the
    /// error of an invitation that could not be issued.
    async fn apply(
        &mut self,
        peer: &str,
        event: HandshakeEvent,
        cause: Option<&str>,
    ) -> Result<()> {
        let mut queue = VecDeque::from([event]);
        let mut issue_error: Option<AppError> = None;

        while let Some(event) = queue.pop_front() {
            let cause = match (&event, cause) {
                (_, Some(cause)) => cause.to_string(),
                (HandshakeEvent::ChannelDisconnected(kind), None) => {
                    format!("{} channel closed", kind)
                }
                (HandshakeEvent::InviteFailed { reason, .. }, None) => reason.clone(),
                _ => "relationship reset".to_string(),
            };

            let Some(entry) = self.peers.get_mut(peer) else {
                break;
            };
            let before = entry.machine.state();
            let actions = entry.machine.handle(event);
            if entry.machine.state() != before {
                self.publish_state(peer);
            }

            for action in actions {
                match action {
                    HandshakeAction::Invite { channel, context } => {
                        if let Err(e) = self.issue_invite(peer, channel, context).await {
                            warn!(
                                "Invitation of {} to {} channel not issued: {}",
                                peer, channel, e
                            );
                            queue.push_back(HandshakeEvent::InviteFailed {
                                channel,
                                reason: failure_reason(&e),
                            });
                            issue_error.get_or_insert(e);
                        }
                    }
                    HandshakeAction::CancelInvite { channel } => self.cancel_invite(peer, channel),
                    HandshakeAction::TearDown => self.tear_down(peer, &cause),
                    HandshakeAction::Established => self.establish(peer),
                    HandshakeAction::Failed { reason } => {
                        self.surface(AppError::handshake(peer, reason));
                    }
                    HandshakeAction::Reset => debug!("Peer {} ready for re-invitation", peer),
                }
            }
        }

        match issue_error {
            None => Ok(()),
            Some(e @ AppError::Handshake { .. }) => Err(e),
            Some(e) => Err(AppError::handshake(peer, e.to_string())),
        }
    }

    async fn issue_invite(
        &mut self,
        peer: &str,
        channel: ChannelKind,
        context: &str,
    ) -> Result<()> {
        let (info, generation) = match self.peers.get(peer) {
            Some(entry) => (entry.info.clone(), entry.generation),
            None => return Err(AppError::handshake(peer, "unknown peer")),
        };
        let pending = self.transport.invite(&info, context).await?;

        let tx = self.tx.clone();
        let timeout = self.invite_timeout;
        let peer_id = peer.to_string();
        let handle = tokio::spawn(
            async move {
                let result = pending.wait(timeout).await;
                let _ = tx.send(ManagerMsg::InviteResolved {
                    peer: peer_id,
                    kind: channel,
                    generation,
                    result,
                });
            }
            .instrument(self.span.clone()),
        );

        if let Some(entry) = self.peers.get_mut(peer) {
            entry.invite = Some((channel, handle.abort_handle()));
        }
        debug!("Invited {} to {} channel", peer, channel);
        Ok(())
    }

    fn cancel_invite(&mut self, peer: &str, channel: ChannelKind) {
        if let Some(entry) = self.peers.get_mut(peer) {
            if matches!(entry.invite, Some((kind, _)) if kind == channel) {
                if let Some((_, handle)) = entry.invite.take() {
                    handle.abort();
                    debug!("Cancelled {} invitation to {}", channel, peer);
                }
            }
        }
    }

    /// Close every channel of the relationship and stop its helpers
    fn tear_down(&mut self, peer: &str, cause: &str) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        entry.generation += 1;
        if let Some((_, handle)) = entry.invite.take() {
            handle.abort();
        }
        if let Some(monitor) = entry.liveness.take() {
            monitor.stop();
        }
        entry.keepalive = None;
        entry.deferred = None;
        entry.stream_tx = None;
        entry.stream_rx = None;
        entry.link = None;
        entry.passive.lost();

        let channels: Vec<Arc<dyn Channel>> =
            entry.command.take().into_iter().chain(entry.streaming.take()).collect();
        if channels.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for channel in channels {
                channel.close().await;
            }
        });

        info!("Relationship with {} torn down: {}", peer, cause);
        self.events.publish(SessionEvent::Disconnected {
            peer_id: peer.to_string(),
            reason: cause.to_string(),
        });
    }

    fn establish(&mut self, peer: &str) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        let (Some(command), Some(stream_rx)) = (entry.command.clone(), entry.stream_rx.take())
        else {
            warn!("Peer {} established without a command channel", peer);
            return;
        };
        let link = PeerLink::new(
            entry.info.clone(),
            entry.plan(),
            command,
            entry.streaming.clone(),
            stream_rx,
        );
        entry.link = Some(link.clone());
        let channels = if entry.streaming.is_some() { 2 } else { 1 };

        info!("Relationship with {} established ({} channels)", peer, channels);
        self.events.publish(SessionEvent::SessionEstablished {
            peer_id: peer.to_string(),
            channels,
        });
        let _ = self.established.send(link);
    }

    /// Take ownership of a connected channel: watch it, read it, and for the
    /// command channel start liveness and keep-alives
    fn attach_channel(&mut self, peer: &str, kind: ChannelKind, channel: Arc<dyn Channel>) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        let generation = entry.generation;

        let tx = self.tx.clone();
        let peer_id = peer.to_string();
        let mut state = channel.state_watch();
        tokio::spawn(async move {
            wait_closed(&mut state).await;
            let _ = tx.send(ManagerMsg::ChannelClosed {
                peer: peer_id,
                kind,
                generation,
            });
        });

        match kind {
            ChannelKind::Command => {
                let (stream_tx, stream_rx) = mpsc::unbounded_channel();

                let tx = self.tx.clone();
                let peer_id = peer.to_string();
                let monitor = LivenessMonitor::spawn(
                    self.config.heartbeat_interval(),
                    self.config.liveness_timeout(),
                    Arc::new(move || {
                        let _ = tx.send(ManagerMsg::Unreachable {
                            peer: peer_id.clone(),
                            generation,
                        });
                    }),
                    &self.span,
                );
                monitor.start();

                if let Some(rx) = channel.take_receiver() {
                    let reader = ChannelReader {
                        peer: peer.to_string(),
                        kind,
                        liveness: Some(monitor.clone()),
                        events: self.events.clone(),
                        forward: stream_tx.clone(),
                        throttler: LogThrottler::with_secs(5),
                    };
                    tokio::spawn(
                        reader
                            .run(rx, channel.state_watch())
                            .instrument(self.span.clone()),
                    );
                }

                entry.keepalive = Some(KeepAliveSender::spawn(
                    channel.clone(),
                    self.config.heartbeat_interval(),
                    &self.span,
                ));
                entry.liveness = Some(monitor);
                entry.stream_tx = Some(stream_tx);
                entry.stream_rx = Some(stream_rx);
                entry.command = Some(channel);
            }
            ChannelKind::Streaming => {
                if let (Some(rx), Some(forward)) =
                    (channel.take_receiver(), entry.stream_tx.clone())
                {
                    let reader = ChannelReader {
                        peer: peer.to_string(),
                        kind,
                        liveness: None,
                        events: self.events.clone(),
                        forward,
                        throttler: LogThrottler::with_secs(5),
                    };
                    tokio::spawn(
                        reader
                            .run(rx, channel.state_watch())
                            .instrument(self.span.clone()),
                    );
                }
                entry.streaming = Some(channel);
            }
        }
    }

    async fn on_invite_resolved(
        &mut self,
        peer: PeerId,
        kind: ChannelKind,
        generation: u64,
        result: Result<Arc<dyn Channel>>,
    ) {
        let current = self.peers.get(&peer).is_some_and(|entry| {
            entry.generation == generation
                && matches!(entry.invite, Some((pending, _)) if pending == kind)
        });
        if !current {
            if let Ok(channel) = result {
                debug!("Closing stale {} channel to {}", kind, peer);
                channel.close().await;
            }
            return;
        }
        if let Some(entry) = self.peers.get_mut(&peer) {
            entry.invite = None;
        }

        match result {
            Ok(channel) => {
                self.attach_channel(&peer, kind, channel);
                let _ = self
                    .apply(&peer, HandshakeEvent::ChannelConnected(kind), None)
                    .await;
            }
            Err(e) => {
                let _ = self
                    .apply(
                        &peer,
                        HandshakeEvent::InviteFailed {
                            channel: kind,
                            reason: failure_reason(&e),
                        },
                        None,
                    )
                    .await;
            }
        }
    }

    fn on_invitation(&mut self, invitation: Invitation) {
        let from = invitation.from.clone();
        let plan = self.plan_for(&from);
        let entry = self
            .peers
            .entry(from.id.clone())
            .or_insert_with(|| PeerEntry::new(from.clone(), plan));

        let active_busy = entry.side == Some(Side::Active)
            && !matches!(
                entry.machine.state(),
                HandshakeState::Discovered | HandshakeState::Disconnected
            );
        if active_busy {
            info!(
                "Rejecting {} invitation from {}: handshake in progress",
                invitation.context, from.id
            );
            tokio::spawn(invitation.reject("handshake already in progress"));
            return;
        }
        if entry.side != Some(Side::Passive) {
            entry.side = Some(Side::Passive);
            entry.passive = PassiveRelationship::new(plan);
        }

        if ChannelKind::from_context(&invitation.context) == Some(ChannelKind::Streaming)
            && entry.passive.channel_state(ChannelKind::Command) == ChannelState::Connecting
        {
            debug!("Deferring streaming invitation from {} until command is accepted", from.id);
            entry.deferred = Some(invitation);
            return;
        }

        let kind = match entry.passive.admit(&invitation.context) {
            Ok(kind) => kind,
            Err(reason) => {
                info!("Rejecting invitation from {}: {}", from.id, reason);
                tokio::spawn(invitation.reject(reason.to_string()));
                return;
            }
        };

        let replaces = kind == ChannelKind::Command
            && (entry.command.is_some()
                || entry.passive.channel_state(ChannelKind::Command) == ChannelState::Connecting);
        if replaces {
            self.tear_down(&from.id, "replaced by a new command channel");
        }
        let Some(entry) = self.peers.get_mut(&from.id) else {
            return;
        };
        entry.passive.accepting(kind);
        let generation = entry.generation;

        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                let result = invitation.accept().await;
                let _ = tx.send(ManagerMsg::Accepted {
                    peer: from.id,
                    kind,
                    generation,
                    result,
                });
            }
            .instrument(self.span.clone()),
        );
    }

    async fn on_accepted(
        &mut self,
        peer: PeerId,
        kind: ChannelKind,
        generation: u64,
        result: Result<Arc<dyn Channel>>,
    ) {
        let current = self
            .peers
            .get(&peer)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            if let Ok(channel) = result {
                channel.close().await;
            }
            return;
        }

        match result {
            Ok(channel) => {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.passive.accepted(kind);
                }
                self.attach_channel(&peer, kind, channel);
                self.publish_state(&peer);

                let (established, deferred) = match self.peers.get_mut(&peer) {
                    Some(entry) => (entry.passive.is_established(), entry.deferred.take()),
                    None => (false, None),
                };
                if established {
                    self.establish(&peer);
                }
                if let Some(invitation) = deferred {
                    self.on_invitation(invitation);
                }
            }
            Err(e) => {
                debug!("Accepting {} channel from {} failed: {}", kind, peer, e);
                self.surface(AppError::handshake(&peer, failure_reason(&e)));
                self.tear_down(&peer, "accept failed");
                self.publish_state(&peer);
            }
        }
    }

    async fn on_channel_closed(&mut self, peer: PeerId, kind: ChannelKind, generation: u64) {
        let Some(entry) = self.peers.get(&peer) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        if entry.side == Some(Side::Passive) {
            self.tear_down(&peer, &format!("{} channel closed", kind));
            self.publish_state(&peer);
        } else {
            let _ = self
                .apply(&peer, HandshakeEvent::ChannelDisconnected(kind), None)
                .await;
        }
    }

    async fn on_unreachable(&mut self, peer: PeerId, generation: u64) {
        let Some(entry) = self.peers.get(&peer) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        let passive = entry.side == Some(Side::Passive);
        let error = AppError::LivenessTimeout { peer: peer.clone() };
        let cause = error.to_string();
        self.surface(error);

        if !self.config.teardown_on_unreachable {
            return;
        }
        if passive {
            self.tear_down(&peer, &cause);
            self.publish_state(&peer);
        } else {
            let _ = self
                .apply(
                    &peer,
                    HandshakeEvent::ChannelDisconnected(ChannelKind::Command),
                    Some(cause.as_str()),
                )
                .await;
        }
    }
}

/// Resolves once the channel reports `NotConnected` (or its state is gone)
async fn wait_closed(state: &mut watch::Receiver<ChannelState>) {
    while *state.borrow_and_update() != ChannelState::NotConnected {
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Reads one channel. Command traffic feeds liveness and the event bus;
/// everything else goes to the link's stream receiver.
struct ChannelReader {
    peer: PeerId,
    kind: ChannelKind,
    liveness: Option<LivenessMonitor>,
    events: Arc<EventBus>,
    forward: mpsc::UnboundedSender<ChannelMessage>,
    throttler: LogThrottler,
}

impl ChannelReader {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<ChannelMessage>,
        mut state: watch::Receiver<ChannelState>,
    ) {
        loop {
            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = wait_closed(&mut state) => {
                    // deliver what arrived before the close
                    while let Ok(message) = rx.try_recv() {
                        self.handle(message);
                    }
                    break;
                }
            }
        }
        debug!("{} channel reader for {} finished", self.kind, self.peer);
    }

    fn handle(&self, message: ChannelMessage) {
        let peer = &self.peer;
        match message {
            ChannelMessage::Data(data) => {
                if let Some(monitor) = &self.liveness {
                    monitor.beat();
                }
                if self.kind == ChannelKind::Command {
                    match Packet::parse(data.clone()) {
                        Ok(packet)
                            if matches!(
                                packet.tag(),
                                PacketTag::Command | PacketTag::CaptureRequest
                            ) =>
                        {
                            match RemoteCommand::from_packet(&packet) {
                                Ok(command) if command.is_heartbeat() => {}
                                Ok(command) => {
                                    debug!("Command from {}: {:?}", peer, command);
                                    self.events.publish(SessionEvent::CommandReceived {
                                        peer_id: peer.clone(),
                                        command,
                                    });
                                }
                                Err(e) => {
                                    warn_throttled!(
                                        self.throttler,
                                        "bad_command",
                                        "Bad command from {}: {}",
                                        peer,
                                        e
                                    );
                                }
                            }
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn_throttled!(
                                self.throttler,
                                "bad_packet",
                                "Bad packet from {}: {}",
                                peer,
                                e
                            );
                            return;
                        }
                    }
                }
                let _ = self.forward.send(ChannelMessage::Data(data));
            }
            ChannelMessage::Resource { name, path, size } => {
                info!("Photo {} ({} bytes) from {}", name, size, peer);
                self.events.publish(SessionEvent::PhotoReceived {
                    peer_id: peer.clone(),
                    name: name.clone(),
                    path: path.clone(),
                    size,
                    received_at: Utc::now(),
                });
                let _ = self.forward.send(ChannelMessage::Resource { name, path, size });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::passthrough::{frame_digest, picture_digest, picture_sequence};
    use crate::codec::{
        CodecFeeder, DecoderWorker, EncoderConfig, EncoderWorker, FeederOptions, FrameCodecAdapter,
        PassthroughDecoderFactory, PassthroughEncoderFactory, RawFrame,
    };
    use crate::protocol::CaptureMode;
    use crate::transport::{MemoryNetwork, PeerRole};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct Node {
        manager: SessionManager,
        events: broadcast::Receiver<SessionEvent>,
    }

    async fn node(
        network: &MemoryNetwork,
        id: &str,
        role: PeerRole,
        config: SessionConfig,
    ) -> Node {
        let transport = Arc::new(network.join(PeerInfo::new(id, id.to_uppercase(), role)));
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let manager =
            SessionManager::new(transport, bus, config, Duration::from_secs(2), &Span::none());
        manager.start(true).await.unwrap();
        Node { manager, events }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut matches: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("event not published in time")
    }

    async fn found(node: &mut Node, peer: &str) {
        wait_for(&mut node.events, |e| {
            matches!(e, SessionEvent::PeerFound { peer_id, .. } if peer_id == peer)
        })
        .await;
    }

    async fn established(node: &mut Node, peer: &str) -> u8 {
        match wait_for(&mut node.events, |e| {
            matches!(e, SessionEvent::SessionEstablished { peer_id, .. } if peer_id == peer)
        })
        .await
        {
            SessionEvent::SessionEstablished { channels, .. } => channels,
            _ => unreachable!(),
        }
    }

    async fn next_link(rx: &mut mpsc::UnboundedReceiver<PeerLink>) -> PeerLink {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no link in time")
            .expect("link channel closed")
    }

    #[tokio::test]
    async fn test_split_relationship_carries_pictures_commands_and_photos() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::with_resource_dir(dir.path());
        let mut a = node(&network, "a", PeerRole::Phone, SessionConfig::default()).await;
        let mut b = node(&network, "b", PeerRole::Tablet, SessionConfig::default()).await;
        let mut a_links = a.manager.take_established().unwrap();
        let mut b_links = b.manager.take_established().unwrap();
        found(&mut a, "b").await;

        a.manager.connect("b").await.unwrap();
        assert_eq!(established(&mut a, "b").await, 2);
        assert_eq!(established(&mut b, "a").await, 2);
        let a_link = next_link(&mut a_links).await;
        let b_link = next_link(&mut b_links).await;
        assert_eq!(a_link.plan(), ChannelPlan::Split);
        assert_eq!(a_link.peer().id, "b");
        assert_eq!(b_link.peer().id, "a");
        let mut b_stream = b_link.take_stream_receiver().unwrap();

        a_link
            .send_packet(&Packet::frame(PacketTag::KeyPicture, vec![0x65, 0x88]))
            .await
            .unwrap();
        assert_eq!(
            b_stream.recv().await.unwrap(),
            ChannelMessage::Data(Bytes::from_static(&[0x03, 0x65, 0x88]))
        );

        a_link
            .send_command(&RemoteCommand::SwitchMode {
                mode: CaptureMode::Video,
            })
            .await
            .unwrap();
        wait_for(&mut b.events, |e| {
            matches!(
                e,
                SessionEvent::CommandReceived { command: RemoteCommand::SwitchMode { .. }, .. }
            )
        })
        .await;

        a_link
            .send_photo("shot.jpg", Bytes::from_static(&[0xFF, 0xD8, 0xFF]))
            .await
            .unwrap();
        match wait_for(&mut b.events, |e| matches!(e, SessionEvent::PhotoReceived { .. })).await {
            SessionEvent::PhotoReceived { peer_id, name, path, size, .. } => {
                assert_eq!(peer_id, "a");
                assert_eq!(name, "shot.jpg");
                assert_eq!(size, 3);
                assert!(path.starts_with(dir.path()));
            }
            _ => unreachable!(),
        }
        assert!(matches!(
            b_stream.recv().await.unwrap(),
            ChannelMessage::Resource { size: 3, .. }
        ));

        let peers = a.manager.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].state, "streaming_connected");
        assert_eq!(peers[0].side, Some(Side::Active));
        assert!(peers[0].established);
        let peers = b.manager.peers().await;
        assert_eq!(peers[0].side, Some(Side::Passive));
        assert!(peers[0].established);
        assert!(b.manager.link("a").await.is_some());

        a.manager.shutdown().await;
        b.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_trigger_uses_single_channel() {
        let network = MemoryNetwork::new();
        let mut phone = node(&network, "phone", PeerRole::Phone, SessionConfig::default()).await;
        let mut watch = node(&network, "watch", PeerRole::Watch, SessionConfig::default()).await;
        let mut phone_links = phone.manager.take_established().unwrap();
        found(&mut watch, "phone").await;

        watch.manager.connect("phone").await.unwrap();
        assert_eq!(established(&mut watch, "phone").await, 1);
        assert_eq!(established(&mut phone, "watch").await, 1);

        let link = next_link(&mut phone_links).await;
        assert_eq!(link.plan(), ChannelPlan::Single);
        assert!(link.send_photo("x.jpg", Bytes::new()).await.is_err());

        let watch_link = watch.manager.link("phone").await.unwrap();
        watch_link
            .send_packet(&Packet::frame(PacketTag::CaptureRequest, Bytes::new()))
            .await
            .unwrap();
        wait_for(&mut phone.events, |e| {
            matches!(
                e,
                SessionEvent::CommandReceived { command: RemoteCommand::CapturePhoto, .. }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn test_disconnect_resets_and_allows_reinvitation() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", PeerRole::Phone, SessionConfig::default()).await;
        let mut b = node(&network, "b", PeerRole::Tablet, SessionConfig::default()).await;
        found(&mut a, "b").await;

        a.manager.connect("b").await.unwrap();
        established(&mut a, "b").await;
        established(&mut b, "a").await;

        network.disconnect("a", "b");
        wait_for(&mut a.events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
        wait_for(&mut b.events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
        let peers = a.manager.peers().await;
        assert_eq!(peers[0].state, "discovered");
        assert_eq!(peers[0].command, ChannelState::NotConnected);
        assert!(a.manager.link("b").await.is_none());

        // no rediscovery needed
        a.manager.connect("b").await.unwrap();
        established(&mut a, "b").await;
        established(&mut b, "a").await;

        a.manager.disconnect("b").await;
        wait_for(&mut b.events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    }

    #[tokio::test]
    async fn test_rejected_and_unissuable_invitations() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", PeerRole::Phone, SessionConfig::default()).await;

        assert!(matches!(
            a.manager.connect("nobody").await,
            Err(AppError::Handshake { .. })
        ));

        // b rejects everything
        let b = network.join(PeerInfo::new("b", "B", PeerRole::Tablet));
        let mut incoming = b.take_incoming().unwrap();
        b.start_advertising().await.unwrap();
        tokio::spawn(async move {
            while let Some(invitation) = incoming.recv().await {
                invitation.reject("not now").await;
            }
        });
        found(&mut a, "b").await;
        a.manager.connect("b").await.unwrap();
        let failed = |e: &SessionEvent| matches!(e, SessionEvent::ConnectionFailed { .. });
        match wait_for(&mut a.events, failed).await {
            SessionEvent::ConnectionFailed { peer_id, reason } => {
                assert_eq!(peer_id, "b");
                assert_eq!(reason, "not now");
            }
            _ => unreachable!(),
        }
        assert_eq!(a.manager.peers().await[0].state, "discovered");

        // c never takes its invitations, so they cannot be delivered
        let c = network.join(PeerInfo::new("c", "C", PeerRole::Tablet));
        drop(c.take_incoming());
        c.start_advertising().await.unwrap();
        found(&mut a, "c").await;
        assert!(matches!(
            a.manager.connect("c").await,
            Err(AppError::Handshake { .. })
        ));
        wait_for(&mut a.events, |e| {
            matches!(e, SessionEvent::ConnectionFailed { peer_id, .. } if peer_id == "c")
        })
        .await;
    }

    #[tokio::test]
    async fn test_lost_peer_cannot_be_invited_until_rediscovered() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", PeerRole::Phone, SessionConfig::default()).await;
        let b = network.join(PeerInfo::new("b", "B", PeerRole::Tablet));
        b.start_advertising().await.unwrap();
        found(&mut a, "b").await;

        b.stop_advertising().await;
        wait_for(&mut a.events, |e| matches!(e, SessionEvent::PeerLost { .. })).await;
        assert_eq!(a.manager.peers().await[0].state, "disconnected");
        assert!(a.manager.connect("b").await.is_err());

        b.start_advertising().await.unwrap();
        found(&mut a, "b").await;
        assert_eq!(a.manager.peers().await[0].state, "discovered");
    }

    #[tokio::test]
    async fn test_command_loss_cancels_pending_streaming_invite() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", PeerRole::Phone, SessionConfig::default()).await;
        let mut a_links = a.manager.take_established().unwrap();
        let b = network.join(PeerInfo::new("b", "B", PeerRole::Tablet));
        let mut incoming = b.take_incoming().unwrap();
        b.start_advertising().await.unwrap();
        found(&mut a, "b").await;

        a.manager.connect("b").await.unwrap();
        let command = incoming.recv().await.unwrap();
        assert_eq!(command.context, "command");
        let _command_channel = command.accept().await.unwrap();
        // held back: never answered before the command channel goes away
        let streaming = incoming.recv().await.unwrap();
        assert_eq!(streaming.context, "streaming");
        wait_for(&mut a.events, |e| {
            matches!(
                e,
                SessionEvent::SessionStateChanged { state, .. } if state == "streaming_inviting"
            )
        })
        .await;

        network.disconnect("a", "b");
        wait_for(&mut a.events, |e| {
            matches!(e, SessionEvent::Disconnected { peer_id, .. } if peer_id == "b")
        })
        .await;
        let peers = a.manager.peers().await;
        assert_eq!(peers[0].state, "discovered");
        assert_eq!(peers[0].streaming, ChannelState::NotConnected);
        assert!(a.manager.link("b").await.is_none());
        assert!(a_links.try_recv().is_err());

        // nobody waits for the streaming answer any more
        let err = streaming.accept().await.err().unwrap();
        assert!(err.to_string().contains("inviter stopped waiting"));
        assert!(a_links.try_recv().is_err());

        a.manager.connect("b").await.unwrap();
        let mut channels = Vec::new();
        for context in ["command", "streaming"] {
            let invitation = incoming.recv().await.unwrap();
            assert_eq!(invitation.context, context);
            channels.push(invitation.accept().await.unwrap());
        }
        assert_eq!(established(&mut a, "b").await, 2);
        assert_eq!(next_link(&mut a_links).await.peer().id, "b");
    }

    #[tokio::test]
    async fn test_vanished_peer_only_ends_active_relationship() {
        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", PeerRole::Phone, SessionConfig::default()).await;
        let mut b = node(&network, "b", PeerRole::Tablet, SessionConfig::default()).await;
        found(&mut a, "b").await;
        a.manager.connect("b").await.unwrap();
        established(&mut a, "b").await;
        established(&mut b, "a").await;

        // the passive side follows its channels, not discovery
        network.vanish("a");
        wait_for(&mut b.events, |e| {
            matches!(e, SessionEvent::PeerLost { peer_id } if peer_id == "a")
        })
        .await;
        let peers = b.manager.peers().await;
        assert!(!peers[0].visible);
        assert!(peers[0].established);
        assert!(b.manager.link("a").await.is_some());

        network.vanish("b");
        wait_for(&mut a.events, |e| {
            matches!(e, SessionEvent::PeerLost { peer_id } if peer_id == "b")
        })
        .await;
        match wait_for(&mut a.events, |e| matches!(e, SessionEvent::Disconnected { .. })).await {
            SessionEvent::Disconnected { peer_id, reason } => {
                assert_eq!(peer_id, "b");
                assert_eq!(reason, "peer lost");
            }
            _ => unreachable!(),
        }
        let peers = a.manager.peers().await;
        assert_eq!(peers[0].state, "disconnected");
        assert!(a.manager.link("b").await.is_none());
        assert!(matches!(
            a.manager.connect("b").await,
            Err(AppError::Handshake { .. })
        ));

        // a closed its channels, so b's relationship ends too
        wait_for(&mut b.events, |e| {
            matches!(e, SessionEvent::Disconnected { peer_id, .. } if peer_id == "a")
        })
        .await;
        assert!(b.manager.link("a").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_reported_unreachable() {
        let network = MemoryNetwork::new();
        let config = SessionConfig {
            heartbeat_interval_ms: 100,
            ..Default::default()
        };
        let mut a = node(&network, "a", PeerRole::Phone, config.clone()).await;
        let mut b = node(&network, "b", PeerRole::Tablet, config).await;
        found(&mut a, "b").await;
        a.manager.connect("b").await.unwrap();
        established(&mut a, "b").await;
        established(&mut b, "a").await;

        network.suspend("b");
        match wait_for(&mut a.events, |e| matches!(e, SessionEvent::PeerUnreachable { .. })).await {
            SessionEvent::PeerUnreachable { peer_id, timeout_ms } => {
                assert_eq!(peer_id, "b");
                assert_eq!(timeout_ms, 250);
            }
            _ => unreachable!(),
        }
        match wait_for(&mut a.events, |e| matches!(e, SessionEvent::Disconnected { .. })).await {
            SessionEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, "Peer b unreachable: liveness timeout")
            }
            _ => unreachable!(),
        }
        // the teardown closes the channels, which b notices
        wait_for(&mut b.events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    }

    #[tokio::test]
    async fn test_lossy_stream_round_trip() {
        const FRAMES: u64 = 30;
        const GOP: u64 = 10;

        let network = MemoryNetwork::new();
        let mut a = node(&network, "a", PeerRole::Phone, SessionConfig::default()).await;
        let b = node(&network, "b", PeerRole::Tablet, SessionConfig::default()).await;
        let mut a_links = a.manager.take_established().unwrap();
        let mut b_links = b.manager.take_established().unwrap();
        found(&mut a, "b").await;
        a.manager.connect("b").await.unwrap();
        let a_link = next_link(&mut a_links).await;
        let b_link = next_link(&mut b_links).await;

        // every third delta picture is lost
        let deltas = Arc::new(AtomicUsize::new(0));
        let counter = deltas.clone();
        network.set_loss(move |data| {
            data.first() == Some(&PacketTag::DeltaPicture.as_byte())
                && counter.fetch_add(1, Ordering::SeqCst) % 3 == 2
        });

        let (picture_tx, mut picture_rx) = mpsc::unbounded_channel();
        let feeder = CodecFeeder::new(
            Arc::new(PassthroughDecoderFactory),
            picture_tx,
            FeederOptions::default(),
            &Span::none(),
        );
        let decoder = Arc::new(DecoderWorker::spawn(feeder, None, &Span::none()));
        let mut stream = b_link.take_stream_receiver().unwrap();
        let sink = decoder.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.recv().await {
                if let ChannelMessage::Data(data) = message {
                    let _ = sink.deliver(data).await;
                }
            }
        });

        let (packet_tx, mut packet_rx) = mpsc::channel(64);
        let encoder = EncoderWorker::spawn(
            Arc::new(PassthroughEncoderFactory),
            EncoderConfig {
                width: 64,
                height: 48,
                fps: 30,
                gop_size: GOP as u32,
                bitrate_kbps: 100,
            },
            FrameCodecAdapter::new(&Span::none()),
            packet_tx,
            &Span::none(),
        );
        let frame_data = |seq: u64| vec![seq as u8; 16];
        for seq in 0..FRAMES {
            encoder.submit(RawFrame::new(frame_data(seq), 64, 48, seq)).await.unwrap();
        }
        // pictures plus one parameter-set pair
        for _ in 0..FRAMES + 2 {
            let packet = packet_rx.recv().await.unwrap();
            a_link.send_packet(&packet).await.unwrap();
        }

        let mut expected = Vec::new();
        let mut delta_index = 0;
        for seq in 0..FRAMES {
            if seq % GOP == 0 {
                expected.push(seq);
            } else {
                if delta_index % 3 != 2 {
                    expected.push(seq);
                }
                delta_index += 1;
            }
        }

        let mut decoded = Vec::new();
        while decoded.len() < expected.len() {
            let picture = tokio::time::timeout(Duration::from_secs(5), picture_rx.recv())
                .await
                .expect("picture not decoded in time")
                .unwrap();
            let seq = picture_sequence(&picture).unwrap();
            assert_eq!(picture_digest(&picture), Some(frame_digest(&frame_data(seq))));
            decoded.push(seq);
        }
        assert_eq!(decoded, expected);
        assert_eq!(deltas.load(Ordering::SeqCst), 27);

        encoder.shutdown().await;
        decoder.shutdown().await;
    }
}
