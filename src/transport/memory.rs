//! In-process transport
//!
//! All nodes joined to one [`MemoryNetwork`] can discover and invite each
//! other. Unreliable sends pass through an optional loss predicate, which
//! makes packet loss reproducible in tests and in the loopback demo.
//! Resources are written to the network's resource directory.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use super::{
    store_resource, Channel, ChannelMessage, ChannelState, DiscoveryEvent, Invitation,
    InvitationResponder, PeerId, PeerInfo, PendingInvite, Transport,
};
use crate::error::{AppError, Result};
use crate::protocol::SendMode;

/// Incoming invitation queue capacity
const INVITATION_QUEUE_CAPACITY: usize = 16;

/// Decides whether an unreliable message is lost
pub type LossPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

struct Node {
    info: PeerInfo,
    advertising: bool,
    incoming: mpsc::Sender<Invitation>,
    browsers: Vec<mpsc::UnboundedSender<DiscoveryEvent>>,
}

struct LinkRecord {
    a: PeerId,
    b: PeerId,
    link: Weak<MemoryLink>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: HashMap<PeerId, Node>,
    links: Vec<LinkRecord>,
    loss: Option<LossPredicate>,
    suspended: HashSet<PeerId>,
}

/// Shared in-process network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
    resource_dir: PathBuf,
}

impl MemoryNetwork {
    /// New network writing resources to the system temp dir
    pub fn new() -> Self {
        Self::with_resource_dir(std::env::temp_dir().join("peercam"))
    }

    pub fn with_resource_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetworkInner::default())),
            resource_dir: dir.into(),
        }
    }

    /// Join the network as `info`. Replaces an existing node with the same id.
    pub fn join(&self, info: PeerInfo) -> MemoryTransport {
        let (incoming_tx, incoming_rx) = mpsc::channel(INVITATION_QUEUE_CAPACITY);
        self.inner.lock().nodes.insert(
            info.id.clone(),
            Node {
                info: info.clone(),
                advertising: false,
                incoming: incoming_tx,
                browsers: Vec::new(),
            },
        );
        MemoryTransport {
            local: info,
            network: self.clone(),
            incoming: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Drop unreliable messages for which `predicate` returns true
    pub fn set_loss<F>(&self, predicate: F)
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.inner.lock().loss = Some(Arc::new(predicate));
    }

    pub fn clear_loss(&self) {
        self.inner.lock().loss = None;
    }

    /// Break every channel between two peers, as if the radio link dropped
    pub fn disconnect(&self, a: &str, b: &str) {
        let links: Vec<Arc<MemoryLink>> = {
            let mut inner = self.inner.lock();
            inner.links.retain(|r| r.link.strong_count() > 0);
            inner
                .links
                .iter()
                .filter(|r| (r.a == a && r.b == b) || (r.a == b && r.b == a))
                .filter_map(|r| r.link.upgrade())
                .collect()
        };
        info!("Injecting disconnect between {} and {} ({} channels)", a, b, links.len());
        for link in links {
            link.close();
        }
    }

    /// Silently drop everything `peer` sends, as if its process froze.
    /// Channels stay connected.
    pub fn suspend(&self, peer: &str) {
        info!("Suspending {}", peer);
        self.inner.lock().suspended.insert(peer.to_string());
    }

    pub fn resume(&self, peer: &str) {
        self.inner.lock().suspended.remove(peer);
    }

    fn is_suspended(&self, peer: &str) -> bool {
        self.inner.lock().suspended.contains(peer)
    }

    /// Make `peer` disappear from discovery without closing its channels
    pub fn vanish(&self, peer: &str) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(peer) {
            node.advertising = false;
        }
        Self::notify(&mut inner, peer, DiscoveryEvent::Lost(peer.to_string()));
    }

    fn notify(inner: &mut NetworkInner, source: &str, event: DiscoveryEvent) {
        for (id, node) in inner.nodes.iter_mut() {
            if id == source {
                continue;
            }
            node.browsers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn loss(&self) -> Option<LossPredicate> {
        self.inner.lock().loss.clone()
    }

    fn register_link(&self, a: &str, b: &str, link: &Arc<MemoryLink>) {
        let mut inner = self.inner.lock();
        inner.links.retain(|r| r.link.strong_count() > 0);
        inner.links.push(LinkRecord {
            a: a.to_string(),
            b: b.to_string(),
            link: Arc::downgrade(link),
        });
    }

    fn close_links_of(&self, peer: &str) {
        let links: Vec<Arc<MemoryLink>> = {
            let inner = self.inner.lock();
            inner
                .links
                .iter()
                .filter(|r| r.a == peer || r.b == peer)
                .filter_map(|r| r.link.upgrade())
                .collect()
        };
        for link in links {
            link.close();
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by both ends of one channel
struct MemoryLink {
    state: watch::Sender<ChannelState>,
    inboxes: [mpsc::UnboundedSender<ChannelMessage>; 2],
}

impl MemoryLink {
    fn close(&self) {
        self.state.send_if_modified(|state| {
            if *state == ChannelState::NotConnected {
                false
            } else {
                *state = ChannelState::NotConnected;
                true
            }
        });
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ChannelState::Connected
    }
}

/// One end of an in-process channel
pub struct MemoryChannel {
    id: String,
    local: PeerId,
    peer: PeerInfo,
    context: String,
    side: usize,
    link: Arc<MemoryLink>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    network: MemoryNetwork,
}

impl MemoryChannel {
    /// Create both ends; `inviter` talks to `invitee` and vice versa
    fn pair(
        network: &MemoryNetwork,
        inviter: &PeerInfo,
        invitee: &PeerInfo,
        context: &str,
    ) -> (Arc<Self>, Arc<Self>) {
        let (state, _) = watch::channel(ChannelState::Connected);
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let link = Arc::new(MemoryLink {
            state,
            inboxes: [tx_a, tx_b],
        });
        network.register_link(&inviter.id, &invitee.id, &link);

        let id = uuid::Uuid::new_v4().to_string();
        let end = |side: usize,
                   local: &PeerInfo,
                   peer: &PeerInfo,
                   rx: mpsc::UnboundedReceiver<ChannelMessage>| {
            Arc::new(MemoryChannel {
                id: id.clone(),
                local: local.id.clone(),
                peer: peer.clone(),
                context: context.to_string(),
                side,
                link: link.clone(),
                receiver: Mutex::new(Some(rx)),
                network: network.clone(),
            })
        };
        (end(0, inviter, invitee, rx_a), end(1, invitee, inviter, rx_b))
    }

    fn remote_inbox(&self) -> &mpsc::UnboundedSender<ChannelMessage> {
        &self.link.inboxes[1 - self.side]
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.link.is_connected() {
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
impl Channel for MemoryChannel {
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
        *self.link.state.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.link.state.subscribe()
    }

    async fn send(&self, data: Bytes, mode: SendMode) -> Result<()> {
        self.ensure_connected()?;
        if self.network.is_suspended(&self.local) {
            return Ok(());
        }
        if mode == SendMode::Unreliable {
            if let Some(loss) = self.network.loss() {
                if loss(&data) {
                    return Ok(());
                }
            }
        }
        self.remote_inbox()
            .send(ChannelMessage::Data(data))
            .map_err(|_| AppError::Transport("remote end dropped".to_string()))
    }

    async fn send_resource(&self, name: &str, data: Bytes) -> Result<()> {
        self.ensure_connected()?;

        let path = store_resource(&self.network.resource_dir, name, &data).await?;
        debug!("Resource {} stored at {}", name, path.display());

        self.remote_inbox()
            .send(ChannelMessage::Resource {
                name: name.to_string(),
                path,
                size: data.len() as u64,
            })
            .map_err(|_| AppError::Transport("remote end dropped".to_string()))
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        self.receiver.lock().take()
    }

    async fn close(&self) {
        self.link.close();
    }
}

/// A node on a [`MemoryNetwork`]
pub struct MemoryTransport {
    local: PeerInfo,
    network: MemoryNetwork,
    incoming: Mutex<Option<mpsc::Receiver<Invitation>>>,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    async fn start_advertising(&self) -> Result<()> {
        let mut inner = self.network.inner.lock();
        let node = inner
            .nodes
            .get_mut(&self.local.id)
            .ok_or_else(|| AppError::Transport("node has left the network".to_string()))?;
        if node.advertising {
            return Ok(());
        }
        node.advertising = true;
        let info = node.info.clone();
        MemoryNetwork::notify(&mut inner, &self.local.id, DiscoveryEvent::Found(info));
        Ok(())
    }

    async fn stop_advertising(&self) {
        let mut inner = self.network.inner.lock();
        let was_advertising = match inner.nodes.get_mut(&self.local.id) {
            Some(node) => std::mem::replace(&mut node.advertising, false),
            None => false,
        };
        if was_advertising {
            MemoryNetwork::notify(
                &mut inner,
                &self.local.id,
                DiscoveryEvent::Lost(self.local.id.clone()),
            );
        }
    }

    async fn browse(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.network.inner.lock();
        for (id, node) in inner.nodes.iter() {
            if id != &self.local.id && node.advertising {
                let _ = tx.send(DiscoveryEvent::Found(node.info.clone()));
            }
        }
        let node = inner
            .nodes
            .get_mut(&self.local.id)
            .ok_or_else(|| AppError::Transport("node has left the network".to_string()))?;
        node.browsers.push(tx);
        Ok(rx)
    }

    async fn invite(&self, peer: &PeerInfo, context: &str) -> Result<PendingInvite> {
        let incoming = {
            let inner = self.network.inner.lock();
            match inner.nodes.get(&peer.id) {
                Some(node) if node.advertising => node.incoming.clone(),
                _ => {
                    return Err(AppError::handshake(
                        &peer.id,
                        "peer is not reachable on this network",
                    ))
                }
            }
        };

        let (tx, rx) = oneshot::channel();
        let responder = MemoryResponder {
            network: self.network.clone(),
            inviter: self.local.clone(),
            invitee: peer.clone(),
            context: context.to_string(),
            reply: tx,
        };
        incoming
            .try_send(Invitation::new(self.local.clone(), context, Box::new(responder)))
            .map_err(|e| {
                AppError::handshake(&peer.id, format!("invitation not delivered: {}", e))
            })?;

        debug!("Invited {} ({})", peer.id, context);
        Ok(PendingInvite::new(peer.id.clone(), context, rx))
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<Invitation>> {
        self.incoming.lock().take()
    }

    async fn shutdown(&self) {
        self.stop_advertising().await;
        self.network.close_links_of(&self.local.id);
        self.network.inner.lock().nodes.remove(&self.local.id);
    }
}

struct MemoryResponder {
    network: MemoryNetwork,
    inviter: PeerInfo,
    invitee: PeerInfo,
    context: String,
    reply: oneshot::Sender<Result<Arc<dyn Channel>>>,
}

#[async_trait]
impl InvitationResponder for MemoryResponder {
    async fn accept(self: Box<Self>) -> Result<Arc<dyn Channel>> {
        let (inviter_end, invitee_end) =
            MemoryChannel::pair(&self.network, &self.inviter, &self.invitee, &self.context);
        let inviter_end: Arc<dyn Channel> = inviter_end;
        let invitee_end: Arc<dyn Channel> = invitee_end;
        if self.reply.send(Ok(inviter_end)).is_err() {
            invitee_end.close().await;
            return Err(AppError::handshake(
                &self.inviter.id,
                "inviter stopped waiting",
            ));
        }
        Ok(invitee_end)
    }

    async fn reject(self: Box<Self>, reason: String) {
        let _ = self
            .reply
            .send(Err(AppError::handshake(&self.invitee.id, reason)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerRole;
    use std::time::Duration;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo::new(id, id.to_uppercase(), PeerRole::Phone)
    }

    #[tokio::test]
    async fn test_discovery_found_and_lost() {
        let network = MemoryNetwork::new();
        let a = network.join(peer("a"));
        let b = network.join(peer("b"));

        b.start_advertising().await.unwrap();
        let mut events = a.browse().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Found(peer("b")));

        b.stop_advertising().await;
        assert_eq!(events.recv().await.unwrap(), DiscoveryEvent::Lost("b".to_string()));
    }

    #[tokio::test]
    async fn test_invite_accept_and_exchange() {
        let network = MemoryNetwork::new();
        let a = network.join(peer("a"));
        let b = network.join(peer("b"));
        b.start_advertising().await.unwrap();
        let mut incoming = b.take_incoming().unwrap();
        assert!(b.take_incoming().is_none());

        let pending = a.invite(&peer("b"), "command").await.unwrap();
        let invitation = incoming.recv().await.unwrap();
        assert_eq!(invitation.from.id, "a");
        assert_eq!(invitation.context, "command");
        let b_end = invitation.accept().await.unwrap();
        let a_end = pending.wait(Duration::from_secs(1)).await.unwrap();

        assert_eq!(a_end.peer().id, "b");
        assert_eq!(b_end.peer().id, "a");
        assert_eq!(a_end.state(), ChannelState::Connected);

        let mut rx = b_end.take_receiver().unwrap();
        a_end
            .send(Bytes::from_static(b"\x10{}"), SendMode::Reliable)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ChannelMessage::Data(Bytes::from_static(b"\x10{}"))
        );

        let mut watch = a_end.state_watch();
        b_end.close().await;
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow(), ChannelState::NotConnected);
        assert!(a_end.send(Bytes::new(), SendMode::Reliable).await.is_err());
    }

    #[tokio::test]
    async fn test_invite_reject_and_unknown_peer() {
        let network = MemoryNetwork::new();
        let a = network.join(peer("a"));
        let b = network.join(peer("b"));

        // Not advertising yet: cannot even be issued
        assert!(matches!(
            a.invite(&peer("b"), "command").await,
            Err(AppError::Handshake { .. })
        ));
        assert!(a.invite(&peer("zzz"), "command").await.is_err());

        b.start_advertising().await.unwrap();
        let mut incoming = b.take_incoming().unwrap();
        let pending = a.invite(&peer("b"), "bogus").await.unwrap();
        incoming.recv().await.unwrap().reject("unknown context").await;
        let err = pending.wait(Duration::from_secs(1)).await.err().unwrap();
        assert!(err.to_string().contains("unknown context"));
    }

    #[tokio::test]
    async fn test_loss_applies_to_unreliable_only() {
        let network = MemoryNetwork::new();
        let a = network.join(peer("a"));
        let b = network.join(peer("b"));
        b.start_advertising().await.unwrap();
        let mut incoming = b.take_incoming().unwrap();
        let pending = a.invite(&peer("b"), "streaming").await.unwrap();
        let b_end = incoming.recv().await.unwrap().accept().await.unwrap();
        let a_end = pending.wait(Duration::from_secs(1)).await.unwrap();
        let mut rx = b_end.take_receiver().unwrap();

        network.set_loss(|_| true);
        a_end.send(Bytes::from_static(&[4, 1]), SendMode::Unreliable).await.unwrap();
        a_end.send(Bytes::from_static(&[1, 2]), SendMode::Reliable).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ChannelMessage::Data(Bytes::from_static(&[1, 2])));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resource_transfer_and_disconnect_injection() {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::with_resource_dir(dir.path());
        let a = network.join(peer("a"));
        let b = network.join(peer("b"));
        b.start_advertising().await.unwrap();
        let mut incoming = b.take_incoming().unwrap();
        let pending = a.invite(&peer("b"), "streaming").await.unwrap();
        let b_end = incoming.recv().await.unwrap().accept().await.unwrap();
        let a_end = pending.wait(Duration::from_secs(1)).await.unwrap();
        let mut rx = b_end.take_receiver().unwrap();

        a_end
            .send_resource("../photo.jpg", Bytes::from_static(&[0xFF, 0xD8, 0xFF]))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ChannelMessage::Resource { name, path, size } => {
                assert_eq!(name, "../photo.jpg");
                assert_eq!(size, 3);
                assert!(path.starts_with(dir.path()));
                assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0xFF, 0xD8, 0xFF]);
            }
            other => panic!("unexpected message {:?}", other),
        }

        network.disconnect("b", "a");
        assert_eq!(a_end.state(), ChannelState::NotConnected);
        assert_eq!(b_end.state(), ChannelState::NotConnected);
    }

    #[tokio::test]
    async fn test_suspended_peer_goes_silent() {
        let network = MemoryNetwork::new();
        let a = network.join(peer("a"));
        let b = network.join(peer("b"));
        b.start_advertising().await.unwrap();
        let mut incoming = b.take_incoming().unwrap();
        let pending = a.invite(&peer("b"), "command").await.unwrap();
        let b_end = incoming.recv().await.unwrap().accept().await.unwrap();
        let a_end = pending.wait(Duration::from_secs(1)).await.unwrap();
        let mut a_rx = a_end.take_receiver().unwrap();
        let mut b_rx = b_end.take_receiver().unwrap();

        network.suspend("b");
        b_end.send(Bytes::from_static(&[1]), SendMode::Reliable).await.unwrap();
        a_end.send(Bytes::from_static(&[2]), SendMode::Reliable).await.unwrap();
        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.recv().await.unwrap(), ChannelMessage::Data(Bytes::from_static(&[2])));
        assert_eq!(a_end.state(), ChannelState::Connected);

        network.resume("b");
        b_end.send(Bytes::from_static(&[3]), SendMode::Reliable).await.unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), ChannelMessage::Data(Bytes::from_static(&[3])));
    }
}
