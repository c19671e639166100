//! mDNS advertisement and browsing
//!
//! The local node registers `<peer id>.<service type>` with TXT keys
//! `id`, `name` and `role`; the service port is the signaling listener.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{PeerId, PeerInfo, PeerRole};
use crate::error::{AppError, Result};

const TXT_ID: &str = "id";
const TXT_NAME: &str = "name";
const TXT_ROLE: &str = "role";

/// Browse result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdnsEvent {
    Resolved { peer: PeerInfo, addr: SocketAddr },
    Removed(PeerId),
}

/// TXT record for `peer`
pub fn txt_properties(peer: &PeerInfo) -> HashMap<String, String> {
    HashMap::from([
        (TXT_ID.to_string(), peer.id.clone()),
        (TXT_NAME.to_string(), peer.display_name.clone()),
        (TXT_ROLE.to_string(), peer.role.as_str().to_string()),
    ])
}

/// Build a peer from TXT values; a missing id makes the record unusable
pub fn peer_from_txt(id: Option<&str>, name: Option<&str>, role: Option<&str>) -> Option<PeerInfo> {
    let id = id.map(str::trim).filter(|id| !id.is_empty())?;
    Some(PeerInfo {
        id: id.to_string(),
        display_name: name.unwrap_or(id).to_string(),
        role: role.map(PeerRole::parse).unwrap_or_default(),
    })
}

/// Prefer IPv4 (link-local v6 needs a scope id the resolver does not give us)
fn pick_address<'a>(addresses: impl IntoIterator<Item = &'a IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for addr in addresses {
        match addr {
            IpAddr::V4(_) => return Some(*addr),
            IpAddr::V6(_) if fallback.is_none() => fallback = Some(*addr),
            _ => {}
        }
    }
    fallback
}

/// mDNS advertiser and browser
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    registered: Mutex<Option<String>>,
}

impl MdnsDiscovery {
    pub fn new(service_type: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| AppError::Transport(format!("mDNS daemon failed to start: {}", e)))?;
        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            registered: Mutex::new(None),
        })
    }

    /// Register the local node. Re-registering replaces the previous record.
    pub fn advertise(&self, local: &PeerInfo, port: u16) -> Result<()> {
        self.withdraw();

        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| local.id.clone());
        let host_name = format!("{}.local.", host);

        let service = ServiceInfo::new(
            &self.service_type,
            &local.id,
            &host_name,
            (),
            port,
            txt_properties(local),
        )
        .map_err(|e| AppError::Transport(format!("invalid mDNS record: {}", e)))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| AppError::Transport(format!("mDNS register failed: {}", e)))?;
        info!("Advertising {} on port {}", fullname, port);
        *self.registered.lock() = Some(fullname);
        Ok(())
    }

    pub fn withdraw(&self) {
        if let Some(fullname) = self.registered.lock().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                debug!("mDNS unregister of {} failed: {}", fullname, e);
            }
        }
    }

    /// Browse for peers, skipping `local_id`
    pub fn browse(&self, local_id: &str) -> Result<mpsc::UnboundedReceiver<MdnsEvent>> {
        let receiver = self
            .daemon
            .browse(&self.service_type)
            .map_err(|e| AppError::Transport(format!("mDNS browse failed: {}", e)))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let local_id = local_id.to_string();

        tokio::spawn(async move {
            // fullname -> peer id, to translate removals
            let mut names: HashMap<String, PeerId> = HashMap::new();

            while let Ok(event) = receiver.recv_async().await {
                let out = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(peer) = peer_from_txt(
                            info.get_property_val_str(TXT_ID),
                            info.get_property_val_str(TXT_NAME),
                            info.get_property_val_str(TXT_ROLE),
                        ) else {
                            warn!("Ignoring {} without peer id", info.get_fullname());
                            continue;
                        };
                        if peer.id == local_id {
                            continue;
                        }
                        let Some(ip) = pick_address(info.get_addresses()) else {
                            debug!("{} resolved without address", info.get_fullname());
                            continue;
                        };
                        names.insert(info.get_fullname().to_string(), peer.id.clone());
                        MdnsEvent::Resolved {
                            peer,
                            addr: SocketAddr::new(ip, info.get_port()),
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => match names.remove(&fullname) {
                        Some(id) => MdnsEvent::Removed(id),
                        None => continue,
                    },
                    ServiceEvent::SearchStopped(_) => break,
                    _ => continue,
                };
                if tx.send(out).is_err() {
                    break;
                }
            }
            debug!("mDNS browse loop finished");
        });

        Ok(rx)
    }

    pub fn shutdown(&self) {
        self.withdraw();
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS shutdown failed: {}", e);
        }
    }
}
