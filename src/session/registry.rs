//! Peer registry
//!
//! The ordered list of participants, oldest join first. Every peer in a
//! session holds the same order, which is what makes host succession
//! deterministic.

use std::time::Instant;

use tracing::{debug, info};

use super::error::SessionError;
use crate::network::ConnectionHandle;
use crate::protocol::{PeerId, PeerSnapshot, PlayerState, Role};

/// Link status of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// This process
    Local,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// A participant as seen by the local process
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub role: Role,
    /// Position in the session's join order, lower is older
    pub join_order: u64,
    pub transport: Option<ConnectionHandle>,
    pub status: PeerStatus,
    pub last_seen_snapshot_seq: Option<u64>,
    pub last_heartbeat_at: Option<Instant>,
    pub remote_state: Option<PlayerState>,
}

impl Peer {
    fn new(id: PeerId, role: Role, join_order: u64) -> Self {
        Self {
            id,
            role,
            join_order,
            transport: None,
            status: PeerStatus::Connecting,
            last_seen_snapshot_seq: None,
            last_heartbeat_at: None,
            remote_state: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status, PeerStatus::Local | PeerStatus::Connected)
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            role: self.role,
            join_order: self.join_order,
            state: self.remote_state.clone(),
        }
    }
}

/// Raised by registry mutations for the coordinator to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    HostLost { previous: PeerId },
}

/// Ordered set of known peers with a capacity limit
#[derive(Debug)]
pub struct PeerRegistry {
    max_peers: usize,
    peers: Vec<Peer>,
    next_join_order: u64,
    events: Vec<RegistryEvent>,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            peers: Vec::with_capacity(max_peers),
            next_join_order: 0,
            events: Vec::new(),
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn set_max_peers(&mut self, max_peers: usize) {
        self.max_peers = max_peers;
    }

    /// Append a peer at the end of the join order
    pub fn add_peer(&mut self, id: PeerId, role: Role) -> Result<&mut Peer, SessionError> {
        let order = self.next_join_order;
        self.insert(Peer::new(id, role, order))
    }

    /// Insert a peer with the join order assigned by the host
    pub fn insert_snapshot(&mut self, snapshot: &PeerSnapshot) -> Result<&mut Peer, SessionError> {
        let mut peer = Peer::new(snapshot.id.clone(), snapshot.role, snapshot.join_order);
        peer.remote_state = snapshot.state.clone();
        peer.last_seen_snapshot_seq = snapshot.state.as_ref().map(|s| s.sequence);
        self.insert(peer)
    }

    fn insert(&mut self, peer: Peer) -> Result<&mut Peer, SessionError> {
        if self.contains(&peer.id) {
            return Err(SessionError::DuplicatePeer(peer.id));
        }
        if self.peers.len() >= self.max_peers {
            return Err(SessionError::CapacityExceeded {
                max_peers: self.max_peers,
            });
        }
        if peer.role == Role::Host {
            self.demote_host();
        }

        info!(
            "Adding peer {} as {:?} (join order {})",
            peer.id, peer.role, peer.join_order
        );
        self.next_join_order = self.next_join_order.max(peer.join_order + 1);
        let index = self
            .peers
            .partition_point(|p| p.join_order < peer.join_order);
        self.peers.insert(index, peer);
        Ok(&mut self.peers[index])
    }

    /// Remove a peer; removing the host raises [`RegistryEvent::HostLost`]
    pub fn remove_peer(&mut self, id: &PeerId) -> Option<Peer> {
        let index = self.peers.iter().position(|p| &p.id == id)?;
        let peer = self.peers.remove(index);
        info!("Removed peer {}", peer.id);
        if peer.is_host() {
            self.events.push(RegistryEvent::HostLost {
                previous: peer.id.clone(),
            });
        }
        Some(peer)
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn get_peer_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| &p.id == id)
    }

    /// Peers in join order
    pub fn list_peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Change a peer's role. Promoting to host demotes the current host.
    pub fn set_role(&mut self, id: &PeerId, role: Role) -> Result<(), SessionError> {
        if !self.contains(id) {
            return Err(SessionError::UnknownPeer(id.clone()));
        }
        if role == Role::Host {
            self.demote_host();
        }
        if let Some(peer) = self.get_peer_mut(id) {
            debug!("Peer {} is now {:?}", id, role);
            peer.role = role;
        }
        Ok(())
    }

    fn demote_host(&mut self) {
        for peer in self.peers.iter_mut().filter(|p| p.is_host()) {
            peer.role = Role::Member;
        }
    }

    pub fn host(&self) -> Option<&Peer> {
        self.peers.iter().find(|p| p.is_host())
    }

    pub fn host_id(&self) -> Option<&PeerId> {
        self.host().map(|p| &p.id)
    }

    /// Deterministic host successor: the oldest remaining peer
    pub fn successor(&self) -> Option<&Peer> {
        self.peers.first()
    }

    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        self.peers.iter().map(Peer::snapshot).collect()
    }

    pub fn take_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drop every entry, keeping the capacity
    pub fn clear(&mut self) {
        self.peers.clear();
        self.events.clear();
        self.next_join_order = 0;
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|p| &p.id == id)
    }
}
