//! In-process transport
//!
//! Links between endpoints of the same [`MemoryNetwork`] deliver bytes
//! synchronously and in order. Faults are injected from outside with
//! [`MemoryNetwork::sever`] and [`MemoryNetwork::set_reachable`], which is
//! what the scenario tests and the `simulate` command use.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::error::NetworkError;
use super::transport::{
    ConnectionHandle, IceConfig, Transport, TransportEvent, TransportEventSender, TransportState,
};
use crate::protocol::PeerId;

struct Endpoint {
    events: TransportEventSender,
    reachable: bool,
}

/// One side of a link
struct LinkEnd {
    owner: PeerId,
    remote: PeerId,
    remote_handle: ConnectionHandle,
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<PeerId, Endpoint>,
    links: HashMap<ConnectionHandle, LinkEnd>,
    next_handle: u64,
}

impl Hub {
    fn allocate(&mut self) -> ConnectionHandle {
        self.next_handle += 1;
        ConnectionHandle::new(self.next_handle)
    }

    fn notify(&self, peer: &PeerId, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(peer) {
            // A dropped receiver means that session is gone
            let _ = endpoint.events.send(event);
        }
    }

    fn notify_state(&self, owner: &PeerId, handle: ConnectionHandle, peer: &PeerId, state: TransportState) {
        self.notify(
            owner,
            TransportEvent::StateChanged {
                handle,
                peer: peer.clone(),
                state,
            },
        );
    }

    fn is_reachable(&self, peer: &PeerId) -> bool {
        self.endpoints.get(peer).is_some_and(|e| e.reachable)
    }

    /// Tear down both ends of a link, reporting `state` to each owner
    fn tear_down(&mut self, handle: ConnectionHandle, state: TransportState) {
        if let Some(end) = self.links.remove(&handle) {
            self.links.remove(&end.remote_handle);
            self.notify_state(&end.owner, handle, &end.remote, state);
            self.notify_state(&end.remote, end.remote_handle, &end.owner, state);
        }
    }
}

/// Shared switchboard for in-process endpoints
///
/// Each network is fully isolated; sessions on different networks can
/// never see each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint for `peer` that reports into `events`
    pub fn endpoint(&self, peer: PeerId, events: TransportEventSender) -> MemoryTransport {
        self.hub.lock().endpoints.insert(
            peer.clone(),
            Endpoint {
                events,
                reachable: true,
            },
        );
        MemoryTransport {
            local: peer,
            hub: self.hub.clone(),
        }
    }

    /// Control whether new links to or from `peer` can be opened
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        if let Some(endpoint) = self.hub.lock().endpoints.get_mut(peer) {
            endpoint.reachable = reachable;
        }
    }

    /// Fail every link touching `peer` and make it unreachable
    pub fn sever(&self, peer: &PeerId) {
        let mut hub = self.hub.lock();
        let handles: Vec<ConnectionHandle> = hub
            .links
            .iter()
            .filter(|(_, end)| &end.owner == peer)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in handles {
            hub.tear_down(handle, TransportState::Failed);
        }
        if let Some(endpoint) = hub.endpoints.get_mut(peer) {
            endpoint.reachable = false;
        }
        debug!("Severed all links of {}", peer);
    }

    /// Fail the links between two peers only
    pub fn sever_link(&self, a: &PeerId, b: &PeerId) {
        let mut hub = self.hub.lock();
        let handles: Vec<ConnectionHandle> = hub
            .links
            .iter()
            .filter(|(_, end)| &end.owner == a && &end.remote == b)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in handles {
            hub.tear_down(handle, TransportState::Failed);
        }
    }

    /// Number of open links, counting each direction once
    pub fn link_count(&self) -> usize {
        self.hub.lock().links.len() / 2
    }
}

/// Endpoint of a [`MemoryNetwork`]
pub struct MemoryTransport {
    local: PeerId,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryTransport {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, peer: &PeerId, _ice: &IceConfig) -> Result<ConnectionHandle, NetworkError> {
        let mut hub = self.hub.lock();
        let handle = hub.allocate();

        if !hub.is_reachable(&self.local) || !hub.is_reachable(peer) {
            debug!("{} cannot reach {}", self.local, peer);
            hub.notify_state(&self.local, handle, peer, TransportState::Failed);
            return Ok(handle);
        }

        let remote_handle = hub.allocate();
        hub.links.insert(
            handle,
            LinkEnd {
                owner: self.local.clone(),
                remote: peer.clone(),
                remote_handle,
            },
        );
        hub.links.insert(
            remote_handle,
            LinkEnd {
                owner: peer.clone(),
                remote: self.local.clone(),
                remote_handle: handle,
            },
        );

        hub.notify_state(&self.local, handle, peer, TransportState::Open);
        hub.notify_state(peer, remote_handle, &self.local, TransportState::Open);
        debug!("Opened link {} <-> {} ({} / {})", self.local, peer, handle, remote_handle);
        Ok(handle)
    }

    fn send(&mut self, handle: ConnectionHandle, bytes: Vec<u8>) -> Result<(), NetworkError> {
        let hub = self.hub.lock();
        let end = hub.links.get(&handle).ok_or(NetworkError::NotConnected)?;
        let endpoint = hub
            .endpoints
            .get(&end.remote)
            .ok_or_else(|| NetworkError::PeerUnreachable(end.remote.clone()))?;

        trace!("{} -> {}: {} bytes", self.local, end.remote, bytes.len());
        endpoint
            .events
            .send(TransportEvent::Message {
                handle: end.remote_handle,
                peer: self.local.clone(),
                bytes,
            })
            .map_err(|_| NetworkError::NotConnected)
    }

    fn close(&mut self, handle: ConnectionHandle) {
        self.hub.lock().tear_down(handle, TransportState::Closed);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut hub = self.hub.lock();
        let handles: Vec<ConnectionHandle> = hub
            .links
            .iter()
            .filter(|(_, end)| end.owner == self.local)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in handles {
            hub.tear_down(handle, TransportState::Closed);
        }
        hub.endpoints.remove(&self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::event_channel;

    #[test]
    fn test_open_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let (tx_a, mut rx_a) = event_channel();
        let (tx_b, mut rx_b) = event_channel();
        let mut a = network.endpoint(PeerId::new("a"), tx_a);
        let _b = network.endpoint(PeerId::new("b"), tx_b);

        let handle = a.open(&PeerId::new("b"), &IceConfig::default()).unwrap();

        assert_eq!(
            rx_a.try_recv().unwrap(),
            TransportEvent::StateChanged {
                handle,
                peer: PeerId::new("b"),
                state: TransportState::Open,
            }
        );
        match rx_b.try_recv().unwrap() {
            TransportEvent::StateChanged { peer, state, .. } => {
                assert_eq!(peer, PeerId::new("a"));
                assert_eq!(state, TransportState::Open);
            }
            other => panic!("Expected state change, got {:?}", other),
        }
        assert_eq!(network.link_count(), 1);
    }

    #[test]
    fn test_send_preserves_order() {
        let network = MemoryNetwork::new();
        let (tx_a, _rx_a) = event_channel();
        let (tx_b, mut rx_b) = event_channel();
        let mut a = network.endpoint(PeerId::new("a"), tx_a);
        let _b = network.endpoint(PeerId::new("b"), tx_b);

        let handle = a.open(&PeerId::new("b"), &IceConfig::default()).unwrap();
        let _open = rx_b.try_recv().unwrap();

        for i in 0..5u8 {
            a.send(handle, vec![i]).unwrap();
        }
        for i in 0..5u8 {
            match rx_b.try_recv().unwrap() {
                TransportEvent::Message { bytes, .. } => assert_eq!(bytes, vec![i]),
                other => panic!("Expected message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_unreachable_peer_fails_open() {
        let network = MemoryNetwork::new();
        let (tx_a, mut rx_a) = event_channel();
        let mut a = network.endpoint(PeerId::new("a"), tx_a);

        let handle = a.open(&PeerId::new("ghost"), &IceConfig::default()).unwrap();
        assert_eq!(
            rx_a.try_recv().unwrap(),
            TransportEvent::StateChanged {
                handle,
                peer: PeerId::new("ghost"),
                state: TransportState::Failed,
            }
        );
        assert!(a.send(handle, vec![1]).is_err());
    }

    #[test]
    fn test_sever_fails_links_on_both_sides() {
        let network = MemoryNetwork::new();
        let (tx_a, mut rx_a) = event_channel();
        let (tx_b, mut rx_b) = event_channel();
        let mut a = network.endpoint(PeerId::new("a"), tx_a);
        let mut b = network.endpoint(PeerId::new("b"), tx_b);

        a.open(&PeerId::new("b"), &IceConfig::default()).unwrap();
        let _ = rx_a.try_recv();
        let _ = rx_b.try_recv();

        network.sever(&PeerId::new("b"));

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                TransportEvent::StateChanged { state, .. } => {
                    assert_eq!(state, TransportState::Failed)
                }
                other => panic!("Expected failure, got {:?}", other),
            }
        }
        assert_eq!(network.link_count(), 0);

        // Severed peer stays unreachable until restored
        let retry = b.open(&PeerId::new("a"), &IceConfig::default()).unwrap();
        assert_eq!(
            rx_b.try_recv().unwrap(),
            TransportEvent::StateChanged {
                handle: retry,
                peer: PeerId::new("a"),
                state: TransportState::Failed,
            }
        );
        network.set_reachable(&PeerId::new("b"), true);
        b.open(&PeerId::new("a"), &IceConfig::default()).unwrap();
        assert_eq!(network.link_count(), 1);
    }
}
