//! Session coordinator
//!
//! Runs the join handshake, keeps the mesh of links to every peer,
//! broadcasts local state, applies remote actions and migrates the host
//! role when the host disappears.
//!
//! ```text
//! Idle -> Hosting | Joining -> Connected -> (Leaving | HostLost) -> Idle
//! ```
//!
//! A [`Session`] is owned by exactly one task and never locked. Every entry
//! point takes the current [`Instant`], so a test harness can drive any
//! number of isolated sessions on a synthetic clock.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::config::SessionConfig;
use super::error::SessionError;
use super::reconnect::{ReconnectDecision, ReconnectionSupervisor};
use super::registry::{Peer, PeerRegistry, PeerStatus, RegistryEvent};
use crate::network::{ConnectionHandle, NetworkError, Transport, TransportEvent, TransportState};
use crate::protocol::{
    encode, unix_millis, Action, ActionId, Envelope, GameMode, JoinIntent, Message, MessageRouter,
    MessageType, PeerId, PeerSnapshot, PlayerState, Role, SessionMeta, REJECT_FULL,
    REJECT_MODE_MISMATCH, REJECT_NOT_HOST,
};
use crate::sync::{IngestOutcome, PredictionBuffer, StateSyncEngine};

/// Game logic callback for actions performed by other players
pub type RemoteActionHandler = Box<dyn FnMut(&PeerId, &str, &Value) + Send + 'static>;

/// Coordinator state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Hosting,
    Joining { host: PeerId, deadline: Instant },
    Connected,
    /// Host gone, waiting for the successor to announce itself
    HostLost,
    Leaving,
}

impl SessionState {
    /// Whether the session is up and broadcasting
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Hosting | SessionState::Connected | SessionState::HostLost
        )
    }
}

/// Notifications for game logic
#[derive(Debug)]
pub enum SessionEvent {
    Hosting {
        meta: SessionMeta,
    },
    Joined {
        assigned_id: PeerId,
        host_id: PeerId,
    },
    JoinFailed {
        error: SessionError,
    },
    /// Full session state received from the host
    StateTransferred {
        peers: Vec<PeerId>,
    },
    PeerJoined {
        peer: PeerId,
    },
    PlayerLeft {
        peer: PeerId,
    },
    /// Reconnection gave up on a peer
    PeerDisconnected {
        peer: PeerId,
    },
    HostMigrated {
        previous: Option<PeerId>,
        new_host: PeerId,
    },
    /// Two peers claimed the host role; `current` keeps it
    HostConflict {
        claimant: PeerId,
        current: PeerId,
    },
    /// The transport needs addresses for this peer from signaling
    CandidatesNeeded {
        peer: PeerId,
    },
    Left,
}

/// Summary of the session as seen locally
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub local_id: PeerId,
    pub session_id: Option<String>,
    pub mode: GameMode,
    pub state: SessionState,
    pub is_host: bool,
    pub connected: bool,
    pub host_id: Option<PeerId>,
    pub peer_count: usize,
    pub max_peers: usize,
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub snapshots_accepted: u64,
    pub snapshots_stale: u64,
    pub peers_marked_stale: u64,
    pub malformed_dropped: u64,
    pub unknown_type_dropped: u64,
    pub actions_applied: u64,
    pub duplicate_actions: u64,
    pub actions_recorded: u64,
    pub actions_confirmed: u64,
    pub actions_evicted: u64,
    pub actions_expired: u64,
    pub pending_actions: u64,
}

/// State the message handlers operate on
struct SessionCore {
    config: SessionConfig,
    local_id: PeerId,
    transport: Box<dyn Transport>,
    state: SessionState,
    meta: Option<SessionMeta>,
    registry: PeerRegistry,
    sync: StateSyncEngine,
    prediction: PredictionBuffer,
    supervisor: ReconnectionSupervisor,
    /// Inbound links from peers not registered yet
    unclaimed: HashMap<ConnectionHandle, PeerId>,
    /// Links this side opened
    dialed: HashSet<ConnectionHandle>,
    candidates: HashMap<PeerId, Vec<SocketAddr>>,
    awaiting_candidates: HashSet<PeerId>,
    awaiting_transfer: bool,
    previous_host: Option<PeerId>,
    next_seq: u64,
    last_applied_action: HashMap<PeerId, u64>,
    remote_action_handler: Option<RemoteActionHandler>,
    events: VecDeque<SessionEvent>,
    /// Link the message being dispatched arrived on
    inbound: Option<(ConnectionHandle, PeerId)>,
    now: Instant,
    actions_applied: u64,
    duplicate_actions: u64,
}

/// One participant's view of a multiplayer session
pub struct Session {
    core: SessionCore,
    router: MessageRouter<SessionCore>,
}

impl Session {
    pub fn new(config: SessionConfig, local_id: PeerId, transport: Box<dyn Transport>) -> Self {
        let config = config.validated();
        let sync = StateSyncEngine::new(local_id.clone(), config.sync_config());
        let prediction =
            PredictionBuffer::new(config.action_buffer_capacity, config.action_retention());
        let supervisor = ReconnectionSupervisor::new(config.reconnect_policy());
        let registry = PeerRegistry::new(config.max_peers());

        Self {
            core: SessionCore {
                config,
                local_id,
                transport,
                state: SessionState::Idle,
                meta: None,
                registry,
                sync,
                prediction,
                supervisor,
                unclaimed: HashMap::new(),
                dialed: HashSet::new(),
                candidates: HashMap::new(),
                awaiting_candidates: HashSet::new(),
                awaiting_transfer: false,
                previous_host: None,
                next_seq: 0,
                last_applied_action: HashMap::new(),
                remote_action_handler: None,
                events: VecDeque::new(),
                inbound: None,
                now: Instant::now(),
                actions_applied: 0,
                duplicate_actions: 0,
            },
            router: build_router(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.core.local_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    pub fn state(&self) -> &SessionState {
        &self.core.state
    }

    pub fn meta(&self) -> Option<&SessionMeta> {
        self.core.meta.as_ref()
    }

    /// Start a new session with this peer as host
    pub fn create(&mut self, now: Instant) -> Result<SessionMeta, SessionError> {
        let core = &mut self.core;
        if core.state != SessionState::Idle {
            return Err(SessionError::InvalidState(format!(
                "cannot host while {:?}",
                core.state
            )));
        }
        core.now = now;
        core.release_all();

        let max_peers = core.config.max_peers();
        core.registry.set_max_peers(max_peers);
        let local = core.registry.add_peer(core.local_id.clone(), Role::Host)?;
        local.status = PeerStatus::Local;

        let meta = SessionMeta {
            session_id: Uuid::new_v4().to_string()[..8].to_string(),
            mode: core.config.mode,
            max_peers,
            host_id: core.local_id.clone(),
            created_at_ms: unix_millis(),
        };
        info!(
            "Hosting {} session {} (max {} peers)",
            meta.mode, meta.session_id, max_peers
        );
        core.meta = Some(meta.clone());
        core.state = SessionState::Hosting;
        core.emit(SessionEvent::Hosting { meta: meta.clone() });
        Ok(meta)
    }

    /// Ask `host` to let this peer in
    ///
    /// The outcome arrives as [`SessionEvent::Joined`] or
    /// [`SessionEvent::JoinFailed`]. Only a transport that cannot open links
    /// at all fails here.
    pub fn join(&mut self, host: PeerId, now: Instant) -> Result<(), SessionError> {
        let core = &mut self.core;
        if core.state != SessionState::Idle {
            return Err(SessionError::InvalidState(format!(
                "cannot join while {:?}",
                core.state
            )));
        }
        if host == core.local_id {
            return Err(SessionError::InvalidState("cannot join own session".to_string()));
        }
        core.now = now;
        core.release_all();
        core.registry.set_max_peers(core.config.max_peers());

        // Provisional entry, released if the join does not complete
        core.registry.add_peer(host.clone(), Role::Host)?;
        core.state = SessionState::Joining {
            host: host.clone(),
            deadline: now + core.config.join_timeout(),
        };

        match core.dial(&host) {
            Ok(Some(handle)) => {
                if let Some(peer) = core.registry.get_peer_mut(&host) {
                    peer.transport = Some(handle);
                }
            }
            Ok(None) => info!("Waiting for address candidates of {}", host),
            Err(e) => {
                core.release_all();
                core.state = SessionState::Idle;
                return Err(e.into());
            }
        }
        info!("Joining session hosted by {}", host);
        Ok(())
    }

    /// Leave gracefully, telling every peer
    pub fn leave(&mut self, now: Instant) -> Result<(), SessionError> {
        let core = &mut self.core;
        core.now = now;
        match core.state {
            SessionState::Idle => return Err(SessionError::NotInSession),
            SessionState::Joining { .. } => info!("Abandoning join"),
            _ => {
                core.state = SessionState::Leaving;
                info!("Leaving session");
                let local = core.local_id.clone();
                core.broadcast(Message::PlayerLeft { peer_id: local });
            }
        }
        core.release_all();
        core.state = SessionState::Idle;
        core.emit(SessionEvent::Left);
        Ok(())
    }

    /// Apply an action locally and broadcast it
    ///
    /// `predict` mutates the local player immediately. The effect is never
    /// rolled back.
    pub fn perform_action<F>(
        &mut self,
        action_type: &str,
        action_data: Value,
        now: Instant,
        predict: F,
    ) -> Result<ActionId, SessionError>
    where
        F: FnOnce(&mut PlayerState),
    {
        let core = &mut self.core;
        if !core.state.is_active() {
            return Err(SessionError::NotInSession);
        }
        core.now = now;

        predict(core.sync.local_state_mut());
        let seq = core.next_seq();
        let id = ActionId {
            owner_id: core.local_id.clone(),
            sequence: seq,
        };
        let timestamp = unix_millis();
        let action = Action {
            id: id.clone(),
            action_type: action_type.to_string(),
            payload: action_data.clone(),
            issued_at_ms: timestamp,
        };

        let awaiting: BTreeSet<PeerId> = core.connected_peers().into_iter().collect();
        let effect = core.sync.local_state().clone();
        if let Some(evicted) = core.prediction.record(action, effect, awaiting, now) {
            debug!(
                "Prediction for {} #{} stands unconfirmed",
                evicted.action.action_type, evicted.action.id.sequence
            );
        }

        core.broadcast_with_seq(
            seq,
            Message::GameAction {
                action_type: action_type.to_string(),
                action_data,
                timestamp,
            },
        );
        Ok(id)
    }

    /// Register the callback for actions performed by other players
    pub fn on_remote_action<F>(&mut self, handler: F)
    where
        F: FnMut(&PeerId, &str, &Value) + Send + 'static,
    {
        self.core.remote_action_handler = Some(Box::new(handler));
    }

    /// Feed one transport event through the session
    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        self.core.now = now;
        match event {
            TransportEvent::Message {
                handle,
                peer,
                bytes,
            } => {
                if self.core.state == SessionState::Idle {
                    trace!("Idle, dropping {} bytes from {}", bytes.len(), peer);
                    return;
                }
                self.core.inbound = Some((handle, peer.clone()));
                self.router.route(&mut self.core, &peer, &bytes);
                self.core.inbound = None;
            }
            TransportEvent::StateChanged {
                handle,
                peer,
                state,
            } => self.core.on_link_state(handle, peer, state),
        }
        self.core.process_registry_events();
    }

    /// Timer step: join timeout, reconnection, state broadcast and action retention
    pub fn tick(&mut self, now: Instant) {
        let core = &mut self.core;
        core.now = now;

        if matches!(core.state, SessionState::Joining { deadline, .. } if now >= deadline) {
            core.fail_join(SessionError::JoinDenied("timed out".to_string()));
            return;
        }
        if !core.state.is_active() {
            return;
        }

        core.run_reconnection();

        if core.sync.broadcast_due(now) {
            let seq = core.next_seq();
            let state = core.sync.take_snapshot(seq, now);
            core.broadcast_with_seq(
                seq,
                Message::PlayerState {
                    state,
                    timestamp: unix_millis(),
                },
            );
        }

        core.prediction.purge_expired(now);
        core.process_registry_events();
    }

    /// Render step: advance remote presentation to `now`
    pub fn update_presentation(&mut self, now: Instant) {
        self.core.sync.interpolate(now);
    }

    /// Smoothed state of every remote player
    pub fn interpolated_remote_states(&self) -> HashMap<PeerId, PlayerState> {
        self.core.sync.presented_states()
    }

    /// Addresses for `peer` learned through signaling
    pub fn add_remote_candidate(&mut self, peer: &PeerId, candidates: Vec<SocketAddr>) {
        let core = &mut self.core;
        let known = core.candidates.entry(peer.clone()).or_default();
        for candidate in candidates {
            if !known.contains(&candidate) {
                known.push(candidate);
            }
        }

        if !core.awaiting_candidates.remove(peer) {
            return;
        }
        let needs_link = core
            .registry
            .get_peer(peer)
            .is_some_and(|p| p.transport.is_none() && p.status != PeerStatus::Local);
        if !needs_link {
            return;
        }

        let joining = matches!(&core.state, SessionState::Joining { host, .. } if host == peer);
        if joining {
            match core.dial(peer) {
                Ok(Some(handle)) => {
                    if let Some(entry) = core.registry.get_peer_mut(peer) {
                        entry.transport = Some(handle);
                    }
                }
                Ok(None) => {}
                Err(e) => core.fail_join(e.into()),
            }
        } else {
            core.connect_peer(peer);
        }
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.core.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.core.events.drain(..).collect()
    }

    pub fn local_state(&self) -> &PlayerState {
        self.core.sync.local_state()
    }

    /// The local player, to be updated by game logic between ticks
    pub fn local_state_mut(&mut self) -> &mut PlayerState {
        self.core.sync.local_state_mut()
    }

    pub fn host_id(&self) -> Option<&PeerId> {
        self.core.registry.host_id()
    }

    pub fn is_host(&self) -> bool {
        self.core.is_host()
    }

    /// Known peers in join order, the local one included
    pub fn peers(&self) -> &[Peer] {
        self.core.registry.list_peers()
    }

    pub fn info(&self) -> SessionInfo {
        let core = &self.core;
        SessionInfo {
            local_id: core.local_id.clone(),
            session_id: core.meta.as_ref().map(|m| m.session_id.clone()),
            mode: core.config.mode,
            state: core.state.clone(),
            is_host: core.is_host(),
            connected: core.state.is_active(),
            host_id: core.registry.host_id().cloned(),
            peer_count: core.registry.len(),
            max_peers: core.registry.max_peers(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        let router = self.router.stats();
        let sync = self.core.sync.stats();
        let prediction = self.core.prediction.stats();
        SessionStats {
            snapshots_accepted: sync.accepted,
            snapshots_stale: sync.stale_discarded,
            peers_marked_stale: sync.marked_stale,
            malformed_dropped: router.malformed,
            unknown_type_dropped: router.unknown_type,
            actions_applied: self.core.actions_applied,
            duplicate_actions: self.core.duplicate_actions,
            actions_recorded: prediction.recorded,
            actions_confirmed: prediction.confirmed,
            actions_evicted: prediction.evicted,
            actions_expired: prediction.expired,
            pending_actions: self.core.prediction.len() as u64,
        }
    }
}

impl SessionCore {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn emit(&mut self, event: SessionEvent) {
        debug!("Session event: {:?}", event);
        self.events.push_back(event);
    }

    fn is_host(&self) -> bool {
        self.registry.host_id() == Some(&self.local_id)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.registry
            .list_peers()
            .iter()
            .filter(|p| p.status == PeerStatus::Connected && p.transport.is_some())
            .map(|p| p.id.clone())
            .collect()
    }

    fn send_on(&mut self, handle: ConnectionHandle, message: Message) {
        let seq = self.next_seq();
        let envelope = Envelope::new(self.local_id.clone(), seq, message);
        match encode(&envelope) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(handle, bytes) {
                    debug!("Send of {} on {} failed: {}", envelope.message_type(), handle, e);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", envelope.message_type(), e),
        }
    }

    fn send_to(&mut self, peer: &PeerId, message: Message) {
        match self.registry.get_peer(peer).and_then(|p| p.transport) {
            Some(handle) => self.send_on(handle, message),
            None => debug!("No link to {}, dropping {}", peer, message.message_type()),
        }
    }

    /// Answer the sender of the message being handled, registered or not
    fn reply(&mut self, peer: &PeerId, message: Message) {
        let registered = self.registry.get_peer(peer).and_then(|p| p.transport);
        let inbound = match &self.inbound {
            Some((handle, link_peer)) if link_peer == peer => Some(*handle),
            _ => None,
        };
        match registered.or(inbound) {
            Some(handle) => self.send_on(handle, message),
            None => debug!("No link to {}, dropping {}", peer, message.message_type()),
        }
    }

    fn broadcast(&mut self, message: Message) {
        let seq = self.next_seq();
        self.broadcast_with_seq(seq, message);
    }

    fn broadcast_except(&mut self, excluded: &PeerId, message: Message) {
        let seq = self.next_seq();
        self.send_all(seq, message, Some(excluded));
    }

    fn broadcast_with_seq(&mut self, seq: u64, message: Message) {
        self.send_all(seq, message, None);
    }

    /// Encode once, send to every connected peer
    fn send_all(&mut self, seq: u64, message: Message, excluded: Option<&PeerId>) {
        let envelope = Envelope::new(self.local_id.clone(), seq, message);
        let bytes = match encode(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode {}: {}", envelope.message_type(), e);
                return;
            }
        };

        let handles: Vec<ConnectionHandle> = self
            .registry
            .list_peers()
            .iter()
            .filter(|p| p.status == PeerStatus::Connected && Some(&p.id) != excluded)
            .filter_map(|p| p.transport)
            .collect();
        trace!(
            "Broadcasting {} seq={} to {} peers",
            envelope.message_type(),
            seq,
            handles.len()
        );
        for handle in handles {
            if let Err(e) = self.transport.send(handle, bytes.clone()) {
                debug!("Broadcast on {} failed: {}", handle, e);
            }
        }
    }

    /// Registry snapshots with the local player's current state filled in
    fn session_snapshots(&self) -> Vec<PeerSnapshot> {
        let mut snapshots = self.registry.snapshots();
        for snapshot in snapshots.iter_mut() {
            if snapshot.id == self.local_id {
                snapshot.state = Some(self.sync.local_state().clone());
            }
        }
        snapshots
    }

    /// Open a link, or ask signaling for addresses first
    fn dial(&mut self, peer: &PeerId) -> Result<Option<ConnectionHandle>, NetworkError> {
        let candidates = self.candidates.get(peer).cloned().unwrap_or_default();
        if self.transport.needs_candidates() && candidates.is_empty() {
            if self.awaiting_candidates.insert(peer.clone()) {
                self.emit(SessionEvent::CandidatesNeeded { peer: peer.clone() });
            }
            return Ok(None);
        }

        let ice = self.config.ice.with_candidates(candidates);
        let handle = self.transport.open(peer, &ice)?;
        self.dialed.insert(handle);
        debug!("Dialing {} on {}", peer, handle);
        Ok(Some(handle))
    }

    /// Dial a registered peer; failures go to the supervisor
    fn connect_peer(&mut self, peer: &PeerId) {
        match self.dial(peer) {
            Ok(Some(handle)) => {
                if let Some(entry) = self.registry.get_peer_mut(peer) {
                    entry.transport = Some(handle);
                }
            }
            Ok(None) => {
                if !self.supervisor.is_reconnecting(peer) {
                    self.link_lost(peer);
                }
            }
            Err(e) => {
                warn!("Cannot dial {}: {}", peer, e);
                self.link_lost(peer);
            }
        }
    }

    fn close_link(&mut self, handle: ConnectionHandle) {
        self.dialed.remove(&handle);
        self.transport.close(handle);
    }

    fn claim_unclaimed(&mut self, peer: &PeerId) -> Option<ConnectionHandle> {
        let handle = self
            .unclaimed
            .iter()
            .find(|(_, owner)| *owner == peer)
            .map(|(handle, _)| *handle)?;
        self.unclaimed.remove(&handle);
        Some(handle)
    }

    fn dialer_of<'a>(&'a self, handle: ConnectionHandle, peer: &'a PeerId) -> &'a PeerId {
        if self.dialed.contains(&handle) {
            &self.local_id
        } else {
            peer
        }
    }

    /// Of two live links to one peer, keep the one dialed by the lower id.
    /// Both ends apply the same rule and so keep the same link.
    fn preferred_link(
        &self,
        current: ConnectionHandle,
        incoming: ConnectionHandle,
        peer: &PeerId,
    ) -> ConnectionHandle {
        let current_dialer = self.dialer_of(current, peer);
        let incoming_dialer = self.dialer_of(incoming, peer);
        if current_dialer < incoming_dialer {
            current
        } else {
            incoming
        }
    }

    fn on_link_state(&mut self, handle: ConnectionHandle, peer: PeerId, state: TransportState) {
        match state {
            TransportState::Connecting => trace!("Link {} to {} connecting", handle, peer),
            TransportState::Open => self.on_link_open(handle, peer),
            TransportState::Closed | TransportState::Failed => {
                self.on_link_down(handle, peer, state)
            }
        }
    }

    fn on_link_open(&mut self, handle: ConnectionHandle, peer: PeerId) {
        if matches!(self.state, SessionState::Idle | SessionState::Leaving) {
            debug!("Not in a session, closing link {} from {}", handle, peer);
            self.close_link(handle);
            return;
        }

        let Some((status, transport)) = self
            .registry
            .get_peer(&peer)
            .map(|p| (p.status, p.transport))
        else {
            debug!("Inbound link {} from unregistered {}", handle, peer);
            self.unclaimed.insert(handle, peer);
            return;
        };
        if status == PeerStatus::Local {
            self.close_link(handle);
            return;
        }

        match transport {
            Some(current) if current == handle => {}
            Some(current) if status == PeerStatus::Connected => {
                if self.preferred_link(current, handle, &peer) == current {
                    debug!("Duplicate link {} to {}, keeping {}", handle, peer, current);
                    self.close_link(handle);
                    return;
                }
                debug!("Duplicate link {} to {}, replacing {}", handle, peer, current);
                self.close_link(current);
            }
            _ => {}
        }
        self.attach(handle, &peer);
    }

    fn attach(&mut self, handle: ConnectionHandle, peer: &PeerId) {
        let now = self.now;
        if let Some(entry) = self.registry.get_peer_mut(peer) {
            entry.transport = Some(handle);
            entry.status = PeerStatus::Connected;
            entry.last_heartbeat_at = Some(now);
        }
        info!("Link {} to {} established", handle, peer);

        let joining_host = matches!(&self.state, SessionState::Joining { host, .. } if host == peer);
        if joining_host {
            let intent = JoinIntent {
                mode: self.config.mode,
                session_id: None,
            };
            self.send_on(
                handle,
                Message::JoinRequest {
                    session_meta: intent,
                    rejoin: false,
                },
            );
            return;
        }

        if self.supervisor.on_recovered(peer).is_some() {
            self.on_peer_recovered(peer);
        }
    }

    fn on_peer_recovered(&mut self, peer: &PeerId) {
        if self.is_host() {
            // Settles any competing claim made while the link was down
            let claim = self.host_claim("host reasserted");
            self.send_to(peer, claim);
        } else if self.registry.host_id() == Some(peer) {
            self.request_rejoin(peer);
        }
    }

    /// Ask the host for a fresh transfer without re-registering
    fn request_rejoin(&mut self, host: &PeerId) {
        let intent = JoinIntent {
            mode: self.config.mode,
            session_id: self.meta.as_ref().map(|m| m.session_id.clone()),
        };
        self.send_to(
            host,
            Message::JoinRequest {
                session_meta: intent,
                rejoin: true,
            },
        );
    }

    /// HOST_MIGRATION naming ourselves, with our join order attached
    fn host_claim(&self, reason: &str) -> Message {
        Message::HostMigration {
            new_host_id: self.local_id.clone(),
            reason: reason.to_string(),
            host: self.registry.get_peer(&self.local_id).map(Peer::snapshot),
        }
    }

    fn on_link_down(&mut self, handle: ConnectionHandle, peer: PeerId, state: TransportState) {
        self.dialed.remove(&handle);
        if self.unclaimed.remove(&handle).is_some() {
            return;
        }
        let current = self
            .registry
            .get_peer(&peer)
            .is_some_and(|p| p.transport == Some(handle));
        if !current {
            trace!("Ignoring {:?} on stale link {}", state, handle);
            return;
        }

        let joining_host = matches!(&self.state, SessionState::Joining { host, .. } if *host == peer);
        if joining_host {
            self.fail_join(SessionError::JoinDenied(format!(
                "link to host {}",
                if state == TransportState::Failed {
                    "failed"
                } else {
                    "closed"
                }
            )));
            return;
        }
        if !self.state.is_active() {
            return;
        }

        info!("Link {} to {} {:?}", handle, peer, state);
        if let Some(entry) = self.registry.get_peer_mut(&peer) {
            entry.transport = None;
        }
        self.link_lost(&peer);
    }

    /// Hand a peer without a link to the supervisor
    fn link_lost(&mut self, peer: &PeerId) {
        match self.supervisor.on_link_lost(peer, self.now) {
            ReconnectDecision::RetryAt { attempt, .. } => {
                if let Some(entry) = self.registry.get_peer_mut(peer) {
                    entry.status = PeerStatus::Reconnecting { attempt };
                }
            }
            ReconnectDecision::Exhausted { .. } => self.drop_peer(peer, true),
        }
    }

    fn run_reconnection(&mut self) {
        for peer in self.supervisor.expired_attempts(self.now) {
            debug!("Reconnect attempt to {} timed out", peer);
            let stale = self
                .registry
                .get_peer_mut(&peer)
                .and_then(|entry| entry.transport.take());
            if let Some(handle) = stale {
                self.close_link(handle);
            }
            self.link_lost(&peer);
        }

        for (peer, attempt) in self.supervisor.due(self.now) {
            match self.registry.get_peer_mut(&peer) {
                Some(entry) => entry.status = PeerStatus::Reconnecting { attempt },
                None => {
                    self.supervisor.forget(&peer);
                    continue;
                }
            }
            debug!("Reconnect attempt {} to {}", attempt, peer);
            self.connect_peer(&peer);
        }
    }

    /// Remove a peer for good
    fn drop_peer(&mut self, peer: &PeerId, disconnected: bool) {
        let Some(removed) = self.registry.remove_peer(peer) else {
            return;
        };
        if let Some(handle) = removed.transport {
            self.close_link(handle);
        }
        self.sync.remove_peer(peer);
        let confirmed = self.prediction.peer_gone(peer);
        if confirmed > 0 {
            debug!("{} pending actions no longer wait on {}", confirmed, peer);
        }
        self.supervisor.forget(peer);
        self.last_applied_action.remove(peer);
        self.awaiting_candidates.remove(peer);

        if disconnected {
            self.emit(SessionEvent::PeerDisconnected { peer: peer.clone() });
        }
        self.emit(SessionEvent::PlayerLeft { peer: peer.clone() });

        self.process_registry_events();
        if self.state == SessionState::HostLost && self.registry.host().is_none() {
            // The successor we were waiting on may be gone too
            let previous = self.previous_host.clone();
            self.on_host_lost(previous);
        }
    }

    fn process_registry_events(&mut self) {
        for event in self.registry.take_events() {
            match event {
                RegistryEvent::HostLost { previous } => {
                    self.previous_host = Some(previous.clone());
                    self.on_host_lost(Some(previous));
                }
            }
        }
    }

    /// Every peer picks the same successor: the oldest remaining entry
    fn on_host_lost(&mut self, previous: Option<PeerId>) {
        if !self.state.is_active() {
            return;
        }
        let Some(successor) = self.registry.successor().map(|p| p.id.clone()) else {
            return;
        };

        if successor == self.local_id {
            self.promote_self(previous);
        } else {
            info!("Host lost, waiting for {} to take over", successor);
            self.state = SessionState::HostLost;
        }
    }

    fn promote_self(&mut self, previous: Option<PeerId>) {
        let local = self.local_id.clone();
        if let Err(e) = self.registry.set_role(&local, Role::Host) {
            warn!("Cannot take over as host: {}", e);
            return;
        }
        if let Some(meta) = self.meta.as_mut() {
            meta.host_id = local.clone();
        }
        self.state = SessionState::Hosting;
        self.previous_host = None;
        info!("Taking over as host");

        let claim = self.host_claim("host disconnected");
        self.broadcast(claim);
        self.emit(SessionEvent::HostMigrated {
            previous,
            new_host: local,
        });
    }

    fn adopt_host(&mut self, new_host: PeerId) {
        let previous = self
            .registry
            .host_id()
            .cloned()
            .or_else(|| self.previous_host.take());
        if let Err(e) = self.registry.set_role(&new_host, Role::Host) {
            warn!("Cannot adopt {} as host: {}", new_host, e);
            return;
        }
        if let Some(meta) = self.meta.as_mut() {
            meta.host_id = new_host.clone();
        }
        self.state = SessionState::Connected;
        self.previous_host = None;
        info!("{} is now the host", new_host);
        self.emit(SessionEvent::HostMigrated { previous, new_host });
    }

    /// Give up the host role to an older peer and get back in sync with it
    ///
    /// `host` describes `new_host` when it is missing from the registry,
    /// which happens when we dropped it before claiming the role.
    fn yield_host(&mut self, new_host: PeerId, host: Option<&PeerSnapshot>) {
        if !self.registry.contains(&new_host) {
            let Some(snapshot) = host.filter(|s| s.id == new_host) else {
                debug!("Cannot yield to unknown {}", new_host);
                return;
            };
            let entry = PeerSnapshot {
                role: Role::Member,
                state: None,
                ..snapshot.clone()
            };
            if let Err(e) = self.registry.insert_snapshot(&entry) {
                warn!("Cannot register {}: {}", new_host, e);
                return;
            }
        }

        warn!("{} is still hosting, stepping down", new_host);
        self.emit(SessionEvent::HostConflict {
            claimant: self.local_id.clone(),
            current: new_host.clone(),
        });
        self.adopt_host(new_host.clone());

        let connected = self
            .registry
            .get_peer(&new_host)
            .is_some_and(|p| p.is_connected() && p.transport.is_some());
        // A peer under supervision sends the rejoin once its redial succeeds
        if connected {
            self.request_rejoin(&new_host);
        } else if !self.supervisor.is_reconnecting(&new_host) {
            match self.claim_unclaimed(&new_host) {
                Some(handle) => {
                    self.attach(handle, &new_host);
                    self.request_rejoin(&new_host);
                }
                None => self.link_lost(&new_host),
            }
        }
    }

    fn fail_join(&mut self, error: SessionError) {
        warn!("Join failed: {}", error);
        self.release_all();
        self.state = SessionState::Idle;
        self.emit(SessionEvent::JoinFailed { error });
    }

    /// Close every link and forget all session state
    fn release_all(&mut self) {
        let handles: Vec<ConnectionHandle> = self
            .registry
            .list_peers()
            .iter()
            .filter_map(|p| p.transport)
            .chain(self.unclaimed.keys().copied())
            .collect();
        for handle in handles {
            self.transport.close(handle);
        }

        self.unclaimed.clear();
        self.dialed.clear();
        self.registry.clear();
        self.sync.clear();
        self.prediction.clear();
        self.supervisor.clear();
        self.last_applied_action.clear();
        self.awaiting_candidates.clear();
        self.awaiting_transfer = false;
        self.previous_host = None;
        self.meta = None;
    }

    /// Bring the registry in line with a transfer from the host
    ///
    /// On the first transfer after joining the registry is rebuilt in the
    /// host's order; later ones (after a rejoin) only add what is missing.
    fn apply_transfer(&mut self, peers: &[PeerSnapshot], meta: &SessionMeta, rebuild: bool) {
        let mut links: HashMap<PeerId, ConnectionHandle> = HashMap::new();
        if rebuild {
            links = self
                .registry
                .list_peers()
                .iter()
                .filter_map(|p| p.transport.map(|handle| (p.id.clone(), handle)))
                .collect();
            self.registry.clear();
        }
        self.registry.set_max_peers(meta.max_peers);
        self.meta = Some(meta.clone());

        let now = self.now;
        let mut to_dial = Vec::new();
        for snapshot in peers {
            let is_local = snapshot.id == self.local_id;
            if self.registry.contains(&snapshot.id) {
                if snapshot.role == Role::Host && self.registry.host_id() != Some(&snapshot.id) {
                    let _ = self.registry.set_role(&snapshot.id, Role::Host);
                }
                continue;
            }

            let link = match links.remove(&snapshot.id) {
                Some(handle) => Some(handle),
                None => self.claim_unclaimed(&snapshot.id),
            };
            match self.registry.insert_snapshot(snapshot) {
                Ok(entry) => {
                    if is_local {
                        entry.status = PeerStatus::Local;
                        entry.remote_state = None;
                    } else if let Some(handle) = link {
                        entry.transport = Some(handle);
                        entry.status = PeerStatus::Connected;
                    } else {
                        to_dial.push(snapshot.id.clone());
                    }
                }
                Err(e) => {
                    warn!("Skipping {} from transfer: {}", snapshot.id, e);
                    continue;
                }
            }

            if !is_local {
                if let Some(state) = &snapshot.state {
                    self.sync.ingest(&snapshot.id, state.sequence, state.clone(), now);
                }
            }
        }
        for (_, handle) in links {
            self.close_link(handle);
        }

        for peer in to_dial {
            self.connect_peer(&peer);
        }

        let ids = self.registry.list_peers().iter().map(|p| p.id.clone()).collect();
        self.emit(SessionEvent::StateTransferred { peers: ids });
    }

    fn reject_join(&mut self, handle: ConnectionHandle, joiner: &PeerId, reason: &str) {
        info!("Rejecting join from {}: {}", joiner, reason);
        self.send_on(
            handle,
            Message::JoinRejected {
                reason: reason.to_string(),
            },
        );
    }
}

type HandlerFn = fn(&mut SessionCore, &Envelope);

fn build_router() -> MessageRouter<SessionCore> {
    let handlers: [(MessageType, HandlerFn); 10] = [
        (MessageType::PlayerState, on_player_state),
        (MessageType::GameAction, on_game_action),
        (MessageType::ActionAck, on_action_ack),
        (MessageType::JoinRequest, on_join_request),
        (MessageType::JoinAccepted, on_join_accepted),
        (MessageType::JoinRejected, on_join_rejected),
        (MessageType::GameState, on_game_state),
        (MessageType::PeerJoined, on_peer_joined),
        (MessageType::HostMigration, on_host_migration),
        (MessageType::PlayerLeft, on_player_left),
    ];

    let mut router = MessageRouter::new();
    for (kind, handler) in handlers {
        router.register(kind, guarded(kind, handler));
    }
    router
}

/// Drop messages whose sender does not match the link they came on.
/// Echoes of our own messages only matter for actions.
fn guarded(
    kind: MessageType,
    handler: HandlerFn,
) -> impl FnMut(&mut SessionCore, &Envelope) + Send + 'static {
    move |core: &mut SessionCore, envelope: &Envelope| {
        if envelope.sender_id == core.local_id {
            if kind != MessageType::GameAction {
                trace!("Ignoring echo of own {}", kind);
                return;
            }
        } else if let Some((handle, link_peer)) = &core.inbound {
            if *link_peer != envelope.sender_id {
                warn!(
                    "Dropping {} from {} received on {}'s link {}",
                    kind, envelope.sender_id, link_peer, handle
                );
                return;
            }
        }
        handler(core, envelope);
    }
}

fn on_player_state(core: &mut SessionCore, envelope: &Envelope) {
    let Message::PlayerState { state, .. } = &envelope.message else {
        return;
    };
    let sender = &envelope.sender_id;
    if state.owner_id != *sender {
        warn!("{} sent state owned by {}, dropped", sender, state.owner_id);
        return;
    }
    if !core.registry.contains(sender) {
        trace!("State from unregistered {}, dropped", sender);
        return;
    }

    let now = core.now;
    if core.sync.ingest(sender, envelope.seq, state.clone(), now) == IngestOutcome::Accepted {
        if let Some(peer) = core.registry.get_peer_mut(sender) {
            peer.last_seen_snapshot_seq = Some(envelope.seq);
            peer.last_heartbeat_at = Some(now);
            peer.remote_state = Some(state.clone());
        }
    }
}

fn on_game_action(core: &mut SessionCore, envelope: &Envelope) {
    let Message::GameAction {
        action_type,
        action_data,
        ..
    } = &envelope.message
    else {
        return;
    };
    let sender = &envelope.sender_id;

    if *sender == core.local_id {
        let id = ActionId {
            owner_id: sender.clone(),
            sequence: envelope.seq,
        };
        core.prediction.confirm(&id);
        debug!("Own action {} echoed back, not applied again", envelope.seq);
        return;
    }
    if !core.registry.contains(sender) {
        debug!("Action from unregistered {}, dropped", sender);
        return;
    }

    let last = core.last_applied_action.get(sender).copied().unwrap_or(0);
    if envelope.seq <= last {
        debug!("Duplicate action {} from {}, dropped", envelope.seq, sender);
        core.duplicate_actions += 1;
        return;
    }
    core.last_applied_action.insert(sender.clone(), envelope.seq);

    if let Some(handler) = core.remote_action_handler.as_mut() {
        handler(sender, action_type, action_data);
    }
    core.actions_applied += 1;

    core.send_to(
        sender,
        Message::ActionAck {
            owner_id: sender.clone(),
            seq: envelope.seq,
        },
    );
}

fn on_action_ack(core: &mut SessionCore, envelope: &Envelope) {
    let Message::ActionAck { owner_id, seq } = &envelope.message else {
        return;
    };
    if *owner_id != core.local_id {
        return;
    }
    let id = ActionId {
        owner_id: owner_id.clone(),
        sequence: *seq,
    };
    if core.prediction.acknowledge(&id, &envelope.sender_id) {
        trace!("Action {} confirmed by every peer", seq);
    }
}

fn on_join_request(core: &mut SessionCore, envelope: &Envelope) {
    let Message::JoinRequest {
        session_meta,
        rejoin,
    } = &envelope.message
    else {
        return;
    };
    let Some((handle, _)) = core.inbound.clone() else {
        return;
    };
    let joiner = envelope.sender_id.clone();

    if core.state != SessionState::Hosting {
        core.reject_join(handle, &joiner, REJECT_NOT_HOST);
        return;
    }
    if session_meta.mode != core.config.mode {
        core.reject_join(handle, &joiner, REJECT_MODE_MISMATCH);
        return;
    }

    let now = core.now;
    let known = core.registry.contains(&joiner);
    if known {
        info!("Peer {} rejoined (requested rejoin: {})", joiner, rejoin);
        core.supervisor.on_recovered(&joiner);
    } else {
        if core.registry.len() >= core.registry.max_peers() {
            core.reject_join(handle, &joiner, REJECT_FULL);
            return;
        }
        match core.registry.add_peer(joiner.clone(), Role::Member) {
            Ok(peer) => {
                peer.transport = Some(handle);
                peer.status = PeerStatus::Connected;
                peer.last_heartbeat_at = Some(now);
            }
            Err(e) => {
                warn!("Cannot register {}: {}", joiner, e);
                core.reject_join(handle, &joiner, REJECT_FULL);
                return;
            }
        }
        core.unclaimed.remove(&handle);
    }

    let current_count = core.registry.len();
    let max_peers = core.registry.max_peers();
    core.send_on(
        handle,
        Message::JoinAccepted {
            assigned_peer_id: joiner.clone(),
            current_count,
            max_peers,
        },
    );
    if let Some(meta) = core.meta.clone() {
        let peers = core.session_snapshots();
        core.send_on(
            handle,
            Message::GameState {
                peers,
                session_meta: meta,
            },
        );
    }

    if !known {
        if let Some(snapshot) = core.registry.get_peer(&joiner).map(Peer::snapshot) {
            core.broadcast_except(&joiner, Message::PeerJoined { peer: snapshot });
        }
        info!("Accepted {} ({}/{})", joiner, current_count, max_peers);
        core.emit(SessionEvent::PeerJoined { peer: joiner });
    }
}

fn on_join_accepted(core: &mut SessionCore, envelope: &Envelope) {
    let Message::JoinAccepted {
        assigned_peer_id,
        current_count,
        max_peers,
    } = &envelope.message
    else {
        return;
    };
    let host = match &core.state {
        SessionState::Joining { host, .. } => host.clone(),
        _ => {
            debug!("Rejoin acknowledged by {}", envelope.sender_id);
            return;
        }
    };
    if envelope.sender_id != host {
        warn!("JOIN_ACCEPTED from {} while joining {}", envelope.sender_id, host);
        return;
    }
    if *assigned_peer_id != core.local_id {
        core.fail_join(SessionError::JoinDenied(format!(
            "host acknowledged {} instead of {}",
            assigned_peer_id, core.local_id
        )));
        return;
    }

    info!(
        "Joined session hosted by {} ({}/{})",
        host, current_count, max_peers
    );
    core.registry.set_max_peers(*max_peers);
    core.state = SessionState::Connected;
    core.awaiting_transfer = true;
    core.emit(SessionEvent::Joined {
        assigned_id: assigned_peer_id.clone(),
        host_id: host,
    });
}

fn on_join_rejected(core: &mut SessionCore, envelope: &Envelope) {
    let Message::JoinRejected { reason } = &envelope.message else {
        return;
    };
    let joining_host =
        matches!(&core.state, SessionState::Joining { host, .. } if *host == envelope.sender_id);
    if !joining_host {
        debug!("Unexpected JOIN_REJECTED from {}", envelope.sender_id);
        return;
    }

    let error = if reason == REJECT_FULL {
        SessionError::CapacityExceeded {
            max_peers: core.registry.max_peers(),
        }
    } else {
        SessionError::JoinDenied(reason.clone())
    };
    core.fail_join(error);
}

fn on_game_state(core: &mut SessionCore, envelope: &Envelope) {
    let Message::GameState {
        peers,
        session_meta,
    } = &envelope.message
    else {
        return;
    };
    if core.registry.host_id() != Some(&envelope.sender_id) {
        warn!("GAME_STATE from non-host {}, dropped", envelope.sender_id);
        return;
    }

    if core.awaiting_transfer {
        core.awaiting_transfer = false;
        core.apply_transfer(peers, session_meta, true);
    } else if core.state.is_active() {
        core.apply_transfer(peers, session_meta, false);
    }
}

fn on_peer_joined(core: &mut SessionCore, envelope: &Envelope) {
    let Message::PeerJoined { peer } = &envelope.message else {
        return;
    };
    if core.registry.host_id() != Some(&envelope.sender_id) {
        warn!("PEER_JOINED from non-host {}, dropped", envelope.sender_id);
        return;
    }
    if peer.id == core.local_id || core.registry.contains(&peer.id) {
        return;
    }

    let link = core.claim_unclaimed(&peer.id);
    match core.registry.insert_snapshot(peer) {
        Ok(entry) => {
            if let Some(handle) = link {
                entry.transport = Some(handle);
                entry.status = PeerStatus::Connected;
            }
        }
        Err(e) => {
            warn!("Cannot register {}: {}", peer.id, e);
            if let Some(handle) = link {
                core.close_link(handle);
            }
            return;
        }
    }
    if let Some(state) = &peer.state {
        let now = core.now;
        core.sync.ingest(&peer.id, state.sequence, state.clone(), now);
    }
    // The newcomer dials us; supervise in case it never does
    if link.is_none() {
        core.link_lost(&peer.id);
    }

    info!("{} joined the session", peer.id);
    core.emit(SessionEvent::PeerJoined {
        peer: peer.id.clone(),
    });
}

fn on_host_migration(core: &mut SessionCore, envelope: &Envelope) {
    let Message::HostMigration {
        new_host_id,
        reason,
        host,
    } = &envelope.message
    else {
        return;
    };
    let sender = &envelope.sender_id;
    if new_host_id != sender {
        on_host_redirect(core, sender, new_host_id, host.as_ref());
        return;
    }

    let registered = core.registry.get_peer(sender).map(|p| p.join_order);
    let claimed = host
        .as_ref()
        .filter(|snapshot| snapshot.id == *sender)
        .map(|snapshot| snapshot.join_order);

    if core.is_host() {
        let Some(claimant_order) = registered.or(claimed) else {
            debug!("Host claim from unknown {} without join order, dropped", sender);
            return;
        };
        let own_order = core
            .registry
            .get_peer(&core.local_id)
            .map(|p| p.join_order)
            .unwrap_or(u64::MAX);
        if claimant_order < own_order {
            info!("{} joined earlier, stepping down as host", sender);
            core.yield_host(sender.clone(), host.as_ref());
        } else {
            info!("Rejecting host claim from {}", sender);
            let claim = core.host_claim("host reasserted");
            core.reply(sender, claim);
        }
        return;
    }

    let Some(claimant_order) = registered else {
        debug!("Host claim from unregistered {}, dropped", sender);
        return;
    };
    let current = match core.registry.host() {
        Some(h) if h.id == *sender => return,
        Some(h) if h.is_connected() && h.join_order < claimant_order => Some(h.snapshot()),
        _ => None,
    };
    match current {
        None => {
            info!("Host migration to {} ({})", sender, reason);
            core.adopt_host(sender.clone());
        }
        Some(current) => {
            warn!(
                "{} claims host while {} is still connected, redirecting",
                sender, current.id
            );
            core.emit(SessionEvent::HostConflict {
                claimant: sender.clone(),
                current: current.id.clone(),
            });
            core.reply(
                sender,
                Message::HostMigration {
                    new_host_id: current.id.clone(),
                    reason: "host still connected".to_string(),
                    host: Some(current),
                },
            );
        }
    }
}

/// A peer tells us `named` is the host; only a competing host acts on it
fn on_host_redirect(
    core: &mut SessionCore,
    sender: &PeerId,
    named: &PeerId,
    host: Option<&PeerSnapshot>,
) {
    if !core.is_host() || !core.registry.contains(sender) || *named == core.local_id {
        debug!("Ignoring host redirect to {} from {}", named, sender);
        return;
    }
    let named_order = core
        .registry
        .get_peer(named)
        .map(|p| p.join_order)
        .or_else(|| host.filter(|s| s.id == *named).map(|s| s.join_order));
    let own_order = core
        .registry
        .get_peer(&core.local_id)
        .map(|p| p.join_order)
        .unwrap_or(u64::MAX);
    match named_order {
        Some(order) if order < own_order => core.yield_host(named.clone(), host),
        _ => debug!("{} named {} as host, keeping the role", sender, named),
    }
}

fn on_player_left(core: &mut SessionCore, envelope: &Envelope) {
    let Message::PlayerLeft { peer_id } = &envelope.message else {
        return;
    };
    let sender = &envelope.sender_id;
    let from_host = core.registry.host_id() == Some(sender);
    if peer_id != sender && !from_host {
        warn!("{} announced departure of {}, dropped", sender, peer_id);
        return;
    }
    if *peer_id == core.local_id {
        debug!("Ignoring PLAYER_LEFT about ourselves");
        return;
    }

    info!("{} left the session", peer_id);
    core.drop_peer(peer_id, false);
}
