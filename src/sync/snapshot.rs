//! State synchronization engine
//!
//! Owns the local player's authoritative state and one track per remote
//! peer. Inbound snapshots only ever move a track forward in sequence;
//! presentation eases toward the newest target and freezes when the
//! peer has gone quiet.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::interpolation::Smoother;
use crate::protocol::{PeerId, PlayerState};

/// Synchronization tuning
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Broadcast rate of the local state
    pub tick_rate_hz: u32,
    /// Silence after which a remote peer is frozen
    pub stale_timeout: Duration,
    /// Longest a target is projected forward along its velocity
    pub max_extrapolation: Duration,
    /// Convergence factor of the smoother, see [`Smoother`]
    pub convergence: f32,
}

impl SyncConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let tick_rate_hz = 60;
        Self {
            tick_rate_hz,
            stale_timeout: Duration::from_secs_f64(3.0 / f64::from(tick_rate_hz)),
            max_extrapolation: Duration::from_millis(100),
            convergence: 10.0,
        }
    }
}

/// Result of offering a snapshot to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Sequence not newer than the last accepted one
    Stale,
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub accepted: u64,
    pub stale_discarded: u64,
    pub marked_stale: u64,
}

#[derive(Debug, Clone)]
struct RemoteTrack {
    last_accepted_seq: u64,
    target: PlayerState,
    target_received_at: Instant,
    presented: PlayerState,
    last_presented_at: Instant,
    smoother: Smoother,
    stale: bool,
}

/// Broadcasts the local state and smooths remote ones
pub struct StateSyncEngine {
    config: SyncConfig,
    local: PlayerState,
    last_broadcast_at: Option<Instant>,
    remotes: HashMap<PeerId, RemoteTrack>,
    stats: SyncStats,
}

impl StateSyncEngine {
    pub fn new(local_id: PeerId, config: SyncConfig) -> Self {
        Self {
            config,
            local: PlayerState::new(local_id),
            last_broadcast_at: None,
            remotes: HashMap::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local_state(&self) -> &PlayerState {
        &self.local
    }

    /// Mutable access for the owner; `sequence` is managed by the engine
    pub fn local_state_mut(&mut self) -> &mut PlayerState {
        &mut self.local
    }

    /// Whether a broadcast interval has elapsed since the last snapshot
    pub fn broadcast_due(&self, now: Instant) -> bool {
        match self.last_broadcast_at {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.config.broadcast_interval(),
        }
    }

    /// Stamp the local state with `seq` and return a copy to broadcast
    pub fn take_snapshot(&mut self, seq: u64, now: Instant) -> PlayerState {
        self.local.sequence = seq;
        self.last_broadcast_at = Some(now);
        self.local.clone()
    }

    /// Offer a remote snapshot
    ///
    /// The first snapshot from a peer is presented as is; later ones become
    /// the new interpolation target.
    pub fn ingest(&mut self, peer: &PeerId, seq: u64, state: PlayerState, now: Instant) -> IngestOutcome {
        match self.remotes.get_mut(peer) {
            Some(track) if seq <= track.last_accepted_seq => {
                trace!(
                    "Discarding stale snapshot from {}: seq {} <= {}",
                    peer,
                    seq,
                    track.last_accepted_seq
                );
                self.stats.stale_discarded += 1;
                IngestOutcome::Stale
            }
            Some(track) => {
                if track.stale {
                    debug!("Peer {} is fresh again", peer);
                    // Resume from where it froze without carrying momentum
                    track.smoother.halt();
                    track.last_presented_at = now;
                }
                track.last_accepted_seq = seq;
                track.target = state;
                track.target_received_at = now;
                track.stale = false;
                self.stats.accepted += 1;
                IngestOutcome::Accepted
            }
            None => {
                let smoother =
                    Smoother::for_interval(self.config.broadcast_interval(), self.config.convergence);
                self.remotes.insert(
                    peer.clone(),
                    RemoteTrack {
                        last_accepted_seq: seq,
                        target: state.clone(),
                        target_received_at: now,
                        presented: state,
                        last_presented_at: now,
                        smoother,
                        stale: false,
                    },
                );
                self.stats.accepted += 1;
                IngestOutcome::Accepted
            }
        }
    }

    /// Advance every remote presentation to `now`
    pub fn interpolate(&mut self, now: Instant) {
        let stale_timeout = self.config.stale_timeout;
        let max_extrapolation = self.config.max_extrapolation;

        for (peer, track) in self.remotes.iter_mut() {
            let dt = now.saturating_duration_since(track.last_presented_at);
            track.last_presented_at = now;

            if track.stale {
                continue;
            }
            let age = now.saturating_duration_since(track.target_received_at);
            if age > stale_timeout {
                debug!("Peer {} stale after {:?} without a snapshot", peer, age);
                track.stale = true;
                track.smoother.halt();
                self.stats.marked_stale += 1;
                continue;
            }

            let lead = age.min(max_extrapolation).as_secs_f32();
            let goal = track.target.position + track.target.velocity * lead;

            let position = track.smoother.step(track.presented.position, goal, dt);
            let rotation =
                track
                    .smoother
                    .step_rotation(track.presented.rotation, track.target.rotation, dt);

            track.presented = PlayerState {
                position,
                rotation,
                ..track.target.clone()
            };
        }
    }

    /// Presented state of every remote peer
    pub fn presented_states(&self) -> HashMap<PeerId, PlayerState> {
        self.remotes
            .iter()
            .map(|(peer, track)| (peer.clone(), track.presented.clone()))
            .collect()
    }

    pub fn presented(&self, peer: &PeerId) -> Option<&PlayerState> {
        self.remotes.get(peer).map(|track| &track.presented)
    }

    /// Latest accepted snapshot of a peer, before smoothing
    pub fn target(&self, peer: &PeerId) -> Option<&PlayerState> {
        self.remotes.get(peer).map(|track| &track.target)
    }

    pub fn is_stale(&self, peer: &PeerId) -> bool {
        self.remotes.get(peer).is_some_and(|track| track.stale)
    }

    pub fn last_accepted_seq(&self, peer: &PeerId) -> Option<u64> {
        self.remotes.get(peer).map(|track| track.last_accepted_seq)
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.remotes.remove(peer);
    }

    /// Forget every remote peer
    pub fn clear(&mut self) {
        self.remotes.clear();
        self.last_broadcast_at = None;
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }
}
