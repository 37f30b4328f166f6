//! Prediction and reconciliation buffer
//!
//! Local actions are applied immediately and remembered here until every
//! peer that was present when they were issued has acknowledged them.
//! Mispredictions are never rolled back: the last predicted effect
//! stands, so action effects must be commutative at the game boundary.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::protocol::{Action, ActionId, PeerId, PlayerState};

/// A locally predicted action awaiting confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub action: Action,
    /// Local state right after the prediction was applied
    pub predicted_effect: PlayerState,
    pub confirmed: bool,
    /// Peers that have not acknowledged yet
    pub awaiting: BTreeSet<PeerId>,
    pub recorded_at: Instant,
}

/// Diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionStats {
    pub recorded: u64,
    pub confirmed: u64,
    /// Dropped unconfirmed to make room
    pub evicted: u64,
    /// Dropped unconfirmed after the retention window
    pub expired: u64,
}

/// Bounded buffer of pending local actions, oldest first
pub struct PredictionBuffer {
    capacity: usize,
    retention: Duration,
    pending: VecDeque<PendingAction>,
    stats: PredictionStats,
}

impl PredictionBuffer {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            retention,
            pending: VecDeque::with_capacity(capacity),
            stats: PredictionStats::default(),
        }
    }

    /// Remember a predicted action
    ///
    /// With nobody to wait for the action is confirmed on the spot and not
    /// kept. When the buffer is full the oldest entry is evicted and
    /// returned; its prediction stands.
    pub fn record(
        &mut self,
        action: Action,
        predicted_effect: PlayerState,
        awaiting: BTreeSet<PeerId>,
        now: Instant,
    ) -> Option<PendingAction> {
        self.stats.recorded += 1;
        if awaiting.is_empty() {
            trace!("Action {:?} confirmed immediately", action.id);
            self.stats.confirmed += 1;
            return None;
        }

        let evicted = if self.pending.len() >= self.capacity {
            let oldest = self.pending.pop_front();
            if let Some(ref entry) = oldest {
                debug!(
                    "Prediction buffer full, evicting action {}#{}",
                    entry.action.id.owner_id, entry.action.id.sequence
                );
                self.stats.evicted += 1;
            }
            oldest
        } else {
            None
        };

        self.pending.push_back(PendingAction {
            action,
            predicted_effect,
            confirmed: false,
            awaiting,
            recorded_at: now,
        });
        evicted
    }

    /// Record that `from` applied the action. Returns true when this
    /// completed the confirmation.
    pub fn acknowledge(&mut self, id: &ActionId, from: &PeerId) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let entry = &mut self.pending[index];
        entry.awaiting.remove(from);
        if entry.awaiting.is_empty() {
            self.finish(index);
            true
        } else {
            false
        }
    }

    /// Confirm an action outright, e.g. on seeing its own echo
    pub fn confirm(&mut self, id: &ActionId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.finish(index);
                true
            }
            None => false,
        }
    }

    /// Stop waiting on a departed peer; returns the number of actions this confirmed
    pub fn peer_gone(&mut self, peer: &PeerId) -> usize {
        for entry in self.pending.iter_mut() {
            entry.awaiting.remove(peer);
        }
        let before = self.pending.len();
        self.pending.retain(|entry| !entry.awaiting.is_empty());
        let confirmed = before - self.pending.len();
        self.stats.confirmed += confirmed as u64;
        confirmed
    }

    /// Drop entries older than the retention window
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.pending.len();
        self.pending
            .retain(|entry| now.saturating_duration_since(entry.recorded_at) < retention);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!("Expired {} unconfirmed actions", expired);
        }
        self.stats.expired += expired as u64;
        expired
    }

    pub fn get(&self, id: &ActionId) -> Option<&PendingAction> {
        self.pending.iter().find(|entry| &entry.action.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn stats(&self) -> PredictionStats {
        self.stats
    }

    fn position(&self, id: &ActionId) -> Option<usize> {
        self.pending.iter().position(|entry| &entry.action.id == id)
    }

    fn finish(&mut self, index: usize) {
        if let Some(mut entry) = self.pending.remove(index) {
            entry.confirmed = true;
            trace!(
                "Action {}#{} confirmed",
                entry.action.id.owner_id,
                entry.action.id.sequence
            );
            self.stats.confirmed += 1;
        }
    }
}
