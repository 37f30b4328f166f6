//! Reconnection supervisor
//!
//! Tracks peers whose link failed and decides when to retry and when to
//! give up. It never touches a transport itself: the coordinator asks
//! which attempts are due and reports how they went.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::protocol::PeerId;

/// Retry schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt, also the time allowed per attempt
    pub base: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based): `base * 2^(attempt - 1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// What happens next for a peer whose link went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAt { attempt: u32, at: Instant },
    /// Budget spent; the peer should be removed
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Waiting { retry_at: Instant },
    InFlight { deadline: Instant },
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    attempt: u32,
    phase: Phase,
}

/// Bounded retry with exponential backoff, per peer
#[derive(Debug)]
pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
    entries: HashMap<PeerId, Entry>,
}

impl ReconnectionSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// A link to `peer` failed. Starts supervision, or counts as a failed
    /// attempt when already supervising.
    pub fn on_link_lost(&mut self, peer: &PeerId, now: Instant) -> ReconnectDecision {
        if self.entries.contains_key(peer) {
            return self.on_attempt_failed(peer, now);
        }
        let at = now + self.policy.delay_for(1);
        info!("Lost link to {}, first retry in {:?}", peer, at - now);
        self.entries.insert(
            peer.clone(),
            Entry {
                attempt: 1,
                phase: Phase::Waiting { retry_at: at },
            },
        );
        ReconnectDecision::RetryAt { attempt: 1, at }
    }

    /// Attempts whose backoff has elapsed, now marked in flight
    ///
    /// Sorted by peer id so every run schedules in the same order.
    pub fn due(&mut self, now: Instant) -> Vec<(PeerId, u32)> {
        let base = self.policy.base;
        let mut due: Vec<(PeerId, u32)> = self
            .entries
            .iter_mut()
            .filter_map(|(peer, entry)| match entry.phase {
                Phase::Waiting { retry_at } if retry_at <= now => {
                    entry.phase = Phase::InFlight {
                        deadline: now + base,
                    };
                    Some((peer.clone(), entry.attempt))
                }
                _ => None,
            })
            .collect();
        due.sort();
        due
    }

    /// In-flight attempts that outlived their deadline
    pub fn expired_attempts(&self, now: Instant) -> Vec<PeerId> {
        let mut expired: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.phase, Phase::InFlight { deadline } if deadline <= now)
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        expired.sort();
        expired
    }

    /// The current attempt for `peer` failed
    pub fn on_attempt_failed(&mut self, peer: &PeerId, now: Instant) -> ReconnectDecision {
        let Some(entry) = self.entries.get_mut(peer) else {
            return self.on_link_lost(peer, now);
        };

        if entry.attempt >= self.policy.max_attempts {
            let attempts = entry.attempt;
            self.entries.remove(peer);
            info!("Giving up on {} after {} attempts", peer, attempts);
            return ReconnectDecision::Exhausted { attempts };
        }

        entry.attempt += 1;
        let at = now + self.policy.delay_for(entry.attempt);
        entry.phase = Phase::Waiting { retry_at: at };
        debug!("Attempt {} for {} scheduled in {:?}", entry.attempt, peer, at - now);
        ReconnectDecision::RetryAt {
            attempt: entry.attempt,
            at,
        }
    }

    /// Link restored. Returns the attempt that succeeded.
    pub fn on_recovered(&mut self, peer: &PeerId) -> Option<u32> {
        let entry = self.entries.remove(peer)?;
        info!("Reconnected to {} on attempt {}", peer, entry.attempt);
        Some(entry.attempt)
    }

    /// Stop supervising without a verdict
    pub fn forget(&mut self, peer: &PeerId) {
        self.entries.remove(peer);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_reconnecting(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn attempt(&self, peer: &PeerId) -> Option<u32> {
        self.entries.get(peer).map(|entry| entry.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_backoff_exponentially_grows() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let mut supervisor = ReconnectionSupervisor::new(policy());
        let peer = PeerId::new("b");
        let mut now = Instant::now();

        let mut decision = supervisor.on_link_lost(&peer, now);
        let mut attempts_run = 0;
        loop {
            match decision {
                ReconnectDecision::RetryAt { at, attempt } => {
                    now = at;
                    assert_eq!(supervisor.due(now), vec![(peer.clone(), attempt)]);
                    attempts_run += 1;
                    decision = supervisor.on_attempt_failed(&peer, now);
                }
                ReconnectDecision::Exhausted { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
            }
        }
        assert_eq!(attempts_run, 5);
        assert!(!supervisor.is_reconnecting(&peer));
    }

    #[test]
    fn test_in_flight_attempt_expires() {
        let mut supervisor = ReconnectionSupervisor::new(policy());
        let peer = PeerId::new("b");
        let start = Instant::now();

        supervisor.on_link_lost(&peer, start);
        assert!(supervisor.due(start).is_empty());

        let first = start + Duration::from_millis(100);
        assert_eq!(supervisor.due(first).len(), 1);
        // Already in flight, not handed out twice
        assert!(supervisor.due(first).is_empty());

        assert!(supervisor.expired_attempts(first).is_empty());
        let late = first + Duration::from_millis(100);
        assert_eq!(supervisor.expired_attempts(late), vec![peer.clone()]);
    }

    #[test]
    fn test_recovery_clears_state() {
        let mut supervisor = ReconnectionSupervisor::new(policy());
        let peer = PeerId::new("b");
        let now = Instant::now();

        supervisor.on_link_lost(&peer, now);
        supervisor.on_attempt_failed(&peer, now);
        assert_eq!(supervisor.attempt(&peer), Some(2));
        assert_eq!(supervisor.on_recovered(&peer), Some(2));
        assert!(!supervisor.is_reconnecting(&peer));
        assert_eq!(supervisor.attempt(&peer), None);
    }
}
