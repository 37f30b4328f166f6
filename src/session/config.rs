//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::reconnect::ReconnectPolicy;
use crate::network::IceConfig;
use crate::protocol::GameMode;
use crate::sync::SyncConfig;

/// Session configuration
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use meshplay::session::SessionConfig;
///
/// let config = SessionConfig::from_json(r#"{"mode": "competitive"}"#).unwrap();
/// assert_eq!(config.max_peers(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: GameMode,
    /// Capacity including the host (default: decided by `mode`)
    pub max_peers: Option<usize>,
    /// Local state broadcasts per second (default: 60, 1..=240)
    pub tick_rate_hz: u32,
    /// Silence before a remote peer is frozen (default: 3 broadcast intervals)
    pub stale_timeout_ms: Option<u64>,
    pub max_extrapolation_ms: u64,
    /// Smoother stiffness times broadcast interval (default: 10.0, >= 1.0)
    pub convergence: f32,
    /// Pending predicted actions kept (default: 20)
    pub action_buffer_capacity: usize,
    pub action_retention_ms: u64,
    pub join_timeout_ms: u64,
    /// First reconnection backoff; later ones double (default: 5000)
    pub reconnection_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub max_reconnect_backoff_ms: u64,
    pub ice: IceConfig,
}

impl SessionConfig {
    /// Validate and normalize the configuration
    ///
    /// Returns a validated config with:
    /// - tick_rate_hz clamped to 1..=240
    /// - max_peers, when given, clamped to 2..=64
    /// - convergence >= 1.0 so the smoother still settles within an interval
    /// - action_buffer_capacity and max_reconnect_attempts >= 1
    /// - max_reconnect_backoff_ms >= reconnection_timeout_ms
    pub fn validated(self) -> Self {
        let convergence = if self.convergence.is_finite() {
            self.convergence.max(1.0)
        } else {
            10.0
        };
        let reconnection_timeout_ms = self.reconnection_timeout_ms.max(1);

        Self {
            max_peers: self.max_peers.map(|n| n.clamp(2, 64)),
            tick_rate_hz: self.tick_rate_hz.clamp(1, 240),
            convergence,
            action_buffer_capacity: self.action_buffer_capacity.max(1),
            reconnection_timeout_ms,
            max_reconnect_attempts: self.max_reconnect_attempts.max(1),
            max_reconnect_backoff_ms: self.max_reconnect_backoff_ms.max(reconnection_timeout_ms),
            ..self
        }
    }

    /// Parse a JSON document, filling gaps with defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::validated)
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
            .unwrap_or_else(|| self.mode.default_max_peers())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }

    pub fn stale_timeout(&self) -> Duration {
        match self.stale_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.broadcast_interval() * 3,
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn action_retention(&self) -> Duration {
        Duration::from_millis(self.action_retention_ms)
    }

    pub fn reconnection_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnection_timeout_ms)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            tick_rate_hz: self.tick_rate_hz,
            stale_timeout: self.stale_timeout(),
            max_extrapolation: Duration::from_millis(self.max_extrapolation_ms),
            convergence: self.convergence,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: self.reconnection_timeout(),
            max_backoff: Duration::from_millis(self.max_reconnect_backoff_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: GameMode::Coop,
            max_peers: None,
            tick_rate_hz: 60,
            stale_timeout_ms: None,
            max_extrapolation_ms: 100,
            convergence: 10.0,
            action_buffer_capacity: 20,
            action_retention_ms: 5_000,
            join_timeout_ms: 10_000,
            reconnection_timeout_ms: 5_000,
            max_reconnect_attempts: 5,
            max_reconnect_backoff_ms: 60_000,
            ice: IceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_peers(), 4);
        assert_eq!(config.stale_timeout(), config.broadcast_interval() * 3);
        assert_eq!(config.reconnect_policy().max_attempts, 5);
        assert_eq!(config.reconnection_timeout(), Duration::from_secs(5));
        assert_eq!(config.ice.servers.len(), 2);
    }

    #[test]
    fn test_validated_clamps() {
        let config = SessionConfig {
            max_peers: Some(1),
            tick_rate_hz: 0,
            convergence: 0.2,
            action_buffer_capacity: 0,
            max_reconnect_attempts: 0,
            reconnection_timeout_ms: 2_000,
            max_reconnect_backoff_ms: 500,
            ..Default::default()
        }
        .validated();

        assert_eq!(config.max_peers(), 2);
        assert_eq!(config.tick_rate_hz, 1);
        assert_eq!(config.convergence, 1.0);
        assert_eq!(config.action_buffer_capacity, 1);
        assert_eq!(config.max_reconnect_attempts, 1);
        assert_eq!(config.max_reconnect_backoff_ms, 2_000);
    }

    #[test]
    fn test_partial_json() {
        let config = SessionConfig::from_json(r#"{"mode": "competitive", "tickRateHz": 5}"#);
        // Field names are snake_case; unknown keys are ignored
        let config = config.unwrap();
        assert_eq!(config.max_peers(), 8);
        assert_eq!(config.tick_rate_hz, 60);

        let config = SessionConfig::from_json(r#"{"tick_rate_hz": 20, "max_peers": 3}"#).unwrap();
        assert_eq!(config.tick_rate_hz, 20);
        assert_eq!(config.max_peers(), 3);
        assert_eq!(config.stale_timeout(), Duration::from_millis(150));
    }
}
