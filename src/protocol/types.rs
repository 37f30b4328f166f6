//! Core data model shared by every layer of the session
//!
//! Peer identity, player snapshots, gameplay actions and the session
//! metadata exchanged during the join handshake.

use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque identifier of a participant, unique for the session's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier that is never reused
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(format!("player_{}", &id[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Role of a peer inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts new joins and owns the session metadata
    Host,
    /// Any other participant
    Member,
}

/// 3D vector used for position and velocity
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(self, other: Vec3) -> f32 {
        (self - other).length()
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;

    fn mul(self, rhs: f32) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// View orientation in radians
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    pub pitch: f32,
    pub yaw: f32,
}

/// Snapshot of one player's state
///
/// Mutated only by its owner; receivers replace it wholesale when a
/// snapshot with a newer sequence arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub owner_id: PeerId,
    pub position: Vec3,
    pub rotation: Rotation,
    pub velocity: Vec3,
    pub health: f32,
    /// Game-specific fields carried opaquely
    #[serde(default)]
    pub custom: Value,
    pub sequence: u64,
}

impl PlayerState {
    /// Fresh state at the origin with full health
    pub fn new(owner_id: PeerId) -> Self {
        Self {
            owner_id,
            position: Vec3::ZERO,
            rotation: Rotation::default(),
            velocity: Vec3::ZERO,
            health: 100.0,
            custom: Value::Null,
            sequence: 0,
        }
    }
}

/// Identity of an action: owner plus the owner's sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionId {
    pub owner_id: PeerId,
    pub sequence: u64,
}

/// A discrete gameplay event such as "collected item"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: ActionId,
    pub action_type: String,
    pub payload: Value,
    pub issued_at_ms: u64,
}

/// Game mode, which also decides the default capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    #[default]
    Coop,
    /// One hunter against the rest
    Asymmetric,
    Competitive,
}

impl GameMode {
    /// Default number of participants, host included
    pub fn default_max_peers(self) -> usize {
        match self {
            GameMode::Coop => 4,
            GameMode::Asymmetric => 4,
            GameMode::Competitive => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Coop => "coop",
            GameMode::Asymmetric => "asymmetric",
            GameMode::Competitive => "competitive",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coop" => Ok(GameMode::Coop),
            "asymmetric" => Ok(GameMode::Asymmetric),
            "competitive" => Ok(GameMode::Competitive),
            other => Err(format!(
                "Unknown game mode: {}. Valid modes are coop, asymmetric, competitive",
                other
            )),
        }
    }
}

/// Canonical session metadata, held by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub mode: GameMode,
    pub max_peers: usize,
    pub host_id: PeerId,
    pub created_at_ms: u64,
}

/// What a joiner expects of the session it asks to enter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinIntent {
    pub mode: GameMode,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// One entry of the ordered peer list transferred to joiners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub role: Role,
    pub join_order: u64,
    #[serde(default)]
    pub state: Option<PlayerState>,
}

/// Wall-clock milliseconds since the Unix epoch, for message timestamps
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("player_"));
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::new("alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"alice\"");
    }

    #[test]
    fn test_vec3_arithmetic() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(0.5, 0.5, 0.5);
        assert_eq!(a + b, Vec3::new(1.5, 2.5, 3.5));
        assert_eq!(a - b, Vec3::new(0.5, 1.5, 2.5));
        assert_eq!(b * 2.0, Vec3::new(1.0, 1.0, 1.0));
        assert!((Vec3::new(3.0, 4.0, 0.0).length() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_game_mode_capacity() {
        assert_eq!(GameMode::Coop.default_max_peers(), 4);
        assert_eq!(GameMode::Asymmetric.default_max_peers(), 4);
        assert_eq!(GameMode::Competitive.default_max_peers(), 8);
    }

    #[test]
    fn test_game_mode_parse() {
        assert_eq!("Competitive".parse::<GameMode>(), Ok(GameMode::Competitive));
        assert!("deathmatch".parse::<GameMode>().is_err());
    }

    #[test]
    fn test_player_state_wire_names() {
        let state = PlayerState::new(PeerId::new("p1"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["ownerId"], "p1");
        assert_eq!(json["health"], 100.0);
    }
}
