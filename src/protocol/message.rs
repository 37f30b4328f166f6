//! Typed session messages
//!
//! Every message travels inside an [`Envelope`] of
//! `{type, senderId, seq, payload}`. `ICE_CANDIDATE` is deliberately absent:
//! candidates are exchanged through the signaling relay, never over a
//! peer link.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{JoinIntent, PeerId, PeerSnapshot, PlayerState, SessionMeta};

/// Wire discriminant of a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PlayerState,
    GameAction,
    ActionAck,
    JoinRequest,
    JoinAccepted,
    JoinRejected,
    GameState,
    PeerJoined,
    HostMigration,
    PlayerLeft,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::PlayerState,
        MessageType::GameAction,
        MessageType::ActionAck,
        MessageType::JoinRequest,
        MessageType::JoinAccepted,
        MessageType::JoinRejected,
        MessageType::GameState,
        MessageType::PeerJoined,
        MessageType::HostMigration,
        MessageType::PlayerLeft,
    ];

    /// Tag used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::PlayerState => "PLAYER_STATE",
            MessageType::GameAction => "GAME_ACTION",
            MessageType::ActionAck => "ACTION_ACK",
            MessageType::JoinRequest => "JOIN_REQUEST",
            MessageType::JoinAccepted => "JOIN_ACCEPTED",
            MessageType::JoinRejected => "JOIN_REJECTED",
            MessageType::GameState => "GAME_STATE",
            MessageType::PeerJoined => "PEER_JOINED",
            MessageType::HostMigration => "HOST_MIGRATION",
            MessageType::PlayerLeft => "PLAYER_LEFT",
        }
    }

    /// Parse a wire tag, `None` for types this protocol does not know
    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason string sent when the session is at capacity
pub const REJECT_FULL: &str = "full";
/// Reason string sent when the joiner expects another game mode
pub const REJECT_MODE_MISMATCH: &str = "mode mismatch";
/// Reason string sent by a peer that is not the host
pub const REJECT_NOT_HOST: &str = "not host";

/// Session message, one variant per wire type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Periodic snapshot of the sender's player
    #[serde(rename_all = "camelCase")]
    PlayerState { state: PlayerState, timestamp: u64 },

    /// Discrete gameplay event, identified by (senderId, seq)
    #[serde(rename_all = "camelCase")]
    GameAction {
        action_type: String,
        #[serde(default)]
        action_data: Value,
        timestamp: u64,
    },

    /// Receiver confirms it applied an action
    #[serde(rename_all = "camelCase")]
    ActionAck { owner_id: PeerId, seq: u64 },

    #[serde(rename_all = "camelCase")]
    JoinRequest {
        session_meta: JoinIntent,
        #[serde(default)]
        rejoin: bool,
    },

    #[serde(rename_all = "camelCase")]
    JoinAccepted {
        assigned_peer_id: PeerId,
        current_count: usize,
        max_peers: usize,
    },

    #[serde(rename_all = "camelCase")]
    JoinRejected { reason: String },

    /// Full catch-up transfer from host to a new joiner
    #[serde(rename_all = "camelCase")]
    GameState {
        peers: Vec<PeerSnapshot>,
        session_meta: SessionMeta,
    },

    /// Host tells existing members about a newly accepted peer
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer: PeerSnapshot },

    /// Claims the host role for the sender, or points the receiver at the
    /// real host when `new_host_id` is someone else. `host` describes
    /// `new_host_id` so a receiver that lost track of it can order it.
    #[serde(rename_all = "camelCase")]
    HostMigration {
        new_host_id: PeerId,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<PeerSnapshot>,
    },

    #[serde(rename_all = "camelCase")]
    PlayerLeft { peer_id: PeerId },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::PlayerState { .. } => MessageType::PlayerState,
            Message::GameAction { .. } => MessageType::GameAction,
            Message::ActionAck { .. } => MessageType::ActionAck,
            Message::JoinRequest { .. } => MessageType::JoinRequest,
            Message::JoinAccepted { .. } => MessageType::JoinAccepted,
            Message::JoinRejected { .. } => MessageType::JoinRejected,
            Message::GameState { .. } => MessageType::GameState,
            Message::PeerJoined { .. } => MessageType::PeerJoined,
            Message::HostMigration { .. } => MessageType::HostMigration,
            Message::PlayerLeft { .. } => MessageType::PlayerLeft,
        }
    }
}

/// A message together with its sender and per-sender sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender_id: PeerId,
    /// Monotonic per sender across all message types
    pub seq: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender_id: PeerId, seq: u64, message: Message) -> Self {
        Self {
            sender_id,
            seq,
            message,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}
