//! Session protocol definitions
//!
//! Defines the data model, the typed message set and the envelope codec.

mod error;
mod message;
mod router;
mod types;

pub use error::ProtocolError;
pub use message::{
    Envelope, Message, MessageType, REJECT_FULL, REJECT_MODE_MISMATCH, REJECT_NOT_HOST,
};
pub use router::{decode, encode, Handler, MessageRouter, RouterStats};
pub use types::{
    unix_millis, Action, ActionId, GameMode, JoinIntent, PeerId, PeerSnapshot, PlayerState,
    Role, Rotation, SessionMeta, Vec3,
};
