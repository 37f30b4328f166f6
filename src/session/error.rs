//! Session error types

use thiserror::Error;

use crate::network::NetworkError;
use crate::protocol::PeerId;

/// Errors surfaced by the session coordinator
#[derive(Error, Debug)]
pub enum SessionError {
    /// Join refused because the session is at capacity; not retried
    #[error("Session is full ({max_peers} peers)")]
    CapacityExceeded { max_peers: usize },

    /// Terminal for the join attempt that produced it
    #[error("Join denied: {0}")]
    JoinDenied(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Not in a session")]
    NotInSession,

    #[error("Peer {0} is already registered")]
    DuplicatePeer(PeerId),

    /// The task driving the session has ended
    #[error("Session task stopped")]
    Stopped,

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
