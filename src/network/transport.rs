//! Transport adapter contract
//!
//! A transport owns direct links to remote peers. It is opened, sent on
//! and closed synchronously; everything it observes (inbound bytes and
//! lifecycle changes) is reported as a [`TransportEvent`] on the channel
//! it was built with. Delivery is ordered within one link only. There is
//! no retry at this layer.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::NetworkError;
use crate::protocol::PeerId;

/// STUN servers used when no configuration is supplied
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Identifies one link inside a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl ConnectionHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a link
///
/// ```text
/// Connecting --> Open --> Closed
///      |           \
///      +-----------> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    /// Closed by either side
    Closed,
    /// Could not be established or broke unexpectedly
    Failed,
}

impl TransportState {
    /// Check if the link is finished for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Connection negotiation parameters handed to [`Transport::open`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN/TURN server URLs
    pub servers: Vec<String>,
    /// Remote addresses learned through signaling
    #[serde(default)]
    pub candidates: Vec<SocketAddr>,
}

impl IceConfig {
    /// Copy of this configuration with the candidates for one peer
    pub fn with_candidates(&self, candidates: Vec<SocketAddr>) -> Self {
        Self {
            servers: self.servers.clone(),
            candidates,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            candidates: Vec::new(),
        }
    }
}

/// Something a transport observed on one of its links
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        handle: ConnectionHandle,
        peer: PeerId,
        state: TransportState,
    },
    Message {
        handle: ConnectionHandle,
        peer: PeerId,
        bytes: Vec<u8>,
    },
}

/// Sending side of a transport's event channel
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving side, drained by the session's event loop
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Create the channel a transport reports into
pub fn event_channel() -> (TransportEventSender, TransportEventReceiver) {
    mpsc::unbounded_channel()
}

/// Direct links to remote peers
///
/// Inbound links opened by remote peers are announced with a
/// `StateChanged { state: Open }` event on a handle the caller has not
/// seen before.
pub trait Transport: Send {
    /// Start opening a link. The outcome arrives as a state event.
    fn open(&mut self, peer: &PeerId, ice: &IceConfig) -> Result<ConnectionHandle, NetworkError>;

    /// Queue bytes on a link, preserving order
    fn send(&mut self, handle: ConnectionHandle, bytes: Vec<u8>) -> Result<(), NetworkError>;

    /// Close a link. Unknown handles are ignored.
    fn close(&mut self, handle: ConnectionHandle);

    /// Whether [`Transport::open`] needs address candidates from signaling
    fn needs_candidates(&self) -> bool {
        false
    }
}
