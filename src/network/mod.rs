//! Network module for P2P communication
//!
//! Handles the transport contract, its in-process and TCP implementations,
//! and the signaling relay used to exchange address candidates.

mod error;
mod memory;
mod signaling;
mod tcp;
mod transport;

pub use error::NetworkError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use signaling::{SignalingClient, SignalingConnection, SignalingMessage, SignalingServer};
pub use tcp::{TcpTransport, MAX_FRAME_LEN};
pub use transport::{
    event_channel, ConnectionHandle, IceConfig, Transport, TransportEvent, TransportEventReceiver,
    TransportEventSender, TransportState, DEFAULT_ICE_SERVERS,
};
