//! Network error types

use thiserror::Error;

use crate::protocol::PeerId;

/// Errors that can occur in the transport and signaling layers
///
/// Link-level failures are recoverable through the reconnection
/// supervisor; only failing to set up the local transport is fatal.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("No address candidates for peer {0}")]
    NoCandidates(PeerId),

    #[error("Peer {0} is not reachable")]
    PeerUnreachable(PeerId),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signaling error: {0}")]
    SignalingError(String),
}
