//! meshplay - Peer-to-peer real-time multiplayer state synchronization
//!
//! Every peer holds a full mesh of links to every other peer. One of them
//! hosts: it admits newcomers and hands them the session state. Player
//! snapshots and actions travel directly between peers, remote players are
//! smoothed toward their latest snapshot, and when the host disappears the
//! oldest remaining peer takes over.

pub mod network;
pub mod protocol;
pub mod session;
pub mod sync;

pub use network::{MemoryNetwork, TcpTransport, Transport, TransportEvent};
pub use protocol::{GameMode, PeerId, PlayerState};
pub use session::{Session, SessionConfig, SessionDriver, SessionEvent, SessionHandle};
