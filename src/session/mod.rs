//! Session management
//!
//! Peer registry, the coordinator state machine with host migration,
//! reconnection supervision and the async driver.

mod config;
mod coordinator;
mod driver;
mod error;
mod reconnect;
mod registry;

pub use config::SessionConfig;
pub use coordinator::{
    RemoteActionHandler, Session, SessionEvent, SessionInfo, SessionState, SessionStats,
};
pub use driver::{SessionDriver, SessionHandle, SessionSnapshot, StateUpdate};
pub use error::SessionError;
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectionSupervisor};
pub use registry::{Peer, PeerRegistry, PeerStatus, RegistryEvent};
