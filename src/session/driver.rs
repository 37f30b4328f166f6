//! Async driver for a [`Session`]
//!
//! The session itself is synchronous. The driver owns it on a tokio task,
//! feeds it transport events and timer ticks, and serves commands from any
//! number of [`SessionHandle`] clones.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::coordinator::{Session, SessionEvent, SessionInfo, SessionStats};
use super::error::SessionError;
use crate::network::TransportEventReceiver;
use crate::protocol::{ActionId, PeerId, PlayerState, SessionMeta};

/// Mutation applied to the local player on the session task
pub type StateUpdate = Box<dyn FnOnce(&mut PlayerState) + Send + 'static>;

/// Point-in-time view of a running session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub info: SessionInfo,
    pub stats: SessionStats,
    pub local: PlayerState,
    pub remote: HashMap<PeerId, PlayerState>,
}

enum SessionCommand {
    Create {
        reply: oneshot::Sender<Result<SessionMeta, SessionError>>,
    },
    Join {
        host: PeerId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Leave {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Action {
        action_type: String,
        action_data: Value,
        predict: StateUpdate,
        reply: oneshot::Sender<Result<ActionId, SessionError>>,
    },
    UpdateLocal(StateUpdate),
    AddCandidates {
        peer: PeerId,
        candidates: Vec<SocketAddr>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

/// Cloneable handle to a session running on its own task
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Stopped)?;
        response.await.map_err(|_| SessionError::Stopped)
    }

    pub async fn create(&self) -> Result<SessionMeta, SessionError> {
        self.request(|reply| SessionCommand::Create { reply }).await?
    }

    pub async fn join(&self, host: PeerId) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Join { host, reply })
            .await?
    }

    pub async fn leave(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Leave { reply }).await?
    }

    pub async fn perform_action<F>(
        &self,
        action_type: &str,
        action_data: Value,
        predict: F,
    ) -> Result<ActionId, SessionError>
    where
        F: FnOnce(&mut PlayerState) + Send + 'static,
    {
        let action_type = action_type.to_string();
        self.request(|reply| SessionCommand::Action {
            action_type,
            action_data,
            predict: Box::new(predict),
            reply,
        })
        .await?
    }

    /// Mutate the local player; the next broadcast carries the change
    pub fn update_local<F>(&self, update: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut PlayerState) + Send + 'static,
    {
        self.commands
            .send(SessionCommand::UpdateLocal(Box::new(update)))
            .map_err(|_| SessionError::Stopped)
    }

    pub fn add_candidates(
        &self,
        peer: PeerId,
        candidates: Vec<SocketAddr>,
    ) -> Result<(), SessionError> {
        self.commands
            .send(SessionCommand::AddCandidates { peer, candidates })
            .map_err(|_| SessionError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    /// Stop the task, leaving the session first if still in one
    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

/// Spawns the session task
pub struct SessionDriver;

impl SessionDriver {
    /// Run `session` on a new task
    ///
    /// `transport_events` must be the receiver paired with the sender the
    /// session's transport was built with.
    pub fn spawn(
        session: Session,
        transport_events: TransportEventReceiver,
    ) -> (
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(session, transport_events, commands_rx, events_tx));
        (
            SessionHandle {
                commands: commands_tx,
            },
            events_rx,
            task,
        )
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn run(
    mut session: Session,
    mut transport_events: TransportEventReceiver,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut ticker = tokio::time::interval(session.config().broadcast_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Session task for {} started", session.local_id());

    loop {
        tokio::select! {
            Some(event) = transport_events.recv() => {
                session.handle_transport_event(event, now());
            }
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => apply(&mut session, command),
                }
            }
            _ = ticker.tick() => {
                let now = now();
                session.tick(now);
                session.update_presentation(now);
            }
        }

        forward_events(&mut session, &events);
    }

    if session.state().is_active() {
        let _ = session.leave(now());
        forward_events(&mut session, &events);
    }
    info!("Session task for {} stopped", session.local_id());
}

fn forward_events(session: &mut Session, events: &mpsc::UnboundedSender<SessionEvent>) {
    for event in session.drain_events() {
        if events.send(event).is_err() {
            debug!("No event listener, dropping session events");
        }
    }
}

fn apply(session: &mut Session, command: SessionCommand) {
    match command {
        SessionCommand::Create { reply } => {
            let _ = reply.send(session.create(now()));
        }
        SessionCommand::Join { host, reply } => {
            let _ = reply.send(session.join(host, now()));
        }
        SessionCommand::Leave { reply } => {
            let _ = reply.send(session.leave(now()));
        }
        SessionCommand::Action {
            action_type,
            action_data,
            predict,
            reply,
        } => {
            let result = session.perform_action(&action_type, action_data, now(), predict);
            let _ = reply.send(result);
        }
        SessionCommand::UpdateLocal(update) => update(session.local_state_mut()),
        SessionCommand::AddCandidates { peer, candidates } => {
            session.add_remote_candidate(&peer, candidates);
        }
        SessionCommand::Snapshot { reply } => {
            let _ = reply.send(SessionSnapshot {
                info: session.info(),
                stats: session.stats(),
                local: session.local_state().clone(),
                remote: session.interpolated_remote_states(),
            });
        }
        SessionCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{event_channel, MemoryNetwork};
    use crate::session::SessionConfig;

    #[tokio::test]
    async fn test_shutdown_reports_left() {
        let network = MemoryNetwork::new();
        let (tx, rx) = event_channel();
        let transport = network.endpoint(PeerId::new("a"), tx);
        let session = Session::new(SessionConfig::default(), PeerId::new("a"), Box::new(transport));
        let (handle, mut events, task) = SessionDriver::spawn(session, rx);

        handle.create().await.unwrap();
        assert!(matches!(events.recv().await, Some(SessionEvent::Hosting { .. })));

        handle.shutdown();
        task.await.unwrap();

        let mut rest = Vec::new();
        while let Ok(event) = events.try_recv() {
            rest.push(event);
        }
        assert!(
            rest.iter().any(|e| matches!(e, SessionEvent::Left)),
            "shutdown events: {:?}",
            rest
        );
    }
}
