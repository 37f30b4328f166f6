//! Signaling relay and client
//!
//! Peers register under their peer id and exchange connection offers,
//! answers and address candidates through the relay before opening
//! direct links. The relay never carries game traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::error::NetworkError;
use crate::protocol::PeerId;

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalingMessage {
    // Client -> Server
    Register {
        peer_id: PeerId,
    },
    Unregister,

    // Relayed between clients
    Offer {
        from: PeerId,
        to: PeerId,
        candidates: Vec<SocketAddr>,
    },
    Answer {
        from: PeerId,
        to: PeerId,
        candidates: Vec<SocketAddr>,
    },
    IceCandidate {
        from: PeerId,
        to: PeerId,
        candidate: SocketAddr,
    },

    // Server -> Client
    Registered {
        peer_id: PeerId,
    },
    PeerUnavailable {
        peer_id: PeerId,
    },
    Error {
        message: String,
    },
}

impl SignalingMessage {
    /// Recipient of a relayed message
    pub fn recipient(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::IceCandidate { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Stamp the sender as registered on the relay
    fn with_sender(mut self, sender: &PeerId) -> Self {
        match &mut self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Answer { from, .. }
            | SignalingMessage::IceCandidate { from, .. } => *from = sender.clone(),
            _ => {}
        }
        self
    }
}

type PeerTable = Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<SignalingMessage>>>>;

/// Relay that forwards messages between registered peers
pub struct SignalingServer {
    peers: PeerTable,
}

impl SignalingServer {
    /// Create a new signaling server
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind and serve until the task is dropped
    pub async fn run(&self, addr: &str) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Bind failed: {}", e)))?;

        info!("Signaling server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetworkError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New signaling connection from {}", peer_addr);
                    let peers = self.peers.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peers).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Ids of currently registered peers
    pub async fn registered_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, peers: PeerTable) -> Result<(), NetworkError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| NetworkError::SignalingError(format!("WebSocket accept failed: {}", e)))?;

    let (mut write, mut read) = ws_stream.split();
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    let mut registered: Option<PeerId> = None;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(msg) => {
                                let response =
                                    process_message(msg, &peers, &relay_tx, &mut registered).await;
                                if let Some(resp) = response {
                                    if send_ws(&mut write, &resp).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("Invalid message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            relayed = relay_rx.recv() => {
                if let Some(msg) = relayed {
                    if send_ws(&mut write, &msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Clean up on disconnect
    if let Some(peer_id) = registered {
        peers.write().await.remove(&peer_id);
        info!("Peer {} unregistered (disconnected)", peer_id);
    }

    Ok(())
}

async fn send_ws<S>(write: &mut S, msg: &SignalingMessage) -> Result<(), NetworkError>
where
    S: Sink<Message> + Unpin,
{
    let json = serde_json::to_string(msg)
        .map_err(|e| NetworkError::SignalingError(format!("Serialize failed: {}", e)))?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|_| NetworkError::SignalingError("Send failed".to_string()))
}

/// Process a signaling message
async fn process_message(
    msg: SignalingMessage,
    peers: &PeerTable,
    relay_tx: &mpsc::UnboundedSender<SignalingMessage>,
    registered: &mut Option<PeerId>,
) -> Option<SignalingMessage> {
    match msg {
        SignalingMessage::Register { peer_id } => {
            let mut peers_guard = peers.write().await;
            if registered.as_ref() != Some(&peer_id) && peers_guard.contains_key(&peer_id) {
                return Some(SignalingMessage::Error {
                    message: format!("Peer id {} already registered", peer_id),
                });
            }
            if let Some(previous) = registered.take() {
                peers_guard.remove(&previous);
            }
            peers_guard.insert(peer_id.clone(), relay_tx.clone());
            *registered = Some(peer_id.clone());

            info!("Peer {} registered", peer_id);
            Some(SignalingMessage::Registered { peer_id })
        }

        SignalingMessage::Unregister => {
            if let Some(peer_id) = registered.take() {
                peers.write().await.remove(&peer_id);
                info!("Peer {} unregistered", peer_id);
            }
            None
        }

        msg @ (SignalingMessage::Offer { .. }
        | SignalingMessage::Answer { .. }
        | SignalingMessage::IceCandidate { .. }) => {
            let Some(sender) = registered.as_ref() else {
                return Some(SignalingMessage::Error {
                    message: "Register before relaying".to_string(),
                });
            };
            let to = msg.recipient().cloned()?;

            let peers_guard = peers.read().await;
            match peers_guard.get(&to) {
                Some(target) if target.send(msg.with_sender(sender)).is_ok() => {
                    debug!("Relayed message {} -> {}", sender, to);
                    None
                }
                _ => Some(SignalingMessage::PeerUnavailable { peer_id: to }),
            }
        }

        // These are server->client messages, ignore if received
        _ => None,
    }
}

/// Signaling client for connecting to a signaling server
pub struct SignalingClient {
    server_url: String,
}

impl SignalingClient {
    /// Create a new signaling client
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }

    /// Connect to the signaling server
    pub async fn connect(&self) -> Result<SignalingConnection, NetworkError> {
        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Connect failed: {}", e)))?;

        debug!("Connected to signaling server: {}", self.server_url);

        Ok(SignalingConnection { ws_stream })
    }

    /// Connect and register under `peer_id`
    pub async fn register(&self, peer_id: &PeerId) -> Result<SignalingConnection, NetworkError> {
        let mut conn = self.connect().await?;
        conn.send(SignalingMessage::Register {
            peer_id: peer_id.clone(),
        })
        .await?;

        match conn.recv().await? {
            SignalingMessage::Registered { .. } => Ok(conn),
            SignalingMessage::Error { message } => Err(NetworkError::SignalingError(message)),
            other => Err(NetworkError::SignalingError(format!(
                "Unexpected reply to register: {:?}",
                other
            ))),
        }
    }
}

/// An active connection to the signaling server
pub struct SignalingConnection {
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl SignalingConnection {
    /// Send a message to the server
    pub async fn send(&mut self, msg: SignalingMessage) -> Result<(), NetworkError> {
        let json = serde_json::to_string(&msg)
            .map_err(|e| NetworkError::SignalingError(format!("Serialize failed: {}", e)))?;

        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Send failed: {}", e)))?;

        Ok(())
    }

    /// Receive a message from the server
    pub async fn recv(&mut self) -> Result<SignalingMessage, NetworkError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        NetworkError::SignalingError(format!("Deserialize failed: {}", e))
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(NetworkError::SignalingError("Connection closed".to_string()));
                }
                Some(Err(e)) => {
                    return Err(NetworkError::SignalingError(format!(
                        "Receive failed: {}",
                        e
                    )));
                }
                _ => continue,
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Close failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_message_serialize() {
        let msg = SignalingMessage::Offer {
            from: PeerId::new("alice"),
            to: PeerId::new("bob"),
            candidates: vec!["127.0.0.1:7000".parse().unwrap()],
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"Offer""#));
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_sender_is_overwritten() {
        let msg = SignalingMessage::IceCandidate {
            from: PeerId::new("mallory"),
            to: PeerId::new("bob"),
            candidate: "10.0.0.1:7000".parse().unwrap(),
        };

        match msg.with_sender(&PeerId::new("alice")) {
            SignalingMessage::IceCandidate { from, to, .. } => {
                assert_eq!(from, PeerId::new("alice"));
                assert_eq!(to, PeerId::new("bob"));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_recipient() {
        assert_eq!(SignalingMessage::Unregister.recipient(), None);
        let answer = SignalingMessage::Answer {
            from: PeerId::new("a"),
            to: PeerId::new("b"),
            candidates: vec![],
        };
        assert_eq!(answer.recipient(), Some(&PeerId::new("b")));
    }
}
