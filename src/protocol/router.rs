//! Envelope codec and typed handler registry
//!
//! Wire format is a flat JSON object:
//! `{"type": "...", "senderId": "...", "seq": 7, "payload": {...}}`

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{trace, warn};

use super::error::ProtocolError;
use super::message::{Envelope, Message, MessageType};
use super::types::PeerId;

/// Serialize an envelope to bytes
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let mut value = serde_json::to_value(&envelope.message)?;
    let object = value
        .as_object_mut()
        .ok_or(ProtocolError::MissingField("type"))?;
    object.insert("senderId".to_string(), json!(envelope.sender_id));
    object.insert("seq".to_string(), json!(envelope.seq));
    Ok(serde_json::to_vec(&value)?)
}

/// Deserialize bytes into an envelope
///
/// Unknown types are reported separately from malformed payloads so the
/// caller can count them apart.
pub fn decode(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let mut value: Value = serde_json::from_slice(bytes)?;
    let object = value
        .as_object_mut()
        .ok_or(ProtocolError::MissingField("type"))?;

    let tag = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("type"))?;
    if MessageType::from_wire(tag).is_none() {
        return Err(ProtocolError::UnknownType(tag.to_string()));
    }

    let sender_id: PeerId = serde_json::from_value(
        object
            .remove("senderId")
            .ok_or(ProtocolError::MissingField("senderId"))?,
    )?;
    let seq = object
        .remove("seq")
        .and_then(|v| v.as_u64())
        .ok_or(ProtocolError::MissingField("seq"))?;

    let message: Message = serde_json::from_value(value)?;
    Ok(Envelope {
        sender_id,
        seq,
        message,
    })
}

/// Handler invoked with the routing context and the decoded envelope
pub type Handler<C> = Box<dyn FnMut(&mut C, &Envelope) + Send + 'static>;

/// Counters for traffic the router could not deliver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub dispatched: u64,
    pub malformed: u64,
    pub unknown_type: u64,
    pub unhandled: u64,
}

/// Routes decoded envelopes to the handler registered for their type
///
/// Dispatch is synchronous and never buffers or retries. The context `C`
/// is passed in by the caller so handlers can mutate session state
/// without the router owning it.
pub struct MessageRouter<C> {
    handlers: HashMap<MessageType, Handler<C>>,
    stats: RouterStats,
}

impl<C> MessageRouter<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            stats: RouterStats::default(),
        }
    }

    /// Register a handler, returning the one it replaces
    pub fn register<F>(&mut self, kind: MessageType, handler: F) -> Option<Handler<C>>
    where
        F: FnMut(&mut C, &Envelope) + Send + 'static,
    {
        self.handlers.insert(kind, Box::new(handler))
    }

    /// Remove the handler for a type
    pub fn unregister(&mut self, kind: MessageType) -> Option<Handler<C>> {
        self.handlers.remove(&kind)
    }

    pub fn has_handler(&self, kind: MessageType) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Dispatch a decoded envelope. Returns false when no handler is registered.
    pub fn dispatch(&mut self, ctx: &mut C, envelope: &Envelope) -> bool {
        let kind = envelope.message_type();
        match self.handlers.get_mut(&kind) {
            Some(handler) => {
                trace!(
                    "Dispatching {} from {} seq={}",
                    kind,
                    envelope.sender_id,
                    envelope.seq
                );
                handler(ctx, envelope);
                self.stats.dispatched += 1;
                true
            }
            None => {
                warn!("No handler for {} from {}, dropped", kind, envelope.sender_id);
                self.stats.unhandled += 1;
                false
            }
        }
    }

    /// Decode raw bytes and dispatch them
    ///
    /// Decode failures are logged and dropped. Returns the dispatched type.
    pub fn route(&mut self, ctx: &mut C, from: &PeerId, bytes: &[u8]) -> Option<MessageType> {
        match decode(bytes) {
            Ok(envelope) => {
                let kind = envelope.message_type();
                self.dispatch(ctx, &envelope).then_some(kind)
            }
            Err(ProtocolError::UnknownType(tag)) => {
                warn!("Unknown message type {} from {}, dropped", tag, from);
                self.stats.unknown_type += 1;
                None
            }
            Err(e) => {
                warn!("Dropping message from {}: {}", from, e);
                self.stats.malformed += 1;
                None
            }
        }
    }
}

impl<C> Default for MessageRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{
        GameMode, JoinIntent, PeerSnapshot, PlayerState, Role, SessionMeta, Vec3,
    };

    fn envelope(message: Message) -> Envelope {
        Envelope::new(PeerId::new("alice"), 42, message)
    }

    fn sample_messages() -> Vec<Message> {
        let mut state = PlayerState::new(PeerId::new("alice"));
        state.position = Vec3::new(1.0, 2.0, 3.0);
        state.sequence = 42;
        let meta = SessionMeta {
            session_id: "s1".to_string(),
            mode: GameMode::Coop,
            max_peers: 4,
            host_id: PeerId::new("alice"),
            created_at_ms: 1_700_000_000_000,
        };
        let snapshot = PeerSnapshot {
            id: PeerId::new("bob"),
            role: Role::Member,
            join_order: 1,
            state: None,
        };

        vec![
            Message::PlayerState {
                state: state.clone(),
                timestamp: 10,
            },
            Message::GameAction {
                action_type: "COLLECT_PELLET".to_string(),
                action_data: json!({"count": 1}),
                timestamp: 11,
            },
            Message::ActionAck {
                owner_id: PeerId::new("bob"),
                seq: 9,
            },
            Message::JoinRequest {
                session_meta: JoinIntent {
                    mode: GameMode::Coop,
                    session_id: None,
                },
                rejoin: false,
            },
            Message::JoinAccepted {
                assigned_peer_id: PeerId::new("bob"),
                current_count: 2,
                max_peers: 4,
            },
            Message::JoinRejected {
                reason: "full".to_string(),
            },
            Message::GameState {
                peers: vec![snapshot.clone()],
                session_meta: meta,
            },
            Message::PeerJoined { peer: snapshot },
            Message::HostMigration {
                new_host_id: PeerId::new("bob"),
                reason: "host disconnected".to_string(),
                host: None,
            },
            Message::PlayerLeft {
                peer_id: PeerId::new("alice"),
            },
        ]
    }

    #[test]
    fn test_every_message_type_round_trips() {
        let messages = sample_messages();
        assert_eq!(messages.len(), MessageType::ALL.len());

        for message in messages {
            let original = envelope(message);
            let bytes = encode(&original).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_envelope_is_flat() {
        let bytes = encode(&envelope(Message::JoinRejected {
            reason: "full".to_string(),
        }))
        .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "JOIN_REJECTED");
        assert_eq!(value["senderId"], "alice");
        assert_eq!(value["seq"], 42);
        assert_eq!(value["payload"]["reason"], "full");
    }

    #[test]
    fn test_decode_unknown_type() {
        let bytes = br#"{"type":"ICE_CANDIDATE","senderId":"a","seq":1,"payload":{}}"#;
        assert!(matches!(
            decode(bytes),
            Err(ProtocolError::UnknownType(tag)) if tag == "ICE_CANDIDATE"
        ));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode(br#"{"type":"PLAYER_LEFT","seq":1,"payload":{"peerId":"a"}}"#),
            Err(ProtocolError::MissingField("senderId"))
        ));
        assert!(matches!(
            decode(br#"{"type":"PLAYER_LEFT","senderId":"a","seq":1,"payload":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_dispatch_routes_by_type() {
        let mut router: MessageRouter<Vec<String>> = MessageRouter::new();
        router.register(MessageType::PlayerLeft, |log, env| {
            log.push(format!("left:{}", env.sender_id));
        });

        let mut log = Vec::new();
        let left = encode(&envelope(Message::PlayerLeft {
            peer_id: PeerId::new("alice"),
        }))
        .unwrap();
        let rejected = encode(&envelope(Message::JoinRejected {
            reason: "full".to_string(),
        }))
        .unwrap();

        let from = PeerId::new("alice");
        assert_eq!(
            router.route(&mut log, &from, &left),
            Some(MessageType::PlayerLeft)
        );
        assert_eq!(router.route(&mut log, &from, &rejected), None);
        assert_eq!(router.route(&mut log, &from, b"{}"), None);

        assert_eq!(log, vec!["left:alice".to_string()]);
        let stats = router.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.unhandled, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn test_register_and_unregister_are_symmetric() {
        let mut router: MessageRouter<u32> = MessageRouter::new();
        assert!(router.register(MessageType::GameAction, |n, _| *n += 1).is_none());
        assert!(router.has_handler(MessageType::GameAction));
        assert!(router.unregister(MessageType::GameAction).is_some());
        assert!(!router.has_handler(MessageType::GameAction));
    }
}
