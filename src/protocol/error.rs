//! Protocol error types

use thiserror::Error;

/// Errors raised while encoding or decoding envelopes
///
/// None of these are fatal to a session: inbound failures are logged,
/// counted and the message dropped.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Malformed message: missing field {0}")]
    MissingField(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}
