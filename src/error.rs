//! Error taxonomy shared by the relay, publisher and resolver.

use std::time::Duration;

use thiserror::Error;

use crate::nip44::CryptoError;

/// Malformed wire message. The relay drops these and keeps the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not json: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("frame is not a json array with a command")]
    NotCommand,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed {command} message: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },
}

/// Failure turning record content back into a directory payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no wrapped session key for {0}")]
    NotARecipient(String),

    #[error("wrapped session key is invalid: {0}")]
    InvalidSessionKey(String),

    #[error("invalid author key: {0}")]
    InvalidAuthor(String),
}

/// Top-level error for publish and resolve operations.
#[derive(Debug, Error)]
pub enum Ncc05Error {
    /// Connection or transport failure talking to a relay.
    #[error("network failure: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A relay answered `OK false`.
    #[error("relay rejected event: {0}")]
    Rejected(String),

    #[error("encryption failed: {0}")]
    Encrypt(CryptoError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Invalid request, e.g. decryption without a key. Aborts immediately.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("key error: {0}")]
    Key(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Ncc05Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Ncc05Error::Network(e.to_string())
    }
}
