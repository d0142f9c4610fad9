//! Binary protocol between editing clients and the collaborator.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ┌──────────┬───────────┬───────────────┬──────────┐
//! │ msg_type │ peer_id   │ document      │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8   │ variable │
//! └──────────┴───────────┴───────────────┴──────────┘
//! ```
//!
//! A session starts with `Join` (payload: [`JoinRequest`]). The server
//! answers with `SyncStep2` carrying the full document state, after which
//! both sides exchange `Update` payloads (Yrs v1 updates).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Open a document session
    Join = 1,
    /// Yrs state vector, asks for the missing diff
    SyncStep1 = 2,
    /// Yrs update answering a join or a SyncStep1
    SyncStep2 = 3,
    /// Incremental Yrs update
    Update = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
    /// Server-side rejection, payload is a UTF-8 reason
    Error = 7,
}

/// Payload of a `Join` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Session token issued by the platform
    pub token: String,
    /// Document to seed from when the joined document has no content yet
    pub initial_content_id: Option<String>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub document: String,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a join request.
    pub fn join(peer_id: Uuid, document: impl Into<String>, request: &JoinRequest) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(request, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Join,
            peer_id,
            document: document.into(),
            payload,
        })
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(peer_id: Uuid, document: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            peer_id,
            document: document.into(),
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff).
    pub fn sync_step2(peer_id: Uuid, document: impl Into<String>, diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            peer_id,
            document: document.into(),
            payload: diff,
        }
    }

    /// Create an update message.
    pub fn update(peer_id: Uuid, document: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            document: document.into(),
            payload: update,
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            document: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            document: String::new(),
            payload: Vec::new(),
        }
    }

    /// Create an error message with a human-readable reason.
    pub fn error(document: impl Into<String>, reason: &str) -> Self {
        Self {
            msg_type: MessageType::Error,
            peer_id: Uuid::nil(),
            document: document.into(),
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (request, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(request)
    }

    /// Reason carried by an `Error` message.
    pub fn error_reason(&self) -> Option<String> {
        (self.msg_type == MessageType::Error)
            .then(|| String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
}
