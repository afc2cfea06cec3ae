use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A malformed relay frame. Contained by the dispatch loop; never a panic.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One message exchanged with the relay, encoded as a JSON text frame.
///
/// The negotiation `payload` inside [`Envelope::PeerSignal`] is opaque to
/// the manager; it belongs to the peer-connection implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Register {
        uuid: Uuid,
        name: String,
    },
    RegisterAck {
        uuid: Uuid,
    },
    PeerSignal {
        source_uuid: Uuid,
        source_name: String,
        peer_uuid: Uuid,
        payload: Value,
    },
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Register { .. } => "register",
            Envelope::RegisterAck { .. } => "register_ack",
            Envelope::PeerSignal { .. } => "peer_signal",
        }
    }
}

pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
    Ok(serde_json::from_str(frame)?)
}

pub fn encode(envelope: &Envelope) -> Result<String, DecodeError> {
    Ok(serde_json::to_string(envelope)?)
}
