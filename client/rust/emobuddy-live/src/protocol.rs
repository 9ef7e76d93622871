//! Wire messages exchanged with the live endpoint.
//!
//! Audio travels as binary WebSocket frames holding raw little-endian PCM16
//! mono. Everything else is a JSON text frame tagged by `"type"`.

use crate::error::TransportError;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    AudioChunk(Bytes),
    ControlEvent(ControlKind),
    Error { code: u16, message: String },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    /// The model finished its turn.
    TurnComplete,
    /// The user talked over the model; queued speech is stale.
    Interrupted,
    GenerationComplete,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Setup {
        protocol_version: u32,
        input_sample_rate: u32,
        output_sample_rate: u32,
    },

    Ready {
        protocol_version: u32,
    },

    Event {
        kind: ControlKind,
    },

    Error {
        code: u16,
        message: String,
    },
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, TransportError> {
    serde_json::to_string(envelope).map_err(|e| TransportError::Protocol(e.to_string()))
}

pub fn decode_envelope(text: &str) -> Result<Envelope, TransportError> {
    serde_json::from_str::<Envelope>(text).map_err(|e| TransportError::Protocol(e.to_string()))
}

impl WireMessage {
    pub fn is_audio(&self) -> bool {
        matches!(self, WireMessage::AudioChunk(_))
    }

    pub fn into_ws_message(self) -> Result<Message, TransportError> {
        let envelope = match self {
            WireMessage::AudioChunk(bytes) => return Ok(Message::Binary(bytes)),
            WireMessage::ControlEvent(kind) => Envelope::Event { kind },
            WireMessage::Error { code, message } => Envelope::Error { code, message },
        };
        Ok(Message::Text(encode_envelope(&envelope)?.into()))
    }

    /// Maps a session envelope. Handshake envelopes are only valid before the
    /// session starts.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, TransportError> {
        match envelope {
            Envelope::Event { kind } => Ok(WireMessage::ControlEvent(kind)),
            Envelope::Error { code, message } => Ok(WireMessage::Error { code, message }),
            Envelope::Setup { .. } | Envelope::Ready { .. } => Err(TransportError::Protocol(
                "handshake message received mid-session".to_string(),
            )),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, TransportError> {
        Self::from_envelope(decode_envelope(text)?)
    }
}
