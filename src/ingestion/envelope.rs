//! # Packet Envelope
//!
//! The `{id, flag, details}` record that moves through every per-call queue.
//! Transport framing (text vs binary, carrier vs orchestration) is decided at
//! the edges; in between, tasks only look at the flag.

use crate::error::{GatewayError, GatewayResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an envelope carries and where it is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Flag {
    /// Handshake frame, or a response issued while opening
    Open,
    /// Caller audio
    Media,
    /// Carrier control frame, or a non-terminal response to one
    Metadata,
    /// Carrier frame of a kind the gateway does not handle
    Unknown,
    /// The carrier finished playing what the orchestration service sent
    EndAudio,
    /// The call is ending on the carrier side
    EndCall,
    /// Synthesized audio to play to the caller
    Say,
    /// End of one synthesized utterance
    Eof,
    /// The orchestration service is done with the call
    End,
}

impl Flag {
    /// Parse a wire flag; `None` for flags this gateway does not know.
    pub fn from_wire(flag: &str) -> Option<Flag> {
        serde_json::from_value(Value::String(flag.to_string())).ok()
    }
}

/// Payload of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Details {
    /// Raw mu-law bytes
    Audio(Vec<u8>),
    /// Parsed JSON control payload or pre-built response frame
    Control(Value),
    /// Markers such as `EOF` carry nothing
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: Option<String>,
    pub flag: Flag,
    pub details: Details,
}

/// Borrowed view used to put control envelopes on the orchestration socket.
#[derive(Serialize)]
struct WireEnvelope<'a> {
    id: Option<&'a str>,
    flag: Flag,
    details: &'a Value,
}

impl Envelope {
    pub fn media(id: &str, audio: Vec<u8>) -> Self {
        Self {
            id: Some(id.to_string()),
            flag: Flag::Media,
            details: Details::Audio(audio),
        }
    }

    pub fn control(id: &str, flag: Flag, payload: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            flag,
            details: Details::Control(payload),
        }
    }

    pub fn say(audio: Vec<u8>) -> Self {
        Self {
            id: None,
            flag: Flag::Say,
            details: Details::Audio(audio),
        }
    }

    pub fn marker(flag: Flag) -> Self {
        Self {
            id: None,
            flag,
            details: Details::Empty,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.details {
            Details::Control(value) => Some(value),
            _ => None,
        }
    }

    pub fn audio(&self) -> Option<&[u8]> {
        match &self.details {
            Details::Audio(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The `type` field of a control payload (`ping`, `close`, ...).
    pub fn control_type(&self) -> Option<&str> {
        self.payload()?.get("type")?.as_str()
    }

    /// The `seq` field of a control payload.
    pub fn control_seq(&self) -> Option<u64> {
        self.payload()?.get("seq")?.as_u64()
    }

    /// Serialize as `{id, flag, details}` for the orchestration socket.
    pub fn to_wire(&self) -> GatewayResult<String> {
        let empty = Value::Null;
        let details = match &self.details {
            Details::Control(value) => value,
            Details::Empty => &empty,
            Details::Audio(_) => {
                return Err(GatewayError::Protocol(format!(
                    "{:?} envelope carries audio and cannot be sent as JSON",
                    self.flag
                )))
            }
        };

        Ok(serde_json::to_string(&WireEnvelope {
            id: self.id.as_deref(),
            flag: self.flag,
            details,
        })?)
    }
}

/// A text frame received from the orchestration service.
///
/// The flag is kept as a string so that unknown flags can be logged instead
/// of failing the parse.
#[derive(Debug, Deserialize)]
pub struct OrchestrationFrame {
    pub flag: String,
    #[serde(default)]
    pub details: Value,
}

impl OrchestrationFrame {
    pub fn parse(text: &str) -> GatewayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode the base64 audio of a `SAY` frame.
    pub fn say_audio(&self) -> GatewayResult<Vec<u8>> {
        let encoded = self
            .details
            .as_str()
            .ok_or_else(|| GatewayError::Protocol("SAY frame without base64 details".to_string()))?;
        BASE64
            .decode(encoded)
            .map_err(|e| GatewayError::Protocol(format!("invalid base64 audio: {}", e)))
    }
}
