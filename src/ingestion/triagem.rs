//! # Triagem (protocol tracker)
//!
//! Per-call protocol state. Classifies carrier control frames and produces the
//! response frames the carrier expects, keeping both sequence counters honest.
//!
//! ## Protocol States:
//! `Init` → `Open` (handshake answered) → `Active` (ping/metadata exchange)
//! → `Disconnecting` (gateway asked the carrier to hang up) → `Closed` (terminal)
//!
//! ## Sequence invariants:
//! - `server_seq` starts at 1 and grows by one per response produced
//! - every response carries `seq` = `server_seq` before the increment and
//!   `clientseq` = the last inbound `seq` seen
//! - `client_seq_lastseen` never moves backwards

use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::envelope::{Envelope, Flag};
use crate::ingestion::templates::ProtocolTemplates;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identifiers carried by the first carrier frame.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Carrier session id; responses are stamped with it
    pub id_session: String,
    /// Conversation id; routing, registry and archival key on it
    pub id_call: String,
    /// Caller number (ANI), when the carrier sends one
    pub client_number: Option<String>,
    /// The frame as received
    pub payload: Value,
}

impl Handshake {
    /// Extract call identifiers from the first carrier frame.
    pub fn parse(text: &str) -> GatewayResult<Self> {
        let payload: Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::Handshake(format!("first frame is not JSON: {}", e)))?;
        Self::from_payload(payload)
    }

    pub fn from_payload(payload: Value) -> GatewayResult<Self> {
        if let Some(kind) = payload.get("type").and_then(Value::as_str) {
            if kind != "open" {
                return Err(GatewayError::Handshake(format!(
                    "first frame must be 'open', got '{}'",
                    kind
                )));
            }
        }

        let id_session = payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::Handshake("missing 'id'".to_string()))?
            .to_string();

        let id_call = payload
            .pointer("/parameters/conversationId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::Handshake("missing 'parameters.conversationId'".to_string()))?
            .to_string();

        let client_number = payload
            .pointer("/parameters/participant/ani")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            id_session,
            id_call,
            client_number,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Init,
    Open,
    Active,
    Disconnecting,
    Closed,
}

/// Outcome of classifying one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Send this frame to the carrier and carry on
    Reply(Value),
    /// Send this frame to the carrier, then end the call
    Terminal(Value),
    /// Nothing to send
    NoReply,
}

pub struct Triagem {
    templates: Arc<ProtocolTemplates>,
    id_session: String,
    id_call: String,
    handshake: Value,
    server_seq: u64,
    client_seq_lastseen: u64,
    state: ProtocolState,
}

impl Triagem {
    pub fn new(templates: Arc<ProtocolTemplates>, handshake: &Handshake) -> Self {
        Self {
            templates,
            id_session: handshake.id_session.clone(),
            id_call: handshake.id_call.clone(),
            handshake: handshake.payload.clone(),
            server_seq: 1,
            client_seq_lastseen: 0,
            state: ProtocolState::Init,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Sequence number the next response will carry.
    pub fn server_seq(&self) -> u64 {
        self.server_seq
    }

    pub fn client_seq_lastseen(&self) -> u64 {
        self.client_seq_lastseen
    }

    pub fn handshake(&self) -> &Value {
        &self.handshake
    }

    /// Classify an inbound envelope and build the response it calls for.
    pub fn classify(&mut self, envelope: &Envelope) -> GatewayResult<Verdict> {
        match envelope.flag {
            Flag::Open => self.on_open(envelope),
            Flag::Metadata => self.on_metadata(envelope),
            other => {
                warn!(call_id = %self.id_call, flag = ?other, "Unexpected envelope in metadata triage");
                Ok(Verdict::NoReply)
            }
        }
    }

    fn on_open(&mut self, envelope: &Envelope) -> GatewayResult<Verdict> {
        if self.state != ProtocolState::Init {
            warn!(call_id = %self.id_call, state = ?self.state, "Duplicate open frame ignored");
            return Ok(Verdict::NoReply);
        }

        if let Some(conversation) = envelope
            .payload()
            .and_then(|p| p.pointer("/parameters/conversationId"))
            .and_then(Value::as_str)
        {
            if conversation != self.id_call {
                return Err(GatewayError::Handshake(format!(
                    "open frame for conversation '{}' on call '{}'",
                    conversation, self.id_call
                )));
            }
        }

        let response = self.respond("opened")?;
        self.state = ProtocolState::Open;
        info!(call_id = %self.id_call, seq = self.server_seq - 1, "Handshake accepted, sending opened");
        Ok(Verdict::Reply(response))
    }

    fn on_metadata(&mut self, envelope: &Envelope) -> GatewayResult<Verdict> {
        self.observe_client_seq(envelope.control_seq());

        let kind = envelope.control_type().unwrap_or_default();

        if self.state == ProtocolState::Closed {
            debug!(call_id = %self.id_call, kind, "Control frame after close, no response");
            return Ok(Verdict::NoReply);
        }

        if self.state == ProtocolState::Open {
            self.state = ProtocolState::Active;
        }

        let verdict = match kind {
            "ping" => Verdict::Reply(self.respond("pong")?),
            "close" => {
                let response = self.respond("closed")?;
                self.state = ProtocolState::Closed;
                info!(call_id = %self.id_call, "Carrier closed the session");
                Verdict::Terminal(response)
            }
            "error" => {
                let message = envelope
                    .payload()
                    .and_then(|p| p.pointer("/parameters/message"))
                    .and_then(Value::as_str)
                    .unwrap_or("<no message>");
                error!(call_id = %self.id_call, carrier_message = message, "Carrier reported an error");
                Verdict::NoReply
            }
            "discarded" | "playback_started" | "playback_completed" => {
                info!(call_id = %self.id_call, kind, "Carrier event");
                Verdict::NoReply
            }
            other => {
                warn!(call_id = %self.id_call, kind = other, "Unknown control frame type");
                Verdict::NoReply
            }
        };

        Ok(verdict)
    }

    /// Build the `disconnect` frame sent when the orchestration service ends the call.
    ///
    /// Returns `None` once the call is already disconnecting or closed, so a
    /// late `END` never produces a second hang-up.
    pub fn finalize(&mut self) -> GatewayResult<Option<Value>> {
        if matches!(self.state, ProtocolState::Disconnecting | ProtocolState::Closed) {
            debug!(call_id = %self.id_call, state = ?self.state, "Call already ending, no disconnect");
            return Ok(None);
        }

        let mut response = self.respond("disconnect")?;
        let id_call = self.id_call.clone();
        output_variables(&mut response)?.insert("idURL".to_string(), Value::String(id_call));

        self.state = ProtocolState::Disconnecting;
        info!(call_id = %self.id_call, "Orchestration ended the call, sending disconnect");
        Ok(Some(response))
    }

    fn observe_client_seq(&mut self, seq: Option<u64>) {
        match seq {
            Some(seq) if seq >= self.client_seq_lastseen => self.client_seq_lastseen = seq,
            Some(seq) => warn!(
                call_id = %self.id_call,
                seq,
                last = self.client_seq_lastseen,
                "Inbound sequence went backwards, keeping last value"
            ),
            None => debug!(call_id = %self.id_call, "Control frame without seq"),
        }
    }

    /// Instantiate and stamp a template, then advance `server_seq`.
    fn respond(&mut self, name: &str) -> GatewayResult<Value> {
        let mut response = self.templates.instantiate(name)?;
        let fields = response
            .as_object_mut()
            .ok_or_else(|| GatewayError::Config(format!("template '{}' is not a JSON object", name)))?;

        fields.insert("id".to_string(), Value::String(self.id_session.clone()));
        fields.insert("seq".to_string(), json!(self.server_seq));
        fields.insert("clientseq".to_string(), json!(self.client_seq_lastseen));

        self.server_seq += 1;
        Ok(response)
    }
}

fn output_variables(response: &mut Value) -> GatewayResult<&mut Map<String, Value>> {
    let malformed = || GatewayError::Config("disconnect template has a malformed 'parameters' section".to_string());

    let parameters = response
        .as_object_mut()
        .ok_or_else(malformed)?
        .entry("parameters")
        .or_insert_with(|| json!({}));

    parameters
        .as_object_mut()
        .ok_or_else(malformed)?
        .entry("outputVariables")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(malformed)
}
