//! # Carrier WebSocket Endpoint
//!
//! The AudioHook route at `gateway.audiohook_path`. Each accepted upgrade
//! becomes one phone call.
//!
//! ## Connection flow:
//! 1. **Guard**: the `X-API-KEY` header is checked when a key is configured,
//!    then the registry capacity (401 / 503 on failure)
//! 2. **Bridge**: a `CarrierWebSocket` actor owns the socket; frames go to the
//!    call through a channel and the call's commands come back through another
//! 3. **Call**: the gateway runs the call pipeline on its own task
//! 4. **Close**: whichever side ends first, the other learns through its channel
//!
//! ## Frame mapping:
//! - **Text** → `CarrierFrame::Text` (JSON control)
//! - **Binary** → `CarrierFrame::Binary` (mu-law audio)
//! - **Ping** → answered here, the call never sees it
//! - **Close / protocol error** → actor stops, call gets `Disconnected`

use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::carrier::{CarrierCommand, CarrierCommands, CarrierFrame, CarrierHandle};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::http::header::HeaderMap;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, trace, warn};

pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Socket owner for one carrier connection.
pub struct CarrierWebSocket {
    frames: mpsc::UnboundedSender<CarrierFrame>,
    commands: Option<CarrierCommands>,
    peer: String,
}

impl CarrierWebSocket {
    pub fn new(frames: mpsc::UnboundedSender<CarrierFrame>, commands: CarrierCommands, peer: String) -> Self {
        Self {
            frames,
            commands: Some(commands),
            peer,
        }
    }

    fn forward(&self, frame: CarrierFrame) {
        // The call is gone once its receiver drops; the socket closes right after.
        let _ = self.frames.send(frame);
    }
}

impl Actor for CarrierWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(peer = %self.peer, "Carrier connection started");
        if let Some(commands) = self.commands.take() {
            ctx.add_stream(UnboundedReceiverStream::new(commands));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(peer = %self.peer, "Carrier connection stopped");
        self.forward(CarrierFrame::Disconnected);
    }
}

/// Frames from the carrier.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CarrierWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.forward(CarrierFrame::Text(text.to_string())),
            Ok(ws::Message::Binary(data)) => self.forward(CarrierFrame::Binary(data.to_vec())),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => trace!(peer = %self.peer, "Carrier pong"),
            Ok(ws::Message::Close(reason)) => {
                info!(peer = %self.peer, reason = ?reason, "Carrier closed the socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => self.forward(CarrierFrame::Other("continuation".to_string())),
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "Carrier protocol error");
                ctx.stop();
            }
        }
    }
}

/// Commands from the call.
impl StreamHandler<CarrierCommand> for CarrierWebSocket {
    fn handle(&mut self, command: CarrierCommand, ctx: &mut Self::Context) {
        match command {
            CarrierCommand::Text(text) => ctx.text(text),
            CarrierCommand::Binary(audio) => ctx.binary(audio),
            CarrierCommand::Close => {
                debug!(peer = %self.peer, "Closing carrier socket");
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

/// Compare the upgrade's `X-API-KEY` with the configured key. An empty
/// configured key turns the check off.
pub fn check_api_key(headers: &HeaderMap, expected: &str) -> GatewayResult<()> {
    if expected.is_empty() {
        return Ok(());
    }
    match headers.get(API_KEY_HEADER).and_then(|value| value.to_str().ok()) {
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(GatewayError::Unauthorized("invalid API key".to_string())),
        None => Err(GatewayError::Unauthorized(format!("missing {} header", API_KEY_HEADER))),
    }
}

/// AudioHook upgrade handler.
pub async fn audiohook_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let peer = req
        .connection_info()
        .peer_addr()
        .unwrap_or("unknown")
        .to_string();

    if let Err(e) = check_api_key(req.headers(), &state.get_config().auth.api_key) {
        warn!(peer = %peer, error = %e, "Refusing carrier upgrade");
        state.gateway.metrics().record_rejected();
        return Err(e.into());
    }
    if let Err(e) = state.gateway.check_capacity() {
        warn!(peer = %peer, error = %e, "Refusing carrier upgrade");
        return Err(e.into());
    }

    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (carrier, commands) = CarrierHandle::channel();

    let response = ws::start(CarrierWebSocket::new(frames_tx, commands, peer.clone()), &req, stream)?;
    info!(peer = %peer, "Carrier upgrade accepted");
    state.gateway.open_call(frames, carrier);

    Ok(response)
}
