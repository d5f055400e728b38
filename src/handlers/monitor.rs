//! # Active Call Monitor
//!
//! WebSocket at `gateway.monitor_path` that pushes the number of registered
//! calls as a plain text frame every `gateway.monitor_interval_ms`. Anything the
//! client sends, other than ping and close, is ignored.

use crate::ingestion::registry::ConnectionRegistry;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct MonitorWebSocket {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
}

impl MonitorWebSocket {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    fn push_count(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.text(self.registry.count().to_string());
    }
}

impl Actor for MonitorWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("Monitor connection started");
        self.push_count(ctx);
        ctx.run_interval(self.interval, |act, ctx| act.push_count(ctx));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!("Monitor connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MonitorWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "Monitor protocol error");
                ctx.stop();
            }
        }
    }
}

pub async fn active_calls_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "Monitor connection requested");
    let monitor = MonitorWebSocket::new(
        state.registry().clone(),
        state.get_config().gateway.monitor_interval(),
    );
    ws::start(monitor, &req, stream)
}
