//! # Orchestration Link
//!
//! Client side of the per-call WebSocket to the orchestration service.
//!
//! ## Connection flow (T0):
//! 1. Open the socket through an [`OrchestrationConnector`], bounded by
//!    `orchestration.connect_timeout_ms`
//! 2. Stamp the carrier handshake with `mac_operation_id`
//! 3. Send it as the first text frame
//!
//! Any failure here is fatal to the call: no other task has started yet.

use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::triagem::Handshake;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

/// Field added to the handshake before it is forwarded.
pub const OPERATION_ID_FIELD: &str = "mac_operation_id";

/// Upper bound on the orchestration close handshake during teardown.
pub const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub type OrchestrationSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type OrchestrationStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Write half shared by the audio uplink, metadata triage and teardown.
pub type SharedSink = Arc<Mutex<OrchestrationSink>>;

/// Opens orchestration connections.
pub trait OrchestrationConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, GatewayResult<(OrchestrationSink, OrchestrationStream)>>;
}

/// Production connector over `tokio-tungstenite`.
pub struct WsConnector {
    url: String,
    timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

impl OrchestrationConnector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, GatewayResult<(OrchestrationSink, OrchestrationStream)>> {
        Box::pin(async move {
            let (ws_stream, response) =
                tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(self.url.as_str()))
                    .await
                    .map_err(|_| {
                        GatewayError::Connect(format!("timed out after {:?} connecting to {}", self.timeout, self.url))
                    })?
                    .map_err(|e| GatewayError::Connect(format!("{}: {}", self.url, e)))?;

            debug!(url = %self.url, status = %response.status(), "Orchestration WebSocket upgraded");

            let (sink, stream) = ws_stream.split();
            let sink: OrchestrationSink = Box::pin(sink);
            let stream: OrchestrationStream = Box::pin(stream);
            Ok((sink, stream))
        })
    }
}

/// The handshake as the orchestration service expects it.
pub fn stamp_handshake(handshake: &Handshake, operation_id: u64) -> GatewayResult<Value> {
    let mut payload = handshake.payload.clone();
    payload
        .as_object_mut()
        .ok_or_else(|| GatewayError::Handshake("handshake is not a JSON object".to_string()))?
        .insert(OPERATION_ID_FIELD.to_string(), json!(operation_id));
    Ok(payload)
}

/// T0: connect and send the stamped handshake.
pub async fn connect_orchestration(
    connector: &dyn OrchestrationConnector,
    handshake: &Handshake,
    operation_id: u64,
) -> GatewayResult<(SharedSink, OrchestrationStream)> {
    let opening = serde_json::to_string(&stamp_handshake(handshake, operation_id)?)?;
    let (mut sink, stream) = connector.connect().await?;

    sink.send(Message::Text(opening))
        .await
        .map_err(|e| GatewayError::Connect(format!("sending handshake: {}", e)))?;

    info!(call_id = %handshake.id_call, operation_id, "Orchestration session opened");
    Ok((Arc::new(Mutex::new(sink)), stream))
}

/// Write one message through the shared sink.
pub async fn send_message(sink: &SharedSink, message: Message) -> GatewayResult<()> {
    sink.lock().await.send(message).await?;
    Ok(())
}

/// Close the shared sink; a socket that is already gone counts as closed.
///
/// A peer that stops reading cannot hold the call open: the close is
/// abandoned after [`SINK_CLOSE_TIMEOUT`].
pub async fn close_sink(sink: &SharedSink) {
    let closing = async {
        if let Err(e) = sink.lock().await.close().await {
            debug!(error = %e, "Orchestration sink already closed");
        }
    };
    if tokio::time::timeout(SINK_CLOSE_TIMEOUT, closing).await.is_err() {
        warn!(timeout = ?SINK_CLOSE_TIMEOUT, "Orchestration sink did not close in time, dropping it");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeConnector;
    use super::*;

    fn handshake() -> Handshake {
        Handshake::parse(r#"{"type":"open","id":"S1","parameters":{"conversationId":"C1"}}"#).unwrap()
    }

    #[test]
    fn test_stamp_adds_operation_id_only() {
        let stamped = stamp_handshake(&handshake(), 5).unwrap();
        assert_eq!(stamped[OPERATION_ID_FIELD], 5);
        assert_eq!(stamped["id"], "S1");
        assert_eq!(stamped["parameters"]["conversationId"], "C1");
    }

    #[tokio::test]
    async fn test_handshake_is_first_frame() {
        let (connector, mut far_end) = FakeConnector::new();
        let (sink, _stream) = connect_orchestration(&connector, &handshake(), 7).await.unwrap();

        match far_end.received.recv().await.unwrap() {
            Message::Text(text) => {
                let sent: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(sent[OPERATION_ID_FIELD], 7);
                assert_eq!(sent["parameters"]["conversationId"], "C1");
            }
            other => panic!("expected text handshake, got {:?}", other),
        }

        send_message(&sink, Message::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(far_end.received.recv().await.unwrap(), Message::Binary(vec![1, 2]));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let connector = FakeConnector::refusing();
        match connect_orchestration(&connector, &handshake(), 5).await {
            Err(GatewayError::Connect(_)) => {}
            other => panic!("expected connect error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unreachable_url_fails_within_timeout() {
        // port 9 on localhost is the discard port; nothing listens there in CI
        let connector = WsConnector::new("ws://127.0.0.1:9/orchestration", Duration::from_secs(2));
        assert!(matches!(
            connect_orchestration(&connector, &handshake(), 5).await,
            Err(GatewayError::Connect(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_stalled_peer() {
        let (connector, _far_end) = FakeConnector::stalling();
        let (sink, _stream) = connect_orchestration(&connector, &handshake(), 5).await.unwrap();

        // an abandoned write leaves the frame unflushed
        let write = send_message(&sink, Message::Binary(vec![1]));
        assert!(tokio::time::timeout(Duration::from_secs(1), write).await.is_err());

        let started = tokio::time::Instant::now();
        close_sink(&sink).await;
        let waited = started.elapsed();
        assert!(waited >= SINK_CLOSE_TIMEOUT);
        assert!(waited < SINK_CLOSE_TIMEOUT + Duration::from_secs(1));
    }
}
