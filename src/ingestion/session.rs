//! # Call Session
//!
//! One `CallSession` per carrier connection. It owns everything a call needs
//! and runs the call from the first carrier frame to teardown.
//!
//! ## Session flow:
//! 1. **accept**: read the handshake frame, build Triagem, register the call
//!    and queue the handshake for triage
//! 2. **connect** (T0): open the orchestration socket and forward the handshake
//! 3. **run**: spawn T1-T6 and supervise them until the call closes
//! 4. **teardown** (exactly once): archive both recordings, deregister, close
//!    both sockets
//!
//! Any task error, a carrier hang-up, a `close` handshake or the end of the
//! disconnect grace period moves the call to `Closing`; the first one wins.

use crate::audio::archive::{client_recording_key, mulaw_to_wav, synthesized_recording_key, AudioArchive};
use crate::audio::noise::BackgroundNoiseGenerator;
use crate::config::{AppConfig, AudioConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::carrier::{CarrierFrame, CarrierFrames, CarrierHandle};
use crate::ingestion::envelope::{Envelope, Flag};
use crate::ingestion::lifecycle::{CallLifecycle, CallPhase, CloseReason, PlaybackTracker};
use crate::ingestion::orchestration::{close_sink, connect_orchestration, OrchestrationConnector, SharedSink};
use crate::ingestion::queue::PacketQueues;
use crate::ingestion::registry::{CallHandle, ConnectionRegistry};
use crate::ingestion::tasks::{self, CallContext, Recording, TaskOutcome};
use crate::ingestion::templates::ProtocolTemplates;
use crate::ingestion::triagem::{Handshake, Triagem};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-call settings taken from the application configuration.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub operation_id: u64,
    pub audio: AudioConfig,
    pub disconnect_grace: Duration,
}

impl CallSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            operation_id: config.orchestration.operation_id,
            audio: config.audio.clone(),
            disconnect_grace: config.gateway.disconnect_grace(),
        }
    }
}

/// Process-wide collaborators every call uses.
#[derive(Clone)]
pub struct CallDeps {
    pub registry: Arc<ConnectionRegistry>,
    pub templates: Arc<ProtocolTemplates>,
    pub connector: Arc<dyn OrchestrationConnector>,
    pub archive: Arc<dyn AudioArchive>,
    pub settings: CallSettings,
}

/// How a call ended.
#[derive(Debug, Clone)]
pub struct CallReport {
    pub id_call: String,
    pub reason: CloseReason,
    pub archive_failures: usize,
    pub duration: Duration,
}

impl CallReport {
    /// The call ended because something broke, not because a party hung up.
    pub fn failed(&self) -> bool {
        matches!(self.reason, CloseReason::TaskFailed(_) | CloseReason::OrchestrationLost)
    }
}

pub struct CallSession {
    handshake: Handshake,
    ctx: Arc<CallContext>,
    frames: CarrierFrames,
    carrier: CarrierHandle,
    queues: PacketQueues,
    deps: CallDeps,
    started: Instant,
}

impl CallSession {
    /// Read the handshake and register the call.
    ///
    /// Nothing has been spawned when this fails, so the caller only has to
    /// close the carrier socket.
    pub async fn accept(mut frames: CarrierFrames, carrier: CarrierHandle, deps: CallDeps) -> GatewayResult<Self> {
        let handshake = match frames.recv().await {
            Some(CarrierFrame::Text(text)) => Handshake::parse(&text)?,
            Some(CarrierFrame::Binary(audio)) => {
                return Err(GatewayError::Handshake(format!(
                    "expected a JSON handshake, got {} bytes of audio",
                    audio.len()
                )))
            }
            Some(CarrierFrame::Other(kind)) => {
                return Err(GatewayError::Handshake(format!("expected a JSON handshake, got {}", kind)))
            }
            Some(CarrierFrame::Disconnected) | None => {
                return Err(GatewayError::Handshake("carrier disconnected before handshake".to_string()))
            }
        };

        let lifecycle = Arc::new(CallLifecycle::new());
        deps.registry.register(CallHandle {
            id_call: handshake.id_call.clone(),
            id_session: handshake.id_session.clone(),
            client_number: handshake.client_number.clone(),
            started_at: Utc::now(),
            lifecycle: lifecycle.clone(),
        })?;

        let queues = PacketQueues::new();
        queues.inbound_metadata.0.push(Envelope::control(
            &handshake.id_call,
            Flag::Open,
            handshake.payload.clone(),
        ))?;

        info!(
            call_id = %handshake.id_call,
            session_id = %handshake.id_session,
            client_number = handshake.client_number.as_deref().unwrap_or("unknown"),
            "Call accepted"
        );

        let ctx = Arc::new(CallContext {
            id_call: handshake.id_call.clone(),
            lifecycle,
            playback: PlaybackTracker::new(),
            triagem: Mutex::new(Triagem::new(deps.templates.clone(), &handshake)),
            audio: deps.settings.audio.clone(),
            disconnect_grace: deps.settings.disconnect_grace,
        });

        Ok(Self {
            handshake,
            ctx,
            frames,
            carrier,
            queues,
            deps,
            started: Instant::now(),
        })
    }

    pub fn id_call(&self) -> &str {
        &self.ctx.id_call
    }

    pub fn lifecycle(&self) -> Arc<CallLifecycle> {
        self.ctx.lifecycle.clone()
    }

    /// Connect to the orchestration service, run the pipeline and tear down.
    pub async fn run(self) -> CallReport {
        let Self {
            handshake,
            ctx,
            frames,
            carrier,
            queues,
            deps,
            started,
        } = self;

        ctx.lifecycle.advance(CallPhase::Connecting);
        let connected = tokio::select! {
            biased;
            _ = ctx.lifecycle.closing() => None,
            connected = connect_orchestration(deps.connector.as_ref(), &handshake, deps.settings.operation_id) => {
                match connected {
                    Ok(link) => Some(link),
                    Err(e) => {
                        error!(call_id = %ctx.id_call, error = %e, "Orchestration connect failed");
                        ctx.lifecycle.begin_closing(CloseReason::TaskFailed("connect-orchestration".to_string()));
                        None
                    }
                }
            }
        };

        let Some((sink, stream)) = connected else {
            return teardown(&ctx, &deps, &carrier, None, Vec::new(), started).await;
        };

        ctx.lifecycle.advance(CallPhase::Active);

        let PacketQueues {
            inbound_audio: (inbound_audio_tx, inbound_audio_rx),
            inbound_metadata: (inbound_metadata_tx, inbound_metadata_rx),
            outbound_metadata: (outbound_metadata_tx, outbound_metadata_rx),
            outbound_audio: (outbound_audio_tx, outbound_audio_rx),
        } = queues;

        let mut pipeline: JoinSet<TaskOutcome> = JoinSet::new();
        pipeline.spawn(tasks::carrier_receive(
            ctx.clone(),
            frames,
            inbound_audio_tx,
            inbound_metadata_tx,
        ));
        pipeline.spawn(tasks::metadata_triage(
            ctx.clone(),
            inbound_metadata_rx,
            outbound_metadata_tx.clone(),
            sink.clone(),
        ));
        pipeline.spawn(tasks::audio_uplink(ctx.clone(), inbound_audio_rx, sink.clone()));
        pipeline.spawn(tasks::metadata_downlink(ctx.clone(), outbound_metadata_rx, carrier.clone()));
        pipeline.spawn(tasks::audio_downlink(
            ctx.clone(),
            outbound_audio_rx,
            carrier.clone(),
            BackgroundNoiseGenerator::new(&ctx.audio),
        ));
        pipeline.spawn(tasks::orchestration_downlink(
            ctx.clone(),
            stream,
            outbound_metadata_tx,
            outbound_audio_tx,
        ));

        let recordings = supervise(&ctx, &mut pipeline).await;
        teardown(&ctx, &deps, &carrier, Some(sink), recordings, started).await
    }
}

/// Wait for every task, turning the first failure into the closing transition.
async fn supervise(ctx: &CallContext, pipeline: &mut JoinSet<TaskOutcome>) -> Vec<Recording> {
    let mut recordings = Vec::new();

    while let Some(joined) = pipeline.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(call_id = %ctx.id_call, error = %e, "Pipeline task aborted");
                ctx.lifecycle.begin_closing(CloseReason::TaskFailed("aborted".to_string()));
                continue;
            }
        };

        match &outcome.result {
            Err(e) if ctx.lifecycle.begin_closing(CloseReason::TaskFailed(outcome.task.to_string())) => {
                error!(call_id = %ctx.id_call, task = %outcome.task, error = %e, "Pipeline task failed");
            }
            Err(e) => {
                debug!(call_id = %ctx.id_call, task = %outcome.task, error = %e, "Task error while closing");
            }
            Ok(()) if ctx.lifecycle.begin_closing(CloseReason::TaskFailed(outcome.task.to_string())) => {
                warn!(call_id = %ctx.id_call, task = %outcome.task, "Task stopped while the call was active");
            }
            Ok(()) => debug!(call_id = %ctx.id_call, task = %outcome.task, "Task finished"),
        }

        recordings.extend(outcome.recording);
    }

    recordings
}

/// Archive, deregister and close. Runs once per call.
async fn teardown(
    ctx: &CallContext,
    deps: &CallDeps,
    carrier: &CarrierHandle,
    sink: Option<SharedSink>,
    recordings: Vec<Recording>,
    started: Instant,
) -> CallReport {
    let mut archive_failures = 0;
    for recording in recordings {
        let (key, audio) = match recording {
            Recording::Client(audio) => (client_recording_key(&ctx.id_call), audio),
            Recording::Synthesized(audio) => (synthesized_recording_key(&ctx.id_call), audio),
        };
        if audio.is_empty() {
            debug!(call_id = %ctx.id_call, key = %key, "Empty recording, nothing to archive");
            continue;
        }

        let stored = match mulaw_to_wav(&audio, ctx.audio.sample_rate) {
            Ok(wav) => deps.archive.store(key.clone(), wav).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(()) => info!(call_id = %ctx.id_call, key = %key, samples = audio.len(), "Recording archived"),
            Err(e) => {
                archive_failures += 1;
                error!(call_id = %ctx.id_call, key = %key, error = %e, "Recording archival failed");
            }
        }
    }

    deps.registry.deregister(&ctx.id_call);
    carrier.close();
    if let Some(sink) = sink {
        close_sink(&sink).await;
    }
    ctx.lifecycle.mark_closed();

    let reason = ctx.lifecycle.reason().unwrap_or(CloseReason::Shutdown);
    let duration = started.elapsed();
    info!(
        call_id = %ctx.id_call,
        reason = %reason,
        duration_ms = duration.as_millis() as u64,
        "Call closed"
    );

    CallReport {
        id_call: ctx.id_call.clone(),
        reason,
        archive_failures,
        duration,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{deps, MemoryArchive, HANDSHAKE};
    use super::*;
    use crate::ingestion::carrier::{CarrierCommand, CarrierCommands};
    use crate::ingestion::orchestration::testing::{FakeConnector, FakeOrchestration};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    struct Call {
        carrier_tx: mpsc::UnboundedSender<CarrierFrame>,
        commands: CarrierCommands,
        orchestration: FakeOrchestration,
        archive: Arc<MemoryArchive>,
        registry: Arc<ConnectionRegistry>,
        lifecycle: Arc<CallLifecycle>,
        report: JoinHandle<CallReport>,
    }

    impl Call {
        async fn start() -> Self {
            Self::start_with(FakeConnector::new()).await
        }

        async fn start_with((connector, orchestration): (FakeConnector, FakeOrchestration)) -> Self {
            let (carrier_tx, frames) = mpsc::unbounded_channel();
            let (carrier, commands) = CarrierHandle::channel();
            let archive = Arc::new(MemoryArchive::default());
            let deps = deps(Arc::new(connector), archive.clone());
            let registry = deps.registry.clone();

            carrier_tx.send(CarrierFrame::Text(HANDSHAKE.to_string())).unwrap();
            let session = CallSession::accept(frames, carrier, deps).await.unwrap();
            let lifecycle = session.lifecycle();
            let report = tokio::spawn(session.run());

            Self {
                carrier_tx,
                commands,
                orchestration,
                archive,
                registry,
                lifecycle,
                report,
            }
        }

        fn carrier_sends(&self, frame: Value) {
            self.carrier_tx.send(CarrierFrame::Text(frame.to_string())).unwrap();
        }

        fn orchestration_sends(&self, frame: Value) {
            self.orchestration.reply.send(Message::Text(frame.to_string())).unwrap();
        }

        /// Next control frame sent to the carrier, skipping audio.
        async fn carrier_text(&mut self) -> Value {
            loop {
                match tokio::time::timeout(WAIT, self.commands.recv()).await.unwrap() {
                    Some(CarrierCommand::Text(text)) => return serde_json::from_str(&text).unwrap(),
                    Some(CarrierCommand::Binary(_)) => continue,
                    other => panic!("expected a control frame, got {:?}", other),
                }
            }
        }

        /// Next audio chunk sent to the carrier that is not keepalive noise.
        async fn carrier_audio(&mut self, noise_len: usize) -> Vec<u8> {
            loop {
                match tokio::time::timeout(WAIT, self.commands.recv()).await.unwrap() {
                    Some(CarrierCommand::Binary(audio)) if audio.len() != noise_len => return audio,
                    Some(CarrierCommand::Binary(_)) => continue,
                    other => panic!("expected audio, got {:?}", other),
                }
            }
        }

        async fn orchestration_text(&mut self) -> Value {
            loop {
                match tokio::time::timeout(WAIT, self.orchestration.received.recv()).await.unwrap() {
                    Some(Message::Text(text)) => return serde_json::from_str(&text).unwrap(),
                    Some(_) => continue,
                    None => panic!("orchestration link closed"),
                }
            }
        }
    }

    async fn finish(call: &mut Call) -> CallReport {
        tokio::time::timeout(WAIT, &mut call.report).await.unwrap().unwrap()
    }

    async fn opened(call: &mut Call) {
        let opened = call.carrier_text().await;
        assert_eq!(opened["type"], "opened");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_opens_both_sides() {
        let mut call = Call::start().await;

        // scenario A
        let opened = call.carrier_text().await;
        assert_eq!(opened["type"], "opened");
        assert_eq!(opened["id"], "S1");
        assert_eq!(opened["seq"], 1);
        assert_eq!(opened["clientseq"], 0);

        let forwarded = call.orchestration_text().await;
        assert_eq!(forwarded["mac_operation_id"], 5);
        assert_eq!(forwarded["parameters"]["conversationId"], "C1");

        assert_eq!(call.registry.count(), 1);
        assert_eq!(call.lifecycle.phase(), CallPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_then_close() {
        let mut call = Call::start().await;
        opened(&mut call).await;
        call.orchestration_text().await;

        // scenario B
        call.carrier_sends(json!({"type": "ping", "seq": 5}));
        let pong = call.carrier_text().await;
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["seq"], 2);
        assert_eq!(pong["clientseq"], 5);

        // scenario C
        call.carrier_sends(json!({"type": "close", "seq": 9}));
        call.carrier_sends(json!({"type": "close", "seq": 10}));
        let closed = call.carrier_text().await;
        assert_eq!(closed["type"], "closed");
        assert_eq!(closed["seq"], 3);
        assert_eq!(closed["clientseq"], 9);

        let end_call = call.orchestration_text().await;
        assert_eq!(end_call["flag"], "END_CALL");
        assert_eq!(end_call["id"], "C1");
        assert_eq!(end_call["details"]["type"], "close");

        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::CarrierClosed);
        assert!(!report.failed());
        assert_eq!(call.registry.count(), 0);
        assert_eq!(call.lifecycle.phase(), CallPhase::Closed);

        // one closed frame only, then the socket is closed
        let mut rest = Vec::new();
        while let Ok(command) = call.commands.try_recv() {
            rest.push(command);
        }
        assert!(rest.iter().all(|c| !matches!(c, CarrierCommand::Text(_))));
        assert_eq!(rest.last(), Some(&CarrierCommand::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_say_eof_and_playback_completed() {
        let mut call = Call::start().await;
        let noise_len = AppConfig::default().audio.chunk_len();
        opened(&mut call).await;
        call.orchestration_text().await;

        // nothing has been played yet, so this is not reported
        call.carrier_sends(json!({"type": "playback_completed", "seq": 2}));

        // scenario D
        call.orchestration_sends(json!({"flag": "SAY", "details": "AAAA"}));
        call.orchestration_sends(json!({"flag": "EOF"}));
        assert_eq!(call.carrier_audio(noise_len).await, vec![0, 0, 0]);

        // let the EOF marker reach the audio downlink
        tokio::time::sleep(Duration::from_millis(50)).await;
        call.carrier_sends(json!({"type": "playback_completed", "seq": 3}));
        let end_audio = call.orchestration_text().await;
        assert_eq!(end_audio["flag"], "END_AUDIO");
        assert_eq!(end_audio["details"]["seq"], 3);

        call.carrier_tx.send(CarrierFrame::Disconnected).unwrap();
        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::CarrierDisconnected);

        let synthesized = call.archive.get("C1_ai.wav").expect("synthesized recording archived");
        assert_eq!(&synthesized[0..4], b"RIFF");
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_sends_disconnect_and_waits_for_close() {
        let mut call = Call::start().await;
        opened(&mut call).await;
        call.orchestration_text().await;

        // scenario E
        call.orchestration_sends(json!({"flag": "END"}));
        let disconnect = call.carrier_text().await;
        assert_eq!(disconnect["type"], "disconnect");
        assert_eq!(disconnect["seq"], 2);
        assert_eq!(disconnect["parameters"]["outputVariables"]["idURL"], "C1");
        assert!(!call.lifecycle.is_closing());

        call.carrier_sends(json!({"type": "close", "seq": 4}));
        let closed = call.carrier_text().await;
        assert_eq!(closed["type"], "closed");
        assert_eq!(closed["seq"], 3);

        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::CarrierClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_expiry_ends_call() {
        let mut call = Call::start().await;
        opened(&mut call).await;
        call.orchestration_text().await;

        call.orchestration_sends(json!({"flag": "END"}));
        call.orchestration_sends(json!({"flag": "END"}));
        assert_eq!(call.carrier_text().await["type"], "disconnect");

        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::OrchestrationEnded);
        assert!(report.duration >= AppConfig::default().gateway.disconnect_grace());
    }

    #[tokio::test(start_paused = true)]
    async fn test_carrier_hangup_archives_both_recordings() {
        let mut call = Call::start().await;
        opened(&mut call).await;
        call.orchestration_text().await;

        call.carrier_tx.send(CarrierFrame::Binary(vec![0xFF; 160])).unwrap();
        call.carrier_tx.send(CarrierFrame::Binary(vec![0x7F; 160])).unwrap();
        match tokio::time::timeout(WAIT, call.orchestration.received.recv()).await.unwrap() {
            Some(Message::Binary(audio)) => assert_eq!(audio, vec![0xFF; 160]),
            other => panic!("expected caller audio, got {:?}", other),
        }

        // one keepalive interval
        tokio::time::sleep(Duration::from_millis(600)).await;
        call.carrier_tx.send(CarrierFrame::Disconnected).unwrap();

        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::CarrierDisconnected);
        assert_eq!(report.archive_failures, 0);
        assert_eq!(call.archive.keys(), vec!["C1_ai.wav".to_string(), "C1_cliente.wav".to_string()]);

        let client = call.archive.get("C1_cliente.wav").unwrap();
        let (header, track) = wav::read(&mut std::io::Cursor::new(client)).unwrap();
        assert_eq!(header.sampling_rate, 8000);
        assert_eq!(track.as_sixteen().unwrap().len(), 320);
        assert_eq!(call.registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orchestration_loss_ends_call() {
        let mut call = Call::start().await;
        opened(&mut call).await;
        call.orchestration_text().await;

        let (replacement, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut call.orchestration.reply, replacement));

        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::OrchestrationLost);
        assert!(report.failed());
        assert_eq!(call.registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_live_calls() {
        let mut call = Call::start().await;
        opened(&mut call).await;

        assert_eq!(call.registry.close_all(CloseReason::Shutdown), 1);
        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::Shutdown);
        assert_eq!(call.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_rejected() {
        let (carrier_tx, frames) = mpsc::unbounded_channel();
        let (carrier, _commands) = CarrierHandle::channel();
        let (connector, _far_end) = FakeConnector::new();
        let deps = deps(Arc::new(connector), Arc::new(MemoryArchive::default()));
        let registry = deps.registry.clone();

        carrier_tx
            .send(CarrierFrame::Text(r#"{"id":"S1","parameters":{}}"#.to_string()))
            .unwrap();
        match CallSession::accept(frames, carrier, deps).await {
            Err(GatewayError::Handshake(_)) => {}
            other => panic!("expected handshake error, got {:?}", other.map(|s| s.id_call().to_string())),
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_call_id_is_rejected() {
        let (connector, _far_end) = FakeConnector::new();
        let deps = deps(Arc::new(connector), Arc::new(MemoryArchive::default()));

        let mut sessions = Vec::new();
        for _ in 0..2 {
            let (carrier_tx, frames) = mpsc::unbounded_channel();
            let (carrier, _commands) = CarrierHandle::channel();
            carrier_tx.send(CarrierFrame::Text(HANDSHAKE.to_string())).unwrap();
            sessions.push(CallSession::accept(frames, carrier, deps.clone()).await);
        }

        assert!(sessions[0].is_ok());
        assert!(matches!(sessions[1], Err(GatewayError::Handshake(_))));
        assert_eq!(deps.registry.count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_tears_down() {
        let (carrier_tx, frames) = mpsc::unbounded_channel();
        let (carrier, mut commands) = CarrierHandle::channel();
        let archive = Arc::new(MemoryArchive::default());
        let deps = deps(Arc::new(FakeConnector::refusing()), archive.clone());
        let registry = deps.registry.clone();

        carrier_tx.send(CarrierFrame::Text(HANDSHAKE.to_string())).unwrap();
        let session = CallSession::accept(frames, carrier, deps).await.unwrap();
        let report = session.run().await;

        assert!(report.failed());
        assert_eq!(report.reason, CloseReason::TaskFailed("connect-orchestration".to_string()));
        assert_eq!(registry.count(), 0);
        assert_eq!(commands.try_recv().unwrap(), CarrierCommand::Close);
        assert!(archive.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_tears_down_while_orchestration_is_stalled() {
        let mut call = Call::start_with(FakeConnector::stalling()).await;
        opened(&mut call).await;
        call.orchestration_text().await;

        call.carrier_tx.send(CarrierFrame::Binary(vec![0x55; 160])).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        call.carrier_tx.send(CarrierFrame::Disconnected).unwrap();

        let report = finish(&mut call).await;
        assert_eq!(report.reason, CloseReason::CarrierDisconnected);
        assert_eq!(call.lifecycle.phase(), CallPhase::Closed);
        assert_eq!(call.registry.count(), 0);
        assert!(call.archive.get("C1_cliente.wav").is_some());

        let mut last = None;
        while let Ok(command) = call.commands.try_recv() {
            last = Some(command);
        }
        assert_eq!(last, Some(CarrierCommand::Close));
    }
}
