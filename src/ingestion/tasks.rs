//! # Pipeline Tasks
//!
//! The six long-running tasks of a call (T1-T6). Connecting to the
//! orchestration service (T0) happens before any of them start and lives in
//! `orchestration.rs`.
//!
//! ```text
//!            ┌──── T1 carrier-receive ────┐
//!  carrier ──┤                            ├─ inbound-audio ──── T3 audio-uplink ──────────┐
//!  socket    │                            └─ inbound-metadata ─ T2 metadata-triage ───────┤── orchestration
//!            │                                                        │                  │   socket
//!            ├── T4 metadata-downlink ◄── outbound-metadata ◄─────────┤                  │
//!            └── T5 audio-downlink ◄───── outbound-audio ◄── T6 orchestration-downlink ◄─┘
//! ```
//!
//! Every task waits on `CallLifecycle::closing()` next to its own I/O and exits
//! without another send once the call starts closing. A task returns a
//! [`TaskOutcome`]; the session supervisor turns an error into the closing
//! transition and collects the recordings for archival.

use crate::audio::noise::BackgroundNoiseGenerator;
use crate::config::AudioConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::carrier::{CarrierFrame, CarrierFrames, CarrierHandle};
use crate::ingestion::envelope::{Details, Envelope, Flag, OrchestrationFrame};
use crate::ingestion::lifecycle::{CallLifecycle, CloseReason, PlaybackTracker};
use crate::ingestion::orchestration::{send_message, OrchestrationStream, SharedSink};
use crate::ingestion::queue::{PacketReceiver, PacketSender, TimedRecv};
use crate::ingestion::triagem::{Triagem, Verdict};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTask {
    CarrierReceive,
    MetadataTriage,
    AudioUplink,
    MetadataDownlink,
    AudioDownlink,
    OrchestrationDownlink,
}

impl PipelineTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineTask::CarrierReceive => "carrier-receive",
            PipelineTask::MetadataTriage => "metadata-triage",
            PipelineTask::AudioUplink => "audio-uplink",
            PipelineTask::MetadataDownlink => "metadata-downlink",
            PipelineTask::AudioDownlink => "audio-downlink",
            PipelineTask::OrchestrationDownlink => "orchestration-downlink",
        }
    }
}

impl fmt::Display for PipelineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio a task recorded while it ran.
#[derive(Debug, Clone, PartialEq)]
pub enum Recording {
    /// Everything the caller said (T1)
    Client(Vec<u8>),
    /// Everything played to the caller, noise included (T5)
    Synthesized(Vec<u8>),
}

/// What a task hands back to the session when it exits.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: PipelineTask,
    pub result: GatewayResult<()>,
    pub recording: Option<Recording>,
}

impl TaskOutcome {
    fn new(task: PipelineTask, result: GatewayResult<()>) -> Self {
        Self {
            task,
            result,
            recording: None,
        }
    }

    fn with_recording(task: PipelineTask, result: GatewayResult<()>, recording: Recording) -> Self {
        Self {
            task,
            result,
            recording: Some(recording),
        }
    }
}

/// State shared by every task of one call.
pub struct CallContext {
    pub id_call: String,
    pub lifecycle: Arc<CallLifecycle>,
    pub playback: PlaybackTracker,
    pub triagem: Mutex<Triagem>,
    pub audio: AudioConfig,
    pub disconnect_grace: Duration,
}

/// T1: read carrier frames and sort them onto the inbound queues.
pub async fn carrier_receive(
    ctx: Arc<CallContext>,
    mut frames: CarrierFrames,
    inbound_audio: PacketSender,
    inbound_metadata: PacketSender,
) -> TaskOutcome {
    let task = PipelineTask::CarrierReceive;
    let mut client_audio = Vec::new();

    let result: GatewayResult<()> = async {
        loop {
            let frame = tokio::select! {
                biased;
                _ = ctx.lifecycle.closing() => break,
                frame = frames.recv() => frame,
            };

            match frame {
                Some(CarrierFrame::Binary(audio)) => {
                    trace!(call_id = %ctx.id_call, %task, bytes = audio.len(), "Caller audio");
                    client_audio.extend_from_slice(&audio);
                    inbound_audio.push(Envelope::media(&ctx.id_call, audio))?;
                }
                Some(CarrierFrame::Text(text)) => match serde_json::from_str::<Value>(&text) {
                    Ok(payload) => {
                        debug!(call_id = %ctx.id_call, %task, frame = %text, "Carrier control frame");
                        inbound_metadata.push(Envelope::control(&ctx.id_call, Flag::Metadata, payload))?;
                    }
                    Err(e) => warn!(call_id = %ctx.id_call, %task, error = %e, "Dropping unparseable control frame"),
                },
                Some(CarrierFrame::Other(kind)) => {
                    inbound_metadata.push(Envelope::control(&ctx.id_call, Flag::Unknown, json!({ "frame": kind })))?;
                }
                Some(CarrierFrame::Disconnected) | None => {
                    if ctx.lifecycle.begin_closing(CloseReason::CarrierDisconnected) {
                        info!(call_id = %ctx.id_call, %task, "Carrier disconnected");
                    }
                    break;
                }
            }
        }
        Ok::<(), GatewayError>(())
    }
    .await;

    TaskOutcome::with_recording(task, result, Recording::Client(client_audio))
}

/// T2: run control frames through Triagem and route what comes out.
pub async fn metadata_triage(
    ctx: Arc<CallContext>,
    mut inbound_metadata: PacketReceiver,
    outbound_metadata: PacketSender,
    orchestration: SharedSink,
) -> TaskOutcome {
    let task = PipelineTask::MetadataTriage;

    let result: GatewayResult<()> = async {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = ctx.lifecycle.closing() => break,
                envelope = inbound_metadata.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let verdict = ctx.triagem.lock().await.classify(&envelope)?;

            let forward = match (envelope.control_type(), &verdict) {
                (Some("playback_completed"), _) if ctx.playback.take_completion() => Some(Flag::EndAudio),
                (Some("close"), Verdict::Terminal(_)) => Some(Flag::EndCall),
                _ => None,
            };
            let reply_flag = if envelope.flag == Flag::Open { Flag::Open } else { Flag::Metadata };

            // END_CALL must reach orchestration before `closed` lets the metadata downlink end the call
            if let Some(flag) = forward {
                let mut relabelled = envelope;
                relabelled.flag = flag;
                debug!(call_id = %ctx.id_call, %task, ?flag, "Forwarding carrier event to orchestration");
                let text = relabelled.to_wire()?;
                tokio::select! {
                    biased;
                    _ = ctx.lifecycle.closing() => break,
                    sent = send_message(&orchestration, Message::Text(text)) => sent?,
                }
            }

            match verdict {
                Verdict::Reply(response) => {
                    outbound_metadata.push(Envelope::control(&ctx.id_call, reply_flag, response))?;
                }
                Verdict::Terminal(response) => {
                    outbound_metadata.push(Envelope::control(&ctx.id_call, Flag::EndCall, response))?;
                }
                Verdict::NoReply => {}
            }
        }
        Ok::<(), GatewayError>(())
    }
    .await;

    TaskOutcome::new(task, result)
}

/// T3: caller audio to the orchestration service.
pub async fn audio_uplink(ctx: Arc<CallContext>, mut inbound_audio: PacketReceiver, orchestration: SharedSink) -> TaskOutcome {
    let task = PipelineTask::AudioUplink;

    let result: GatewayResult<()> = async {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = ctx.lifecycle.closing() => break,
                envelope = inbound_audio.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            match (envelope.flag, envelope.details) {
                (Flag::Media, Details::Audio(audio)) => {
                    tokio::select! {
                        biased;
                        _ = ctx.lifecycle.closing() => break,
                        sent = send_message(&orchestration, Message::Binary(audio)) => sent?,
                    }
                }
                (flag, _) => warn!(call_id = %ctx.id_call, %task, ?flag, "Discarding non-media envelope"),
            }
        }
        Ok::<(), GatewayError>(())
    }
    .await;

    TaskOutcome::new(task, result)
}

/// T4: control responses to the carrier.
///
/// Sending `closed` ends the call. Sending `disconnect` starts the grace
/// period the carrier has to answer with `close`.
pub async fn metadata_downlink(
    ctx: Arc<CallContext>,
    mut outbound_metadata: PacketReceiver,
    carrier: CarrierHandle,
) -> TaskOutcome {
    let task = PipelineTask::MetadataDownlink;
    let mut grace_deadline: Option<Instant> = None;

    let result: GatewayResult<()> = async {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = ctx.lifecycle.closing() => break,
                _ = deadline(grace_deadline) => {
                    if ctx.lifecycle.begin_closing(CloseReason::OrchestrationEnded) {
                        info!(call_id = %ctx.id_call, %task, "Carrier did not close after disconnect, ending call");
                    }
                    break;
                }
                envelope = outbound_metadata.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let Some(response) = envelope.payload() else {
                warn!(call_id = %ctx.id_call, %task, flag = ?envelope.flag, "Outbound envelope without a frame");
                continue;
            };

            let text = serde_json::to_string(response)?;
            debug!(call_id = %ctx.id_call, %task, frame = %text, "Sending control frame to carrier");
            carrier.send_text(text)?;

            match envelope.flag {
                Flag::EndCall => {
                    ctx.lifecycle.begin_closing(CloseReason::CarrierClosed);
                }
                Flag::End if grace_deadline.is_none() => {
                    grace_deadline = Some(Instant::now() + ctx.disconnect_grace);
                }
                _ => {}
            }
        }
        Ok::<(), GatewayError>(())
    }
    .await;

    TaskOutcome::new(task, result)
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// T5: synthesized audio to the carrier, comfort noise whenever there is none.
pub async fn audio_downlink(
    ctx: Arc<CallContext>,
    mut outbound_audio: PacketReceiver,
    carrier: CarrierHandle,
    mut noise: BackgroundNoiseGenerator,
) -> TaskOutcome {
    let task = PipelineTask::AudioDownlink;
    let interval = ctx.audio.chunk_duration();
    let mut synthesized = Vec::new();

    let result: GatewayResult<()> = async {
        loop {
            let received = tokio::select! {
                biased;
                _ = ctx.lifecycle.closing() => break,
                received = outbound_audio.recv_timeout(interval) => received,
            };

            match received {
                TimedRecv::Packet(envelope) => match (envelope.flag, envelope.details) {
                    (Flag::Say, Details::Audio(audio)) => {
                        let pace = ctx.audio.playback_duration(audio.len());
                        trace!(call_id = %ctx.id_call, %task, bytes = audio.len(), "Playing synthesized audio");
                        synthesized.extend_from_slice(&audio);
                        carrier.send_audio(audio)?;

                        tokio::select! {
                            biased;
                            _ = ctx.lifecycle.closing() => break,
                            _ = tokio::time::sleep(pace) => {}
                        }
                    }
                    (Flag::Eof, _) => {
                        if ctx.playback.arm() {
                            debug!(call_id = %ctx.id_call, %task, "Utterance streamed, waiting for playback_completed");
                        } else {
                            debug!(call_id = %ctx.id_call, %task, "Repeated EOF ignored");
                        }
                    }
                    (flag, _) => warn!(call_id = %ctx.id_call, %task, ?flag, "Discarding unexpected downlink envelope"),
                },
                TimedRecv::Idle => {
                    if ctx.playback.reset_if_completed() {
                        debug!(call_id = %ctx.id_call, %task, "Playback completed, noise resumes next interval");
                    } else {
                        send_noise(&mut noise, &carrier, &mut synthesized)?;
                    }
                }
                TimedRecv::Closed => {
                    // no more synthesized audio will come; keep the line alive until the call closes
                    tokio::select! {
                        biased;
                        _ = ctx.lifecycle.closing() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    send_noise(&mut noise, &carrier, &mut synthesized)?;
                }
            }
        }
        Ok::<(), GatewayError>(())
    }
    .await;

    TaskOutcome::with_recording(task, result, Recording::Synthesized(synthesized))
}

fn send_noise(
    noise: &mut BackgroundNoiseGenerator,
    carrier: &CarrierHandle,
    synthesized: &mut Vec<u8>,
) -> GatewayResult<()> {
    let chunk = noise.next_chunk();
    synthesized.extend_from_slice(&chunk);
    carrier.send_audio(chunk)
}

/// T6: read the orchestration socket and feed the outbound queues.
///
/// The socket closing before `END` means the call lost its orchestration side.
pub async fn orchestration_downlink(
    ctx: Arc<CallContext>,
    mut orchestration: OrchestrationStream,
    outbound_metadata: PacketSender,
    outbound_audio: PacketSender,
) -> TaskOutcome {
    let task = PipelineTask::OrchestrationDownlink;
    let mut ended = false;

    let result: GatewayResult<()> = async {
        loop {
            let message = tokio::select! {
                biased;
                _ = ctx.lifecycle.closing() => break,
                message = orchestration.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    let frame = match OrchestrationFrame::parse(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(call_id = %ctx.id_call, %task, error = %e, "Dropping unparseable orchestration frame");
                            continue;
                        }
                    };

                    match Flag::from_wire(&frame.flag) {
                        Some(Flag::Say) => match frame.say_audio() {
                            Ok(audio) => outbound_audio.push(Envelope::say(audio))?,
                            Err(e) => warn!(call_id = %ctx.id_call, %task, error = %e, "Dropping SAY frame"),
                        },
                        Some(Flag::Eof) => outbound_audio.push(Envelope::marker(Flag::Eof))?,
                        Some(Flag::End) => {
                            ended = true;
                            if let Some(disconnect) = ctx.triagem.lock().await.finalize()? {
                                outbound_metadata.push(Envelope::control(&ctx.id_call, Flag::End, disconnect))?;
                            }
                        }
                        _ => warn!(call_id = %ctx.id_call, %task, flag = %frame.flag, "Unexpected orchestration flag"),
                    }
                }
                Some(Ok(Message::Binary(audio))) => {
                    warn!(call_id = %ctx.id_call, %task, bytes = audio.len(), "Unexpected binary frame from orchestration");
                }
                Some(Ok(Message::Close(_))) | None => {
                    if ended {
                        debug!(call_id = %ctx.id_call, %task, "Orchestration closed after END");
                    } else if ctx.lifecycle.begin_closing(CloseReason::OrchestrationLost) {
                        warn!(call_id = %ctx.id_call, %task, "Orchestration closed before END");
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(GatewayError::from(e)),
            }
        }
        Ok::<(), GatewayError>(())
    }
    .await;

    TaskOutcome::new(task, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::ingestion::carrier::CarrierCommand;
    use crate::ingestion::lifecycle::CallPhase;
    use crate::ingestion::queue::packet_queue;
    use crate::ingestion::templates::ProtocolTemplates;
    use crate::ingestion::triagem::Handshake;

    fn context() -> Arc<CallContext> {
        let config = AppConfig::default();
        let handshake =
            Handshake::parse(r#"{"type":"open","id":"S1","parameters":{"conversationId":"C1"}}"#).unwrap();
        let lifecycle = Arc::new(CallLifecycle::new());
        lifecycle.advance(CallPhase::Active);
        Arc::new(CallContext {
            id_call: handshake.id_call.clone(),
            lifecycle,
            playback: PlaybackTracker::new(),
            triagem: Mutex::new(Triagem::new(Arc::new(ProtocolTemplates::builtin().unwrap()), &handshake)),
            audio: config.audio.clone(),
            disconnect_grace: config.gateway.disconnect_grace(),
        })
    }

    #[tokio::test]
    async fn test_carrier_receive_sorts_frames() {
        let ctx = context();
        let (frames_tx, frames) = tokio::sync::mpsc::unbounded_channel();
        let (audio_tx, mut audio_rx) = packet_queue("inbound-audio");
        let (meta_tx, mut meta_rx) = packet_queue("inbound-metadata");

        frames_tx.send(CarrierFrame::Binary(vec![1, 2, 3])).unwrap();
        frames_tx.send(CarrierFrame::Text(r#"{"type":"ping","seq":2}"#.to_string())).unwrap();
        frames_tx.send(CarrierFrame::Text("{broken".to_string())).unwrap();
        frames_tx.send(CarrierFrame::Other("continuation".to_string())).unwrap();
        frames_tx.send(CarrierFrame::Binary(vec![4])).unwrap();
        frames_tx.send(CarrierFrame::Disconnected).unwrap();

        let outcome = carrier_receive(ctx.clone(), frames, audio_tx, meta_tx).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.recording, Some(Recording::Client(vec![1, 2, 3, 4])));
        assert_eq!(ctx.lifecycle.reason(), Some(CloseReason::CarrierDisconnected));

        assert_eq!(audio_rx.try_recv().unwrap(), Envelope::media("C1", vec![1, 2, 3]));
        assert_eq!(audio_rx.try_recv().unwrap(), Envelope::media("C1", vec![4]));
        assert_eq!(meta_rx.try_recv().unwrap().control_type(), Some("ping"));
        assert_eq!(meta_rx.try_recv().unwrap().flag, Flag::Unknown);
        assert!(meta_rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_downlink_sends_noise_every_interval() {
        let ctx = context();
        let (carrier, mut commands) = CarrierHandle::channel();
        let (_audio_tx, audio_rx) = packet_queue("outbound-audio");
        let noise = BackgroundNoiseGenerator::seeded(&ctx.audio, 7);
        let chunk_len = ctx.audio.chunk_len();

        let handle = tokio::spawn(audio_downlink(ctx.clone(), audio_rx, carrier, noise));

        // just past three intervals
        tokio::time::sleep(ctx.audio.chunk_duration() * 3 + Duration::from_millis(10)).await;
        for _ in 0..3 {
            match commands.try_recv().unwrap() {
                CarrierCommand::Binary(chunk) => assert_eq!(chunk.len(), chunk_len),
                other => panic!("expected noise chunk, got {:?}", other),
            }
        }
        assert!(commands.try_recv().is_err());

        ctx.lifecycle.begin_closing(CloseReason::Shutdown);
        let outcome = handle.await.unwrap();
        assert!(outcome.result.is_ok());
        match outcome.recording {
            Some(Recording::Synthesized(audio)) => assert_eq!(audio.len(), chunk_len * 3),
            other => panic!("expected synthesized recording, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_downlink_plays_say_then_arms_on_eof() {
        let ctx = context();
        let (carrier, mut commands) = CarrierHandle::channel();
        let (audio_tx, audio_rx) = packet_queue("outbound-audio");
        let noise = BackgroundNoiseGenerator::seeded(&ctx.audio, 7);

        audio_tx.push(Envelope::say(vec![0x7F; 800])).unwrap();
        audio_tx.push(Envelope::marker(Flag::Eof)).unwrap();
        audio_tx.push(Envelope::marker(Flag::Eof)).unwrap();

        let handle = tokio::spawn(audio_downlink(ctx.clone(), audio_rx, carrier, noise));

        // 800 bytes at 8kHz play for 100ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(commands.try_recv().unwrap(), CarrierCommand::Binary(vec![0x7F; 800]));
        assert!(!ctx.playback.is_ignoring());

        assert!(ctx.playback.take_completion());
        tokio::time::sleep(ctx.audio.chunk_duration()).await;
        // the idle tick that clears the completion sends nothing
        assert!(commands.try_recv().is_err());
        assert!(!ctx.playback.reset_if_completed());

        tokio::time::sleep(ctx.audio.chunk_duration()).await;
        assert!(matches!(commands.try_recv().unwrap(), CarrierCommand::Binary(_)));

        ctx.lifecycle.begin_closing(CloseReason::Shutdown);
        let outcome = handle.await.unwrap();
        match outcome.recording {
            Some(Recording::Synthesized(audio)) => assert!(audio.starts_with(&[0x7F; 800])),
            other => panic!("expected synthesized recording, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_ends_call() {
        let ctx = context();
        let (carrier, mut commands) = CarrierHandle::channel();
        let (meta_tx, meta_rx) = packet_queue("outbound-metadata");

        let disconnect = ctx.triagem.lock().await.finalize().unwrap().unwrap();
        meta_tx.push(Envelope::control("C1", Flag::End, disconnect)).unwrap();

        let handle = tokio::spawn(metadata_downlink(ctx.clone(), meta_rx, carrier));

        tokio::time::sleep(ctx.disconnect_grace / 2).await;
        assert!(matches!(commands.try_recv().unwrap(), CarrierCommand::Text(_)));
        assert!(!ctx.lifecycle.is_closing());

        tokio::time::sleep(ctx.disconnect_grace).await;
        assert_eq!(ctx.lifecycle.reason(), Some(CloseReason::OrchestrationEnded));
        assert!(handle.await.unwrap().result.is_ok());
    }

    #[tokio::test]
    async fn test_uplink_forwards_media_only() {
        use crate::ingestion::orchestration::testing::FakeConnector;
        use crate::ingestion::orchestration::OrchestrationConnector;

        let ctx = context();
        let (connector, mut far_end) = FakeConnector::new();
        let (sink, _stream) = connector.connect().await.unwrap();
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let (audio_tx, audio_rx) = packet_queue("inbound-audio");

        audio_tx.push(Envelope::media("C1", vec![9, 9])).unwrap();
        audio_tx.push(Envelope::marker(Flag::Eof)).unwrap();
        audio_tx.push(Envelope {
            id: None,
            flag: Flag::Media,
            details: Details::Empty,
        })
        .unwrap();
        drop(audio_tx);

        let outcome = audio_uplink(ctx, audio_rx, sink).await;
        assert!(outcome.result.is_ok());
        assert_eq!(far_end.received.recv().await.unwrap(), Message::Binary(vec![9, 9]));
        assert!(far_end.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uplink_stops_on_close_while_peer_is_stalled() {
        use crate::ingestion::orchestration::testing::FakeConnector;
        use crate::ingestion::orchestration::OrchestrationConnector;

        let ctx = context();
        let (connector, mut far_end) = FakeConnector::stalling();
        let (sink, _stream) = connector.connect().await.unwrap();
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        send_message(&sink, Message::Text("{}".to_string())).await.unwrap();
        far_end.received.recv().await.unwrap();

        let (audio_tx, audio_rx) = packet_queue("inbound-audio");
        audio_tx.push(Envelope::media("C1", vec![1])).unwrap();
        let handle = tokio::spawn(audio_uplink(ctx.clone(), audio_rx, sink.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!handle.is_finished());

        ctx.lifecycle.begin_closing(CloseReason::CarrierDisconnected);
        let outcome = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(outcome.result.is_ok());
        // the abandoned write released the sink
        assert!(sink.try_lock().is_ok());
        drop(audio_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_is_forwarded_before_closed_is_queued() {
        use crate::ingestion::orchestration::testing::FakeConnector;
        use crate::ingestion::orchestration::OrchestrationConnector;

        let ctx = context();
        let (connector, mut far_end) = FakeConnector::stalling();
        let (sink, _stream) = connector.connect().await.unwrap();
        let sink: SharedSink = Arc::new(Mutex::new(sink));
        send_message(&sink, Message::Text("{}".to_string())).await.unwrap();
        far_end.received.recv().await.unwrap();

        let handshake =
            Handshake::parse(r#"{"type":"open","id":"S1","parameters":{"conversationId":"C1"}}"#).unwrap();
        let (meta_tx, meta_rx) = packet_queue("inbound-metadata");
        let (out_tx, mut out_rx) = packet_queue("outbound-metadata");
        meta_tx.push(Envelope::control("C1", Flag::Open, handshake.payload)).unwrap();
        meta_tx
            .push(Envelope::control("C1", Flag::Metadata, json!({"type": "close", "seq": 2})))
            .unwrap();

        let handle = tokio::spawn(metadata_triage(ctx.clone(), meta_rx, out_tx, sink));
        tokio::time::sleep(Duration::from_secs(1)).await;

        // END_CALL is stuck on the stalled socket, so `closed` has not been queued
        assert_eq!(out_rx.try_recv().unwrap().flag, Flag::Open);
        assert!(out_rx.try_recv().is_none());

        ctx.lifecycle.begin_closing(CloseReason::Shutdown);
        assert!(handle.await.unwrap().result.is_ok());
        assert!(out_rx.try_recv().is_none());
    }
}
