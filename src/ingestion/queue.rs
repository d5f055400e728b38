//! # Packet Queues
//!
//! Four unbounded FIFO channels per call:
//!
//! | queue | producer | consumer |
//! |---|---|---|
//! | inbound-audio | carrier receive | audio uplink |
//! | inbound-metadata | handshake, carrier receive | metadata triage |
//! | outbound-metadata | metadata triage, orchestration downlink | metadata downlink |
//! | outbound-audio | orchestration downlink | audio downlink |
//!
//! Producers never wait; backpressure is applied only at the socket edges.

use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::envelope::Envelope;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sending half of a packet queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PacketSender {
    name: &'static str,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receiving half of a packet queue.
#[derive(Debug)]
pub struct PacketReceiver {
    name: &'static str,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Result of a time-bounded receive.
#[derive(Debug, PartialEq)]
pub enum TimedRecv {
    Packet(Envelope),
    /// Nothing arrived within the interval
    Idle,
    /// Every sender is gone
    Closed,
}

/// Create a named queue.
pub fn packet_queue(name: &'static str) -> (PacketSender, PacketReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PacketSender { name, tx }, PacketReceiver { name, rx })
}

impl PacketSender {
    pub fn push(&self, envelope: Envelope) -> GatewayResult<()> {
        self.tx
            .send(envelope)
            .map_err(|_| GatewayError::Transport(format!("{} queue has no consumer", self.name)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PacketReceiver {
    /// Wait for the next packet; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Wait at most `interval` for the next packet.
    pub async fn recv_timeout(&mut self, interval: Duration) -> TimedRecv {
        match tokio::time::timeout(interval, self.rx.recv()).await {
            Ok(Some(envelope)) => TimedRecv::Packet(envelope),
            Ok(None) => TimedRecv::Closed,
            Err(_) => TimedRecv::Idle,
        }
    }

    /// Take a packet only if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The four queues of one call, before they are handed out to the tasks.
pub struct PacketQueues {
    pub inbound_audio: (PacketSender, PacketReceiver),
    pub inbound_metadata: (PacketSender, PacketReceiver),
    pub outbound_metadata: (PacketSender, PacketReceiver),
    pub outbound_audio: (PacketSender, PacketReceiver),
}

impl PacketQueues {
    pub fn new() -> Self {
        Self {
            inbound_audio: packet_queue("inbound-audio"),
            inbound_metadata: packet_queue("inbound-metadata"),
            outbound_metadata: packet_queue("outbound-metadata"),
            outbound_audio: packet_queue("outbound-audio"),
        }
    }
}
