//! # Carrier Link
//!
//! Channel-level view of the carrier WebSocket. The socket itself is owned by
//! the `CarrierWebSocket` actor; a call only sees:
//!
//! - a stream of [`CarrierFrame`]s (what the carrier sent)
//! - a [`CarrierHandle`] to queue [`CarrierCommand`]s (what the carrier should get)
//!
//! This keeps the pipeline independent of actix and lets tests drive a call
//! with plain channels.

use crate::error::{GatewayError, GatewayResult};
use tokio::sync::mpsc;

/// A frame received from the carrier socket.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierFrame {
    /// JSON control frame
    Text(String),
    /// Raw mu-law audio
    Binary(Vec<u8>),
    /// The socket closed or failed
    Disconnected,
    /// Any other frame kind, named for logging
    Other(String),
}

/// Something to write to the carrier socket.
#[derive(Debug, Clone, PartialEq)]
pub enum CarrierCommand {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

pub type CarrierFrames = mpsc::UnboundedReceiver<CarrierFrame>;
pub type CarrierCommands = mpsc::UnboundedReceiver<CarrierCommand>;

/// Write side of the carrier socket. Cheap to clone; every clone feeds the
/// same socket in send order.
#[derive(Debug, Clone)]
pub struct CarrierHandle {
    tx: mpsc::UnboundedSender<CarrierCommand>,
}

impl CarrierHandle {
    /// A handle and the command stream the socket owner must drain.
    pub fn channel() -> (Self, CarrierCommands) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_text(&self, text: String) -> GatewayResult<()> {
        self.send(CarrierCommand::Text(text))
    }

    pub fn send_audio(&self, audio: Vec<u8>) -> GatewayResult<()> {
        self.send(CarrierCommand::Binary(audio))
    }

    /// Ask the socket owner to close the connection. A socket that is already
    /// gone counts as closed.
    pub fn close(&self) {
        let _ = self.tx.send(CarrierCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: CarrierCommand) -> GatewayResult<()> {
        self.tx
            .send(command)
            .map_err(|_| GatewayError::Transport("carrier socket is gone".to_string()))
    }
}
