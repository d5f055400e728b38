//! # Recording Archival
//!
//! At the end of a call both sides of the conversation are handed to an
//! archive: the caller's audio and everything the gateway played back
//! (synthesized speech plus keepalive noise). Recordings arrive as raw mu-law
//! and leave as 16-bit PCM WAV files.
//!
//! Archival is best effort. A failed upload is logged by the caller and never
//! holds up session teardown.

use crate::audio::g711;
use crate::config::ArchiveConfig;
use crate::error::{GatewayError, GatewayResult};
use futures_util::future::BoxFuture;
use std::io::Cursor;
use std::path::PathBuf;
use tracing::debug;

/// File extension of archived recordings.
pub const RECORDING_EXTENSION: &str = "wav";

/// Storage collaborator that receives finished recordings.
pub trait AudioArchive: Send + Sync {
    /// Store `body` under `key`.
    fn store(&self, key: String, body: Vec<u8>) -> BoxFuture<'static, GatewayResult<()>>;
}

/// Key of the caller's recording.
pub fn client_recording_key(id_call: &str) -> String {
    format!("{}_cliente.{}", id_call, RECORDING_EXTENSION)
}

/// Key of the recording of everything sent to the caller.
pub fn synthesized_recording_key(id_call: &str) -> String {
    format!("{}_ai.{}", id_call, RECORDING_EXTENSION)
}

/// Wrap mu-law audio in a mono 16-bit PCM WAV container.
pub fn mulaw_to_wav(mulaw: &[u8], sample_rate: u32) -> GatewayResult<Vec<u8>> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let track = wav::BitDepth::Sixteen(g711::decode(mulaw));

    let mut out = Cursor::new(Vec::with_capacity(44 + mulaw.len() * 2));
    wav::write(header, &track, &mut out)?;
    Ok(out.into_inner())
}

/// Writes recordings as files under a directory.
pub struct FileArchive {
    directory: PathBuf,
}

impl FileArchive {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl AudioArchive for FileArchive {
    fn store(&self, key: String, body: Vec<u8>) -> BoxFuture<'static, GatewayResult<()>> {
        let directory = self.directory.clone();
        Box::pin(async move {
            if key.contains('/') || key.contains("..") {
                return Err(GatewayError::Archive(format!("refusing unsafe key '{}'", key)));
            }
            tokio::fs::create_dir_all(&directory).await?;
            let path = directory.join(&key);
            tokio::fs::write(&path, &body).await?;
            debug!(path = %path.display(), bytes = body.len(), "Recording archived");
            Ok(())
        })
    }
}

/// Archive used when archival is switched off; drops every recording.
pub struct DisabledArchive;

impl AudioArchive for DisabledArchive {
    fn store(&self, key: String, _body: Vec<u8>) -> BoxFuture<'static, GatewayResult<()>> {
        Box::pin(async move {
            debug!(key = %key, "Archival disabled, recording dropped");
            Ok(())
        })
    }
}

/// Pick the archive implementation the configuration asks for.
pub fn from_config(config: &ArchiveConfig) -> Box<dyn AudioArchive> {
    if config.enabled {
        Box::new(FileArchive::new(&config.directory))
    } else {
        Box::new(DisabledArchive)
    }
}
