//! # Configuration Management
//!
//! Loads gateway configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP__SERVER__PORT`, `APP__ORCHESTRATION__URL`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The double underscore separator keeps snake_case keys such as
//! `operation_id` addressable from the environment.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub orchestration: OrchestrationConfig,
    pub audio: AudioConfig,
    pub archive: ArchiveConfig,
    pub protocol: ProtocolConfig,
    pub auth: AuthConfig,
}

/// Bind address of the HTTP/WebSocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Carrier-facing routes and call admission.
///
/// ## Fields:
/// - `audiohook_path`: route the carrier upgrades to
/// - `monitor_path`: WebSocket route that streams the live call count
/// - `monitor_interval_ms`: how often the call count is pushed
/// - `max_concurrent_calls`: upgrades beyond this are answered with 503
/// - `disconnect_grace_ms`: after sending `disconnect`, how long the carrier has
///   to complete the close handshake before the call is torn down anyway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub audiohook_path: String,
    pub monitor_path: String,
    pub monitor_interval_ms: u64,
    pub max_concurrent_calls: usize,
    pub disconnect_grace_ms: u64,
}

/// Where the orchestration service lives and how the gateway introduces itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    pub url: String,
    pub operation_id: u64,
    pub connect_timeout_ms: u64,
}

/// Carrier audio format and keepalive pacing.
///
/// The carrier streams single-channel mu-law, one byte per sample, so
/// `sample_rate` bytes make one second of audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub chunk_duration_ms: u64,
    pub noise_amplitude: i16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub directory: String,
}

/// An empty `templates_dir` selects the built-in template set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub templates_dir: String,
}

/// An empty `api_key` disables the upgrade key check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub api_key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            gateway: GatewayConfig {
                audiohook_path: "/audiohook".to_string(),
                monitor_path: "/ws/active-calls".to_string(),
                monitor_interval_ms: 1000,
                max_concurrent_calls: 200,
                disconnect_grace_ms: 3000,
            },
            orchestration: OrchestrationConfig {
                url: "ws://localhost:9999/orquestration/orquestration".to_string(),
                operation_id: 5,
                connect_timeout_ms: 5000,
            },
            audio: AudioConfig {
                sample_rate: 8000,
                chunk_duration_ms: 500,
                noise_amplitude: 48,
            },
            archive: ArchiveConfig {
                enabled: true,
                directory: "recordings".to_string(),
            },
            protocol: ProtocolConfig {
                templates_dir: String::new(),
            },
            auth: AuthConfig {
                api_key: String::new(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__ORCHESTRATION__URL=ws://orchestrator:9999/ws`
    /// - `APP__AUDIO__CHUNK_DURATION_MS=400`
    /// - `APP__AUTH__API_KEY=secret`
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.gateway.audiohook_path.starts_with('/') || !self.gateway.monitor_path.starts_with('/') {
            return Err(anyhow::anyhow!("Gateway paths must start with '/'"));
        }

        if self.gateway.audiohook_path == self.gateway.monitor_path {
            return Err(anyhow::anyhow!("AudioHook and monitor paths must differ"));
        }

        if self.gateway.monitor_interval_ms == 0 {
            return Err(anyhow::anyhow!("Monitor interval must be greater than 0"));
        }

        if self.gateway.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if !(self.orchestration.url.starts_with("ws://") || self.orchestration.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Orchestration URL must use ws:// or wss://, got '{}'",
                self.orchestration.url
            ));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.chunk_duration_ms == 0 {
            return Err(anyhow::anyhow!("Audio chunk duration must be greater than 0"));
        }

        if self.audio.noise_amplitude < 0 {
            return Err(anyhow::anyhow!("Noise amplitude cannot be negative"));
        }

        if self.archive.enabled && self.archive.directory.trim().is_empty() {
            return Err(anyhow::anyhow!("Archive directory is required when archival is enabled"));
        }

        Ok(())
    }
}

impl AudioConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_millis(self.chunk_duration_ms)
    }

    /// Bytes of mu-law audio in one keepalive chunk.
    pub fn chunk_len(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_duration_ms / 1000) as usize
    }

    /// Playback time of `len` bytes of mu-law audio.
    pub fn playback_duration(&self, len: usize) -> Duration {
        Duration::from_millis(len as u64 * 1000 / self.sample_rate as u64)
    }
}

impl GatewayConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl OrchestrationConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
