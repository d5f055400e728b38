//! # Gateway
//!
//! Boundary between the HTTP layer and the per-call pipeline. The carrier
//! WebSocket actor hands over a frame channel and a command handle; the gateway
//! runs the call on its own task and keeps the process-wide call counters.

use crate::audio::archive::{self, AudioArchive};
use crate::config::AppConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::carrier::{CarrierFrames, CarrierHandle};
use crate::ingestion::orchestration::WsConnector;
use crate::ingestion::registry::ConnectionRegistry;
use crate::ingestion::session::{CallDeps, CallReport, CallSession, CallSettings};
use crate::ingestion::templates::ProtocolTemplates;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Call counters since process start.
#[derive(Debug, Default)]
pub struct CallMetrics {
    accepted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    handshake_failures: AtomicU64,
    archive_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallMetricsSnapshot {
    pub calls_accepted: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub calls_rejected: u64,
    pub handshake_failures: u64,
    pub archive_failures: u64,
}

impl CallMetrics {
    /// An upgrade was refused (bad key or no capacity).
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_report(&self, report: &CallReport) {
        if report.failed() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        self.archive_failures
            .fetch_add(report.archive_failures as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            calls_accepted: self.accepted.load(Ordering::Relaxed),
            calls_completed: self.completed.load(Ordering::Relaxed),
            calls_failed: self.failed.load(Ordering::Relaxed),
            calls_rejected: self.rejected.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            archive_failures: self.archive_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct Gateway {
    deps: CallDeps,
    metrics: Arc<CallMetrics>,
}

impl Gateway {
    /// Build the production gateway: templates, orchestration connector and
    /// archive all come from the configuration.
    pub fn from_config(config: &AppConfig, registry: Arc<ConnectionRegistry>) -> GatewayResult<Self> {
        let templates = ProtocolTemplates::load(&config.protocol.templates_dir)?;
        let connector = WsConnector::new(
            config.orchestration.url.clone(),
            config.orchestration.connect_timeout(),
        );
        let archive: Arc<dyn AudioArchive> = Arc::from(archive::from_config(&config.archive));

        info!(
            orchestration = %config.orchestration.url,
            templates = ?templates.names(),
            archive_enabled = config.archive.enabled,
            "Gateway ready"
        );

        Ok(Self::new(CallDeps {
            registry,
            templates: Arc::new(templates),
            connector: Arc::new(connector),
            archive,
            settings: CallSettings::from_config(config),
        }))
    }

    pub fn new(deps: CallDeps) -> Self {
        Self {
            deps,
            metrics: Arc::new(CallMetrics::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.deps.registry
    }

    pub fn metrics(&self) -> &Arc<CallMetrics> {
        &self.metrics
    }

    /// Refuse new calls once the registry is full.
    pub fn check_capacity(&self) -> GatewayResult<()> {
        let registry = &self.deps.registry;
        if registry.is_full() {
            self.metrics.record_rejected();
            return Err(GatewayError::Capacity(format!(
                "{} of {} calls in progress",
                registry.count(),
                registry.max_calls()
            )));
        }
        Ok(())
    }

    /// Run a call on its own task.
    ///
    /// Resolves to `None` when the call never got past its handshake.
    pub fn open_call(&self, frames: CarrierFrames, carrier: CarrierHandle) -> JoinHandle<Option<CallReport>> {
        let deps = self.deps.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let session = match CallSession::accept(frames, carrier.clone(), deps).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "Rejecting call");
                    metrics.handshake_failures.fetch_add(1, Ordering::Relaxed);
                    carrier.close();
                    return None;
                }
            };

            metrics.accepted.fetch_add(1, Ordering::Relaxed);
            let report = session.run().await;
            metrics.record_report(&report);
            Some(report)
        })
    }
}
