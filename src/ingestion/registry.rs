//! # Connection Registry
//!
//! Process-wide map of live calls keyed by `id_call`. The accept path inserts,
//! each session's teardown removes its own entry, and the monitor only reads
//! the count.
//!
//! The registry never owns a call: an entry holds the call's lifecycle so the
//! process can ask it to close, nothing more.

use crate::error::{GatewayError, GatewayResult};
use crate::ingestion::lifecycle::{CallLifecycle, CloseReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Registry entry for one call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub id_call: String,
    pub id_session: String,
    pub client_number: Option<String>,
    pub started_at: DateTime<Utc>,
    pub lifecycle: Arc<CallLifecycle>,
}

/// Snapshot used by the health and metrics endpoints.
#[derive(Debug, Serialize)]
pub struct RegistrySummary {
    pub active_calls: usize,
    pub max_calls: usize,
    pub phase_counts: BTreeMap<String, usize>,
}

pub struct ConnectionRegistry {
    calls: RwLock<HashMap<String, CallHandle>>,
    max_calls: usize,
}

impl ConnectionRegistry {
    pub fn new(max_calls: usize) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            max_calls,
        }
    }

    /// Insert a call.
    ///
    /// ## Returns:
    /// - **Err(Handshake)**: a call with this id is already live; the existing
    ///   entry is left untouched
    /// - **Err(Capacity)**: `max_calls` calls are already live
    pub fn register(&self, handle: CallHandle) -> GatewayResult<()> {
        let mut calls = self.calls.write().unwrap_or_else(|e| e.into_inner());

        if calls.contains_key(&handle.id_call) {
            return Err(GatewayError::Handshake(format!(
                "call '{}' is already registered",
                handle.id_call
            )));
        }

        if calls.len() >= self.max_calls {
            return Err(GatewayError::Capacity(format!(
                "maximum concurrent calls ({}) reached",
                self.max_calls
            )));
        }

        info!(call_id = %handle.id_call, session_id = %handle.id_session, "Call registered");
        calls.insert(handle.id_call.clone(), handle);
        Ok(())
    }

    /// Remove a call. Returns `false` if it was not registered.
    pub fn deregister(&self, id_call: &str) -> bool {
        let mut calls = self.calls.write().unwrap_or_else(|e| e.into_inner());
        calls.remove(id_call).is_some()
    }

    pub fn get(&self, id_call: &str) -> Option<CallHandle> {
        let calls = self.calls.read().unwrap_or_else(|e| e.into_inner());
        calls.get(id_call).cloned()
    }

    pub fn count(&self) -> usize {
        let calls = self.calls.read().unwrap_or_else(|e| e.into_inner());
        calls.len()
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.max_calls
    }

    pub fn call_ids(&self) -> Vec<String> {
        let calls = self.calls.read().unwrap_or_else(|e| e.into_inner());
        calls.keys().cloned().collect()
    }

    /// Ask every live call to close. Each call deregisters itself on teardown.
    ///
    /// Returns how many calls accepted the request.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let calls = self.calls.read().unwrap_or_else(|e| e.into_inner());
        calls
            .values()
            .filter(|call| call.lifecycle.begin_closing(reason.clone()))
            .count()
    }

    pub fn summary(&self) -> RegistrySummary {
        let calls = self.calls.read().unwrap_or_else(|e| e.into_inner());

        let mut phase_counts = BTreeMap::new();
        for call in calls.values() {
            *phase_counts
                .entry(call.lifecycle.phase().as_str().to_string())
                .or_insert(0) += 1;
        }

        RegistrySummary {
            active_calls: calls.len(),
            max_calls: self.max_calls,
            phase_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::lifecycle::CallPhase;

    fn handle(id_call: &str) -> CallHandle {
        CallHandle {
            id_call: id_call.to_string(),
            id_session: format!("session-{}", id_call),
            client_number: None,
            started_at: Utc::now(),
            lifecycle: Arc::new(CallLifecycle::new()),
        }
    }

    #[test]
    fn test_register_and_deregister() {
        let registry = ConnectionRegistry::new(10);
        registry.register(handle("C1")).unwrap();
        registry.register(handle("C2")).unwrap();
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get("C1").unwrap().id_session, "session-C1");

        assert!(registry.deregister("C1"));
        assert!(!registry.deregister("C1"));
        assert_eq!(registry.call_ids(), vec!["C2".to_string()]);
    }

    #[test]
    fn test_duplicate_call_id_keeps_first_entry() {
        let registry = ConnectionRegistry::new(10);
        let first = handle("C1");
        let first_lifecycle = first.lifecycle.clone();
        registry.register(first).unwrap();

        let err = registry.register(handle("C1")).unwrap_err();
        assert!(matches!(err, GatewayError::Handshake(_)));
        assert_eq!(registry.count(), 1);
        assert!(Arc::ptr_eq(&registry.get("C1").unwrap().lifecycle, &first_lifecycle));
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ConnectionRegistry::new(1);
        registry.register(handle("C1")).unwrap();
        assert!(registry.is_full());
        assert!(matches!(registry.register(handle("C2")), Err(GatewayError::Capacity(_))));
    }

    #[test]
    fn test_close_all_signals_every_call_once() {
        let registry = ConnectionRegistry::new(10);
        let first = handle("C1");
        first.lifecycle.advance(CallPhase::Active);
        registry.register(first).unwrap();
        registry.register(handle("C2")).unwrap();

        let summary = registry.summary();
        assert_eq!(summary.active_calls, 2);
        assert_eq!(summary.phase_counts.get("active"), Some(&1));
        assert_eq!(summary.phase_counts.get("handshaking"), Some(&1));

        assert_eq!(registry.close_all(CloseReason::Shutdown), 2);
        assert_eq!(registry.close_all(CloseReason::Shutdown), 0);
        assert_eq!(
            registry.get("C2").unwrap().lifecycle.reason(),
            Some(CloseReason::Shutdown)
        );
        // entries stay until each call tears down
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_concurrent_register_and_deregister() {
        let registry = Arc::new(ConnectionRegistry::new(1000));
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("W{}-{}", worker, i);
                        registry.register(handle(&id)).unwrap();
                        if i % 2 == 0 {
                            assert!(registry.deregister(&id));
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.count(), 8 * 25);
    }
}
