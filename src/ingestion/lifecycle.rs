//! # Call Lifecycle
//!
//! Shared per-call state every task can observe:
//!
//! - **CallLifecycle**: the call phase, published on a `watch` channel so that
//!   any task can wait for the closing transition while it is blocked on I/O
//! - **PlaybackTracker**: the two flags that turn a carrier
//!   `playback_completed` event into exactly one `END_AUDIO` per utterance
//!
//! ## Phases:
//! `Handshaking` → `Connecting` → `Active` → `Closing` → `Closed`
//!
//! Any phase may jump to `Closing`; the first trigger wins and later ones are
//! ignored.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Handshaking,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Handshaking => "handshaking",
            CallPhase::Connecting => "connecting",
            CallPhase::Active => "active",
            CallPhase::Closing => "closing",
            CallPhase::Closed => "closed",
        }
    }

    fn is_ending(&self) -> bool {
        matches!(self, CallPhase::Closing | CallPhase::Closed)
    }
}

/// What started the closing transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The carrier socket dropped without a close handshake
    CarrierDisconnected,
    /// The carrier sent `close` and got `closed`
    CarrierClosed,
    /// `disconnect` was sent and the grace period ran out
    OrchestrationEnded,
    /// The orchestration socket closed before `END`
    OrchestrationLost,
    /// A pipeline task returned an error
    TaskFailed(String),
    /// The process is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::CarrierDisconnected => write!(f, "carrier disconnected"),
            CloseReason::CarrierClosed => write!(f, "carrier closed"),
            CloseReason::OrchestrationEnded => write!(f, "orchestration ended the call"),
            CloseReason::OrchestrationLost => write!(f, "orchestration connection lost"),
            CloseReason::TaskFailed(task) => write!(f, "task {} failed", task),
            CloseReason::Shutdown => write!(f, "gateway shutdown"),
        }
    }
}

#[derive(Debug, Clone)]
struct LifecycleState {
    phase: CallPhase,
    reason: Option<CloseReason>,
}

/// Observable call phase.
#[derive(Debug)]
pub struct CallLifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Default for CallLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CallLifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState {
            phase: CallPhase::Handshaking,
            reason: None,
        });
        Self { state }
    }

    pub fn phase(&self) -> CallPhase {
        self.state.borrow().phase
    }

    /// Why the call is closing, once it is.
    pub fn reason(&self) -> Option<CloseReason> {
        self.state.borrow().reason.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.phase().is_ending()
    }

    /// Move forward to `phase`. Ignored once the call is closing.
    pub fn advance(&self, phase: CallPhase) {
        self.state.send_if_modified(|state| {
            if state.phase.is_ending() || state.phase == phase {
                return false;
            }
            state.phase = phase;
            true
        });
    }

    /// Enter `Closing`. Returns `true` only for the trigger that won.
    pub fn begin_closing(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.phase.is_ending() {
                return false;
            }
            state.phase = CallPhase::Closing;
            state.reason = Some(reason);
            true
        })
    }

    /// Teardown is done.
    pub fn mark_closed(&self) {
        self.state.send_if_modified(|state| {
            if state.phase == CallPhase::Closed {
                return false;
            }
            if state.reason.is_none() {
                state.reason = Some(CloseReason::Shutdown);
            }
            state.phase = CallPhase::Closed;
            true
        });
    }

    /// Resolves once the call enters `Closing` (immediately if it already has).
    pub async fn closing(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives in `self`, so the channel cannot close under us
        let _ = rx.wait_for(|state| state.phase.is_ending()).await;
    }
}

/// Playback bookkeeping shared by the metadata triage and audio downlink tasks.
///
/// `ignoring` starts out set: a `playback_completed` arriving before any
/// synthesized utterance has finished streaming is not ours to report.
#[derive(Debug)]
pub struct PlaybackTracker {
    completed: AtomicBool,
    ignoring: AtomicBool,
}

impl Default for PlaybackTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackTracker {
    pub fn new() -> Self {
        Self {
            completed: AtomicBool::new(false),
            ignoring: AtomicBool::new(true),
        }
    }

    /// The orchestration service finished an utterance (`EOF`).
    ///
    /// Returns `false` when the tracker was already armed, so a repeated `EOF`
    /// changes nothing.
    pub fn arm(&self) -> bool {
        self.ignoring
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The carrier reported `playback_completed`.
    ///
    /// Returns `true` when this completion should be forwarded as `END_AUDIO`.
    pub fn take_completion(&self) -> bool {
        if self
            .ignoring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.completed.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Clear a recorded completion. Returns whether one was pending.
    pub fn reset_if_completed(&self) -> bool {
        self.completed.swap(false, Ordering::AcqRel)
    }

    pub fn is_ignoring(&self) -> bool {
        self.ignoring.load(Ordering::Acquire)
    }
}
