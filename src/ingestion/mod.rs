//! # Call Ingestion
//!
//! Everything that happens between a carrier WebSocket and the orchestration
//! service for one phone call.
//!
//! ## Components:
//! - **envelope / queue**: the `{id, flag, details}` record and the four
//!   per-call queues it travels on
//! - **templates / triagem**: response templates and the protocol tracker that
//!   stamps them
//! - **lifecycle**: call phase and playback bookkeeping shared by the tasks
//! - **carrier / orchestration**: the two socket links
//! - **tasks / session**: the T1-T6 pipeline and the session that runs it
//! - **registry / gateway**: process-wide call map and the entry point used by
//!   the HTTP layer

pub mod carrier;
pub mod envelope;
pub mod gateway;
pub mod lifecycle;
pub mod orchestration;
pub mod queue;
pub mod registry;
pub mod session;
pub mod tasks;
pub mod templates;
pub mod triagem;
