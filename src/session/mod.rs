//! # Interview Sessions
//!
//! - **model**: session rows, statuses, transcript entries and events
//! - **orchestrator**: lifecycle, single-flight per owner, audio routing
//! - **persistence**: where finished transcripts go

pub mod model;
pub mod orchestrator;
pub mod persistence;

pub use model::{ControlEvent, ErrorInfo, SessionEvent, SessionId, SessionOptions, SessionStatus};
pub use orchestrator::{OrchestratorError, OrchestratorSettings, SessionOrchestrator};
