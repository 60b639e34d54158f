//! Session lifecycle orchestration for coding-agent work on tracked issues.
//!
//! The orchestrator owns the session state machine: it provisions an
//! execution environment per session, consumes the agent's message stream,
//! reclassifies idle sessions, delivers operator input, and tears the
//! environment down when the session ends. Lifecycle changes fan out as
//! events through a deduplicating sink.

pub mod agent;
pub mod config;
pub mod events;
pub mod orchestrator;

pub use agent::{AgentStream, AgentStreamSource};
pub use config::OrchestratorConfig;
pub use events::{DedupEventSink, EventSink, OrchestratorEvent};
pub use orchestrator::{SessionOrchestrator, StartSessionRequest};
