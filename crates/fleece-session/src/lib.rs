//! Session records, the session status state machine, the agent failure
//! taxonomy, and durable session persistence.

mod error;
mod record;
mod store;

pub use error::AgentError;
pub use record::{
    AgentMessage, ExecutionMode, SessionRecord, SessionStatus, RESUMABLE_STATES,
};
pub use store::SessionStore;
