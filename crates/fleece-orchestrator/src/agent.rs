//! Seam to the opaque agent process: a cancellable message stream plus an
//! input channel back into the environment.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use fleece_container::EnvironmentHandle;
use fleece_session::{AgentError, AgentMessage};

/// The agent's output as a cancellable async producer. Dropping the stream
/// is the cancellation: no further messages are observed.
pub type AgentStream = Pin<Box<dyn Stream<Item = AgentMessage> + Send>>;

#[async_trait]
/// Trait contract for `AgentStreamSource` behavior.
pub trait AgentStreamSource: Send + Sync {
    /// Attaches to the environment's message stream.
    async fn open_stream(&self, handle: &EnvironmentHandle) -> Result<AgentStream, AgentError>;

    /// Delivers operator input (a resume prompt or a question answer) to the
    /// agent process inside the environment.
    async fn send_input(&self, handle: &EnvironmentHandle, input: &str)
        -> Result<(), AgentError>;
}
