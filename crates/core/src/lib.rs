//! Core logic including the agent loop, tool execution and model retries.

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

mod agent;
pub mod conversation;
mod model_client;
mod retry;
pub mod tool;

pub use agent::{Agent, AgentBuilder, AgentEvent, Error, ErrorKind};
pub use conversation::Conversation;
pub use retry::RetryPolicy;
pub use tokio_util::sync::CancellationToken;
