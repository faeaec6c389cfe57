use std::fmt::{self, Display};
use std::pin::Pin;
use std::task::{self, Poll};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::ModelProviderError;

/// A streamed model response, consumed event by event.
pub trait ModelResponse: Sized + Send + 'static {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// Polls for the next event of the response.
    ///
    /// Returns `Poll::Pending` while no event is available, in which case
    /// the task is woken once one may be. `Ok(Some(_))` yields an event,
    /// `Ok(None)` signals the end of the response, and `Err(_)` a failure
    /// that ends the response too.
    ///
    /// A finished response keeps returning `Ok(None)`.
    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>>;
}

/// Why the model stopped generating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFinishReason {
    /// The model is waiting for tool results.
    ToolCalls,
    /// The answer is complete.
    Stop,
    /// The completion token limit was reached.
    Length,
}

impl Display for ModelFinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFinishReason::ToolCalls => write!(f, "tool calls"),
            ModelFinishReason::Stop => write!(f, "stop"),
            ModelFinishReason::Length => write!(f, "length"),
        }
    }
}

/// A tool invocation requested by the model.
///
/// Each request is answered by exactly one
/// [`ToolCallResult`](crate::ToolCallResult) carrying the same `id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Identifier chosen by the model, echoed back in the result.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Tool input, normally a JSON object.
    pub arguments: Value,
}

impl ToolCallRequest {
    /// Creates a tool call request.
    #[inline]
    pub fn new<S1, S2>(id: S1, name: S2, arguments: Value) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One event of a [`ModelResponse`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelResponseEvent {
    /// The last event of a response.
    Completed(ModelFinishReason),
    /// A piece of the answer text.
    MessageDelta(String),
    /// A complete tool call request.
    ToolCall(ToolCallRequest),
}
