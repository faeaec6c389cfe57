mod builder;
mod error;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use market_agent_model::{
    AssistantMessage, ModelFinishReason, ModelMessage, ModelRequest,
    ToolCallRequest, ToolCallResult,
};
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::model_client::{DeltaFn, ModelClient};
use crate::retry::RetryPolicy;
use crate::tool::Executor as ToolExecutor;
pub use builder::AgentBuilder;
pub use error::{Error, ErrorKind};

pub(crate) type SystemPromptFn = Box<dyn Fn() -> String + Send + Sync>;
pub(crate) type EventFn = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Progress notifications emitted while a turn is running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentEvent {
    /// A piece of the model's answer arrived.
    MessageDelta(String),
    /// The model asked for a tool call, which is about to run.
    ToolCall(ToolCallRequest),
    /// A tool call has finished.
    ToolResult {
        /// The result handed to the model.
        result: ToolCallResult,
        /// Whether the tool reported a failure.
        is_error: bool,
    },
}

/// Where a turn currently is.
#[derive(Debug)]
enum Stage {
    AwaitingModel,
    AwaitingToolResults(AssistantMessage),
    Done(String),
}

/// The tool-calling loop.
///
/// An agent alternates between asking the model and running the tools the
/// model asks for, until the model answers without tool calls. It holds no
/// conversation state itself, so one agent can serve many conversations.
pub struct Agent {
    model_client: ModelClient,
    tool_executor: ToolExecutor,
    system_prompt: Option<SystemPromptFn>,
    max_iterations: usize,
    retry_policy: RetryPolicy,
    on_event: Option<EventFn>,
}

impl Agent {
    /// The default number of model calls allowed in one turn.
    pub const DEFAULT_MAX_ITERATIONS: usize = 10;

    /// Runs one turn: appends `input` to the conversation and drives the
    /// loop until the model gives a final answer, which is returned.
    ///
    /// On error the conversation is left valid: every assistant message
    /// with tool calls is followed by all of its results, so the caller
    /// may continue with another turn.
    pub async fn run<S: Into<String>>(
        &self,
        conversation: &mut Conversation,
        input: S,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        if let Some(system_prompt) = &self.system_prompt {
            if conversation.ensure_system(|| system_prompt()) {
                debug!("inserted the system prompt");
            }
        }
        conversation.push(ModelMessage::user(input));

        let mut iterations = 0;
        let mut stage = Stage::AwaitingModel;
        loop {
            trace!("entering stage {stage:?}");
            stage = match stage {
                Stage::AwaitingModel => {
                    if iterations >= self.max_iterations {
                        warn!("gave up after {iterations} model calls");
                        return Err(Error::iteration_limit(self.max_iterations));
                    }
                    iterations += 1;
                    self.call_model(conversation, cancel).await?
                }
                Stage::AwaitingToolResults(message) => {
                    self.run_tools(conversation, message, cancel).await?;
                    Stage::AwaitingModel
                }
                Stage::Done(answer) => return Ok(answer),
            };
        }
    }

    async fn call_model(
        &self,
        conversation: &mut Conversation,
        cancel: &CancellationToken,
    ) -> Result<Stage, Error> {
        let req = ModelRequest {
            messages: conversation.messages().to_vec(),
            tools: self.tool_executor.definitions(),
        };
        let on_delta: DeltaFn = match &self.on_event {
            Some(on_event) => {
                let on_event = Arc::clone(on_event);
                Arc::new(move |delta: &str| {
                    on_event(AgentEvent::MessageDelta(delta.to_owned()))
                })
            }
            None => Arc::new(|_: &str| {}),
        };

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            resp = self.model_client.send_request_with_retry(
                &req,
                &self.retry_policy,
                on_delta,
            ) => resp.map_err(Error::model)?,
        };
        match resp.finish_reason {
            Some(ModelFinishReason::Length) => {
                warn!("the model response was cut off by the token limit");
            }
            Some(reason) => trace!("model finished with reason: {reason}"),
            None => {}
        }

        let message = resp.message;
        if message.has_tool_calls() {
            debug!("model requested {} tool call(s)", message.tool_calls.len());
            return Ok(Stage::AwaitingToolResults(message));
        }
        let answer = message.content.clone();
        conversation.push(ModelMessage::Assistant(message));
        Ok(Stage::Done(answer))
    }

    async fn run_tools(
        &self,
        conversation: &mut Conversation,
        message: AssistantMessage,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        for req in &message.tool_calls {
            self.emit(AgentEvent::ToolCall(req.clone()));
        }
        let batch = self.tool_executor.dispatch(&message.tool_calls);
        let completed = tokio::select! {
            biased;
            // Dropping the batch aborts the running calls.
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            completed = batch.join() => completed,
        };

        let mut results = Vec::with_capacity(completed.len());
        for outcome in &completed {
            let result = outcome.to_message();
            self.emit(AgentEvent::ToolResult {
                result: result.clone(),
                is_error: outcome.result.is_err(),
            });
            results.push(ModelMessage::Tool(result));
        }
        // The assistant message and its results are committed together.
        conversation.push(ModelMessage::Assistant(message));
        conversation.extend(results);
        Ok(())
    }

    #[inline]
    fn emit(&self, event: AgentEvent) {
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }
}
