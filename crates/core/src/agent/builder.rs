use market_agent_model::ModelProvider;

use super::{Agent, AgentEvent, EventFn, SystemPromptFn};
use crate::model_client::ModelClient;
use crate::retry::RetryPolicy;
use crate::tool::{AnyTool, Executor as ToolExecutor, Tool, ToolObject};

/// [`Agent`] builder.
pub struct AgentBuilder {
    model_client: ModelClient,
    tools: Vec<Box<dyn ToolObject>>,
    system_prompt: Option<SystemPromptFn>,
    max_iterations: usize,
    retry_policy: RetryPolicy,
    on_event: Option<EventFn>,
}

impl AgentBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(
        provider: P,
    ) -> Self {
        Self {
            model_client: ModelClient::new(provider),
            tools: vec![],
            system_prompt: None,
            max_iterations: Agent::DEFAULT_MAX_ITERATIONS,
            retry_policy: RetryPolicy::default(),
            on_event: None,
        }
    }

    /// Registers a tool.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Self {
        self.tools.push(Box::new(AnyTool(tool)));
        self
    }

    /// Sets the function producing the system message, which is inserted
    /// into conversations that don't have one yet.
    #[inline]
    pub fn with_system_prompt(
        mut self,
        system_prompt: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.system_prompt = Some(Box::new(system_prompt));
        self
    }

    /// Limits the number of model calls in a single turn.
    #[inline]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Sets how failed model requests are retried.
    #[inline]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Attaches a callback receiving [`AgentEvent`]s.
    #[inline]
    pub fn on_event(
        mut self,
        on_event: impl Fn(AgentEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(std::sync::Arc::new(on_event));
        self
    }

    /// Builds the agent.
    pub fn build(self) -> Agent {
        let Self {
            model_client,
            tools,
            system_prompt,
            max_iterations,
            retry_policy,
            on_event,
        } = self;
        Agent {
            model_client,
            tool_executor: ToolExecutor::with_tools(tools),
            system_prompt,
            max_iterations,
            retry_policy,
            on_event,
        }
    }
}
