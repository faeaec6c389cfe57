use std::sync::Arc;

use market_agent_core::{
    Agent, AgentBuilder, AgentEvent, CancellationToken, Conversation,
    Error as AgentError,
};
use market_agent_model::ModelProvider;
use market_agent_openai_model::{OpenAIConfigBuilder, OpenAIProvider};
use reqwest::Client;

use crate::config::{Credentials, Settings};
use crate::error::ConfigError;
use crate::prompt::get_prompt;
use crate::tools::*;
use crate::usage::UsageTracker;

type EventFn = Box<dyn Fn(AgentEvent) + Send + Sync>;

/// A session builder.
///
/// See [`Session`].
pub struct SessionBuilder {
    settings: Settings,
    credentials: Credentials,
    usage: UsageTracker,
    on_event: Option<EventFn>,
}

impl SessionBuilder {
    /// Creates a session builder from the loaded settings and credentials.
    pub fn new(settings: Settings, credentials: Credentials) -> Self {
        Self {
            settings,
            credentials,
            usage: UsageTracker::in_memory(),
            on_event: None,
        }
    }

    /// Sets the tracker the tools record their calls into.
    #[inline]
    pub fn with_usage_tracker(mut self, usage: UsageTracker) -> Self {
        self.usage = usage;
        self
    }

    /// Attaches a callback receiving the agent's progress events.
    #[inline]
    pub fn on_event(
        mut self,
        on_event: impl Fn(AgentEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(Box::new(on_event));
        self
    }

    /// Builds a session talking to the configured OpenAI model.
    pub fn build(self) -> Result<Session, ConfigError> {
        let client = http_client()?;
        let openai = &self.settings.llm.openai;
        let mut config =
            OpenAIConfigBuilder::with_api_key(&self.credentials.openai_api_key)
                .with_model(&openai.model_name);
        if let Some(base_url) = self.openai_base_url() {
            config = config.with_base_url(base_url);
        }
        if let Some(temperature) = openai.temperature {
            config = config.with_temperature(temperature);
        }
        if let Some(max_tokens) = openai.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        let provider = OpenAIProvider::with_client(client.clone(), config.build());
        self.assemble(provider, client)
    }

    /// Builds a session talking to the given model provider.
    pub fn build_with_provider<P: ModelProvider + 'static>(
        self,
        provider: P,
    ) -> Result<Session, ConfigError> {
        let client = http_client()?;
        self.assemble(provider, client)
    }

    fn openai_base_url(&self) -> Option<&str> {
        self.credentials
            .openai_base_url
            .as_deref()
            .or(self.settings.llm.openai.base_url.as_deref())
    }

    fn assemble<P: ModelProvider + 'static>(
        self,
        provider: P,
        client: Client,
    ) -> Result<Session, ConfigError> {
        let mut agent_builder = AgentBuilder::with_model_provider(provider)
            .with_system_prompt(|| get_prompt("main"))
            .with_max_iterations(self.settings.agent.max_iterations)
            .with_retry_policy(self.settings.retry_policy());

        for kind in self.settings.enabled_tools()? {
            debug!("registering {kind}");
            agent_builder = match kind {
                ToolKind::Retriever => {
                    agent_builder.with_tool(self.retriever_tool(&client))
                }
                kind => agent_builder.with_tool(self.query_tool(kind, &client)),
            };
        }
        if let Some(on_event) = self.on_event {
            agent_builder = agent_builder.on_event(on_event);
        }

        Ok(Session {
            agent: agent_builder.build(),
            conversation: Conversation::new(),
            usage: self.usage,
        })
    }

    fn retriever_tool(&self, client: &Client) -> RetrieverTool {
        let retriever = &self.settings.retriever;
        let usage = self.usage.clone();
        let Some(pinecone_key) = &self.credentials.pinecone_api_key else {
            return RetrieverTool::not_configured(
                ToolKind::Retriever.credential_env(),
                usage,
                retriever.top_k,
                retriever.score_threshold,
            );
        };

        let mut embeddings = OpenAIEmbeddings::new(
            client.clone(),
            self.credentials.openai_api_key.clone(),
            self.settings.embedding_model.model_name.clone(),
        );
        if let Some(base_url) = self.openai_base_url() {
            embeddings = embeddings.with_base_url(base_url);
        }
        let search = PineconeSearch::new(
            client.clone(),
            pinecone_key.clone(),
            self.settings.vector_db.index_name.clone(),
            embeddings,
        );
        RetrieverTool::new(
            Arc::new(search),
            usage,
            retriever.top_k,
            retriever.score_threshold,
        )
    }

    fn query_tool(&self, kind: ToolKind, client: &Client) -> QueryTool {
        let credentials = &self.credentials;
        let usage = self.usage.clone();
        let client = client.clone();
        let backend: Option<Arc<dyn QueryBackend>> = match kind {
            ToolKind::PolygonFinancials => {
                credentials.polygon_api_key.clone().map(|key| {
                    Arc::new(PolygonFinancials::new(client, key)) as _
                })
            }
            ToolKind::TavilySearch => {
                let max_results = self.settings.tools.tavily.max_results;
                credentials.tavily_api_key.clone().map(|key| {
                    Arc::new(TavilySearch::new(client, key, max_results)) as _
                })
            }
            ToolKind::BingSearch => {
                credentials.bing_subscription_key.clone().map(|key| {
                    Arc::new(BingSearch::new(client, key)) as _
                })
            }
            ToolKind::Retriever => None,
        };
        match backend {
            Some(backend) => QueryTool::new(kind, backend, usage),
            None => {
                let env = kind.credential_env();
                info!("{env} is not set, {kind} will report it is not configured");
                QueryTool::not_configured(kind, env, usage)
            }
        }
    }
}

/// A chat session with the assistant.
///
/// The session owns the conversation and the agent driving it. Each call to
/// [`Session::ask`] runs one turn.
pub struct Session {
    agent: Agent,
    conversation: Conversation,
    usage: UsageTracker,
}

impl Session {
    /// Sends a message and waits for the final answer.
    ///
    /// A cancelled or failed turn leaves the conversation usable, the next
    /// call continues from it.
    pub async fn ask(
        &mut self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        self.agent
            .run(&mut self.conversation, message, cancel)
            .await
    }

    /// Returns the conversation so far.
    #[inline]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Returns the usage tracker shared by the tools.
    #[inline]
    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }
}
