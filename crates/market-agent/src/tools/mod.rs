//! The tools offered to the model.
//!
//! There are four of them, listed by [`ToolKind`]. Each one forwards a
//! single free-text query to an external service and hands the service's
//! answer back to the model. Service failures are turned into tool error
//! results (`Error accessing <service>: ...`), they never end the turn.
//! Every call is counted by the [`UsageTracker`], whether it succeeds or
//! not.

mod bing;
mod http;
mod polygon;
mod retriever;
mod tavily;

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use market_agent_core::tool::{Error as ToolError, Tool, ToolResult};
use schemars::{JsonSchema, schema_for};
use serde::Deserialize;
use serde_json::Value;
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::usage::UsageTracker;
pub use bing::BingSearch;
pub use http::{BackendError, http_client};
pub use polygon::PolygonFinancials;
pub use retriever::{
    DocumentSearch, OpenAIEmbeddings, PineconeSearch, RetrieverInput,
    RetrieverTool, ScoredDocument,
};
pub use tavily::TavilySearch;

/// The available tools, named as the model sees them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
pub enum ToolKind {
    #[strum(serialize = "retriever_tool")]
    Retriever,
    #[strum(serialize = "polygon_financials_tool")]
    PolygonFinancials,
    #[strum(serialize = "tavily_search_tool")]
    TavilySearch,
    #[strum(serialize = "bing_search_tool")]
    BingSearch,
}

impl ToolKind {
    /// Iterates over all tools.
    #[inline]
    pub fn all() -> impl Iterator<Item = ToolKind> {
        Self::iter()
    }

    /// Returns the tool name shown to the model.
    #[inline]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Returns the key the tool is counted under in the usage record.
    pub fn usage_key(self) -> &'static str {
        match self {
            ToolKind::Retriever => "retriever",
            ToolKind::PolygonFinancials => "polygon_api",
            ToolKind::TavilySearch => "tavily_search",
            ToolKind::BingSearch => "bing_search",
        }
    }

    /// Returns the name of the backing service used in error messages.
    pub fn service(self) -> &'static str {
        match self {
            ToolKind::Retriever => "vector database",
            ToolKind::PolygonFinancials => "Polygon API",
            ToolKind::TavilySearch => "Tavily search",
            ToolKind::BingSearch => "Bing Search API",
        }
    }

    /// Returns the environment variable holding the service credential.
    pub fn credential_env(self) -> &'static str {
        match self {
            ToolKind::Retriever => "PINECONE_API_KEY",
            ToolKind::PolygonFinancials => "POLYGON_API_KEY",
            ToolKind::TavilySearch => "TAVILY_API_KEY",
            ToolKind::BingSearch => "BING_SUBSCRIPTION_KEY",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::Retriever => {
                r#"
Retrieves relevant financial information from the vector database.
Use this tool to search through uploaded financial documents and trading guides."#
            }
            ToolKind::PolygonFinancials => {
                "Get financial data using Polygon API for stocks, market data, and company financials. The query should be a stock ticker symbol such as AAPL."
            }
            ToolKind::TavilySearch => {
                "Search current financial news and market updates using Tavily."
            }
            ToolKind::BingSearch => {
                "Search the web using Bing Search API for additional financial information."
            }
        }
    }
}

impl Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an unknown tool name.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown tool `{0}`")]
pub struct UnknownToolError(pub String);

impl FromStr for ToolKind {
    type Err = UnknownToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownToolError(s.to_owned()))
    }
}

/// A service answering free-text queries.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query(&self, query: &str) -> Result<String, BackendError>;
}

#[derive(Deserialize, JsonSchema)]
pub struct QueryInput {
    #[schemars(description = "The search query.")]
    pub query: String,
}

/// A tool forwarding its query to a [`QueryBackend`].
///
/// Used for the Polygon, Tavily and Bing tools.
pub struct QueryTool {
    kind: ToolKind,
    backend: Result<Arc<dyn QueryBackend>, &'static str>,
    usage: UsageTracker,
    parameter_schema: Value,
}

impl QueryTool {
    /// Creates a tool of `kind` backed by `backend`.
    pub fn new(
        kind: ToolKind,
        backend: Arc<dyn QueryBackend>,
        usage: UsageTracker,
    ) -> Self {
        Self::with_backend(kind, Ok(backend), usage)
    }

    /// Creates a tool whose calls fail because the credential named
    /// `missing_env` is absent.
    pub fn not_configured(
        kind: ToolKind,
        missing_env: &'static str,
        usage: UsageTracker,
    ) -> Self {
        Self::with_backend(kind, Err(missing_env), usage)
    }

    fn with_backend(
        kind: ToolKind,
        backend: Result<Arc<dyn QueryBackend>, &'static str>,
        usage: UsageTracker,
    ) -> Self {
        Self {
            kind,
            backend,
            usage,
            parameter_schema: schema_for!(QueryInput).to_value(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ToolKind {
        self.kind
    }
}

impl Tool for QueryTool {
    type Input = QueryInput;

    fn name(&self) -> &str {
        self.kind.name()
    }

    fn description(&self) -> &str {
        self.kind.description()
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    #[allow(clippy::manual_async_fn)]
    fn execute(
        &self,
        input: QueryInput,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let kind = self.kind;
        let backend = self.backend.clone();
        let usage = self.usage.clone();
        async move {
            info!("{kind} called with query: {}", input.query);
            usage.record(kind, &input.query).await;
            let result = match backend {
                Ok(backend) => backend.query(&input.query).await,
                Err(missing_env) => Err(BackendError::NotConfigured(missing_env)),
            };
            result.map_err(|err| service_error(kind, err))
        }
    }
}

/// Renders a backend failure as the tool result shown to the model.
pub(crate) fn service_error(kind: ToolKind, err: BackendError) -> ToolError {
    warn!("{kind} failed: {err}");
    ToolError::execution_error()
        .with_reason(format!("Error accessing {}: {err}", kind.service()))
}
