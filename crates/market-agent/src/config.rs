//! Settings and credentials.
//!
//! Settings come from a YAML document, `config/config.yaml` unless
//! `MARKET_AGENT_CONFIG` points elsewhere. Secrets never live in that file,
//! they are read from the environment (and a `.env` file if present).

use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::time::Duration;

use market_agent_core::{Agent, RetryPolicy};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::tools::ToolKind;

/// The whole configuration document.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Settings {
    pub embedding_model: EmbeddingModelSettings,
    pub llm: LlmSettings,
    pub vector_db: VectorDbSettings,
    pub retriever: RetrieverSettings,
    pub tools: ToolsSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub analytics: AnalyticsSettings,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct EmbeddingModelSettings {
    pub model_name: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LlmSettings {
    pub openai: OpenAISettings,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct OpenAISettings {
    pub model_name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct VectorDbSettings {
    pub index_name: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RetrieverSettings {
    pub top_k: usize,
    pub score_threshold: f32,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ToolsSettings {
    pub tavily: TavilySettings,
    /// Tool names to register. All tools are registered when absent.
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TavilySettings {
    pub max_results: u32,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub retry: RetrySettings,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: Agent::DEFAULT_MAX_ITERATIONS,
            retry: Default::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    /// `0` retries without a time limit.
    pub max_elapsed_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_interval_ms: policy.initial_interval.as_millis() as u64,
            max_interval_ms: policy.max_interval.as_millis() as u64,
            max_elapsed_ms: policy
                .max_elapsed
                .map_or(0, |elapsed| elapsed.as_millis() as u64),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub path: PathBuf,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tool_usage_analytics.json"),
        }
    }
}

impl Settings {
    /// Used when `MARKET_AGENT_CONFIG` is not set.
    pub const DEFAULT_PATH: &'static str = "config/config.yaml";
    /// Environment variable overriding the config file location.
    pub const PATH_ENV: &'static str = "MARKET_AGENT_CONFIG";

    /// Loads the settings from the configured location.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(Self::PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_PATH));
        Self::from_path(path)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("loading settings from {}", path.display());
        let yaml = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read {
                path: path.to_owned(),
                source,
            }
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                key,
                reason: reason.to_owned(),
            }
        }

        if self.retriever.top_k == 0 {
            return Err(invalid("retriever.top_k", "must be at least 1"));
        }
        if !self.retriever.score_threshold.is_finite() {
            return Err(invalid("retriever.score_threshold", "must be a number"));
        }
        if self.tools.tavily.max_results == 0 {
            return Err(invalid(
                "tools.tavily.max_results",
                "must be at least 1",
            ));
        }
        if self.agent.max_iterations == 0 {
            return Err(invalid("agent.max_iterations", "must be at least 1"));
        }
        if self.agent.retry.max_attempts == 0 {
            return Err(invalid(
                "agent.retry.max_attempts",
                "must be at least 1",
            ));
        }
        self.enabled_tools()?;
        Ok(())
    }

    /// Returns the tools to register, in a stable order without
    /// duplicates.
    pub fn enabled_tools(&self) -> Result<Vec<ToolKind>, ConfigError> {
        let Some(names) = &self.tools.enabled else {
            return Ok(ToolKind::all().collect());
        };
        let mut kinds = vec![];
        for name in names {
            let kind: ToolKind = name
                .parse()
                .map_err(|_| ConfigError::UnknownTool(name.clone()))?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.agent.retry;
        RetryPolicy {
            max_attempts: retry.max_attempts,
            initial_interval: Duration::from_millis(retry.initial_interval_ms),
            max_interval: Duration::from_millis(retry.max_interval_ms),
            max_elapsed: (retry.max_elapsed_ms > 0)
                .then(|| Duration::from_millis(retry.max_elapsed_ms)),
        }
    }
}

/// API keys and endpoints taken from the environment.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub openai_api_key: String,
    pub openai_base_url: Option<String>,
    pub polygon_api_key: Option<String>,
    pub pinecone_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub bing_subscription_key: Option<String>,
}

impl Credentials {
    /// Reads the credentials from the process environment, after loading
    /// `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            trace!("no .env file loaded: {err}");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the credentials through `lookup`. Empty values count as
    /// missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let openai_api_key = get("OPENAI_API_KEY")
            .ok_or(ConfigError::MissingEnv("OPENAI_API_KEY"))?;
        Ok(Self {
            openai_api_key,
            openai_base_url: get("OPENAI_BASE_URL"),
            polygon_api_key: get("POLYGON_API_KEY"),
            pinecone_api_key: get("PINECONE_API_KEY"),
            tavily_api_key: get("TAVILY_API_KEY"),
            bing_subscription_key: get("BING_SUBSCRIPTION_KEY"),
        })
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(value: &Option<String>) -> Option<&'static str> {
            value.as_ref().map(|_| "<redacted>")
        }
        f.debug_struct("Credentials")
            .field("openai_api_key", &"<redacted>")
            .field("openai_base_url", &self.openai_base_url)
            .field("polygon_api_key", &redact(&self.polygon_api_key))
            .field("pinecone_api_key", &redact(&self.pinecone_api_key))
            .field("tavily_api_key", &redact(&self.tavily_api_key))
            .field(
                "bing_subscription_key",
                &redact(&self.bing_subscription_key),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const CONFIG: &str = r#"
embedding_model:
  provider: "openai"
  model_name: "text-embedding-3-small"
retriever:
  top_k: 3
  score_threshold: 0.5
vector_db:
  index_name: "financial-docs"
llm:
  openai:
    provider: "openai"
    model_name: "gpt-4o-mini"
tools:
  tavily:
    max_results: 5
"#;

    #[test]
    fn test_parse_minimal_config() {
        let settings = Settings::from_yaml_str(CONFIG).unwrap();
        assert_eq!(settings.embedding_model.model_name, "text-embedding-3-small");
        assert_eq!(settings.llm.openai.model_name, "gpt-4o-mini");
        assert_eq!(settings.vector_db.index_name, "financial-docs");
        assert_eq!(settings.retriever.top_k, 3);
        assert_eq!(settings.retriever.score_threshold, 0.5);
        assert_eq!(settings.tools.tavily.max_results, 5);
        assert_eq!(settings.agent.max_iterations, 10);
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(
            settings.analytics.path,
            PathBuf::from("tool_usage_analytics.json")
        );
        assert_eq!(settings.enabled_tools().unwrap().len(), 4);
    }

    #[test]
    fn test_optional_sections() {
        let yaml = format!(
            "{CONFIG}  enabled: [tavily_search_tool, retriever_tool, tavily_search_tool]
agent:
  max_iterations: 4
  retry:
    max_attempts: 1
    max_elapsed_ms: 0
analytics:
  path: /tmp/usage.json
"
        );
        let settings = Settings::from_yaml_str(&yaml).unwrap();
        assert_eq!(
            settings.enabled_tools().unwrap(),
            [ToolKind::TavilySearch, ToolKind::Retriever]
        );
        assert_eq!(settings.agent.max_iterations, 4);
        let policy = settings.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_elapsed, None);
        assert_eq!(settings.analytics.path, PathBuf::from("/tmp/usage.json"));
    }

    #[test]
    fn test_invalid_config() {
        let yaml = format!("{CONFIG}  enabled: [stock_oracle]\n");
        let err = Settings::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTool(name) if name == "stock_oracle"));

        let yaml = CONFIG.replace("top_k: 3", "top_k: 0");
        let err = Settings::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "retriever.top_k", .. }
        ));

        let yaml = CONFIG.replace("index_name", "name");
        let err = Settings::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_config_file() {
        let err = Settings::from_path("/nonexistent/config.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/config.yaml"));
    }

    #[test]
    fn test_credentials() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("POLYGON_API_KEY", "poly"),
            ("TAVILY_API_KEY", "  "),
        ]
        .into();
        let credentials =
            Credentials::from_lookup(|key| env.get(key).map(|v| v.to_string()))
                .unwrap();
        assert_eq!(credentials.openai_api_key, "sk-test");
        assert_eq!(credentials.polygon_api_key.as_deref(), Some("poly"));
        assert_eq!(credentials.tavily_api_key, None);
        assert_eq!(credentials.bing_subscription_key, None);
        assert!(!format!("{credentials:?}").contains("sk-test"));

        let err = Credentials::from_lookup(|_| None).unwrap_err();
        assert_eq!(err.to_string(), "missing environment variable OPENAI_API_KEY");
    }
}
