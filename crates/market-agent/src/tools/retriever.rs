use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use market_agent_core::tool::{Error as ToolError, Tool, ToolResult};
use reqwest::Client;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use super::http::{BackendError, check_status, endpoint};
use super::{ToolKind, service_error};
use crate::usage::UsageTracker;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_PINECONE_CONTROL_URL: &str = "https://api.pinecone.io";
const PINECONE_API_VERSION: &str = "2024-07";

/// A document returned by a similarity search.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredDocument {
    pub content: String,
    pub score: f32,
    pub metadata: Map<String, Value>,
}

/// A similarity search over a document collection.
#[async_trait]
pub trait DocumentSearch: Send + Sync {
    /// Returns up to `top_k` documents similar to `question`.
    async fn search(
        &self,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, BackendError>;
}

/// Text embeddings from the OpenAI `/embeddings` endpoint.
pub struct OpenAIEmbeddings {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAIEmbeddings {
    pub fn new(client: Client, api_key: String, model: String) -> Self {
        Self {
            client,
            api_key,
            base_url: DEFAULT_OPENAI_BASE_URL.to_owned(),
            model,
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let req = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let resp = self
            .client
            .post(endpoint(&self.base_url, "embeddings"))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;
        let resp: EmbeddingResponse = check_status(resp).await?.json().await?;
        resp.data
            .into_iter()
            .next()
            .map(|data| data.embedding)
            .ok_or_else(|| BackendError::Decode("no embedding returned".to_owned()))
    }
}

#[derive(Deserialize)]
struct IndexDescription {
    host: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    score: f32,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

/// Similarity search over a Pinecone index.
///
/// The data plane host of the index is looked up once, on first use.
pub struct PineconeSearch {
    client: Client,
    api_key: String,
    index_name: String,
    control_url: String,
    host: OnceCell<String>,
    embeddings: OpenAIEmbeddings,
}

impl PineconeSearch {
    pub fn new(
        client: Client,
        api_key: String,
        index_name: String,
        embeddings: OpenAIEmbeddings,
    ) -> Self {
        Self {
            client,
            api_key,
            index_name,
            control_url: DEFAULT_PINECONE_CONTROL_URL.to_owned(),
            host: OnceCell::new(),
            embeddings,
        }
    }

    pub fn with_control_url<S: Into<String>>(mut self, control_url: S) -> Self {
        self.control_url = control_url.into();
        self
    }

    async fn host(&self) -> Result<&str, BackendError> {
        let host = self
            .host
            .get_or_try_init(|| async {
                let url = endpoint(
                    &self.control_url,
                    &format!("indexes/{}", self.index_name),
                );
                let resp = self
                    .client
                    .get(url)
                    .header("Api-Key", &self.api_key)
                    .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
                    .send()
                    .await?;
                let index: IndexDescription =
                    check_status(resp).await?.json().await?;
                debug!("index {} is served by {}", self.index_name, index.host);
                Ok::<_, BackendError>(if index.host.starts_with("http") {
                    index.host
                } else {
                    format!("https://{}", index.host)
                })
            })
            .await?;
        Ok(host)
    }
}

#[async_trait]
impl DocumentSearch for PineconeSearch {
    async fn search(
        &self,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, BackendError> {
        let vector = self.embeddings.embed(question).await?;
        let host = self.host().await?;
        let req = QueryRequest {
            vector: &vector,
            top_k,
            include_metadata: true,
        };
        let resp = self
            .client
            .post(endpoint(host, "query"))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", PINECONE_API_VERSION)
            .json(&req)
            .send()
            .await?;
        let resp: QueryResponse = check_status(resp).await?.json().await?;

        Ok(resp
            .matches
            .into_iter()
            .map(|m| {
                let mut metadata = m.metadata.unwrap_or_default();
                let content = match metadata.remove("text") {
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                ScoredDocument {
                    content,
                    score: m.score,
                    metadata,
                }
            })
            .collect())
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct RetrieverInput {
    #[schemars(description = "The question to search the financial documents for.")]
    pub question: String,
}

/// Searches the uploaded financial documents.
pub struct RetrieverTool {
    backend: Result<Arc<dyn DocumentSearch>, &'static str>,
    usage: UsageTracker,
    top_k: usize,
    score_threshold: f32,
    parameter_schema: Value,
}

impl RetrieverTool {
    pub fn new(
        backend: Arc<dyn DocumentSearch>,
        usage: UsageTracker,
        top_k: usize,
        score_threshold: f32,
    ) -> Self {
        Self::with_backend(Ok(backend), usage, top_k, score_threshold)
    }

    /// Creates a tool whose calls fail because the credential named
    /// `missing_env` is absent.
    pub fn not_configured(
        missing_env: &'static str,
        usage: UsageTracker,
        top_k: usize,
        score_threshold: f32,
    ) -> Self {
        Self::with_backend(Err(missing_env), usage, top_k, score_threshold)
    }

    fn with_backend(
        backend: Result<Arc<dyn DocumentSearch>, &'static str>,
        usage: UsageTracker,
        top_k: usize,
        score_threshold: f32,
    ) -> Self {
        Self {
            backend,
            usage,
            top_k,
            score_threshold,
            parameter_schema: schema_for!(RetrieverInput).to_value(),
        }
    }
}

impl Tool for RetrieverTool {
    type Input = RetrieverInput;

    fn name(&self) -> &str {
        ToolKind::Retriever.name()
    }

    fn description(&self) -> &str {
        ToolKind::Retriever.description()
    }

    fn parameter_schema(&self) -> &Value {
        &self.parameter_schema
    }

    #[allow(clippy::manual_async_fn)]
    fn execute(
        &self,
        input: RetrieverInput,
    ) -> impl Future<Output = ToolResult> + Send + 'static {
        let backend = self.backend.clone();
        let usage = self.usage.clone();
        let top_k = self.top_k;
        let score_threshold = self.score_threshold;
        async move {
            let question = input.question.trim();
            if question.is_empty() {
                return Err(ToolError::invalid_input().with_reason(format!(
                    "Invalid input for {}: question must not be empty",
                    ToolKind::Retriever
                )));
            }
            info!("{} called with question: {question}", ToolKind::Retriever);
            usage.record(ToolKind::Retriever, question).await;

            let documents = match backend {
                Ok(backend) => backend.search(question, top_k).await,
                Err(missing_env) => Err(BackendError::NotConfigured(missing_env)),
            }
            .map_err(|err| service_error(ToolKind::Retriever, err))?;
            Ok(render(select(documents, top_k, score_threshold)))
        }
    }
}

/// Keeps the `top_k` best documents scoring at least `score_threshold`.
fn select(
    mut documents: Vec<ScoredDocument>,
    top_k: usize,
    score_threshold: f32,
) -> Vec<ScoredDocument> {
    documents.retain(|doc| doc.score >= score_threshold);
    documents.sort_by(|a, b| b.score.total_cmp(&a.score));
    documents.truncate(top_k);
    documents
}

fn render(documents: Vec<ScoredDocument>) -> String {
    if documents.is_empty() {
        return "No relevant documents found.".to_owned();
    }
    let mut text = String::new();
    for (i, doc) in documents.iter().enumerate() {
        let _ = write!(text, "Document {} (score {:.3})", i + 1, doc.score);
        if !doc.metadata.is_empty() {
            let _ = write!(text, " {}", Value::Object(doc.metadata.clone()));
        }
        let _ = writeln!(text, ":\n{}\n", doc.content.trim());
    }
    text.trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn doc(content: &str, score: f32) -> ScoredDocument {
        ScoredDocument {
            content: content.to_owned(),
            score,
            metadata: Map::new(),
        }
    }

    struct FixedDocuments(Vec<ScoredDocument>);

    #[async_trait]
    impl DocumentSearch for FixedDocuments {
        async fn search(
            &self,
            _question: &str,
            _top_k: usize,
        ) -> Result<Vec<ScoredDocument>, BackendError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_select_applies_threshold_and_cap() {
        let documents = vec![
            doc("low", 0.2),
            doc("good", 0.7),
            doc("best", 0.9),
            doc("edge", 0.5),
            doc("fine", 0.6),
        ];
        let selected = select(documents, 3, 0.5);
        let contents: Vec<_> = selected.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, ["best", "good", "fine"]);

        assert!(select(vec![doc("low", 0.1)], 3, 0.5).is_empty());
    }

    #[tokio::test]
    async fn test_retriever_tool() {
        let usage = UsageTracker::in_memory();
        let mut with_source = doc("Dividends are paid quarterly.", 0.8);
        with_source
            .metadata
            .insert("source".to_owned(), json!("guide.pdf"));
        let backend = FixedDocuments(vec![doc("Unrelated.", 0.1), with_source]);
        let tool = RetrieverTool::new(Arc::new(backend), usage.clone(), 3, 0.5);

        let result = tool
            .execute(RetrieverInput {
                question: "dividend policy".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(
            result,
            "Document 1 (score 0.800) {\"source\":\"guide.pdf\"}:\nDividends are paid quarterly."
        );
        assert_eq!(usage.stats().await.calls(ToolKind::Retriever), 1);
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let usage = UsageTracker::in_memory();
        let tool = RetrieverTool::new(
            Arc::new(FixedDocuments(vec![])),
            usage.clone(),
            3,
            0.5,
        );
        let err = tool
            .execute(RetrieverInput {
                question: "   ".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), market_agent_core::tool::ErrorKind::InvalidInput);
        assert_eq!(usage.stats().await.total_calls, 0);
    }

    #[tokio::test]
    async fn test_not_configured() {
        let tool = RetrieverTool::not_configured(
            "PINECONE_API_KEY",
            UsageTracker::in_memory(),
            3,
            0.5,
        );
        let err = tool
            .execute(RetrieverInput {
                question: "dividend policy".to_owned(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error accessing vector database: PINECONE_API_KEY is not configured"
        );
    }

    #[tokio::test]
    async fn test_pinecone_search() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "text-embedding-3-small",
                "input": "dividend policy"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}]
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/indexes/financial-docs"))
            .and(header("Api-Key", "pc-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "financial-docs",
                "host": server.uri()
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(header("Api-Key", "pc-key"))
            .and(body_partial_json(json!({"topK": 3, "includeMetadata": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "matches": [
                    {"id": "a", "score": 0.9, "metadata": {"text": "Dividends are paid quarterly.", "source": "guide.pdf"}},
                    {"id": "b", "score": 0.4, "metadata": {"text": "Unrelated."}}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let embeddings = OpenAIEmbeddings::new(
            Client::new(),
            "sk-test".into(),
            "text-embedding-3-small".into(),
        )
        .with_base_url(server.uri());
        let pinecone = PineconeSearch::new(
            Client::new(),
            "pc-key".into(),
            "financial-docs".into(),
            embeddings,
        )
        .with_control_url(server.uri());

        let documents = pinecone.search("dividend policy", 3).await.unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].content, "Dividends are paid quarterly.");
        assert_eq!(documents[0].metadata["source"], "guide.pdf");
        assert!(!documents[0].metadata.contains_key("text"));

        // The second search reuses the resolved index host.
        let documents = pinecone.search("dividend policy", 3).await.unwrap();
        assert_eq!(documents[1].content, "Unrelated.");
    }
}
