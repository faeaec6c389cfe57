use std::fmt::Write;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::QueryBackend;
use super::http::{BackendError, check_status, endpoint};

const DEFAULT_BASE_URL: &str = "https://api.tavily.com";
const MAX_RAW_CONTENT_CHARS: usize = 1500;

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    max_results: u32,
    search_depth: &'static str,
    include_answer: bool,
    include_raw_content: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    raw_content: Option<String>,
}

/// News search over the Tavily API.
pub struct TavilySearch {
    client: Client,
    api_key: String,
    base_url: String,
    max_results: u32,
}

impl TavilySearch {
    pub fn new(client: Client, api_key: String, max_results: u32) -> Self {
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_owned(),
            max_results,
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl QueryBackend for TavilySearch {
    async fn query(&self, query: &str) -> Result<String, BackendError> {
        let req = SearchRequest {
            query,
            max_results: self.max_results,
            search_depth: "advanced",
            include_answer: true,
            include_raw_content: true,
        };
        let resp = self
            .client
            .post(endpoint(&self.base_url, "search"))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;
        let resp: SearchResponse = check_status(resp).await?.json().await?;
        debug!("tavily returned {} result(s)", resp.results.len());
        Ok(render(&resp))
    }
}

fn render(resp: &SearchResponse) -> String {
    let mut text = String::new();
    if let Some(answer) = resp.answer.as_deref().filter(|a| !a.is_empty()) {
        let _ = writeln!(text, "Answer: {answer}\n");
    }
    if resp.results.is_empty() {
        text.push_str("No search results.");
        return text;
    }
    for (i, result) in resp.results.iter().enumerate() {
        let _ = writeln!(text, "[{}] {} ({})", i + 1, result.title, result.url);
        let _ = writeln!(text, "{}", result.content.trim());
        if let Some(raw) = result.raw_content.as_deref() {
            let raw: String = raw.trim().chars().take(MAX_RAW_CONTENT_CHARS).collect();
            if !raw.is_empty() {
                let _ = writeln!(text, "Excerpt: {raw}");
            }
        }
        text.push('\n');
    }
    text.trim_end().to_owned()
}
