use std::fmt::Write;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use super::QueryBackend;
use super::http::{BackendError, check_status, endpoint};

const DEFAULT_BASE_URL: &str = "https://api.bing.microsoft.com";
const RESULT_COUNT: &str = "4";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    web_pages: Option<WebPages>,
}

#[derive(Deserialize)]
struct WebPages {
    #[serde(default)]
    value: Vec<WebPage>,
}

#[derive(Deserialize)]
struct WebPage {
    name: String,
    url: String,
    #[serde(default)]
    snippet: String,
}

/// Web search over the Bing Web Search v7 API.
pub struct BingSearch {
    client: Client,
    subscription_key: String,
    base_url: String,
}

impl BingSearch {
    pub fn new(client: Client, subscription_key: String) -> Self {
        Self {
            client,
            subscription_key,
            base_url: DEFAULT_BASE_URL.to_owned(),
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl QueryBackend for BingSearch {
    async fn query(&self, query: &str) -> Result<String, BackendError> {
        let url = Url::parse_with_params(
            &endpoint(&self.base_url, "v7.0/search"),
            &[("q", query), ("count", RESULT_COUNT)],
        )
        .map_err(|err| BackendError::InvalidUrl(err.to_string()))?;
        let resp = self
            .client
            .get(url)
            .header("Ocp-Apim-Subscription-Key", &self.subscription_key)
            .send()
            .await?;
        let resp: SearchResponse = check_status(resp).await?.json().await?;

        let pages = resp.web_pages.map(|pages| pages.value).unwrap_or_default();
        debug!("bing returned {} page(s)", pages.len());
        if pages.is_empty() {
            return Ok("No good Bing Search Result was found.".to_owned());
        }
        let mut text = String::new();
        for (i, page) in pages.iter().enumerate() {
            let _ = writeln!(text, "[{}] {} ({})", i + 1, page.name, page.url);
            let _ = writeln!(text, "{}\n", page.snippet.trim());
        }
        Ok(text.trim_end().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_search_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v7.0/search"))
            .and(query_param("q", "fed rate decision"))
            .and(header("Ocp-Apim-Subscription-Key", "bing-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "webPages": {
                    "value": [
                        {"name": "Fed holds rates", "url": "https://example.com/fed", "snippet": "Rates unchanged."},
                        {"name": "Markets react", "url": "https://example.com/mkt", "snippet": "Stocks rallied."}
                    ]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let bing = BingSearch::new(Client::new(), "bing-key".into())
            .with_base_url(server.uri());
        let result = bing.query("fed rate decision").await.unwrap();
        assert_eq!(
            result,
            "[1] Fed holds rates (https://example.com/fed)\nRates unchanged.\n\n\
             [2] Markets react (https://example.com/mkt)\nStocks rallied."
        );
    }

    #[tokio::test]
    async fn test_no_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let bing = BingSearch::new(Client::new(), "bing-key".into())
            .with_base_url(server.uri());
        assert_eq!(
            bing.query("zzz").await.unwrap(),
            "No good Bing Search Result was found."
        );
    }
}
