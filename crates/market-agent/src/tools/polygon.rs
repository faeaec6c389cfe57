use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;

use super::QueryBackend;
use super::http::{BackendError, check_status, endpoint};

const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

#[derive(Deserialize)]
struct FinancialsResponse {
    #[serde(default)]
    results: Vec<Value>,
}

/// Company financials from the Polygon API.
///
/// The query is taken as a ticker symbol.
pub struct PolygonFinancials {
    client: Client,
    api_key: String,
    base_url: String,
}

impl PolygonFinancials {
    pub fn new(client: Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_owned(),
        }
    }

    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl QueryBackend for PolygonFinancials {
    async fn query(&self, query: &str) -> Result<String, BackendError> {
        let ticker = query.trim().to_uppercase();
        let url = Url::parse_with_params(
            &endpoint(&self.base_url, "vX/reference/financials"),
            &[("ticker", ticker.as_str()), ("apiKey", self.api_key.as_str())],
        )
        .map_err(|err| BackendError::InvalidUrl(err.to_string()))?;

        let resp = self.client.get(url).send().await?;
        let resp: FinancialsResponse = check_status(resp).await?.json().await?;
        debug!("polygon returned {} report(s) for {ticker}", resp.results.len());

        if resp.results.is_empty() {
            return Ok(format!("No financial data found for {ticker}."));
        }
        serde_json::to_string(&resp.results)
            .map_err(|err| BackendError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_financials_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vX/reference/financials"))
            .and(query_param("ticker", "AAPL"))
            .and(query_param("apiKey", "poly-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "OK",
                "results": [{"fiscal_year": "2023", "company_name": "Apple Inc."}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let polygon = PolygonFinancials::new(Client::new(), "poly-key".into())
            .with_base_url(server.uri());
        let result = polygon.query(" aapl ").await.unwrap();
        let result: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(
            result,
            json!([{"fiscal_year": "2023", "company_name": "Apple Inc."}])
        );
    }

    #[tokio::test]
    async fn test_financials_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("ticker", "NOPE"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"results": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("ticker", "AAPL"))
            .respond_with(
                ResponseTemplate::new(403).set_body_string("NOT_AUTHORIZED"),
            )
            .mount(&server)
            .await;

        let polygon = PolygonFinancials::new(Client::new(), "bad".into())
            .with_base_url(server.uri());
        assert_eq!(
            polygon.query("NOPE").await.unwrap(),
            "No financial data found for NOPE."
        );
        let err = polygon.query("AAPL").await.unwrap_err();
        assert!(matches!(
            &err,
            BackendError::Status { status, body }
                if status.as_u16() == 403 && body == "NOT_AUTHORIZED"
        ));
    }
}
