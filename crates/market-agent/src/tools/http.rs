use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Errors from the external services behind the tools.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The credential with this environment variable name is absent.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Creates the HTTP client shared by the tool backends.
pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}

/// Passes successful responses through, and turns the others into
/// [`BackendError::Status`] carrying the start of the body.
pub(crate) async fn check_status(
    resp: Response,
) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body = body.trim();
    let body = match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_owned(),
    };
    Err(BackendError::Status { status, body })
}

/// Joins a base URL and a path, tolerating a trailing slash on the base.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        assert_eq!(
            endpoint("https://api.tavily.com/", "/search"),
            "https://api.tavily.com/search"
        );
        assert_eq!(
            endpoint("http://127.0.0.1:1234", "v7.0/search"),
            "http://127.0.0.1:1234/v7.0/search"
        );
    }
}
