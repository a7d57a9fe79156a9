//! HTTP plumbing shared by the API clients.

use crate::error::{BiblioError, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Wait assumed for a 429 without a usable `Retry-After` header.
const DEFAULT_RATE_LIMIT_SECS: u64 = 5;

/// Build a client with the given identity, timeout and optional proxy.
pub(crate) fn build_client(user_agent: &str, timeout: Duration, proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .cookie_store(true);

    if let Some(proxy_url) = proxy {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
            BiblioError::Config(format!("Invalid proxy URL '{}': {}", proxy_url, e))
        })?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| BiblioError::Config(format!("Failed to build HTTP client: {}", e)))
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Map 429 to [`BiblioError::RateLimited`] and other failures to [`BiblioError::Api`].
pub(crate) async fn check_status(response: Response, service: &str) -> Result<Response> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait = retry_after(response.headers()).unwrap_or(DEFAULT_RATE_LIMIT_SECS);
        return Err(BiblioError::RateLimited(wait));
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(200).collect();
        return Err(BiblioError::Api {
            code: status.as_u16(),
            message: format!("{} error: {} - {}", service, status, preview),
        });
    }

    Ok(response)
}

/// Read a successful response body as JSON.
///
/// A body that is not valid JSON is a [`BiblioError::Parse`], which is retried.
pub(crate) async fn read_json(response: Response, service: &str) -> Result<Value> {
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| BiblioError::Parse(format!("{} returned malformed JSON: {}", service, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(12));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let err = build_client("test", Duration::from_secs(1), Some("http://localhost:99999"));
        assert!(matches!(err, Err(BiblioError::Config(_))));
    }
}
