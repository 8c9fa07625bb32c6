//! HTTP client for the refresh-token endpoint.

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, Client};
use serde::Serialize;
use tracing::{debug, warn};

use super::{ExchangeError, RefreshExchanger, RefreshGrant};

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Exchanges refresh tokens against a JSON endpoint.
#[derive(Clone)]
pub struct HttpExchanger {
    client: Client,
    url: String,
}

impl HttpExchanger {
    pub fn new(url: impl Into<String>) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns `None` when rate limited so the caller can back off and retry.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ExchangeError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ExchangeError::from_status(status, &body))
        }
    }

    async fn post_refresh(&self, refresh_token: &str) -> Result<RefreshGrant, ExchangeError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let body = RefreshRequest { refresh_token };

        loop {
            let response = self
                .client
                .post(&self.url)
                .header(header::ACCEPT, "application/json")
                .json(&body)
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let grant: RefreshGrant = response
                        .json()
                        .await
                        .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;
                    if grant.token.is_empty() {
                        return Err(ExchangeError::InvalidResponse("empty token".to_string()));
                    }
                    debug!(expires_at = grant.expires_at, "Refresh exchange succeeded");
                    return Ok(grant);
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ExchangeError::RateLimited);
                    }
                    warn!(url = %self.url, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }
}

impl RefreshExchanger for HttpExchanger {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<RefreshGrant, ExchangeError>> {
        self.post_refresh(refresh_token).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(RefreshRequest { refresh_token: "rt" }).unwrap();
        assert_eq!(body, serde_json::json!({"refreshToken": "rt"}));
    }

    #[test]
    fn test_parse_grant_minimal_and_full() {
        let minimal: RefreshGrant =
            serde_json::from_str(r#"{"token":"new","expiresAt":1700000000000}"#).unwrap();
        assert_eq!(minimal.token, "new");
        assert_eq!(minimal.refresh_token, None);
        assert_eq!(minimal.permissions, None);

        let full: RefreshGrant = serde_json::from_str(
            r#"{"token":"new","expiresAt":1,"refreshToken":"rt2","permissions":["read"]}"#,
        )
        .unwrap();
        assert_eq!(full.refresh_token.as_deref(), Some("rt2"));
        assert!(full.permissions.unwrap().contains("read"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        // Port 9 (discard) on localhost is not expected to run an HTTP server
        let exchanger = HttpExchanger::new("http://127.0.0.1:9/refresh").unwrap();
        let err = exchanger.exchange("rt").await.unwrap_err();
        assert!(matches!(err, ExchangeError::NetworkError(_)));
    }
}
