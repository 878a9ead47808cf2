//! HTTP client for venue REST endpoints.

use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;

use crate::{CallError, ExchangeError, RateLimitSignal};

/// Binance error code for "too many requests".
const TOO_MANY_REQUESTS_CODE: i64 = -1003;

/// Wait applied when the venue signals a rate limit without a retry-after.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Configuration for the REST client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Request timeout.
    pub timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Idle connections kept per host.
    pub max_idle_per_host: usize,
    /// User agent string.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_idle_per_host: 8,
            user_agent: format!("candlewick/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Pooled HTTP client that classifies venue rate-limit responses.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    config: ClientConfig,
}

impl RestClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: ClientConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .gzip(true)
            .build()?;
        Ok(Self { client, config })
    }

    /// Returns the client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetches `url` and decodes the JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::RateLimited`] when the venue rejects the request
    /// for exceeding its limit, and [`CallError::Failed`] for any other
    /// failure.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CallError<ExchangeError>> {
        trace!(url, "GET");
        let response = self.client.get(url).send().await.map_err(|e| CallError::Failed(e.into()))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| CallError::Failed(e.into()));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.unwrap_or_default();

        Err(match rate_limit_signal(status, retry_after.as_deref(), &body) {
            Some(signal) => CallError::RateLimited(signal),
            None => CallError::Failed(ExchangeError::Status { status: status.as_u16(), body }),
        })
    }
}

/// Classifies an error response as a rate-limit signal.
///
/// HTTP 429 and 418 are rate limits, as is a body carrying error code
/// `-1003`. `Retry-After` is read in seconds.
pub(crate) fn rate_limit_signal(status: StatusCode, retry_after: Option<&str>, body: &str) -> Option<RateLimitSignal> {
    let limited = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
        || serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| value.get("code").and_then(serde_json::Value::as_i64))
            == Some(TOO_MANY_REQUESTS_CODE);

    limited.then(|| RateLimitSignal {
        retry_after: retry_after
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("candlewick/"));
    }

    #[test]
    fn test_too_many_requests_uses_retry_after() {
        let signal = rate_limit_signal(StatusCode::TOO_MANY_REQUESTS, Some("7"), "").unwrap();
        assert_eq!(signal.retry_after, Duration::from_secs(7));
    }

    #[test]
    fn test_ip_ban_is_a_rate_limit() {
        let signal = rate_limit_signal(StatusCode::IM_A_TEAPOT, None, "").unwrap();
        assert_eq!(signal.retry_after, DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_error_code_is_a_rate_limit() {
        let body = r#"{"code":-1003,"msg":"Too many requests."}"#;
        let signal = rate_limit_signal(StatusCode::BAD_REQUEST, Some("2"), body).unwrap();
        assert_eq!(signal.retry_after, Duration::from_secs(2));
    }

    #[test]
    fn test_other_errors_are_not_rate_limits() {
        let body = r#"{"code":-1121,"msg":"Invalid symbol."}"#;
        assert!(rate_limit_signal(StatusCode::BAD_REQUEST, None, body).is_none());
        assert!(rate_limit_signal(StatusCode::INTERNAL_SERVER_ERROR, Some("5"), "oops").is_none());
    }
}
