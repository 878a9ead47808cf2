//! Exchange errors.

use candlewick_stream::StreamError;
use candlewick_types::CalendarError;
use std::sync::Arc;
use thiserror::Error;

use crate::{CallError, RateLimitSignal};

/// Errors raised by exchange adapters.
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    /// Server returned an error status.
    #[error("server error {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The venue rejected the call for exceeding its rate limit.
    #[error("rate limited, retry after {}ms", .0.retry_after.as_millis())]
    RateLimited(RateLimitSignal),

    /// A venue payload could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Stream subscription failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The venue does not list the symbol.
    #[error("unknown pair: {0}")]
    UnknownPair(String),

    /// Refreshing the pair cache failed.
    #[error("pair refresh failed: {0}")]
    Refresh(#[source] Arc<ExchangeError>),

    /// Venue data violates an integrity rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Venue timezone or boundary computation failed.
    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(error: reqwest::Error) -> Self {
        Self::Http(Arc::new(error))
    }
}

impl From<CallError<Self>> for ExchangeError {
    fn from(error: CallError<Self>) -> Self {
        match error {
            CallError::RateLimited(signal) => Self::RateLimited(signal),
            CallError::Failed(error) => error,
        }
    }
}
