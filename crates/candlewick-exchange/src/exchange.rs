//! Venue collaborator interface.

use async_trait::async_trait;
use candlewick_types::{Candle, Pair, Timeframe, Tz};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

use crate::{ExchangeError, RateLimitExceeded};

/// Range and page size of a historical bar request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandleQuery {
    /// Earliest open time (inclusive), UTC milliseconds.
    pub since: Option<i64>,
    /// Latest open time (inclusive), UTC milliseconds.
    pub until: Option<i64>,
    /// Maximum number of bars; the venue default when unset.
    pub limit: Option<usize>,
}

impl CandleQuery {
    /// Requests bars opening within `[since, until]`.
    #[must_use]
    pub const fn range(since: i64, until: i64) -> Self {
        Self { since: Some(since), until: Some(until), limit: None }
    }

    /// Requests the latest `limit` bars.
    #[must_use]
    pub const fn latest(limit: usize) -> Self {
        Self { since: None, until: None, limit: Some(limit) }
    }

    /// Returns a copy with the page size replaced.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Notification from an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// A bar update on a watched channel.
    Candle {
        /// Venue symbol.
        symbol: String,
        /// Bar timeframe.
        timeframe: Timeframe,
        /// Bar state.
        candle: Candle,
        /// Whether the bar is final.
        is_close: bool,
    },
    /// A new pair was listed.
    PairAdded(Pair),
    /// A listed pair changed.
    PairUpdated(Pair),
    /// A pair was delisted. The pair is reported with `is_active` false.
    PairRemoved(Pair),
    /// The venue's rate limit was exceeded and calls are paused.
    RateLimitExceeded(RateLimitExceeded),
}

/// What a watch call started, so it can be stopped with
/// [`Exchange::unwatch`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchHandle {
    /// Channel subscriptions.
    Channels(Vec<String>),
    /// A background task, identified by an adapter-local id.
    Task(u64),
}

/// Fan-out of [`ExchangeEvent`]s to every subscriber.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ExchangeEvent>>>,
}

impl EventHub {
    /// Creates a hub without subscribers.
    #[must_use]
    pub const fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    /// Adds a subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExchangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// Sends `event` to every live subscriber, dropping closed ones.
    pub fn emit(&self, event: &ExchangeEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

/// A trading venue that serves historical bars and streams live ones.
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    /// Human-readable venue name.
    fn name(&self) -> &str;

    /// Timezone the venue aligns calendar bars to.
    async fn timezone(&self) -> Result<Tz, ExchangeError>;

    /// Looks up a single pair.
    async fn pair(&self, symbol: &str) -> Result<Option<Pair>, ExchangeError>;

    /// Lists every pair the venue knows, including inactive ones.
    async fn pairs(&self) -> Result<Vec<Pair>, ExchangeError>;

    /// Lists the pairs currently trading.
    async fn active_pairs(&self) -> Result<Vec<Pair>, ExchangeError> {
        Ok(self.pairs().await?.into_iter().filter(|pair| pair.is_active).collect())
    }

    /// Fetches one page of historical bars, oldest first.
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        query: CandleQuery,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Largest page [`Exchange::candles`] returns.
    fn max_candles_per_request(&self) -> usize;

    /// Starts streaming bars for every `(symbol, timeframe)`.
    async fn watch_candles_batch(&self, params: &[(String, Timeframe)]) -> Result<WatchHandle, ExchangeError>;

    /// Starts streaming bars for one symbol.
    async fn watch_candles(&self, symbol: &str, timeframe: Timeframe) -> Result<WatchHandle, ExchangeError> {
        self.watch_candles_batch(&[(symbol.to_string(), timeframe)]).await
    }

    /// Stops streaming bars for one symbol.
    async fn unwatch_candles(&self, symbol: &str, timeframe: Timeframe) -> Result<(), ExchangeError>;

    /// Stops whatever `handle` started.
    async fn unwatch(&self, handle: WatchHandle) -> Result<(), ExchangeError>;

    /// Starts reporting pair listings, changes and delistings.
    async fn watch_pairs(&self) -> Result<WatchHandle, ExchangeError>;

    /// Subscribes to exchange events.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExchangeEvent>;
}
