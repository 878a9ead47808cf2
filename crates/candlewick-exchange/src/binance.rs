//! Binance spot and futures adapter.

use async_trait::async_trait;
use candlewick_stream::{Connector, MultiplexerConfig, StreamData, StreamMultiplexer, WsConnector};
use candlewick_types::{Calendar, Candle, Pair, Timeframe, Tz};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OnceCell, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{ClientConfig, RestClient};
use crate::parse::{ExchangeInfo, StreamPayload, parse_klines, parse_stream_payload};
use crate::url::{CONTRACT_INFO_CHANNEL, exchange_info_url, kline_channel, klines_url};
use crate::{
    CandleQuery, EventHub, Exchange, ExchangeError, ExchangeEvent, PairCache, PairMap, RateLimiter, WatchHandle,
};

/// Page size Binance applies when a klines request carries no limit.
const DEFAULT_KLINES_LIMIT: usize = 500;

/// Binance market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Market {
    /// Spot.
    #[default]
    Spot,
    /// USD-margined futures.
    UsdM,
    /// Coin-margined futures.
    CoinM,
}

impl Market {
    /// Returns every market.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Spot, Self::UsdM, Self::CoinM]
    }

    /// Human-readable venue name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Spot => "Binance Spot",
            Self::UsdM => "Binance USDM Futures",
            Self::CoinM => "Binance COINM Futures",
        }
    }

    /// Short identifier used on the command line.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::UsdM => "usdm",
            Self::CoinM => "coinm",
        }
    }

    /// REST base URL.
    #[must_use]
    pub const fn rest_base(self) -> &'static str {
        match self {
            Self::Spot => crate::url::SPOT_REST,
            Self::UsdM => crate::url::USDM_REST,
            Self::CoinM => crate::url::COINM_REST,
        }
    }

    /// Combined-stream websocket endpoint.
    #[must_use]
    pub const fn stream_endpoint(self) -> &'static str {
        match self {
            Self::Spot => crate::url::SPOT_STREAM,
            Self::UsdM => crate::url::USDM_STREAM,
            Self::CoinM => crate::url::COINM_STREAM,
        }
    }

    /// Channels one websocket connection may carry.
    #[must_use]
    pub const fn max_streams_per_connection(self) -> usize {
        match self {
            Self::Spot => 1024,
            Self::UsdM | Self::CoinM => 200,
        }
    }

    /// Largest klines page.
    #[must_use]
    pub const fn klines_limit(self) -> usize {
        match self {
            Self::Spot => 1000,
            Self::UsdM | Self::CoinM => 1500,
        }
    }

    /// Request weight of `exchangeInfo`.
    #[must_use]
    pub const fn exchange_info_weight(self) -> u32 {
        match self {
            Self::Spot => 20,
            Self::UsdM | Self::CoinM => 1,
        }
    }

    /// Request weight of a klines page of `limit` bars.
    #[must_use]
    pub const fn klines_weight(self, limit: usize) -> u32 {
        match self {
            Self::Spot => 2,
            Self::UsdM | Self::CoinM => {
                if limit < 100 {
                    1
                } else if limit < 500 {
                    2
                } else if limit <= 1000 {
                    5
                } else {
                    10
                }
            }
        }
    }

    /// Whether the market reports contract changes on a stream.
    #[must_use]
    pub const fn is_futures(self) -> bool {
        matches!(self, Self::UsdM | Self::CoinM)
    }

    /// Whether the market serves bars of `timeframe`.
    #[must_use]
    pub fn supports(self, timeframe: Timeframe) -> bool {
        (self == Self::Spot && timeframe == Timeframe::SECOND) || Timeframe::standard().contains(&timeframe)
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Market {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|market| market.id().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ExchangeError::Validation(format!("unknown market '{s}', expected spot, usdm or coinm")))
    }
}

/// Configuration for [`BinanceExchange`].
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    /// Market to connect to.
    pub market: Market,
    /// REST client settings.
    pub client: ClientConfig,
    /// Deadline for websocket control requests.
    pub request_timeout: Duration,
    /// Interval between `exchangeInfo` polls when watching spot pairs.
    pub pair_poll_interval: Duration,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            market: Market::default(),
            client: ClientConfig::default(),
            request_timeout: Duration::from_secs(10),
            pair_poll_interval: Duration::from_secs(60),
        }
    }
}

impl BinanceConfig {
    /// Creates a default configuration for `market`.
    #[must_use]
    pub fn new(market: Market) -> Self {
        Self { market, ..Self::default() }
    }

    /// Returns the multiplexer configuration for the market.
    #[must_use]
    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        let mut config = MultiplexerConfig::new(self.market.stream_endpoint())
            .with_max_channels(self.market.max_streams_per_connection());
        config.request_timeout = self.request_timeout;
        config
    }
}

struct Venue {
    limiter: Arc<RateLimiter>,
    timezone: Tz,
}

struct Inner {
    config: BinanceConfig,
    client: RestClient,
    multiplexer: StreamMultiplexer,
    hub: EventHub,
    pairs: PairCache,
    venue: OnceCell<Venue>,
    tasks: Mutex<HashMap<u64, CancellationToken>>,
    next_task: AtomicU64,
    shutdown: CancellationToken,
}

/// Binance exchange adapter.
///
/// REST calls share one [`RateLimiter`] sized from the venue's
/// `REQUEST_WEIGHT` limit, which is read from `exchangeInfo` on first use.
/// Bars are streamed over a [`StreamMultiplexer`].
pub struct BinanceExchange {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BinanceExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceExchange")
            .field("market", &self.inner.config.market)
            .field("multiplexer", &self.inner.multiplexer)
            .field("pairs", &self.inner.pairs)
            .finish_non_exhaustive()
    }
}

impl BinanceExchange {
    /// Creates an adapter streaming over real websockets.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: BinanceConfig) -> Result<Self, ExchangeError> {
        Self::with_connector(config, WsConnector)
    }

    /// Creates an adapter streaming through `connector`.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_connector(config: BinanceConfig, connector: impl Connector) -> Result<Self, ExchangeError> {
        let client = RestClient::new(config.client.clone())?;
        let (multiplexer, data) = StreamMultiplexer::new(config.multiplexer_config(), connector);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            config,
            client,
            multiplexer,
            hub: EventHub::new(),
            pairs: PairCache::new(),
            venue: OnceCell::new(),
            tasks: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(1),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(pump(Arc::downgrade(&inner), data, shutdown));
        Ok(Self { inner })
    }

    /// Returns the market.
    #[must_use]
    pub fn market(&self) -> Market {
        self.inner.config.market
    }

    /// Returns the stream multiplexer.
    #[must_use]
    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.inner.multiplexer
    }

    /// Stops background tasks and closes every stream connection.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.multiplexer.close().await;
    }

    fn ensure_supported(&self, timeframe: Timeframe) -> Result<(), ExchangeError> {
        if self.market().supports(timeframe) {
            Ok(())
        } else {
            Err(ExchangeError::Validation(format!("{} does not serve {timeframe} bars", self.market().name())))
        }
    }
}

impl Drop for BinanceExchange {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    async fn venue(self: &Arc<Self>) -> Result<&Venue, ExchangeError> {
        self.venue
            .get_or_try_init(|| async {
                let url = exchange_info_url(self.config.market.rest_base());
                let info = self.client.get_json::<ExchangeInfo>(&url).await?;
                let weight_per_second = info.weight_per_second()?;
                let timezone = Calendar::parse_timezone(&info.timezone)?;

                let limiter = Arc::new(RateLimiter::new(weight_per_second));
                self.forward_rate_limits(&limiter);

                info!(market = %self.config.market, weight_per_second, %timezone, "loaded venue limits");
                Ok(Venue { limiter, timezone })
            })
            .await
    }

    fn forward_rate_limits(self: &Arc<Self>, limiter: &RateLimiter) {
        let mut events = limiter.subscribe();
        let inner = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.hub.emit(&ExchangeEvent::RateLimitExceeded(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => debug!(missed, "rate limit events lagged"),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn limiter(self: &Arc<Self>) -> Result<Arc<RateLimiter>, ExchangeError> {
        Ok(Arc::clone(&self.venue().await?.limiter))
    }

    async fn exchange_info(self: &Arc<Self>) -> Result<ExchangeInfo, ExchangeError> {
        let limiter = self.limiter().await?;
        let url = exchange_info_url(self.config.market.rest_base());
        let client = &self.client;
        let url = url.as_str();

        Ok(limiter
            .call(self.config.market.exchange_info_weight(), move || client.get_json::<ExchangeInfo>(url))
            .await?)
    }

    async fn pair_map(self: &Arc<Self>) -> Result<Arc<PairMap>, ExchangeError> {
        let inner = Arc::clone(self);
        self.pairs
            .get_or_refresh(move || async move {
                let pairs = inner.exchange_info().await?.pairs(inner.config.market)?;
                debug!(market = %inner.config.market, pairs = pairs.len(), "loaded pairs");
                Ok(pairs.into_iter().map(|pair| (pair.symbol.clone(), pair)).collect())
            })
            .await
    }

    async fn handle_pair_update(self: &Arc<Self>, symbol: &str) {
        let old = match self.pair_map().await {
            Ok(pairs) => pairs.get(symbol).cloned(),
            Err(error) => {
                warn!(symbol, %error, "failed to read pairs before contract update");
                return;
            }
        };

        self.pairs.invalidate();

        let new = match self.pair_map().await {
            Ok(pairs) => pairs.get(symbol).cloned(),
            Err(error) => {
                warn!(symbol, %error, "failed to refresh pairs after contract update");
                return;
            }
        };

        let event = match (old, new) {
            (Some(_), Some(new)) => ExchangeEvent::PairUpdated(new),
            (Some(old), None) => ExchangeEvent::PairRemoved(old.with_active(false)),
            (None, Some(new)) => ExchangeEvent::PairAdded(new),
            (None, None) => return,
        };
        info!(symbol, event = ?event, "contract changed");
        self.hub.emit(&event);
    }

    fn register_task(&self, cancel: CancellationToken) -> u64 {
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).insert(id, cancel);
        id
    }
}

/// Routes channel payloads to exchange events.
async fn pump(inner: Weak<Inner>, mut data: mpsc::UnboundedReceiver<StreamData>, shutdown: CancellationToken) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = data.recv() => message,
        };
        let Some(message) = message else { break };
        let Some(inner) = inner.upgrade() else { break };

        match parse_stream_payload(&message.data) {
            Ok(StreamPayload::Kline { symbol, timeframe, candle, is_close }) => {
                inner.hub.emit(&ExchangeEvent::Candle { symbol, timeframe, candle, is_close });
            }
            Ok(StreamPayload::ContractInfo { symbol }) => {
                tokio::spawn(async move { inner.handle_pair_update(&symbol).await });
            }
            Ok(StreamPayload::Other) => trace!(stream = %message.stream, "ignoring payload"),
            Err(error) => warn!(stream = %message.stream, %error, "undecodable stream payload"),
        }
    }
    debug!("stream pump stopped");
}

/// Polls the pair list and reports differences between polls.
async fn poll_pairs(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut known: Option<Arc<PairMap>> = None;

    loop {
        {
            let Some(inner) = inner.upgrade() else { break };
            if known.is_some() {
                inner.pairs.invalidate();
            }
            match inner.pair_map().await {
                Ok(current) => {
                    if let Some(previous) = &known {
                        for event in diff_pairs(previous, &current) {
                            inner.hub.emit(&event);
                        }
                    }
                    known = Some(current);
                }
                Err(error) => warn!(%error, "pair poll failed"),
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    debug!("pair poll stopped");
}

/// Lists the pair events that turn `previous` into `current`.
pub(crate) fn diff_pairs(previous: &PairMap, current: &PairMap) -> Vec<ExchangeEvent> {
    let mut events = Vec::new();

    for (symbol, pair) in current {
        match previous.get(symbol) {
            None => events.push(ExchangeEvent::PairAdded(pair.clone())),
            Some(old) if old != pair => events.push(ExchangeEvent::PairUpdated(pair.clone())),
            Some(_) => {}
        }
    }

    events.extend(
        previous
            .iter()
            .filter(|(symbol, _)| !current.contains_key(*symbol))
            .map(|(_, pair)| ExchangeEvent::PairRemoved(pair.clone().with_active(false))),
    );

    events
}

#[async_trait]
impl Exchange for BinanceExchange {
    fn name(&self) -> &str {
        self.market().name()
    }

    async fn timezone(&self) -> Result<Tz, ExchangeError> {
        Ok(self.inner.venue().await?.timezone)
    }

    async fn pair(&self, symbol: &str) -> Result<Option<Pair>, ExchangeError> {
        Ok(self.inner.pair_map().await?.get(symbol).cloned())
    }

    async fn pairs(&self) -> Result<Vec<Pair>, ExchangeError> {
        Ok(self.inner.pair_map().await?.values().cloned().collect())
    }

    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        query: CandleQuery,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.ensure_supported(timeframe)?;

        let market = self.market();
        let limit = query.limit.map(|limit| limit.clamp(1, market.klines_limit()));
        let weight = market.klines_weight(limit.unwrap_or(DEFAULT_KLINES_LIMIT));
        let url = klines_url(market.rest_base(), symbol, timeframe, query.since, query.until, limit);

        let limiter = self.inner.limiter().await?;
        let client = &self.inner.client;
        let url = url.as_str();
        let rows: Vec<Vec<Value>> = limiter.call(weight, move || client.get_json(url)).await?;

        parse_klines(&rows)
    }

    fn max_candles_per_request(&self) -> usize {
        self.market().klines_limit()
    }

    async fn watch_candles_batch(&self, params: &[(String, Timeframe)]) -> Result<WatchHandle, ExchangeError> {
        for (_, timeframe) in params {
            self.ensure_supported(*timeframe)?;
        }
        let channels: Vec<String> = params
            .iter()
            .map(|(symbol, timeframe)| kline_channel(symbol, *timeframe))
            .collect();

        self.inner.multiplexer.subscribe(channels.iter().cloned()).await?;
        Ok(WatchHandle::Channels(channels))
    }

    async fn unwatch_candles(&self, symbol: &str, timeframe: Timeframe) -> Result<(), ExchangeError> {
        self.inner.multiplexer.unsubscribe([kline_channel(symbol, timeframe)]).await?;
        Ok(())
    }

    async fn unwatch(&self, handle: WatchHandle) -> Result<(), ExchangeError> {
        match handle {
            WatchHandle::Channels(channels) => self.inner.multiplexer.unsubscribe(channels).await?,
            WatchHandle::Task(id) => {
                let cancel = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
            }
        }
        Ok(())
    }

    async fn watch_pairs(&self) -> Result<WatchHandle, ExchangeError> {
        if self.market().is_futures() {
            self.inner.multiplexer.subscribe([CONTRACT_INFO_CHANNEL]).await?;
            return Ok(WatchHandle::Channels(vec![CONTRACT_INFO_CHANNEL.to_string()]));
        }

        let cancel = self.inner.shutdown.child_token();
        let id = self.inner.register_task(cancel.clone());
        tokio::spawn(poll_pairs(Arc::downgrade(&self.inner), self.inner.config.pair_poll_interval, cancel));
        Ok(WatchHandle::Task(id))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ExchangeEvent> {
        self.inner.hub.subscribe()
    }
}
