//! Aggregation controller.
//!
//! The [`Aggregator`] is a single actor task. It consumes the exchange's
//! event channel and the results of backfill tasks, so the candle store is
//! only ever touched from one place and the bars of a symbol are merged
//! strictly in order.
//!
//! A symbol moves through three states. It is untracked until its first base
//! bar arrives. That bar triggers a backfill of the history needed to rebuild
//! every open candle, and closing bars received meanwhile are queued. Once the
//! history is replayed the queue is flushed and the symbol is active, merging
//! each base bar as it arrives.

use candlewick_exchange::{CandleQuery, Exchange, ExchangeError, ExchangeEvent, WatchHandle, fetch_candles_range};
use candlewick_types::{Calendar, Candle, Pair, Timeframe};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Stage;
use crate::{AggregateError, AggregationTask, AggregatorConfig, CandleStore, EmitGate};

/// Notification emitted by the [`Aggregator`].
#[derive(Debug, Clone)]
pub enum AggregatorEvent {
    /// Initialisation started.
    Init,
    /// Pairs, calendar and anchors are resolved.
    Initialized,
    /// Watching is about to start.
    Start,
    /// Base bars are streaming.
    Started,
    /// Shutdown started.
    Stop,
    /// Shutdown finished.
    Stopped,
    /// A symbol started backfilling, triggered by `trigger`.
    PairInit {
        /// Pair.
        pair: Pair,
        /// First live base bar.
        trigger: Candle,
    },
    /// A symbol finished backfilling and is live.
    PairInitialized(Pair),
    /// A bar of any configured timeframe.
    Candle {
        /// Pair.
        pair: Pair,
        /// Timeframe of the bar.
        timeframe: Timeframe,
        /// Bar state.
        candle: Candle,
        /// Whether the bar is final.
        is_close: bool,
    },
    /// A closing base bar was merged into every timeframe.
    ///
    /// Sent for history replayed during backfill as well as for live bars,
    /// regardless of the emit watermarks that filter [`AggregatorEvent::Candle`].
    Aggregated {
        /// Pair.
        pair: Pair,
        /// Close time of the base bar.
        close_time: i64,
        /// Derived bars after the merge. Timeframes whose open candle starts
        /// after the base bar while replaying history are absent.
        candles: BTreeMap<Timeframe, Candle>,
    },
    /// A symbol hit an integrity error. Its state was dropped and the next
    /// base bar starts it again.
    SymbolFailed {
        /// Symbol.
        symbol: String,
        /// What went wrong.
        error: AggregateError,
    },
}

/// Derives bars of every configured timeframe from a venue's base feed.
pub struct Aggregator<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    config: AggregatorConfig,
    events: mpsc::UnboundedSender<AggregatorEvent>,
}

impl<E: Exchange + ?Sized> std::fmt::Debug for Aggregator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("exchange", &self.exchange.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: Exchange + ?Sized> Aggregator<E> {
    /// Creates an aggregator and the receiver of its events.
    pub fn new(exchange: Arc<E>, config: AggregatorConfig) -> (Self, mpsc::UnboundedReceiver<AggregatorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { exchange, config, events }, rx)
    }

    /// Runs until `shutdown` is cancelled or the exchange stops sending
    /// events.
    ///
    /// Integrity errors are reported per symbol through
    /// [`AggregatorEvent::SymbolFailed`] and do not stop the run.
    ///
    /// # Errors
    ///
    /// Returns an error if initialisation fails: the configuration is
    /// unusable, a configured symbol is unknown, the venue cannot be
    /// queried, or an anchor cannot be resolved.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AggregateError> {
        let Self { exchange, config, events } = self;
        let _ = events.send(AggregatorEvent::Init);

        let timeframes = config.sorted_timeframes();
        let Some(base) = timeframes.first().copied() else {
            return Err(AggregateError::Config("no timeframes configured".into()));
        };
        if config.init_concurrency == 0 {
            return Err(AggregateError::Config("init concurrency must be at least one".into()));
        }

        let mut incoming = exchange.subscribe();

        let pairs = resolve_pairs(exchange.as_ref(), &config).await?;
        let calendar = build_calendar(exchange.as_ref(), &config, &timeframes, &pairs).await?;
        info!(
            exchange = exchange.name(),
            pairs = pairs.len(),
            base = %base,
            timeframes = timeframes.len(),
            timezone = %calendar.timezone(),
            "aggregator initialized"
        );
        let _ = events.send(AggregatorEvent::Initialized);

        let (results_tx, mut results) = mpsc::unbounded_channel();
        let mut runtime = Runtime {
            exchange: Arc::clone(&exchange),
            calendar,
            base,
            timeframes,
            pairs: pairs.into_iter().map(|pair| (pair.symbol.clone(), pair)).collect(),
            store: CandleStore::new(),
            gate: EmitGate::new(config.emit_from.clone(), config.validate_emit),
            received: HashMap::new(),
            listings: HashMap::new(),
            backfills: HashMap::new(),
            generation: 0,
            semaphore: Arc::new(Semaphore::new(config.init_concurrency)),
            results: results_tx,
            watches: Vec::new(),
            events,
            config,
        };

        runtime.emit(AggregatorEvent::Start);
        runtime.start().await?;
        runtime.emit(AggregatorEvent::Started);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = incoming.recv() => match event {
                    Some(event) => runtime.handle_exchange_event(event).await,
                    None => {
                        warn!("exchange event channel closed");
                        break;
                    }
                },
                Some(done) = results.recv() => runtime.handle_backfill(done),
            }
        }

        runtime.stop().await;
        Ok(())
    }
}

async fn resolve_pairs<E: Exchange + ?Sized>(
    exchange: &E,
    config: &AggregatorConfig,
) -> Result<Vec<Pair>, AggregateError> {
    let Some(symbols) = &config.symbols else {
        return Ok(exchange.active_pairs().await?);
    };

    let mut pairs = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        match exchange.pair(symbol).await? {
            Some(pair) => pairs.push(pair),
            None => return Err(AggregateError::UnknownPair(symbol.clone())),
        }
    }
    Ok(pairs)
}

async fn build_calendar<E: Exchange + ?Sized>(
    exchange: &E,
    config: &AggregatorConfig,
    timeframes: &[Timeframe],
    pairs: &[Pair],
) -> Result<Calendar, AggregateError> {
    let timezone = exchange.timezone().await?;
    let mut calendar = Calendar::new(timezone).with_week_start(config.week_start);

    let sample = config
        .sample_symbol
        .clone()
        .or_else(|| pairs.first().map(|pair| pair.symbol.clone()));

    for &timeframe in timeframes.iter().filter(|tf| tf.requires_anchor()) {
        if let Some(base_time) = config.anchors.get(&timeframe) {
            calendar.set_anchor(timeframe, *base_time);
            continue;
        }

        let Some(sample) = &sample else {
            return Err(candlewick_types::CalendarError::MissingBaseTime(timeframe).into());
        };

        let latest = match exchange.candles(sample, timeframe, CandleQuery::latest(1)).await {
            Ok(candles) => candles.first().copied(),
            Err(ExchangeError::Validation(reason)) => {
                debug!(%timeframe, %reason, "venue does not serve anchor sample");
                None
            }
            Err(err) => return Err(err.into()),
        };

        match latest {
            Some(candle) => {
                debug!(%timeframe, %sample, base_time = candle.open_time, "anchored timeframe");
                calendar.set_anchor(timeframe, candle.open_time);
            }
            None => return Err(candlewick_types::CalendarError::MissingBaseTime(timeframe).into()),
        }
    }

    Ok(calendar)
}

/// Outcome of a backfill task.
struct BackfillDone {
    symbol: String,
    generation: u64,
    trigger: Candle,
    since: i64,
    boundaries: BTreeMap<Timeframe, i64>,
    outcome: Result<Vec<Candle>, ExchangeError>,
}

struct Backfill {
    generation: u64,
    abort: AbortHandle,
}

/// Replay options of a single merge.
#[derive(Default)]
struct Replay<'a> {
    aggregate_from: Option<&'a BTreeMap<Timeframe, i64>>,
}

struct Runtime<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    config: AggregatorConfig,
    calendar: Calendar,
    base: Timeframe,
    timeframes: Vec<Timeframe>,
    pairs: HashMap<String, Pair>,
    store: CandleStore,
    gate: EmitGate,
    received: HashMap<String, i64>,
    listings: HashMap<String, i64>,
    backfills: HashMap<String, Backfill>,
    generation: u64,
    semaphore: Arc<Semaphore>,
    results: mpsc::UnboundedSender<BackfillDone>,
    watches: Vec<WatchHandle>,
    events: mpsc::UnboundedSender<AggregatorEvent>,
}

impl<E: Exchange + ?Sized> Runtime<E> {
    fn emit(&self, event: AggregatorEvent) {
        if self.events.send(event).is_err() {
            debug!("aggregator event receiver dropped");
        }
    }

    async fn start(&mut self) -> Result<(), AggregateError> {
        if self.config.handle_pair_updates {
            self.watches.push(self.exchange.watch_pairs().await?);
        }

        let mut params: Vec<(String, Timeframe)> = self.pairs.keys().map(|s| (s.clone(), self.base)).collect();
        params.sort();
        if !params.is_empty() {
            self.watches.push(self.exchange.watch_candles_batch(&params).await?);
        }
        info!(symbols = params.len(), base = %self.base, "watching base bars");
        Ok(())
    }

    async fn stop(&mut self) {
        self.emit(AggregatorEvent::Stop);

        for handle in std::mem::take(&mut self.watches) {
            if let Err(error) = self.exchange.unwatch(handle).await {
                warn!(%error, "failed to unwatch");
            }
        }
        for (_, backfill) in self.backfills.drain() {
            backfill.abort.abort();
        }
        self.store.clear();
        self.gate.clear();
        self.received.clear();
        self.listings.clear();

        info!("aggregator stopped");
        self.emit(AggregatorEvent::Stopped);
    }

    async fn handle_exchange_event(&mut self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Candle { symbol, timeframe, candle, is_close } => {
                if timeframe != self.base || !self.pairs.contains_key(&symbol) {
                    return;
                }
                if let Err(error) = self.on_candle(&symbol, candle, is_close) {
                    self.fail_symbol(&symbol, error);
                }
            }
            ExchangeEvent::PairAdded(pair) => self.on_pair_added(pair).await,
            ExchangeEvent::PairUpdated(pair) | ExchangeEvent::PairRemoved(pair) => self.on_pair_update(pair).await,
            ExchangeEvent::RateLimitExceeded(exceeded) => {
                debug!(wait_until = exceeded.wait_until, "exchange is rate limited");
            }
        }
    }

    fn on_candle(&mut self, symbol: &str, candle: Candle, is_close: bool) -> Result<(), AggregateError> {
        if let Some(expected) = self.received.get(symbol).copied() {
            if expected != candle.open_time {
                return Err(AggregateError::NotContinuous {
                    stage: Stage::Receive,
                    symbol: symbol.to_string(),
                    timeframe: self.base,
                    expected,
                    actual: candle.open_time,
                });
            }
        }

        if !self.store.has(symbol) {
            self.store.create(symbol);
            self.schedule_backfill(symbol, candle)?;
        }

        self.received
            .insert(symbol.to_string(), if is_close { candle.close_time + 1 } else { candle.open_time });

        if is_close || self.store.is_active(symbol) {
            self.store.add_to_queue(symbol, AggregationTask { candle, is_close })?;
            for task in self.store.drain_ready(symbol) {
                self.aggregate(symbol, &task.candle, task.is_close, &Replay::default())?;
            }
        }
        Ok(())
    }

    fn schedule_backfill(&mut self, symbol: &str, trigger: Candle) -> Result<(), AggregateError> {
        let Some(pair) = self.pairs.get(symbol).cloned() else {
            return Err(AggregateError::UnknownPair(symbol.to_string()));
        };

        let until = trigger.open_time - 1;
        let mut boundaries = BTreeMap::new();
        for &timeframe in self.timeframes.iter().filter(|tf| **tf != self.base) {
            boundaries.insert(timeframe, self.calendar.open_time(timeframe, until)?);
        }

        let lowest = boundaries.values().min().copied().unwrap_or(trigger.open_time);
        let since = match self.config.known_candles.get(symbol) {
            Some(known) if known.apply_at > lowest => known.apply_at,
            _ => lowest,
        };

        self.emit(AggregatorEvent::PairInit { pair, trigger });
        info!(symbol, since, until, trigger = trigger.open_time, "backfill scheduled");

        self.generation += 1;
        let generation = self.generation;
        let exchange = Arc::clone(&self.exchange);
        let semaphore = Arc::clone(&self.semaphore);
        let results = self.results.clone();
        let base = self.base;
        let symbol = symbol.to_string();
        let task_symbol = symbol.clone();

        let task = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let outcome = if until >= since {
                fetch_candles_range(exchange.as_ref(), &task_symbol, base, since, until).await
            } else {
                Ok(Vec::new())
            };
            let _ = results.send(BackfillDone { symbol: task_symbol, generation, trigger, since, boundaries, outcome });
        });

        self.backfills.insert(symbol, Backfill { generation, abort: task.abort_handle() });
        Ok(())
    }

    fn handle_backfill(&mut self, done: BackfillDone) {
        let current = self.backfills.get(&done.symbol).map(|backfill| backfill.generation);
        if current != Some(done.generation) {
            debug!(symbol = %done.symbol, generation = done.generation, "discarding stale backfill");
            return;
        }
        self.backfills.remove(&done.symbol);

        if let Err(error) = self.complete_backfill(&done) {
            self.fail_symbol(&done.symbol, error);
        }
    }

    fn complete_backfill(&mut self, done: &BackfillDone) -> Result<(), AggregateError> {
        let symbol = done.symbol.as_str();
        if !self.store.has(symbol) {
            return Ok(());
        }

        let candles = done.outcome.clone()?;
        let listing_at = match candles.first() {
            Some(first) if first.open_time > done.since => Some(first.open_time),
            Some(_) => None,
            None => Some(done.trigger.open_time),
        };
        if let Some(listing_at) = listing_at {
            debug!(symbol, listing_at, "pair listed inside backfill window");
            self.listings.insert(symbol.to_string(), listing_at);
        }

        let replay = Replay { aggregate_from: Some(&done.boundaries) };
        for candle in &candles {
            self.aggregate(symbol, candle, true, &replay)?;
        }

        for task in self.store.activate(symbol)? {
            self.aggregate(symbol, &task.candle, task.is_close, &Replay::default())?;
        }

        info!(symbol, replayed = candles.len(), "pair initialized");
        if let Some(pair) = self.pairs.get(symbol).cloned() {
            self.emit(AggregatorEvent::PairInitialized(pair));
        }
        Ok(())
    }

    fn aggregate(&mut self, symbol: &str, candle: &Candle, is_close: bool, replay: &Replay<'_>) -> Result<(), AggregateError> {
        let Some(pair) = self.pairs.get(symbol).cloned() else {
            return Err(AggregateError::UnknownPair(symbol.to_string()));
        };
        let precision = pair.precision.quantity;
        let listing_at = self.listings.get(symbol).copied();
        let known = self
            .config
            .known_candles
            .get(symbol)
            .filter(|known| known.apply_at == candle.open_time)
            .map(|known| known.candles.clone());
        let mut snapshot = BTreeMap::new();

        for index in 0..self.timeframes.len() {
            let timeframe = self.timeframes[index];

            if timeframe == self.base {
                self.emit_candle(&pair, timeframe, *candle, is_close)?;
                continue;
            }

            if replay
                .aggregate_from
                .and_then(|from| from.get(&timeframe))
                .is_some_and(|from| candle.open_time < *from)
            {
                continue;
            }

            let (open_time, close_time) = self.calendar.candle_times(timeframe, candle.open_time)?;
            let current_open = self.store.open_candle(symbol, timeframe).map(|open| open.open_time);

            if let Some(seed) = known.as_ref().and_then(|known| known.get(&timeframe)) {
                if current_open != Some(seed.open_time) {
                    self.store.set_open_candle(symbol, timeframe, *seed)?;
                }
            } else if (open_time == candle.open_time || listing_at == Some(candle.open_time))
                && current_open != Some(open_time)
            {
                self.store.create_open_candle(symbol, timeframe, open_time, close_time, candle.open)?;
            }

            let aggregated = self.store.aggregate(symbol, timeframe, candle, is_close, precision)?;
            self.emit_candle(&pair, timeframe, aggregated.candle, aggregated.is_close)?;
            snapshot.insert(timeframe, aggregated.candle);
        }

        if is_close {
            self.emit(AggregatorEvent::Aggregated { pair, close_time: candle.close_time, candles: snapshot });
        }
        Ok(())
    }

    fn emit_candle(&mut self, pair: &Pair, timeframe: Timeframe, candle: Candle, is_close: bool) -> Result<(), AggregateError> {
        let is_active = self.store.is_active(&pair.symbol);
        if self.gate.admit(&pair.symbol, timeframe, &candle, is_close, is_active)? {
            self.emit(AggregatorEvent::Candle { pair: pair.clone(), timeframe, candle, is_close });
        }
        Ok(())
    }

    async fn on_pair_added(&mut self, pair: Pair) {
        if !self.config.handle_pair_updates || !self.config.auto_add_new_pairs || !pair.is_active {
            return;
        }
        if self.pairs.contains_key(&pair.symbol) {
            self.pairs.insert(pair.symbol.clone(), pair);
            return;
        }

        let symbol = pair.symbol.clone();
        self.pairs.insert(symbol.clone(), pair);
        match self.exchange.watch_candles(&symbol, self.base).await {
            Ok(handle) => {
                info!(%symbol, "watching new pair");
                self.watches.push(handle);
            }
            Err(error) => {
                warn!(%symbol, %error, "failed to watch new pair");
                self.pairs.remove(&symbol);
            }
        }
    }

    async fn on_pair_update(&mut self, pair: Pair) {
        if !self.config.handle_pair_updates || !self.pairs.contains_key(&pair.symbol) {
            return;
        }
        if pair.is_active {
            debug!(symbol = %pair.symbol, "pair metadata refreshed");
            self.pairs.insert(pair.symbol.clone(), pair);
            return;
        }

        let symbol = pair.symbol;
        if self.config.unwatch_on_pair_disabled {
            if let Err(error) = self.exchange.unwatch_candles(&symbol, self.base).await {
                warn!(%symbol, %error, "failed to unwatch disabled pair");
            }
        }
        self.discard(&symbol);
        self.pairs.remove(&symbol);
        info!(%symbol, "pair disabled, state discarded");
    }

    fn fail_symbol(&mut self, symbol: &str, error: AggregateError) {
        error!(symbol, %error, "symbol failed, dropping its state");
        self.discard(symbol);
        self.emit(AggregatorEvent::SymbolFailed { symbol: symbol.to_string(), error });
    }

    fn discard(&mut self, symbol: &str) {
        self.store.remove(symbol);
        self.gate.reset(symbol);
        self.received.remove(symbol);
        self.listings.remove(symbol);
        if let Some(backfill) = self.backfills.remove(symbol) {
            backfill.abort.abort();
        }
    }
}
