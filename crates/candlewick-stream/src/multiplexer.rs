//! Connection pool that spreads channel subscriptions over websockets.

use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::connection::{Connection, Shared};
use crate::{ConnectionId, Connector, StreamError, WsConnector};

/// Configuration for a [`StreamMultiplexer`].
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Combined-stream endpoint.
    pub endpoint: String,
    /// Maximum channels a single connection may carry.
    pub max_channels_per_connection: usize,
    /// Maximum channels per SUBSCRIBE or UNSUBSCRIBE request.
    pub max_subscribe_per_message: usize,
    /// Time to wait for a request's response.
    pub request_timeout: Duration,
    /// Base delay for reconnect backoff (in milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay between reconnect attempts (in milliseconds).
    pub max_delay_ms: u64,
    /// Capacity of the lifecycle event broadcast.
    pub event_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://stream.binance.com:9443/stream".to_string(),
            max_channels_per_connection: 1024,
            max_subscribe_per_message: 200,
            request_timeout: Duration::from_secs(10),
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            event_capacity: 1024,
        }
    }
}

impl MultiplexerConfig {
    /// Creates a configuration for `endpoint` with default limits.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }

    /// Sets the per-connection channel cap.
    #[must_use]
    pub const fn with_max_channels(mut self, max_channels_per_connection: usize) -> Self {
        self.max_channels_per_connection = max_channels_per_connection;
        self
    }

    /// Calculates the reconnect delay with exponential backoff and jitter.
    ///
    /// The jitter is drawn at random for every call so connections that
    /// dropped together do not retry in lockstep.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        // base_delay * 2^attempt, capped
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(10));
        let capped = exp_delay.min(self.max_delay_ms);

        // Random jitter of up to ±25%
        let range = (capped / 4) as i64;
        let jitter = if range > 0 { rand::thread_rng().gen_range(-range..=range) } else { 0 };

        Duration::from_millis((capped as i64 + jitter).max(100) as u64)
    }
}

/// Lifecycle notification from the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A connection is being opened.
    Connect {
        /// Connection id.
        connection: ConnectionId,
    },
    /// A connection is open and its server-side subscriptions are loaded.
    Connected {
        /// Connection id.
        connection: ConnectionId,
    },
    /// A dropped connection is attempting to reconnect.
    Reconnect {
        /// Connection id.
        connection: ConnectionId,
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// A dropped connection is back and its channels are restored.
    Reconnected {
        /// Connection id.
        connection: ConnectionId,
    },
    /// A connection dropped unexpectedly.
    Disconnect {
        /// Connection id.
        connection: ConnectionId,
    },
    /// A connection shut down for good.
    Disconnected {
        /// Connection id.
        connection: ConnectionId,
    },
    /// The server sent a close frame.
    Close {
        /// Connection id.
        connection: ConnectionId,
        /// Close code.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
    /// Channels are about to be subscribed.
    Subscribe {
        /// Connection id.
        connection: ConnectionId,
        /// Channels requested.
        channels: Vec<String>,
    },
    /// Channels were subscribed and verified.
    Subscribed {
        /// Connection id.
        connection: ConnectionId,
        /// Channels subscribed.
        channels: Vec<String>,
    },
    /// A frame that is neither a response nor channel data.
    Message {
        /// Connection id.
        connection: ConnectionId,
        /// Raw frame.
        text: String,
    },
}

/// A channel payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamData {
    /// Connection the payload arrived on.
    pub connection: ConnectionId,
    /// Channel name.
    pub stream: String,
    /// Payload.
    pub data: Value,
}

/// Spreads channel subscriptions over a pool of connections.
///
/// Channel payloads are delivered losslessly through the receiver returned by
/// [`StreamMultiplexer::new`]. Lifecycle events are broadcast and may be
/// missed by slow subscribers.
pub struct StreamMultiplexer {
    shared: Shared,
    connections: Mutex<BTreeMap<ConnectionId, Connection>>,
    operations: tokio::sync::Mutex<()>,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("endpoint", &self.shared.config.endpoint)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl StreamMultiplexer {
    /// Creates a multiplexer and the receiver of its channel payloads.
    pub fn new(
        config: MultiplexerConfig,
        connector: impl Connector,
    ) -> (Self, mpsc::UnboundedReceiver<StreamData>) {
        let (data, data_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let multiplexer = Self {
            shared: Shared {
                config: Arc::new(config),
                connector: Arc::new(connector),
                request_ids: Arc::new(AtomicU64::new(1)),
                events,
                data,
            },
            connections: Mutex::new(BTreeMap::new()),
            operations: tokio::sync::Mutex::new(()),
            next_connection: AtomicU64::new(1),
        };

        (multiplexer, data_rx)
    }

    /// Creates a multiplexer over real websockets.
    pub fn websocket(config: MultiplexerConfig) -> (Self, mpsc::UnboundedReceiver<StreamData>) {
        Self::new(config, WsConnector)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &MultiplexerConfig {
        &self.shared.config
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribes to channels not already carried by the pool.
    ///
    /// Spare capacity of ready connections is filled oldest first; the rest
    /// is split across new connections.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be opened, a request fails
    /// or times out, or the server does not confirm the subscriptions.
    pub async fn subscribe<I, S>(&self, channels: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let _operation = self.operations.lock().await;

        let carried = self.channels();
        let mut seen = BTreeSet::new();
        let mut pending: Vec<String> = channels
            .into_iter()
            .map(Into::into)
            .filter(|channel| !carried.contains(channel) && seen.insert(channel.clone()))
            .collect();

        if pending.is_empty() {
            return Ok(());
        }

        let limit = self.shared.config.max_channels_per_connection.max(1);

        for connection in self.snapshot() {
            if pending.is_empty() {
                break;
            }
            if !connection.is_ready() {
                continue;
            }
            let spare = limit.saturating_sub(connection.channel_count());
            if spare == 0 {
                continue;
            }
            let batch: Vec<String> = pending.drain(..spare.min(pending.len())).collect();
            connection.subscribe(&batch).await?;
        }

        for chunk in pending.chunks(limit) {
            let connection = self.connect().await?;
            if let Err(e) = connection.subscribe(chunk).await {
                if connection.channel_count() == 0 {
                    self.remove(connection.id());
                    connection.close().await;
                }
                return Err(e);
            }
        }

        debug!(connections = self.connection_count(), "subscription pass complete");
        Ok(())
    }

    /// Unsubscribes from channels, closing connections that end up empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a request fails or times out, or the server still
    /// lists a channel afterwards.
    pub async fn unsubscribe<I, S>(&self, channels: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wanted: BTreeSet<String> = channels.into_iter().map(Into::into).collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let _operation = self.operations.lock().await;

        for connection in self.snapshot() {
            let owned: Vec<String> = connection.channels().intersection(&wanted).cloned().collect();
            if owned.is_empty() {
                continue;
            }

            if connection.unsubscribe(&owned).await? == 0 {
                info!(connection = %connection.id(), "closing empty stream connection");
                self.remove(connection.id());
                connection.close().await;
            }
        }

        Ok(())
    }

    /// Closes every connection.
    pub async fn close(&self) {
        let _operation = self.operations.lock().await;
        let connections: Vec<Connection> = std::mem::take(&mut *self.pool()).into_values().collect();
        futures::future::join_all(connections.iter().map(Connection::close)).await;
    }

    /// Returns the number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.pool().len()
    }

    /// Returns every channel carried by the pool.
    #[must_use]
    pub fn channels(&self) -> BTreeSet<String> {
        self.snapshot().iter().flat_map(Connection::channels).collect()
    }

    /// Returns the channels carried by each connection, oldest first.
    #[must_use]
    pub fn connection_channels(&self) -> BTreeMap<ConnectionId, BTreeSet<String>> {
        self.snapshot().iter().map(|connection| (connection.id(), connection.channels())).collect()
    }

    async fn connect(&self) -> Result<Connection, StreamError> {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let connection = Connection::open(id, self.shared.clone()).await?;
        self.pool().insert(id, connection.clone());
        Ok(connection)
    }

    fn remove(&self, id: ConnectionId) {
        self.pool().remove(&id);
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.pool().values().cloned().collect()
    }

    fn pool(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        for connection in self.pool().values() {
            connection.cancel();
        }
    }
}
