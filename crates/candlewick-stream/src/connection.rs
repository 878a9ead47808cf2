//! A single pooled connection and its supervisor task.
//!
//! Each connection runs a supervisor that reads frames, resolves outstanding
//! requests by id and forwards channel payloads. A separate writer task owns
//! the outgoing half of the socket. When the socket drops unexpectedly the
//! supervisor reconnects with backoff and restores the last known channel set
//! before announcing [`StreamEvent::Reconnected`].

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{self, Method, ServerMessage};
use crate::transport::{Connector, FrameSink, FrameStream, Inbound};
use crate::{MultiplexerConfig, StreamData, StreamError, StreamEvent};

/// Identifier of a pooled connection. Ids increase in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

type Responder = oneshot::Sender<Result<Value, StreamError>>;

#[derive(Default)]
struct State {
    ready: bool,
    epoch: u64,
    channels: BTreeSet<String>,
    pending: HashMap<u64, Responder>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

/// Plumbing shared by every connection of one multiplexer.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) config: Arc<MultiplexerConfig>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) request_ids: Arc<AtomicU64>,
    pub(crate) events: broadcast::Sender<StreamEvent>,
    pub(crate) data: mpsc::UnboundedSender<StreamData>,
}

struct Inner {
    id: ConnectionId,
    shared: Shared,
    state: Mutex<State>,
    control: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub(crate) struct Connection {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Connects, starts the supervisor and loads the server's current
    /// subscription list.
    pub(crate) async fn open(id: ConnectionId, shared: Shared) -> Result<Self, StreamError> {
        let endpoint = shared.config.endpoint.clone();
        let connection = Self {
            inner: Arc::new(Inner {
                id,
                shared,
                state: Mutex::default(),
                control: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        };

        connection.emit(StreamEvent::Connect { connection: id });
        info!(connection = %id, %endpoint, "opening stream connection");

        let (sink, stream) = connection.inner.shared.connector.connect(&endpoint).await?;
        let writer = connection.attach(sink);
        let task = tokio::spawn(connection.clone().supervise(writer, stream));
        *lock(&connection.inner.task) = Some(task);

        let listed = {
            let _control = connection.inner.control.lock().await;
            connection.list_subscriptions().await
        };

        match listed {
            Ok(channels) => {
                connection.state().channels.extend(channels);
            }
            Err(e) => {
                connection.close().await;
                return Err(e);
            }
        }

        connection.emit(StreamEvent::Connected { connection: id });
        info!(connection = %id, "stream connection ready");
        Ok(connection)
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state().ready
    }

    pub(crate) fn channels(&self) -> BTreeSet<String> {
        self.state().channels.clone()
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.state().channels.len()
    }

    /// Subscribes to `channels`, then verifies the server's list.
    pub(crate) async fn subscribe(&self, channels: &[String]) -> Result<(), StreamError> {
        let _control = self.inner.control.lock().await;
        self.subscribe_locked(channels).await
    }

    /// Unsubscribes from `channels`, then verifies the server's list.
    /// Returns the number of channels left on the connection.
    pub(crate) async fn unsubscribe(&self, channels: &[String]) -> Result<usize, StreamError> {
        let _control = self.inner.control.lock().await;
        let connection = self.inner.id;

        for chunk in channels.chunks(self.per_message()) {
            self.request(Method::Unsubscribe, Some(chunk)).await?;
        }

        let listed = self.list_subscriptions().await?;
        let lingering: Vec<String> =
            channels.iter().filter(|channel| listed.contains(channel.as_str())).cloned().collect();

        if !lingering.is_empty() {
            return Err(StreamError::ClientError {
                connection,
                reason: "unable to unsubscribe channels",
                channels: lingering,
            });
        }

        debug!(%connection, channels = channels.len(), remaining = listed.len(), "unsubscribed");
        let remaining = listed.len();
        self.state().channels = listed;
        Ok(remaining)
    }

    /// Stops the supervisor and closes the socket.
    pub(crate) async fn close(&self) {
        self.inner.shutdown.cancel();
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(connection = %self.inner.id, error = %e, "connection task failed");
            }
        }
    }

    /// Signals the supervisor to stop without waiting for it.
    pub(crate) fn cancel(&self) {
        self.inner.shutdown.cancel();
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn emit(&self, event: StreamEvent) {
        // No receivers is not an error.
        let _ = self.inner.shared.events.send(event);
    }

    fn per_message(&self) -> usize {
        self.inner.shared.config.max_subscribe_per_message.max(1)
    }

    async fn subscribe_locked(&self, channels: &[String]) -> Result<(), StreamError> {
        if channels.is_empty() {
            return Ok(());
        }

        let connection = self.inner.id;
        self.emit(StreamEvent::Subscribe { connection, channels: channels.to_vec() });

        for chunk in channels.chunks(self.per_message()) {
            self.request(Method::Subscribe, Some(chunk)).await?;
        }

        let listed = self.list_subscriptions().await?;
        let missing: Vec<String> =
            channels.iter().filter(|channel| !listed.contains(channel.as_str())).cloned().collect();

        if !missing.is_empty() {
            return Err(StreamError::ClientError {
                connection,
                reason: "unable to subscribe channels",
                channels: missing,
            });
        }

        debug!(%connection, channels = channels.len(), total = listed.len(), "subscribed");
        self.state().channels = listed;
        self.emit(StreamEvent::Subscribed { connection, channels: channels.to_vec() });
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<BTreeSet<String>, StreamError> {
        let result = self.request(Method::ListSubscriptions, None).await?;
        if result.is_null() {
            return Ok(BTreeSet::new());
        }
        serde_json::from_value(result).map_err(|e| StreamError::Protocol(e.to_string()))
    }

    async fn request(&self, method: Method, params: Option<&[String]>) -> Result<Value, StreamError> {
        let connection = self.inner.id;
        let id = self.inner.shared.request_ids.fetch_add(1, Ordering::Relaxed);
        let payload = protocol::encode_request(id, method, params)?;
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state();
            if !state.ready {
                return Err(StreamError::NotReady(connection));
            }
            let Some(outbound) = state.outbound.clone() else {
                return Err(StreamError::NotReady(connection));
            };
            state.pending.insert(id, tx);
            if outbound.send(payload).is_err() {
                state.pending.remove(&id);
                return Err(StreamError::Closed(connection));
            }
        }

        debug!(%connection, id, %method, "request sent");
        let outcome = tokio::time::timeout(self.inner.shared.config.request_timeout, rx).await;
        self.state().pending.remove(&id);

        match outcome {
            Err(_) => Err(StreamError::RequestTimeout { connection, method }),
            Ok(Err(_)) => Err(StreamError::Closed(connection)),
            Ok(Ok(response)) => response,
        }
    }

    /// Installs a writer task for a freshly connected socket.
    fn attach(&self, mut sink: FrameSink) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let mut state = self.state();
            state.outbound = Some(tx);
            state.ready = true;
            state.epoch += 1;
        }

        let connection = self.inner.id;
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(%connection, error = %e, "failed to write frame");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(%connection, error = %e, "error while closing socket");
            }
        })
    }

    /// Marks the connection as down and fails every outstanding request.
    fn detach(&self) {
        let pending = {
            let mut state = self.state();
            state.ready = false;
            state.outbound = None;
            std::mem::take(&mut state.pending)
        };

        for (_, responder) in pending {
            let _ = responder.send(Err(StreamError::Closed(self.inner.id)));
        }
    }

    async fn supervise(self, mut writer: JoinHandle<()>, mut stream: FrameStream) {
        let connection = self.inner.id;

        loop {
            let dropped = self.read(&mut stream).await;
            self.detach();
            if let Err(e) = writer.await {
                warn!(%connection, error = %e, "writer task failed");
            }

            if !dropped {
                break;
            }

            self.emit(StreamEvent::Disconnect { connection });
            warn!(%connection, "stream connection dropped");

            let Some((next_writer, next_stream)) = self.reconnect().await else {
                break;
            };
            writer = next_writer;
            stream = next_stream;
            let epoch = self.state().epoch;
            tokio::spawn(self.clone().restore(epoch));
        }

        self.emit(StreamEvent::Disconnected { connection });
        info!(%connection, "stream connection closed");
    }

    /// Reads frames until the socket drops (`true`) or shutdown (`false`).
    async fn read(&self, stream: &mut FrameStream) -> bool {
        let connection = self.inner.id;
        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => return false,
                frame = stream.next() => match frame {
                    Some(Ok(Inbound::Text(text))) => self.handle_text(&text),
                    Some(Ok(Inbound::Close { code, reason })) => {
                        debug!(%connection, ?code, %reason, "server closed the socket");
                        self.emit(StreamEvent::Close { connection, code, reason });
                        return true;
                    }
                    Some(Err(e)) => {
                        warn!(%connection, error = %e, "transport error");
                        return true;
                    }
                    None => return true,
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let connection = self.inner.id;
        let message = match protocol::parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(%connection, error = %e, "dropping undecodable frame");
                return;
            }
        };

        match message {
            ServerMessage::Stream { stream, data } => {
                let _ = self.inner.shared.data.send(StreamData { connection, stream, data });
            }
            ServerMessage::Response { id, result } => self.resolve(id, Ok(result), text),
            ServerMessage::Error { id: Some(id), code, msg } => {
                self.resolve(id, Err(StreamError::RequestFailed { code, msg }), text);
            }
            ServerMessage::Malformed { id } => {
                self.resolve(id, Err(StreamError::Protocol(format!("invalid response: {text}"))), text);
            }
            ServerMessage::Error { id: None, .. } | ServerMessage::Other(_) => {
                self.emit(StreamEvent::Message { connection, text: text.to_string() });
            }
        }
    }

    fn resolve(&self, id: u64, outcome: Result<Value, StreamError>, text: &str) {
        let responder = self.state().pending.remove(&id);
        match responder {
            Some(responder) => {
                let _ = responder.send(outcome);
            }
            None => self.emit(StreamEvent::Message { connection: self.inner.id, text: text.to_string() }),
        }
    }

    async fn reconnect(&self) -> Option<(JoinHandle<()>, FrameStream)> {
        let connection = self.inner.id;
        let config = Arc::clone(&self.inner.shared.config);
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            let delay = config.backoff_delay(attempt);
            self.emit(StreamEvent::Reconnect { connection, attempt });
            info!(%connection, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                () = self.inner.shutdown.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            match self.inner.shared.connector.connect(&config.endpoint).await {
                Ok((sink, stream)) => return Some((self.attach(sink), stream)),
                Err(e) => warn!(%connection, attempt, error = %e, "reconnect failed"),
            }
        }
    }

    /// Resubscribes the last known channel set after a reconnect, retrying
    /// with backoff until it succeeds. Gives up once the socket of `epoch`
    /// is gone, since the next reconnect starts its own restore.
    async fn restore(self, epoch: u64) {
        let connection = self.inner.id;
        let config = Arc::clone(&self.inner.shared.config);
        let mut attempt = 0u32;

        loop {
            let outcome = {
                let _control = self.inner.control.lock().await;
                if self.state().epoch != epoch {
                    return;
                }
                let channels: Vec<String> = self.state().channels.iter().cloned().collect();
                self.subscribe_locked(&channels).await.map(|()| channels.len())
            };

            let e = match outcome {
                Ok(channels) => {
                    info!(%connection, channels, "subscriptions restored");
                    self.emit(StreamEvent::Reconnected { connection });
                    return;
                }
                Err(e) => e,
            };

            {
                let state = self.state();
                if state.epoch != epoch || !state.ready {
                    debug!(%connection, error = %e, "socket dropped during restore");
                    return;
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = config.backoff_delay(attempt);
            warn!(%connection, attempt, delay_ms = delay.as_millis() as u64, error = %e, "failed to restore subscriptions");

            tokio::select! {
                () = self.inner.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
