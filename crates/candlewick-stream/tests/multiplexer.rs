//! Multiplexer behaviour against an in-memory combined-stream server.

use async_trait::async_trait;
use candlewick_stream::{
    ConnectionId, Connector, FrameSink, FrameStream, Inbound, Method, MultiplexerConfig, StreamData, StreamError,
    StreamEvent, StreamMultiplexer,
};
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

type Subscriptions = Arc<Mutex<BTreeSet<String>>>;

struct Socket {
    subscriptions: Subscriptions,
    push: Option<fmpsc::UnboundedSender<Result<Inbound, StreamError>>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Fake server. Channels prefixed `reject` get an error response, `silent`
/// gets no response, `ignored` is acknowledged but never listed. The next
/// `outages` SUBSCRIBE requests fail whatever their channels.
#[derive(Clone, Default)]
struct FakeServer {
    sockets: Arc<Mutex<Vec<Socket>>>,
    outages: Arc<AtomicUsize>,
}

impl FakeServer {
    fn fail_next_subscribes(&self, count: usize) {
        self.outages.store(count, Ordering::SeqCst);
    }

    fn connects(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    fn subscriptions(&self, socket: usize) -> BTreeSet<String> {
        self.sockets.lock().unwrap()[socket].subscriptions.lock().unwrap().clone()
    }

    fn push(&self, socket: usize, stream: &str, data: Value) {
        let frame = json!({ "stream": stream, "data": data }).to_string();
        let sockets = self.sockets.lock().unwrap();
        sockets[socket].push.as_ref().unwrap().unbounded_send(Ok(Inbound::Text(frame))).unwrap();
    }

    fn kill(&self, socket: usize) {
        let mut sockets = self.sockets.lock().unwrap();
        sockets[socket].push = None;
        if let Some(kill) = sockets[socket].kill.take() {
            let _ = kill.send(());
        }
    }
}

fn answer(request: &str, subscriptions: &Subscriptions, outages: &AtomicUsize) -> Option<String> {
    let request: Value = serde_json::from_str(request).unwrap();
    let id = request["id"].as_u64().unwrap();
    let params: Vec<String> =
        request.get("params").map(|p| serde_json::from_value(p.clone()).unwrap()).unwrap_or_default();

    let response = match request["method"].as_str().unwrap() {
        "SUBSCRIBE" => {
            let outage = outages.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
            if outage {
                json!({ "error": { "code": -1003, "msg": "Too many requests" }, "id": id })
            } else if params.iter().any(|c| c.starts_with("reject")) {
                json!({ "error": { "code": 2, "msg": "Invalid request" }, "id": id })
            } else if params.iter().any(|c| c.starts_with("silent")) {
                return None;
            } else {
                let mut subscribed = subscriptions.lock().unwrap();
                subscribed.extend(params.into_iter().filter(|c| !c.starts_with("ignored")));
                json!({ "result": null, "id": id })
            }
        }
        "UNSUBSCRIBE" => {
            let mut subscribed = subscriptions.lock().unwrap();
            for channel in &params {
                subscribed.remove(channel);
            }
            json!({ "result": null, "id": id })
        }
        "LIST_SUBSCRIPTIONS" => {
            let subscribed: Vec<String> = subscriptions.lock().unwrap().iter().cloned().collect();
            json!({ "result": subscribed, "id": id })
        }
        other => panic!("unexpected method {other}"),
    };

    Some(response.to_string())
}

#[async_trait]
impl Connector for FakeServer {
    async fn connect(&self, _endpoint: &str) -> Result<(FrameSink, FrameStream), StreamError> {
        let (client_tx, mut server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Result<Inbound, StreamError>>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let subscriptions = Subscriptions::default();
        let outages = Arc::clone(&self.outages);

        self.sockets.lock().unwrap().push(Socket {
            subscriptions: Arc::clone(&subscriptions),
            push: Some(server_tx.clone()),
            kill: Some(kill_tx),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    request = server_rx.next() => {
                        let Some(request) = request else { break };
                        if let Some(reply) = answer(&request, &subscriptions, &outages) {
                            if server_tx.unbounded_send(Ok(Inbound::Text(reply))).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        let sink = client_tx.sink_map_err(|e| StreamError::Transport(e.to_string()));
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }
}

fn channels(names: &[&str]) -> Vec<String> {
    names.iter().map(ToString::to_string).collect()
}

fn multiplexer(cap: usize) -> (StreamMultiplexer, FakeServer, UnboundedReceiver<StreamData>) {
    let server = FakeServer::default();
    let config = MultiplexerConfig::new("wss://fake.test/stream").with_max_channels(cap);
    let (mux, data) = StreamMultiplexer::new(config, server.clone());
    (mux, server, data)
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(ToString::to_string).collect()
}

fn sizes(mux: &StreamMultiplexer) -> Vec<usize> {
    mux.connection_channels().values().map(BTreeSet::len).collect()
}

#[tokio::test]
async fn test_subscribe_splits_across_connections() {
    let (mux, server, _data) = multiplexer(2);

    mux.subscribe(channels(&["a", "b", "c", "d", "e"])).await.unwrap();

    assert_eq!(mux.connection_count(), 3);
    assert_eq!(sizes(&mux), [2, 2, 1]);
    assert_eq!(server.connects(), 3);
    assert_eq!(mux.channels().len(), 5);

    let first = mux.connection_channels().into_iter().next().unwrap();
    assert_eq!(first.0, ConnectionId(1));
    assert_eq!(first.1, set(&["a", "b"]));
}

#[tokio::test]
async fn test_subscribe_fills_spare_capacity_first() {
    let (mux, server, _data) = multiplexer(2);

    mux.subscribe(["a"]).await.unwrap();
    mux.subscribe(["b", "c"]).await.unwrap();
    assert_eq!(sizes(&mux), [2, 1]);
    assert_eq!(server.subscriptions(0), set(&["a", "b"]));

    // Already carried channels and duplicates are ignored.
    mux.subscribe(["a", "c", "d", "d"]).await.unwrap();
    assert_eq!(sizes(&mux), [2, 2]);
    assert_eq!(server.connects(), 2);
}

#[tokio::test]
async fn test_unsubscribe_closes_empty_connections() {
    let (mux, server, _data) = multiplexer(2);
    let mut events = mux.events();

    mux.subscribe(channels(&["a", "b", "c", "d", "e"])).await.unwrap();
    mux.unsubscribe(["a", "e"]).await.unwrap();

    assert_eq!(mux.connection_count(), 2);
    assert_eq!(sizes(&mux), [1, 2]);
    assert!(server.subscriptions(0).contains("b"));
    assert!(server.subscriptions(2).is_empty());

    mux.unsubscribe(["b", "c", "d"]).await.unwrap();
    assert_eq!(mux.connection_count(), 0);
    assert!(mux.channels().is_empty());

    let mut disconnected = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StreamEvent::Disconnected { .. }) {
            disconnected += 1;
        }
    }
    assert_eq!(disconnected, 3);
}

#[tokio::test]
async fn test_stream_data_is_forwarded() {
    let (mux, server, mut data) = multiplexer(10);
    mux.subscribe(["btcusdt@kline_1m"]).await.unwrap();

    server.push(0, "btcusdt@kline_1m", json!({ "e": "kline" }));

    let received = data.recv().await.unwrap();
    assert_eq!(received.connection, ConnectionId(1));
    assert_eq!(received.stream, "btcusdt@kline_1m");
    assert_eq!(received.data, json!({ "e": "kline" }));
}

#[tokio::test]
async fn test_error_response_fails_request() {
    let (mux, _server, _data) = multiplexer(10);

    let err = mux.subscribe(["reject-me"]).await.unwrap_err();
    assert_eq!(err, StreamError::RequestFailed { code: 2, msg: "Invalid request".into() });
    assert_eq!(mux.connection_count(), 0);
}

#[tokio::test]
async fn test_unconfirmed_subscription_is_client_error() {
    let (mux, _server, _data) = multiplexer(10);

    let err = mux.subscribe(["ok", "ignored-channel"]).await.unwrap_err();
    match err {
        StreamError::ClientError { channels, .. } => assert_eq!(channels, ["ignored-channel"]),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout() {
    let (mux, _server, _data) = multiplexer(10);

    let err = mux.subscribe(["silent"]).await.unwrap_err();
    assert!(matches!(err, StreamError::RequestTimeout { method: Method::Subscribe, .. }));
    assert!(err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_subscriptions() {
    let (mux, server, mut data) = multiplexer(10);
    let mut events = mux.events();

    mux.subscribe(["a", "b"]).await.unwrap();
    server.kill(0);

    let reconnected = tokio::time::timeout(Duration::from_secs(120), async {
        let mut saw_disconnect = false;
        loop {
            match events.recv().await.unwrap() {
                StreamEvent::Disconnect { .. } => saw_disconnect = true,
                StreamEvent::Reconnected { connection } => return (connection, saw_disconnect),
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(reconnected, (ConnectionId(1), true));
    assert_eq!(server.connects(), 2);
    assert_eq!(server.subscriptions(1), set(&["a", "b"]));
    assert_eq!(mux.connection_count(), 1);

    server.push(1, "a", json!(1));
    assert_eq!(data.recv().await.unwrap().stream, "a");

    mux.close().await;
    assert_eq!(mux.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_restore_is_retried() {
    let (mux, server, mut data) = multiplexer(10);
    let mut events = mux.events();

    mux.subscribe(["a", "b"]).await.unwrap();
    server.fail_next_subscribes(2);
    server.kill(0);

    let subscribe_attempts = tokio::time::timeout(Duration::from_secs(300), async {
        let mut attempts = 0;
        loop {
            match events.recv().await.unwrap() {
                StreamEvent::Subscribe { .. } => attempts += 1,
                StreamEvent::Reconnected { .. } => return attempts,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    // the initial subscribe, two rejected restores, then the one that stuck
    assert_eq!(subscribe_attempts, 4);
    assert_eq!(server.connects(), 2);
    assert_eq!(server.subscriptions(1), set(&["a", "b"]));
    assert_eq!(mux.channels(), set(&["a", "b"]));

    server.push(1, "b", json!(2));
    assert_eq!(data.recv().await.unwrap().stream, "b");

    mux.close().await;
}
