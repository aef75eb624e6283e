//! Integration tests for the pub/sub channel against an in-process mock
//! WebSocket server.
//!
//! The mock accepts connections on a loopback port, answers the protocol
//! handshake (`ready` frame) and acknowledges control frames according to
//! a per-test behavior. Tests drive the public channel API and assert on
//! the frames the server recorded.

use futures_util::{SinkExt, StreamExt};
use lumen_link::{LumenLinkClient, LumenLinkError, LumenLinkTimeouts};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

use std::sync::Arc;

const WAIT_DEADLINE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How the mock answers `publish` frames.
#[derive(Clone, Copy)]
enum PublishMode {
    /// Acknowledge every publish with a fresh message id.
    Ack,
    /// Never acknowledge (ack-timeout tests).
    Silent,
    /// Acknowledge all except the named topic.
    SilentFor(&'static str),
    /// Withhold acks until `n` publishes arrived, then ack them in
    /// reverse order with `id-<topic>` message ids.
    ReverseBatch(usize),
}

struct ConnectionControl {
    outbox: mpsc::UnboundedSender<Message>,
    kill: mpsc::UnboundedSender<()>,
}

/// Scripted WebSocket pub/sub server on a loopback port.
struct MockServer {
    base_url: String,
    frames: Arc<Mutex<Vec<(usize, Value)>>>,
    conns: Arc<Mutex<Vec<ConnectionControl>>>,
}

impl MockServer {
    async fn start(publish_mode: PublishMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let frames: Arc<Mutex<Vec<(usize, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let conns: Arc<Mutex<Vec<ConnectionControl>>> = Arc::new(Mutex::new(Vec::new()));

        let frames_accept = frames.clone();
        let conns_accept = conns.clone();
        tokio::spawn(async move {
            let mut conn_idx = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                let idx = conn_idx;
                conn_idx += 1;
                tokio::spawn(handle_connection(
                    stream,
                    idx,
                    publish_mode,
                    frames_accept.clone(),
                    conns_accept.clone(),
                ));
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            frames,
            conns,
        }
    }

    async fn connection_count(&self) -> usize {
        self.conns.lock().await.len()
    }

    /// Frames of a given type, across all connections.
    async fn frames_of_type(&self, frame_type: &str) -> Vec<Value> {
        self.frames
            .lock()
            .await
            .iter()
            .filter(|(_, v)| v["type"] == frame_type)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Frames of a given type received on one specific connection.
    async fn frames_on(&self, conn: usize, frame_type: &str) -> Vec<Value> {
        self.frames
            .lock()
            .await
            .iter()
            .filter(|(idx, v)| *idx == conn && v["type"] == frame_type)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Push a server-initiated frame to the most recent connection.
    async fn push(&self, frame: Value) {
        let conns = self.conns.lock().await;
        let conn = conns.last().expect("no connection to push to");
        conn.outbox
            .send(Message::Text(frame.to_string().into()))
            .expect("push frame");
    }

    /// Force-close the most recent connection (simulated drop).
    async fn kill_latest(&self) {
        let conns = self.conns.lock().await;
        let conn = conns.last().expect("no connection to kill");
        let _ = conn.kill.send(());
    }

    async fn wait_for_connection_count(&self, n: usize) {
        let start = Instant::now();
        while self.connection_count().await < n {
            assert!(
                start.elapsed() < WAIT_DEADLINE,
                "timed out waiting for {} connections",
                n
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_frame_count(&self, frame_type: &str, n: usize) {
        let start = Instant::now();
        while self.frames_of_type(frame_type).await.len() < n {
            assert!(
                start.elapsed() < WAIT_DEADLINE,
                "timed out waiting for {} {} frames",
                n,
                frame_type
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    idx: usize,
    publish_mode: PublishMode,
    frames: Arc<Mutex<Vec<(usize, Value)>>>,
    conns: Arc<Mutex<Vec<ConnectionControl>>>,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
    conns.lock().await.push(ConnectionControl {
        outbox: outbox_tx,
        kill: kill_tx,
    });

    let ready = json!({"type": "ready", "clientId": format!("c{}", idx)});
    if ws
        .send(Message::Text(ready.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut msg_counter = 0usize;
    let mut publish_buffer: Vec<(String, String)> = Vec::new();

    loop {
        tokio::select! {
            _ = kill_rx.recv() => {
                let _ = ws.close(None).await;
                return;
            }
            out = outbox_rx.recv() => {
                if let Some(out) = out {
                    if ws.send(out).await.is_err() {
                        return;
                    }
                }
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let value: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        frames.lock().await.push((idx, value.clone()));

                        let rid = value["requestId"].as_str().unwrap_or_default().to_string();
                        match value["type"].as_str() {
                            Some("publish") => {
                                let topic =
                                    value["topic"].as_str().unwrap_or_default().to_string();
                                let ack = |rid: String, topic: String, id: String| {
                                    json!({
                                        "type": "published",
                                        "requestId": rid,
                                        "id": id,
                                        "topic": topic,
                                        "created": "2024-01-01T00:00:01Z"
                                    })
                                };
                                match publish_mode {
                                    PublishMode::Ack => {
                                        msg_counter += 1;
                                        let frame =
                                            ack(rid, topic, format!("msg{}", msg_counter));
                                        if ws
                                            .send(Message::Text(frame.to_string().into()))
                                            .await
                                            .is_err()
                                        {
                                            return;
                                        }
                                    }
                                    PublishMode::Silent => {}
                                    PublishMode::SilentFor(silent_topic) => {
                                        if topic != silent_topic {
                                            msg_counter += 1;
                                            let frame =
                                                ack(rid, topic, format!("msg{}", msg_counter));
                                            if ws
                                                .send(Message::Text(frame.to_string().into()))
                                                .await
                                                .is_err()
                                            {
                                                return;
                                            }
                                        }
                                    }
                                    PublishMode::ReverseBatch(n) => {
                                        publish_buffer.push((rid, topic));
                                        if publish_buffer.len() == n {
                                            for (rid, topic) in
                                                publish_buffer.drain(..).rev().collect::<Vec<_>>()
                                            {
                                                let frame = ack(
                                                    rid,
                                                    topic.clone(),
                                                    format!("id-{}", topic),
                                                );
                                                if ws
                                                    .send(Message::Text(
                                                        frame.to_string().into(),
                                                    ))
                                                    .await
                                                    .is_err()
                                                {
                                                    return;
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                            Some("subscribe") => {
                                let frame = json!({"type": "subscribed", "requestId": rid});
                                if ws
                                    .send(Message::Text(frame.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Some("unsubscribe") => {
                                let frame = json!({"type": "unsubscribed", "requestId": rid});
                                if ws
                                    .send(Message::Text(frame.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Some("ping") => {
                                let frame = json!({"type": "pong", "requestId": rid});
                                if ws
                                    .send(Message::Text(frame.to_string().into()))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return,
                }
            }
        }
    }
}

fn client_for(server: &MockServer) -> LumenLinkClient {
    LumenLinkClient::builder()
        .base_url(server.base_url.clone())
        .timeouts(LumenLinkTimeouts::fast())
        .build()
        .expect("build client")
}

// =============================================================================
// Publish / acknowledgement correlation
// =============================================================================

#[tokio::test]
async fn test_publish_returns_the_server_ack() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let ack = client
        .pubsub()
        .publish("chat/general", json!({"text": "hi"}))
        .await
        .expect("publish should be acknowledged");

    assert_eq!(ack.id, "msg1");
    assert_eq!(ack.topic, "chat/general");
    assert_eq!(ack.created, "2024-01-01T00:00:01Z");
    assert!(client.pubsub().is_connected());
}

#[tokio::test]
async fn test_publish_times_out_when_the_server_never_acks() {
    let server = MockServer::start(PublishMode::Silent).await;
    let client = LumenLinkClient::builder()
        .base_url(server.base_url.clone())
        .timeouts(
            LumenLinkTimeouts::builder()
                .connection_timeout(Duration::from_secs(2))
                .ack_timeout(Duration::from_millis(300))
                .keepalive_interval(Duration::ZERO)
                .build(),
        )
        .build()
        .unwrap();

    let start = Instant::now();
    let err = client
        .pubsub()
        .publish("x", json!({}))
        .await
        .expect_err("publish must time out");

    assert!(matches!(err, LumenLinkError::TimeoutError(_)), "{:?}", err);
    assert!(
        start.elapsed() >= Duration::from_millis(300),
        "failed before the configured ack timeout"
    );
    // The connection itself survives an ack timeout.
    assert!(client.pubsub().is_connected());
}

#[tokio::test]
async fn test_concurrent_publishes_resolve_by_request_id() {
    // The server withholds both acks, then answers in reverse order: each
    // caller must still get the ack matching its own request id.
    let server = MockServer::start(PublishMode::ReverseBatch(2)).await;
    let client = client_for(&server);

    let pubsub_a = client.clone();
    let a = tokio::spawn(async move {
        pubsub_a.pubsub().publish("alpha", json!({"n": 1})).await
    });
    let pubsub_b = client.clone();
    let b = tokio::spawn(async move {
        pubsub_b.pubsub().publish("beta", json!({"n": 2})).await
    });

    let ack_a = a.await.unwrap().expect("alpha publish acked");
    let ack_b = b.await.unwrap().expect("beta publish acked");

    assert_eq!(ack_a.id, "id-alpha");
    assert_eq!(ack_a.topic, "alpha");
    assert_eq!(ack_b.id, "id-beta");
    assert_eq!(ack_b.topic, "beta");
}

#[tokio::test]
async fn test_slow_ack_does_not_block_a_concurrent_publish() {
    let server = MockServer::start(PublishMode::SilentFor("slow")).await;
    let client = LumenLinkClient::builder()
        .base_url(server.base_url.clone())
        .timeouts(
            LumenLinkTimeouts::builder()
                .connection_timeout(Duration::from_secs(2))
                .ack_timeout(Duration::from_millis(500))
                .keepalive_interval(Duration::ZERO)
                .build(),
        )
        .build()
        .unwrap();

    let slow_client = client.clone();
    let slow = tokio::spawn(async move {
        slow_client.pubsub().publish("slow", json!({})).await
    });

    // The fast publish resolves while the slow one is still pending.
    let start = Instant::now();
    let fast = client.pubsub().publish("fast", json!({})).await;
    assert!(fast.is_ok());
    assert!(
        start.elapsed() < Duration::from_millis(400),
        "fast publish was held up by the pending slow one"
    );

    let err = slow.await.unwrap().expect_err("slow publish must time out");
    assert!(matches!(err, LumenLinkError::TimeoutError(_)));
}

// =============================================================================
// Subscription bookkeeping
// =============================================================================

#[tokio::test]
async fn test_n_listeners_trigger_exactly_one_subscribe_frame() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let _a = client.pubsub().subscribe("t", |_| {}).await.unwrap();
    let _b = client.pubsub().subscribe("t", |_| {}).await.unwrap();
    let _c = client.pubsub().subscribe("t", |_| {}).await.unwrap();

    // Give any (erroneous) extra frames a moment to arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let subscribes = server.frames_of_type("subscribe").await;
    assert_eq!(
        subscribes.len(),
        1,
        "N local listeners must multiplex over one server-side subscription"
    );
    assert_eq!(subscribes[0]["topic"], "t");
}

#[tokio::test]
async fn test_messages_fan_out_and_a_panicking_listener_is_isolated() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _bad = client
        .pubsub()
        .subscribe("orders/*", |_| panic!("listener exploded"))
        .await
        .unwrap();
    let _good = client
        .pubsub()
        .subscribe("orders/*", move |msg| {
            let _ = tx.send(msg);
        })
        .await
        .unwrap();

    server
        .push(json!({
            "type": "message",
            "id": "m1",
            "topic": "orders/*",
            "created": "2024-01-01T00:00:00Z",
            "data": {"action": "create"}
        }))
        .await;

    let msg = tokio::time::timeout(WAIT_DEADLINE, rx.recv())
        .await
        .expect("second listener must still receive the message")
        .unwrap();
    assert_eq!(msg.id, "m1");
    assert_eq!(msg.topic, "orders/*");
    assert_eq!(msg.data["action"], "create");
}

#[tokio::test]
async fn test_unsubscribing_one_listener_leaves_the_other_active() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let (tx_a, mut rx_a) = mpsc::unbounded_channel::<String>();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel::<String>();

    let mut a = client
        .pubsub()
        .subscribe("t", move |msg| {
            let _ = tx_a.send(msg.id);
        })
        .await
        .unwrap();
    let _b = client
        .pubsub()
        .subscribe("t", move |msg| {
            let _ = tx_b.send(msg.id);
        })
        .await
        .unwrap();

    a.unsubscribe().await.unwrap();
    assert!(a.is_closed());

    server
        .push(json!({
            "type": "message",
            "id": "m-after",
            "topic": "t",
            "created": "2024-01-01T00:00:00Z",
            "data": null
        }))
        .await;

    let got = tokio::time::timeout(WAIT_DEADLINE, rx_b.recv())
        .await
        .expect("remaining listener receives the message")
        .unwrap();
    assert_eq!(got, "m-after");
    assert!(
        rx_a.try_recv().is_err(),
        "removed listener must not be invoked"
    );
    // Topic still has a listener, so the channel stays connected.
    assert!(client.pubsub().is_connected());
}

#[tokio::test]
async fn test_removing_the_last_listener_disconnects() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let mut sub = client.pubsub().subscribe("t", |_| {}).await.unwrap();
    assert!(client.pubsub().is_connected());

    sub.unsubscribe().await.unwrap();
    assert!(
        !client.pubsub().is_connected(),
        "last listener removal must tear the connection down"
    );

    // The scoped unsubscribe frame went out before the close.
    server.wait_for_frame_count("unsubscribe", 1).await;
    let unsubscribes = server.frames_of_type("unsubscribe").await;
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(unsubscribes[0]["topic"], "t");
}

#[tokio::test]
async fn test_unsubscribe_all_sends_a_global_frame_and_disconnects() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let _a = client.pubsub().subscribe("t1", |_| {}).await.unwrap();
    let _b = client.pubsub().subscribe("t2", |_| {}).await.unwrap();
    assert!(client.pubsub().is_connected());

    client.pubsub().unsubscribe_all().await.unwrap();
    assert!(!client.pubsub().is_connected());

    server.wait_for_frame_count("unsubscribe", 1).await;
    let global: Vec<Value> = server
        .frames_of_type("unsubscribe")
        .await
        .into_iter()
        .filter(|f| f.get("topic").is_none())
        .collect();
    assert_eq!(global.len(), 1, "exactly one global unsubscribe frame");
}

// =============================================================================
// Reconnection
// =============================================================================

#[tokio::test]
async fn test_reconnect_replays_exactly_the_registered_topics() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let _t1 = client.pubsub().subscribe("t1", |_| {}).await.unwrap();
    let _t2 = client.pubsub().subscribe("t2", |_| {}).await.unwrap();
    server.wait_for_connection_count(1).await;

    server.kill_latest().await;
    server.wait_for_connection_count(2).await;
    server.wait_for_frame_count("subscribe", 4).await;

    let replayed = server.frames_on(1, "subscribe").await;
    let mut topics: Vec<&str> = replayed
        .iter()
        .filter_map(|f| f["topic"].as_str())
        .collect();
    topics.sort_unstable();
    assert_eq!(
        topics,
        vec!["t1", "t2"],
        "replay must cover exactly the registered topics"
    );

    // Ready transition resets the attempt counter.
    let start = Instant::now();
    while !(client.pubsub().is_connected() && client.pubsub().reconnect_attempts() == 0) {
        assert!(start.elapsed() < WAIT_DEADLINE, "channel did not settle");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[tokio::test]
async fn test_no_reconnect_after_the_last_listener_is_gone() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    let mut sub = client.pubsub().subscribe("t", |_| {}).await.unwrap();
    server.wait_for_connection_count(1).await;

    server.kill_latest().await;
    // Remove the listener before the first backoff rung elapses.
    sub.unsubscribe().await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(
        server.connection_count().await,
        1,
        "a channel with no listeners must not keep reconnecting"
    );
    assert!(!client.pubsub().is_connected());
}

// =============================================================================
// Disconnect semantics
// =============================================================================

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    client
        .pubsub()
        .publish("warmup", json!({}))
        .await
        .expect("warmup publish");
    assert!(client.pubsub().is_connected());

    client.pubsub().disconnect().await;
    assert!(!client.pubsub().is_connected());
    client.pubsub().disconnect().await;
    assert!(!client.pubsub().is_connected());
}

#[tokio::test]
async fn test_publish_after_manual_disconnect_reconnects() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    client.pubsub().publish("a", json!({})).await.unwrap();
    client.pubsub().disconnect().await;
    assert!(!client.pubsub().is_connected());

    // A new publish clears the manual-close flag and reconnects.
    let ack = client.pubsub().publish("b", json!({})).await.unwrap();
    assert_eq!(ack.topic, "b");
    assert!(client.pubsub().is_connected());
    assert_eq!(server.connection_count().await, 2);
}

#[tokio::test]
async fn test_ping_round_trips_through_the_ack_registry() {
    let server = MockServer::start(PublishMode::Ack).await;
    let client = client_for(&server);

    client.pubsub().publish("warmup", json!({})).await.unwrap();
    client.pubsub().ping().await.expect("ping should be ponged");

    let pings = server.frames_of_type("ping").await;
    assert_eq!(pings.len(), 1);
}
