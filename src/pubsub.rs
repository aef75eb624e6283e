//! WebSocket publish/subscribe channel.
//!
//! Maintains a single multiplexed WebSocket connection to the server's
//! `/api/pubsub` endpoint. Handles:
//!
//! - Request/acknowledgement correlation over the duplex transport
//!   (publish, subscribe, unsubscribe, ping each carry a `requestId`)
//! - Fan-out of delivered `message` frames to per-topic listener sets
//! - Single-flight connection establishment shared by concurrent callers
//! - Automatic reconnection with a capped delay ladder and full
//!   re-subscription replay after a successful reconnect
//! - Keepalive pings with a pong deadline while the socket is idle
//!
//! All mutable channel state is owned by one background task; public calls
//! send commands over an mpsc channel and await oneshot replies.

use crate::{
    ack::AckRegistry,
    auth::AuthStore,
    backoff::{Backoff, PUBSUB_LADDER},
    error::{LumenLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    models::{ClientFrame, PubSubMessage, PublishAck, ServerFrame},
    timeouts::LumenLinkTimeouts,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked for every message delivered on a subscribed topic.
pub type MessageListener = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

/// Command channel capacity between the public handle and the task.
const CMD_CHANNEL_CAPACITY: usize = 256;

/// Sleep bound that effectively means "never" for disabled deadlines.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the public API to the background channel task.
enum PubSubCmd {
    /// Publish a payload and wait for the `published` acknowledgement.
    Publish {
        topic: String,
        data: JsonValue,
        reply: oneshot::Sender<Result<ServerFrame>>,
    },
    /// Register a listener; the reply carries its id once the initial
    /// `subscribe` handshake (if any) has settled.
    Subscribe {
        topic: String,
        listener: MessageListener,
        reply: oneshot::Sender<u64>,
    },
    /// Remove one listener by id (handle unsubscribe / Drop).
    RemoveListener {
        topic: String,
        listener_id: u64,
        reply: Option<oneshot::Sender<()>>,
    },
    /// Drop one topic (`Some`) or every topic (`None`).
    Unsubscribe {
        topic: Option<String>,
        reply: oneshot::Sender<()>,
    },
    /// Liveness probe answered by the server's `pong` frame.
    Ping {
        reply: oneshot::Sender<Result<ServerFrame>>,
    },
    /// Manual disconnect; suppresses auto-reconnect until the next
    /// publish/subscribe call.
    Disconnect { reply: oneshot::Sender<()> },
    /// Posted by an ack timer when its wait elapsed.
    AckTimeout { request_id: String },
}

/// Work deferred until a connection attempt settles.
enum Deferred {
    Publish {
        topic: String,
        data: JsonValue,
        reply: oneshot::Sender<Result<ServerFrame>>,
    },
    Subscribe {
        topic: String,
        listener_id: u64,
        reply: oneshot::Sender<u64>,
    },
}

// ── Public handle ───────────────────────────────────────────────────────────

/// WebSocket publish/subscribe channel.
///
/// One instance manages one (lazily established) connection; all state is
/// private to the instance. Cheap to share behind the client.
///
/// # Examples
///
/// ```rust,no_run
/// use lumen_link::LumenLinkClient;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = LumenLinkClient::builder()
///     .base_url("http://localhost:8090")
///     .build()?;
///
/// let pubsub = client.pubsub();
/// let mut sub = pubsub
///     .subscribe("chat/general", |msg| println!("got: {}", msg.data))
///     .await?;
///
/// let ack = pubsub.publish("chat/general", json!({"text": "hi"})).await?;
/// println!("published as {}", ack.id);
///
/// sub.unsubscribe().await?;
/// # Ok(())
/// # }
/// ```
pub struct PubSubChannel {
    base_url: String,
    auth: AuthStore,
    timeouts: LumenLinkTimeouts,
    handlers: EventHandlers,
    core: OnceCell<ChannelCore>,
}

struct ChannelCore {
    cmd_tx: mpsc::Sender<PubSubCmd>,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
}

impl PubSubChannel {
    pub(crate) fn new(
        base_url: String,
        auth: AuthStore,
        timeouts: LumenLinkTimeouts,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            base_url,
            auth,
            timeouts,
            handlers,
            core: OnceCell::new(),
        }
    }

    /// Spawn the background task on first use.
    async fn core(&self) -> &ChannelCore {
        self.core
            .get_or_init(|| async {
                let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
                let connected = Arc::new(AtomicBool::new(false));
                let reconnect_attempts = Arc::new(AtomicU32::new(0));

                tokio::spawn(channel_task(
                    cmd_rx,
                    cmd_tx.clone(),
                    self.base_url.clone(),
                    self.auth.clone(),
                    self.timeouts.clone(),
                    self.handlers.clone(),
                    connected.clone(),
                    reconnect_attempts.clone(),
                ));

                ChannelCore {
                    cmd_tx,
                    connected,
                    reconnect_attempts,
                }
            })
            .await
    }

    /// Publish `data` to `topic` and wait for the server acknowledgement.
    ///
    /// Establishes the connection if necessary (concurrent callers share one
    /// in-flight attempt). Fails on: empty topic, connection failure, ack
    /// timeout, or a server-reported error frame. All four are retryable at
    /// the caller's discretion.
    pub async fn publish(&self, topic: &str, data: impl Serialize) -> Result<PublishAck> {
        if topic.is_empty() {
            return Err(LumenLinkError::ValidationError(
                "topic must not be empty".to_string(),
            ));
        }
        let data = serde_json::to_value(data)?;

        let core = self.core().await;
        let (reply, rx) = oneshot::channel();
        core.cmd_tx
            .send(PubSubCmd::Publish {
                topic: topic.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| LumenLinkError::ConnectionClosed)?;

        let frame = rx.await.map_err(|_| LumenLinkError::ConnectionClosed)??;
        match frame {
            ServerFrame::Published {
                id, topic, created, ..
            } => Ok(PublishAck { id, topic, created }),
            other => Err(LumenLinkError::InternalError(format!(
                "publish resolved with unexpected frame: {:?}",
                other
            ))),
        }
    }

    /// Register `listener` for messages on `topic`.
    ///
    /// The listener is registered locally before any network traffic, so no
    /// inbound message can race past it. The first listener for a topic
    /// sends one `subscribe` control frame and waits for its ack (failures
    /// of that wait are swallowed; the registration stands and reconnect
    /// replay re-announces it). Additional listeners multiplex over the
    /// existing server-side subscription without further frames.
    pub async fn subscribe(
        &self,
        topic: &str,
        listener: impl Fn(PubSubMessage) + Send + Sync + 'static,
    ) -> Result<PubSubSubscription> {
        if topic.is_empty() {
            return Err(LumenLinkError::ValidationError(
                "topic must not be empty".to_string(),
            ));
        }

        let core = self.core().await;
        let (reply, rx) = oneshot::channel();
        core.cmd_tx
            .send(PubSubCmd::Subscribe {
                topic: topic.to_string(),
                listener: Arc::new(listener),
                reply,
            })
            .await
            .map_err(|_| LumenLinkError::ConnectionClosed)?;

        let listener_id = rx.await.map_err(|_| LumenLinkError::ConnectionClosed)?;
        Ok(PubSubSubscription {
            topic: topic.to_string(),
            listener_id,
            cmd_tx: core.cmd_tx.clone(),
            closed: false,
        })
    }

    /// Drop every listener for `topic` and send a scoped `unsubscribe`
    /// frame (best-effort). Disconnects when no topics remain.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(LumenLinkError::ValidationError(
                "topic must not be empty".to_string(),
            ));
        }
        self.send_unsubscribe(Some(topic.to_string())).await
    }

    /// Drop every topic, send a global `unsubscribe` frame (best-effort)
    /// and disconnect.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.send_unsubscribe(None).await
    }

    async fn send_unsubscribe(&self, topic: Option<String>) -> Result<()> {
        let core = self.core().await;
        let (reply, rx) = oneshot::channel();
        core.cmd_tx
            .send(PubSubCmd::Unsubscribe { topic, reply })
            .await
            .map_err(|_| LumenLinkError::ConnectionClosed)?;
        rx.await.map_err(|_| LumenLinkError::ConnectionClosed)
    }

    /// Round-trip a `ping` frame through the ack registry.
    ///
    /// Fails immediately when the channel is not connected.
    pub async fn ping(&self) -> Result<()> {
        let core = self.core().await;
        let (reply, rx) = oneshot::channel();
        core.cmd_tx
            .send(PubSubCmd::Ping { reply })
            .await
            .map_err(|_| LumenLinkError::ConnectionClosed)?;
        rx.await.map_err(|_| LumenLinkError::ConnectionClosed)?.map(|_| ())
    }

    /// Manually close the connection.
    ///
    /// Rejects every pending acknowledgement and connect waiter, cancels any
    /// scheduled reconnect and suppresses auto-reconnect until the next
    /// `publish`/`subscribe` call. Idempotent; listeners stay registered.
    pub async fn disconnect(&self) {
        let Some(core) = self.core.get() else {
            return; // never used, nothing to tear down
        };
        let (reply, rx) = oneshot::channel();
        if core.cmd_tx.send(PubSubCmd::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the WebSocket is currently open and ready.
    pub fn is_connected(&self) -> bool {
        self.core
            .get()
            .map(|core| core.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Consecutive failed connection attempts; resets to 0 on every
    /// successful ready transition.
    pub fn reconnect_attempts(&self) -> u32 {
        self.core
            .get()
            .map(|core| core.reconnect_attempts.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Handle for one registered pub/sub listener.
///
/// `unsubscribe()` removes exactly this listener; dropping the handle does
/// the same on a best-effort basis.
#[derive(Debug)]
pub struct PubSubSubscription {
    topic: String,
    listener_id: u64,
    cmd_tx: mpsc::Sender<PubSubCmd>,
    closed: bool,
}

impl PubSubSubscription {
    /// Topic this listener is registered on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove this listener. If it was the last one for the topic, a
    /// best-effort `unsubscribe` frame is sent; if it was the last across
    /// all topics, the channel disconnects.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(PubSubCmd::RemoveListener {
                topic: self.topic.clone(),
                listener_id: self.listener_id,
                reply: Some(reply),
            })
            .await
            .map_err(|_| LumenLinkError::ConnectionClosed)?;
        rx.await.map_err(|_| LumenLinkError::ConnectionClosed)
    }

    /// Returns `true` once `unsubscribe()` has run (or `Drop` consumed it).
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for PubSubSubscription {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cmd_tx.try_send(PubSubCmd::RemoveListener {
                topic: self.topic.clone(),
                listener_id: self.listener_id,
                reply: None,
            });
        }
    }
}

// ── Wire helpers ────────────────────────────────────────────────────────────

/// Compose the WebSocket endpoint URL from the configured base URL.
///
/// The auth token rides as a query parameter: custom headers are not
/// universally available to WebSocket clients, so the server accepts
/// `?token=` on this endpoint.
fn pubsub_url(base_url: &str, auth: &AuthStore) -> Result<String> {
    let mut url = reqwest::Url::parse(base_url.trim()).map_err(|e| {
        LumenLinkError::ConfigurationError(format!("invalid base_url '{}': {}", base_url, e))
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(LumenLinkError::ConfigurationError(format!(
                "unsupported base_url scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        LumenLinkError::ConfigurationError(format!("cannot derive ws URL from '{}'", base_url))
    })?;

    let path = format!("{}/api/pubsub", url.path().trim_end_matches('/'));
    url.set_path(&path);

    if auth.is_valid() {
        if let Some(token) = auth.token() {
            url.query_pairs_mut().append_pair("token", &token);
        }
    }

    Ok(url.to_string())
}

/// Serialize and send one control frame.
async fn send_frame(
    ws: &mut WsStream,
    frame: &ClientFrame,
    handlers: &EventHandlers,
) -> Result<()> {
    let payload = serde_json::to_string(frame)?;
    handlers.emit_send(&payload);
    ws.send(Message::Text(payload.into()))
        .await
        .map_err(|e| LumenLinkError::WebSocketError(format!("failed to send frame: {}", e)))
}

/// Establish the WebSocket and wait for the server's `ready` frame.
///
/// The connection timeout covers both the transport handshake and the wait
/// for `ready`; either failing surfaces the same way to every pending
/// connect waiter.
async fn establish(
    base_url: &str,
    auth: &AuthStore,
    timeouts: &LumenLinkTimeouts,
) -> Result<(WsStream, String)> {
    let url = pubsub_url(base_url, auth)?;
    log::debug!("[lumen-link] connecting pub/sub socket to {}", url);
    let request = url.into_client_request().map_err(|e| {
        LumenLinkError::WebSocketError(format!("failed to build WebSocket request: {}", e))
    })?;

    let attempt = async {
        let (mut ws, _response) = connect_async(request)
            .await
            .map_err(|e| LumenLinkError::WebSocketError(format!("connection failed: {}", e)))?;

        // The first application frame must be `ready` with our session id.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Ready { client_id }) => return Ok((ws, client_id)),
                        Ok(other) => {
                            log::debug!(
                                "[lumen-link] ignoring pre-ready frame: {:?}",
                                other
                            );
                        }
                        Err(e) => log::warn!("[lumen-link] unparseable pre-ready frame: {}", e),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(LumenLinkError::WebSocketError(format!(
                        "connection failed before ready: {}",
                        e
                    )));
                }
                None => {
                    return Err(LumenLinkError::NetworkError(
                        "connection closed before ready".to_string(),
                    ));
                }
            }
        }
    };

    if LumenLinkTimeouts::is_disabled(timeouts.connection_timeout) {
        attempt.await
    } else {
        match tokio::time::timeout(timeouts.connection_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(LumenLinkError::TimeoutError(format!(
                "no ready frame within {:?}",
                timeouts.connection_timeout
            ))),
        }
    }
}

/// Spawn the timer bounding one pending acknowledgement.
fn spawn_ack_timer(
    cmd_tx: mpsc::Sender<PubSubCmd>,
    request_id: String,
    wait: Duration,
) -> Option<JoinHandle<()>> {
    if LumenLinkTimeouts::is_disabled(wait) {
        return None;
    }
    Some(tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let _ = cmd_tx.send(PubSubCmd::AckTimeout { request_id }).await;
    }))
}

/// Rebuild a connect error for each of several waiters (errors are not
/// `Clone`; only the variants `establish` produces matter here).
fn connect_error_like(err: &LumenLinkError) -> LumenLinkError {
    match err {
        LumenLinkError::TimeoutError(msg) => LumenLinkError::TimeoutError(msg.clone()),
        LumenLinkError::WebSocketError(msg) => LumenLinkError::WebSocketError(msg.clone()),
        LumenLinkError::ConfigurationError(msg) => {
            LumenLinkError::ConfigurationError(msg.clone())
        }
        other => LumenLinkError::NetworkError(other.to_string()),
    }
}

/// Invoke every listener registered for `topic` with the decoded message.
/// A panicking listener is isolated from the others and from the task.
fn dispatch_message(
    topics: &HashMap<String, Vec<(u64, MessageListener)>>,
    message: PubSubMessage,
) {
    let Some(listeners) = topics.get(&message.topic) else {
        log::debug!("[lumen-link] message for unknown topic {}", message.topic);
        return;
    };
    let snapshot: Vec<MessageListener> =
        listeners.iter().map(|(_, cb)| cb.clone()).collect();
    for listener in snapshot {
        let msg = message.clone();
        if catch_unwind(AssertUnwindSafe(|| listener(msg))).is_err() {
            log::warn!(
                "[lumen-link] listener for topic {} panicked; continuing",
                message.topic
            );
        }
    }
}

/// Fail all deferred work: publishes get the connection error, subscribes
/// resolve with their listener id (registration survives; best-effort).
fn drain_wait_queue_failed(wait_queue: &mut VecDeque<Deferred>, err: &LumenLinkError) {
    for deferred in wait_queue.drain(..) {
        match deferred {
            Deferred::Publish { reply, .. } => {
                let _ = reply.send(Err(connect_error_like(err)));
            }
            Deferred::Subscribe {
                listener_id, reply, ..
            } => {
                let _ = reply.send(listener_id);
            }
        }
    }
}

// ── Background channel task ─────────────────────────────────────────────────

/// The single-writer task owning all mutable channel state.
///
/// Lifecycle per iteration:
/// 1. Connected: multiplex socket frames, commands, keepalive deadlines.
/// 2. Disconnected with pending work: back off (while still serving
///    commands), then run one shared connection attempt.
/// 3. Idle: wait for the next command.
#[allow(clippy::too_many_arguments)]
async fn channel_task(
    mut cmd_rx: mpsc::Receiver<PubSubCmd>,
    cmd_tx: mpsc::Sender<PubSubCmd>,
    base_url: String,
    auth: AuthStore,
    timeouts: LumenLinkTimeouts,
    handlers: EventHandlers,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
) {
    let mut topics: HashMap<String, Vec<(u64, MessageListener)>> = HashMap::new();
    let mut registry = AckRegistry::new();
    let mut socket: Option<WsStream> = None;
    let mut wait_queue: VecDeque<Deferred> = VecDeque::new();
    let mut backoff = Backoff::new(&PUBSUB_LADDER);
    // Manual-close flag; orthogonal to the connection state.
    let mut closing = false;
    // Set when an unexpected drop or failed attempt warrants another try.
    let mut reconnect_pending = false;
    let mut next_listener_id: u64 = 1;

    // Keepalive state: idle deadline arms the ping, pong deadline bounds it.
    let has_keepalive = !LumenLinkTimeouts::is_disabled(timeouts.keepalive_interval);
    let has_pong_timeout = has_keepalive && !LumenLinkTimeouts::is_disabled(timeouts.pong_timeout);
    let keepalive_dur = if has_keepalive {
        timeouts.keepalive_interval
    } else {
        FAR_FUTURE
    };
    let mut idle_deadline = TokioInstant::now() + keepalive_dur;
    let mut awaiting_pong = false;
    let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

    loop {
        if let Some(ws) = socket.as_mut() {
            let idle_sleep = tokio::time::sleep_until(idle_deadline);
            tokio::pin!(idle_sleep);
            let pong_sleep = tokio::time::sleep_until(pong_deadline);
            tokio::pin!(pong_sleep);

            tokio::select! {
                biased;

                // No frame arrived since our keepalive ping: the peer is gone.
                _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                    log::warn!(
                        "[lumen-link] pong timeout ({:?}), treating pub/sub connection as dead",
                        timeouts.pong_timeout
                    );
                    registry.reject_all(|| LumenLinkError::ConnectionClosed);
                    connected.store(false, Ordering::SeqCst);
                    handlers.emit_disconnect(DisconnectReason::new(
                        "pong timeout",
                        topics.keys().cloned().collect(),
                    ));
                    awaiting_pong = false;
                    socket = None;
                    reconnect_pending = !topics.is_empty() && !closing;
                    continue;
                }

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // Every handle dropped: graceful shutdown.
                        registry.reject_all(|| LumenLinkError::ConnectionClosed);
                        let _ = ws.close(None).await;
                        connected.store(false, Ordering::SeqCst);
                        return;
                    };
                    match cmd {
                        PubSubCmd::Publish { topic, data, reply } => {
                            let request_id = new_request_id();
                            let frame = ClientFrame::Publish {
                                topic,
                                data,
                                request_id: request_id.clone(),
                            };
                            match send_frame(ws, &frame, &handlers).await {
                                Ok(()) => {
                                    let timer = spawn_ack_timer(
                                        cmd_tx.clone(),
                                        request_id.clone(),
                                        timeouts.ack_timeout,
                                    );
                                    registry.register(request_id, reply, timer);
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                    registry.reject_all(|| LumenLinkError::ConnectionClosed);
                                    connected.store(false, Ordering::SeqCst);
                                    handlers.emit_disconnect(DisconnectReason::new(
                                        "send failed",
                                        topics.keys().cloned().collect(),
                                    ));
                                    socket = None;
                                    reconnect_pending = !topics.is_empty() && !closing;
                                    continue;
                                }
                            }
                        }
                        PubSubCmd::Subscribe { topic, listener, reply } => {
                            let listener_id = next_listener_id;
                            next_listener_id += 1;
                            let entry = topics.entry(topic.clone()).or_default();
                            entry.push((listener_id, listener));
                            if entry.len() > 1 {
                                // Existing server-side subscription covers us.
                                let _ = reply.send(listener_id);
                            } else if !subscribe_with_ack(
                                ws,
                                &mut registry,
                                &cmd_tx,
                                &timeouts,
                                &handlers,
                                &topic,
                                listener_id,
                                reply,
                            )
                            .await
                            {
                                registry.reject_all(|| LumenLinkError::ConnectionClosed);
                                connected.store(false, Ordering::SeqCst);
                                handlers.emit_disconnect(DisconnectReason::new(
                                    "send failed",
                                    topics.keys().cloned().collect(),
                                ));
                                socket = None;
                                reconnect_pending = !topics.is_empty() && !closing;
                                continue;
                            }
                        }
                        PubSubCmd::RemoveListener { topic, listener_id, reply } => {
                            let mut topic_gone = false;
                            if let Some(entry) = topics.get_mut(&topic) {
                                entry.retain(|(id, _)| *id != listener_id);
                                if entry.is_empty() {
                                    topics.remove(&topic);
                                    topic_gone = true;
                                }
                            }
                            if topic_gone {
                                let frame = ClientFrame::Unsubscribe {
                                    topic: Some(topic),
                                    request_id: new_request_id(),
                                };
                                let _ = send_frame(ws, &frame, &handlers).await;
                            }
                            if topics.is_empty() {
                                // Last listener overall: tear the connection down.
                                registry.reject_all(|| LumenLinkError::ConnectionClosed);
                                let _ = ws.close(None).await;
                                connected.store(false, Ordering::SeqCst);
                                handlers.emit_disconnect(DisconnectReason::new(
                                    "all listeners removed",
                                    Vec::new(),
                                ));
                                socket = None;
                                reconnect_pending = false;
                                if let Some(reply) = reply {
                                    let _ = reply.send(());
                                }
                                continue;
                            }
                            if let Some(reply) = reply {
                                let _ = reply.send(());
                            }
                        }
                        PubSubCmd::Unsubscribe { topic, reply } => {
                            let frame = match topic {
                                Some(topic) => {
                                    topics.remove(&topic);
                                    ClientFrame::Unsubscribe {
                                        topic: Some(topic),
                                        request_id: new_request_id(),
                                    }
                                }
                                None => {
                                    topics.clear();
                                    ClientFrame::Unsubscribe {
                                        topic: None,
                                        request_id: new_request_id(),
                                    }
                                }
                            };
                            let _ = send_frame(ws, &frame, &handlers).await;
                            if topics.is_empty() {
                                registry.reject_all(|| LumenLinkError::ConnectionClosed);
                                let _ = ws.close(None).await;
                                connected.store(false, Ordering::SeqCst);
                                handlers.emit_disconnect(DisconnectReason::new(
                                    "unsubscribed",
                                    Vec::new(),
                                ));
                                socket = None;
                                reconnect_pending = false;
                                let _ = reply.send(());
                                continue;
                            }
                            let _ = reply.send(());
                        }
                        PubSubCmd::Ping { reply } => {
                            let request_id = new_request_id();
                            let frame = ClientFrame::Ping {
                                request_id: request_id.clone(),
                            };
                            match send_frame(ws, &frame, &handlers).await {
                                Ok(()) => {
                                    let timer = spawn_ack_timer(
                                        cmd_tx.clone(),
                                        request_id.clone(),
                                        timeouts.ack_timeout,
                                    );
                                    registry.register(request_id, reply, timer);
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                }
                            }
                        }
                        PubSubCmd::Disconnect { reply } => {
                            closing = true;
                            if !registry.is_empty() {
                                log::debug!(
                                    "[lumen-link] rejecting {} pending acks on disconnect",
                                    registry.len()
                                );
                            }
                            registry.reject_all(|| LumenLinkError::ConnectionClosed);
                            drain_wait_queue_failed(
                                &mut wait_queue,
                                &LumenLinkError::ConnectionClosed,
                            );
                            let _ = ws.close(None).await;
                            connected.store(false, Ordering::SeqCst);
                            handlers.emit_disconnect(DisconnectReason::new(
                                "client disconnected",
                                topics.keys().cloned().collect(),
                            ));
                            socket = None;
                            reconnect_pending = false;
                            let _ = reply.send(());
                            continue;
                        }
                        PubSubCmd::AckTimeout { request_id } => {
                            registry.reject(
                                &request_id,
                                LumenLinkError::TimeoutError(
                                    "timed out waiting for response".to_string(),
                                ),
                            );
                        }
                    }
                }

                // Idle for a full keepalive interval: probe the peer.
                _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                    let frame = ClientFrame::Ping {
                        request_id: new_request_id(),
                    };
                    if send_frame(ws, &frame, &handlers).await.is_err() {
                        registry.reject_all(|| LumenLinkError::ConnectionClosed);
                        connected.store(false, Ordering::SeqCst);
                        handlers.emit_disconnect(DisconnectReason::new(
                            "keepalive send failed",
                            topics.keys().cloned().collect(),
                        ));
                        socket = None;
                        reconnect_pending = !topics.is_empty() && !closing;
                        continue;
                    }
                    if has_pong_timeout {
                        awaiting_pong = true;
                        pong_deadline = TokioInstant::now() + timeouts.pong_timeout;
                    }
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                }

                frame = ws.next() => {
                    // Any inbound frame proves liveness.
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                    if awaiting_pong {
                        awaiting_pong = false;
                        pong_deadline = TokioInstant::now() + FAR_FUTURE;
                    }

                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            handlers.emit_receive(&text);
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(ServerFrame::Message { id, topic, created, data }) => {
                                    dispatch_message(&topics, PubSubMessage {
                                        id,
                                        topic,
                                        created,
                                        data,
                                    });
                                }
                                Ok(ServerFrame::Error { request_id: Some(id), message }) => {
                                    if !registry.reject(
                                        &id,
                                        LumenLinkError::RequestRejected(message.clone()),
                                    ) {
                                        log::debug!(
                                            "[lumen-link] error frame for unknown request {}: {}",
                                            id,
                                            message
                                        );
                                    }
                                }
                                Ok(ServerFrame::Error { request_id: None, message }) => {
                                    handlers.emit_error(ConnectionError::new(&message, true));
                                    log::warn!("[lumen-link] server error: {}", message);
                                }
                                Ok(ServerFrame::Ready { client_id }) => {
                                    // Unexpected mid-stream ready; session id refresh.
                                    log::debug!(
                                        "[lumen-link] mid-stream ready frame (client id {})",
                                        client_id
                                    );
                                }
                                Ok(ack) => {
                                    if let Some(id) = ack.request_id() {
                                        let id = id.to_string();
                                        if !registry.resolve(&id, ack) {
                                            log::debug!(
                                                "[lumen-link] ack for unknown request {}",
                                                id
                                            );
                                        }
                                    }
                                }
                                Err(e) => {
                                    log::warn!("[lumen-link] unparseable frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("[lumen-link] ignoring binary frame");
                        }
                        Some(Ok(Message::Close(close))) => {
                            let reason = match close {
                                Some(f) => DisconnectReason::with_code(
                                    f.reason.to_string(),
                                    f.code.into(),
                                    topics.keys().cloned().collect(),
                                ),
                                None => DisconnectReason::new(
                                    "server closed connection",
                                    topics.keys().cloned().collect(),
                                ),
                            };
                            registry.reject_all(|| LumenLinkError::ConnectionClosed);
                            connected.store(false, Ordering::SeqCst);
                            handlers.emit_disconnect(reason);
                            socket = None;
                            reconnect_pending = !topics.is_empty() && !closing;
                            continue;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            handlers.emit_error(ConnectionError::new(e.to_string(), true));
                            registry.reject_all(|| LumenLinkError::ConnectionClosed);
                            connected.store(false, Ordering::SeqCst);
                            handlers.emit_disconnect(DisconnectReason::new(
                                format!("WebSocket error: {}", e),
                                topics.keys().cloned().collect(),
                            ));
                            socket = None;
                            reconnect_pending = !topics.is_empty() && !closing;
                            continue;
                        }
                        None => {
                            registry.reject_all(|| LumenLinkError::ConnectionClosed);
                            connected.store(false, Ordering::SeqCst);
                            handlers.emit_disconnect(DisconnectReason::new(
                                "WebSocket stream ended",
                                topics.keys().cloned().collect(),
                            ));
                            socket = None;
                            reconnect_pending = !topics.is_empty() && !closing;
                            continue;
                        }
                    }
                }
            }
        } else if !closing && (reconnect_pending || !wait_queue.is_empty()) {
            // ── Disconnected with pending work: back off, then one attempt ──

            let delay = if reconnect_pending {
                let d = backoff.next_delay();
                reconnect_attempts.store(backoff.attempts(), Ordering::SeqCst);
                d
            } else {
                Duration::ZERO
            };

            if !delay.is_zero() {
                log::info!(
                    "[lumen-link] pub/sub reconnect in {:?} (attempt {})",
                    delay,
                    backoff.attempts()
                );
                let sleep_fut = tokio::time::sleep(delay);
                tokio::pin!(sleep_fut);
                let mut aborted = false;
                loop {
                    tokio::select! {
                        biased;
                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else { return; };
                            if handle_disconnected_cmd(
                                cmd,
                                &mut topics,
                                &mut wait_queue,
                                &mut registry,
                                &mut closing,
                                &mut reconnect_pending,
                                &mut next_listener_id,
                            ) {
                                aborted = true;
                                break;
                            }
                        }
                        _ = &mut sleep_fut => break,
                    }
                }
                if aborted || closing {
                    continue;
                }
            }

            match establish(&base_url, &auth, &timeouts).await {
                Ok((mut ws, client_id)) => {
                    let was_reconnect = backoff.attempts() > 0;
                    backoff.reset();
                    reconnect_attempts.store(0, Ordering::SeqCst);
                    log::info!(
                        "[lumen-link] pub/sub connected (client id {})",
                        client_id
                    );

                    let mut broken = false;
                    // Replay every live topic after a reconnect; acks are not
                    // awaited, the registrations already stand locally.
                    let mut announced: HashSet<String> = HashSet::new();
                    if was_reconnect {
                        for topic in topics.keys() {
                            let frame = ClientFrame::Subscribe {
                                topic: topic.clone(),
                                request_id: new_request_id(),
                            };
                            if send_frame(&mut ws, &frame, &handlers).await.is_err() {
                                broken = true;
                                break;
                            }
                            announced.insert(topic.clone());
                        }
                    }

                    // Serve the waiters that triggered or joined this attempt.
                    for deferred in wait_queue.drain(..).collect::<Vec<_>>() {
                        match deferred {
                            Deferred::Publish { topic, data, reply } => {
                                if broken {
                                    let _ = reply.send(Err(LumenLinkError::ConnectionClosed));
                                    continue;
                                }
                                let request_id = new_request_id();
                                let frame = ClientFrame::Publish {
                                    topic,
                                    data,
                                    request_id: request_id.clone(),
                                };
                                match send_frame(&mut ws, &frame, &handlers).await {
                                    Ok(()) => {
                                        let timer = spawn_ack_timer(
                                            cmd_tx.clone(),
                                            request_id.clone(),
                                            timeouts.ack_timeout,
                                        );
                                        registry.register(request_id, reply, timer);
                                    }
                                    Err(e) => {
                                        let _ = reply.send(Err(e));
                                        broken = true;
                                    }
                                }
                            }
                            Deferred::Subscribe { topic, listener_id, reply } => {
                                if broken
                                    || announced.contains(&topic)
                                    || !topics.contains_key(&topic)
                                {
                                    let _ = reply.send(listener_id);
                                    continue;
                                }
                                announced.insert(topic.clone());
                                if !subscribe_with_ack(
                                    &mut ws,
                                    &mut registry,
                                    &cmd_tx,
                                    &timeouts,
                                    &handlers,
                                    &topic,
                                    listener_id,
                                    reply,
                                )
                                .await
                                {
                                    broken = true;
                                }
                            }
                        }
                    }

                    if broken {
                        registry.reject_all(|| LumenLinkError::ConnectionClosed);
                        reconnect_pending = !topics.is_empty() && !closing;
                        continue;
                    }

                    connected.store(true, Ordering::SeqCst);
                    handlers.emit_connect();
                    socket = Some(ws);
                    idle_deadline = TokioInstant::now() + keepalive_dur;
                    awaiting_pong = false;
                    pong_deadline = TokioInstant::now() + FAR_FUTURE;
                }
                Err(e) => {
                    log::warn!("[lumen-link] pub/sub connect failed: {}", e);
                    handlers.emit_error(ConnectionError::new(e.to_string(), true));
                    drain_wait_queue_failed(&mut wait_queue, &e);
                    reconnect_pending = !topics.is_empty() && !closing;
                }
            }
        } else {
            // ── Idle: no connection wanted, wait for the next command ──
            let Some(cmd) = cmd_rx.recv().await else {
                return;
            };
            handle_disconnected_cmd(
                cmd,
                &mut topics,
                &mut wait_queue,
                &mut registry,
                &mut closing,
                &mut reconnect_pending,
                &mut next_listener_id,
            );
        }
    }
}

/// Send the first-listener `subscribe` frame and arrange for the caller to
/// be released when its ack settles. Success, error, and timeout all
/// release; the errors themselves are swallowed.
///
/// Returns `false` when the socket is broken and must be torn down.
#[allow(clippy::too_many_arguments)]
async fn subscribe_with_ack(
    ws: &mut WsStream,
    registry: &mut AckRegistry,
    cmd_tx: &mpsc::Sender<PubSubCmd>,
    timeouts: &LumenLinkTimeouts,
    handlers: &EventHandlers,
    topic: &str,
    listener_id: u64,
    reply: oneshot::Sender<u64>,
) -> bool {
    let request_id = new_request_id();
    let frame = ClientFrame::Subscribe {
        topic: topic.to_string(),
        request_id: request_id.clone(),
    };

    let (ack_tx, ack_rx) = oneshot::channel::<Result<ServerFrame>>();
    // Adapter: whatever the ack outcome, release the subscriber with its id.
    tokio::spawn(async move {
        if let Ok(Err(e)) = ack_rx.await {
            log::debug!("[lumen-link] subscribe ack failed (swallowed): {}", e);
        }
        let _ = reply.send(listener_id);
    });

    match send_frame(ws, &frame, handlers).await {
        Ok(()) => {
            let timer = spawn_ack_timer(cmd_tx.clone(), request_id.clone(), timeouts.ack_timeout);
            registry.register(request_id, ack_tx, timer);
            true
        }
        Err(e) => {
            log::warn!("[lumen-link] failed to send subscribe for {}: {}", topic, e);
            // Dropping ack_tx releases the adapter (and thus the caller).
            false
        }
    }
}

/// Handle a command while no socket exists.
///
/// Returns `true` when the caller should abandon an in-progress backoff
/// wait (manual disconnect or a state change that cancels the reconnect).
fn handle_disconnected_cmd(
    cmd: PubSubCmd,
    topics: &mut HashMap<String, Vec<(u64, MessageListener)>>,
    wait_queue: &mut VecDeque<Deferred>,
    registry: &mut AckRegistry,
    closing: &mut bool,
    reconnect_pending: &mut bool,
    next_listener_id: &mut u64,
) -> bool {
    match cmd {
        PubSubCmd::Publish { topic, data, reply } => {
            // A publish wants a connection even after a manual disconnect.
            *closing = false;
            wait_queue.push_back(Deferred::Publish { topic, data, reply });
            false
        }
        PubSubCmd::Subscribe { topic, listener, reply } => {
            *closing = false;
            let listener_id = *next_listener_id;
            *next_listener_id += 1;
            let entry = topics.entry(topic.clone()).or_default();
            entry.push((listener_id, listener));
            if entry.len() == 1 {
                wait_queue.push_back(Deferred::Subscribe {
                    topic,
                    listener_id,
                    reply,
                });
            } else {
                let _ = reply.send(listener_id);
                // Still make sure a connection comes up for the topic.
                *reconnect_pending = true;
            }
            false
        }
        PubSubCmd::RemoveListener { topic, listener_id, reply } => {
            if let Some(entry) = topics.get_mut(&topic) {
                entry.retain(|(id, _)| *id != listener_id);
                if entry.is_empty() {
                    topics.remove(&topic);
                }
            }
            if topics.is_empty() {
                // Nothing left to reconnect for; cancel any pending timer.
                *reconnect_pending = false;
            }
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            topics.is_empty() && wait_queue.is_empty()
        }
        PubSubCmd::Unsubscribe { topic, reply } => {
            match topic {
                Some(topic) => {
                    topics.remove(&topic);
                }
                None => topics.clear(),
            }
            if topics.is_empty() {
                *reconnect_pending = false;
            }
            let _ = reply.send(());
            topics.is_empty() && wait_queue.is_empty()
        }
        PubSubCmd::Ping { reply } => {
            let _ = reply.send(Err(LumenLinkError::ConnectionClosed));
            false
        }
        PubSubCmd::Disconnect { reply } => {
            *closing = true;
            *reconnect_pending = false;
            registry.reject_all(|| LumenLinkError::ConnectionClosed);
            drain_wait_queue_failed(wait_queue, &LumenLinkError::ConnectionClosed);
            let _ = reply.send(());
            true
        }
        PubSubCmd::AckTimeout { request_id } => {
            registry.reject(
                &request_id,
                LumenLinkError::TimeoutError("timed out waiting for response".to_string()),
            );
            false
        }
    }
}
