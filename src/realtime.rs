//! Server-Sent-Events realtime channel for record change subscriptions.
//!
//! Maintains one half-duplex SSE connection to the server's `/api/realtime`
//! endpoint. The server first emits a `connect` event carrying this client's
//! session id; the client then POSTs its complete set of topic keys over a
//! side-channel HTTP request, and repeats that submission whenever the set
//! changes. Named events are dispatched to the listeners registered for
//! exactly that topic key. Topic submission is fire-and-forget: the SSE
//! protocol has no application-level acks, so failures are logged and
//! swallowed, and reconnect replay re-announces everything.
//!
//! Like the pub/sub channel, all mutable state is owned by one background
//! task fed through an mpsc command channel.

use crate::{
    auth::AuthStore,
    backoff::{Backoff, REALTIME_LADDER},
    error::{LumenLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    models::{ConnectMessage, RecordEvent, SubscribeOptions, TopicSubmission},
    sse::{SseEvent, SseParser},
    timeouts::LumenLinkTimeouts,
};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OnceCell};

type SseBody = BoxStream<'static, reqwest::Result<Bytes>>;

/// Callback invoked for every decoded event on a subscribed topic key.
pub type RecordListener = Arc<dyn Fn(RecordEvent) + Send + Sync>;

/// Name of the handshake event carrying the client id.
const CONNECT_EVENT: &str = "connect";

/// Command channel capacity between the public handle and the task.
const CMD_CHANNEL_CAPACITY: usize = 256;

// ── Commands ────────────────────────────────────────────────────────────────

enum RealtimeCmd {
    /// Register a listener under a composite topic key.
    Subscribe {
        key: String,
        listener: RecordListener,
        reply: oneshot::Sender<u64>,
    },
    /// Remove one listener by id (handle unsubscribe / Drop).
    RemoveListener {
        key: String,
        listener_id: u64,
        reply: Option<oneshot::Sender<()>>,
    },
    /// Drop every listener for a base topic (`Some`) or all topics (`None`).
    Unsubscribe {
        topic: Option<String>,
        reply: oneshot::Sender<()>,
    },
    /// Manual disconnect; suppresses auto-reconnect until the next subscribe.
    Disconnect { reply: oneshot::Sender<()> },
}

// ── Public handle ───────────────────────────────────────────────────────────

/// SSE-based realtime record subscription channel.
///
/// # Examples
///
/// ```rust,no_run
/// use lumen_link::{LumenLinkClient, RecordAction};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = LumenLinkClient::builder()
///     .base_url("http://localhost:8090")
///     .build()?;
///
/// let mut sub = client
///     .realtime()
///     .subscribe("posts/*", |event| {
///         if event.action == RecordAction::Create {
///             println!("new post: {}", event.record);
///         }
///     })
///     .await?;
///
/// // ... later
/// sub.unsubscribe().await?;
/// # Ok(())
/// # }
/// ```
pub struct RealtimeChannel {
    base_url: String,
    http: reqwest::Client,
    auth: AuthStore,
    timeouts: LumenLinkTimeouts,
    handlers: EventHandlers,
    core: OnceCell<RealtimeCore>,
}

struct RealtimeCore {
    cmd_tx: mpsc::Sender<RealtimeCmd>,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
}

impl RealtimeChannel {
    pub(crate) fn new(
        base_url: String,
        http: reqwest::Client,
        auth: AuthStore,
        timeouts: LumenLinkTimeouts,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            base_url,
            http,
            auth,
            timeouts,
            handlers,
            core: OnceCell::new(),
        }
    }

    async fn core(&self) -> &RealtimeCore {
        self.core
            .get_or_init(|| async {
                let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
                let connected = Arc::new(AtomicBool::new(false));
                let reconnect_attempts = Arc::new(AtomicU32::new(0));

                tokio::spawn(realtime_task(
                    cmd_rx,
                    self.base_url.clone(),
                    self.http.clone(),
                    self.auth.clone(),
                    self.timeouts.clone(),
                    self.handlers.clone(),
                    connected.clone(),
                    reconnect_attempts.clone(),
                ));

                RealtimeCore {
                    cmd_tx,
                    connected,
                    reconnect_attempts,
                }
            })
            .await
    }

    /// Register `listener` for events on `topic`.
    ///
    /// Opens the SSE connection if none exists, otherwise resubmits the
    /// full topic list. Registration itself never fails on network errors;
    /// those only show up as background reconnects (and through the
    /// `on_disconnect` hook).
    pub async fn subscribe(
        &self,
        topic: &str,
        listener: impl Fn(RecordEvent) + Send + Sync + 'static,
    ) -> Result<RealtimeSubscription> {
        self.subscribe_with_options(topic, listener, SubscribeOptions::new())
            .await
    }

    /// Like [`subscribe`](Self::subscribe), with per-subscription query or
    /// header overrides. Distinct options yield distinct server-side topic
    /// keys, so the same base topic can be watched under several filters.
    pub async fn subscribe_with_options(
        &self,
        topic: &str,
        listener: impl Fn(RecordEvent) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Result<RealtimeSubscription> {
        if topic.is_empty() {
            return Err(LumenLinkError::ValidationError(
                "topic must not be empty".to_string(),
            ));
        }
        let key = options.composite_key(topic);

        let core = self.core().await;
        let (reply, rx) = oneshot::channel();
        core.cmd_tx
            .send(RealtimeCmd::Subscribe {
                key: key.clone(),
                listener: Arc::new(listener),
                reply,
            })
            .await
            .map_err(|_| LumenLinkError::ConnectionClosed)?;

        let listener_id = rx.await.map_err(|_| LumenLinkError::ConnectionClosed)?;
        Ok(RealtimeSubscription {
            key,
            listener_id,
            cmd_tx: core.cmd_tx.clone(),
            closed: false,
        })
    }

    /// Drop every listener registered for `topic`, across all option
    /// variants of it, then resubmit or disconnect accordingly.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(LumenLinkError::ValidationError(
                "topic must not be empty".to_string(),
            ));
        }
        self.send_unsubscribe(Some(topic.to_string())).await
    }

    /// Drop every listener and disconnect.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.send_unsubscribe(None).await
    }

    async fn send_unsubscribe(&self, topic: Option<String>) -> Result<()> {
        let core = self.core().await;
        let (reply, rx) = oneshot::channel();
        core.cmd_tx
            .send(RealtimeCmd::Unsubscribe { topic, reply })
            .await
            .map_err(|_| LumenLinkError::ConnectionClosed)?;
        rx.await.map_err(|_| LumenLinkError::ConnectionClosed)
    }

    /// Manually close the connection.
    ///
    /// Cancels the live transport, clears the client id and suppresses
    /// auto-reconnect until the next subscribe call. Idempotent; listeners
    /// stay registered.
    pub async fn disconnect(&self) {
        let Some(core) = self.core.get() else {
            return;
        };
        let (reply, rx) = oneshot::channel();
        if core
            .cmd_tx
            .send(RealtimeCmd::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Whether a client id has been received on a live connection.
    pub fn is_connected(&self) -> bool {
        self.core
            .get()
            .map(|core| core.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Consecutive failed connection attempts; resets to 0 whenever a
    /// client id is received.
    pub fn reconnect_attempts(&self) -> u32 {
        self.core
            .get()
            .map(|core| core.reconnect_attempts.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Handle for one registered realtime listener.
#[derive(Debug)]
pub struct RealtimeSubscription {
    key: String,
    listener_id: u64,
    cmd_tx: mpsc::Sender<RealtimeCmd>,
    closed: bool,
}

impl RealtimeSubscription {
    /// Composite topic key this listener is registered under.
    pub fn topic_key(&self) -> &str {
        &self.key
    }

    /// Remove this listener. The last listener for the key removes the key
    /// and resubmits the topic list; the last key overall disconnects.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RealtimeCmd::RemoveListener {
                key: self.key.clone(),
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

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cmd_tx.try_send(RealtimeCmd::RemoveListener {
                key: self.key.clone(),
                listener_id: self.listener_id,
                reply: None,
            });
        }
    }
}

// ── Wire helpers ────────────────────────────────────────────────────────────

/// Open the SSE stream; resolves once response headers are in.
async fn open_stream(
    base_url: &str,
    http: &reqwest::Client,
    auth: &AuthStore,
    timeouts: &LumenLinkTimeouts,
) -> Result<SseBody> {
    let url = format!("{}/api/realtime", base_url.trim_end_matches('/'));
    log::debug!("[lumen-link] opening realtime stream to {}", url);

    let mut request = http.get(&url).header("Accept", "text/event-stream");
    if auth.is_valid() {
        if let Some(token) = auth.token() {
            request = request.bearer_auth(token);
        }
    }

    // Bound only the header exchange; the body is a long-lived stream.
    let send = request.send();
    let response = if LumenLinkTimeouts::is_disabled(timeouts.connection_timeout) {
        send.await?
    } else {
        tokio::time::timeout(timeouts.connection_timeout, send)
            .await
            .map_err(|_| {
                LumenLinkError::TimeoutError(format!(
                    "no realtime response within {:?}",
                    timeouts.connection_timeout
                ))
            })??
    };

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(LumenLinkError::ServerError {
            status_code: status.as_u16(),
            message,
        });
    }

    Ok(response.bytes_stream().boxed())
}

/// POST the complete live topic set for this client id.
///
/// Fire-and-forget from the caller's point of view; the error return is
/// only for logging at the call sites.
async fn submit_topics(
    base_url: &str,
    http: &reqwest::Client,
    auth: &AuthStore,
    timeouts: &LumenLinkTimeouts,
    client_id: &str,
    topics: &HashMap<String, Vec<(u64, RecordListener)>>,
) -> Result<()> {
    let mut subscriptions: Vec<String> = topics.keys().cloned().collect();
    subscriptions.sort();

    let body = TopicSubmission {
        client_id: client_id.to_string(),
        subscriptions,
    };

    let url = format!("{}/api/realtime", base_url.trim_end_matches('/'));
    let mut request = http
        .post(&url)
        .timeout(timeouts.request_timeout)
        .json(&body);
    if auth.is_valid() {
        if let Some(token) = auth.token() {
            request = request.bearer_auth(token);
        }
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(LumenLinkError::ServerError {
            status_code: status.as_u16(),
            message,
        });
    }
    Ok(())
}

/// Invoke every listener for the event's topic key with the decoded
/// payload. A panicking listener is isolated from the others.
fn dispatch_event(
    topics: &HashMap<String, Vec<(u64, RecordListener)>>,
    event: &SseEvent,
) {
    let Some(listeners) = topics.get(&event.event) else {
        log::debug!(
            "[lumen-link] event {:?} for unknown topic key {}",
            event.id,
            event.event
        );
        return;
    };

    let payload: RecordEvent = match serde_json::from_str(&event.data) {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!(
                "[lumen-link] undecodable event payload for {}: {}",
                event.event,
                e
            );
            return;
        }
    };

    let snapshot: Vec<RecordListener> = listeners.iter().map(|(_, cb)| cb.clone()).collect();
    for listener in snapshot {
        let item = payload.clone();
        if catch_unwind(AssertUnwindSafe(|| listener(item))).is_err() {
            log::warn!(
                "[lumen-link] listener for topic key {} panicked; continuing",
                event.event
            );
        }
    }
}

// ── Background channel task ─────────────────────────────────────────────────

/// The single-writer task owning all mutable realtime state.
#[allow(clippy::too_many_arguments)]
async fn realtime_task(
    mut cmd_rx: mpsc::Receiver<RealtimeCmd>,
    base_url: String,
    http: reqwest::Client,
    auth: AuthStore,
    timeouts: LumenLinkTimeouts,
    handlers: EventHandlers,
    connected: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
) {
    let mut topics: HashMap<String, Vec<(u64, RecordListener)>> = HashMap::new();
    let mut stream: Option<SseBody> = None;
    let mut parser = SseParser::new();
    // Empty until the connect event delivers the session id.
    let mut client_id = String::new();
    let mut closing = false;
    let mut connect_requested = false;
    let mut reconnect_pending = false;
    let mut backoff = Backoff::new(&REALTIME_LADDER);
    let mut next_listener_id: u64 = 1;

    loop {
        if let Some(body) = stream.as_mut() {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        connected.store(false, Ordering::SeqCst);
                        return;
                    };
                    match cmd {
                        RealtimeCmd::Subscribe { key, listener, reply } => {
                            let listener_id = next_listener_id;
                            next_listener_id += 1;
                            topics.entry(key).or_default().push((listener_id, listener));
                            let _ = reply.send(listener_id);
                            // Before the connect event there is no client id
                            // to submit under; the connect handler submits
                            // the full set as soon as the id arrives.
                            if !client_id.is_empty() {
                                if let Err(e) = submit_topics(
                                    &base_url, &http, &auth, &timeouts, &client_id, &topics,
                                ).await {
                                    log::warn!("[lumen-link] topic submission failed: {}", e);
                                }
                            }
                        }
                        RealtimeCmd::RemoveListener { key, listener_id, reply } => {
                            remove_listener(&mut topics, &key, listener_id);
                            if topics.is_empty() {
                                connected.store(false, Ordering::SeqCst);
                                handlers.emit_disconnect(DisconnectReason::new(
                                    "all listeners removed",
                                    Vec::new(),
                                ));
                                stream = None;
                                parser = SseParser::new();
                                client_id.clear();
                                connect_requested = false;
                                reconnect_pending = false;
                            } else if !client_id.is_empty() {
                                if let Err(e) = submit_topics(
                                    &base_url, &http, &auth, &timeouts, &client_id, &topics,
                                ).await {
                                    log::warn!("[lumen-link] topic submission failed: {}", e);
                                }
                            }
                            if let Some(reply) = reply {
                                let _ = reply.send(());
                            }
                            continue;
                        }
                        RealtimeCmd::Unsubscribe { topic, reply } => {
                            remove_topic(&mut topics, topic.as_deref());
                            if topics.is_empty() {
                                connected.store(false, Ordering::SeqCst);
                                handlers.emit_disconnect(DisconnectReason::new(
                                    "unsubscribed",
                                    Vec::new(),
                                ));
                                stream = None;
                                parser = SseParser::new();
                                client_id.clear();
                                connect_requested = false;
                                reconnect_pending = false;
                            } else if !client_id.is_empty() {
                                if let Err(e) = submit_topics(
                                    &base_url, &http, &auth, &timeouts, &client_id, &topics,
                                ).await {
                                    log::warn!("[lumen-link] topic submission failed: {}", e);
                                }
                            }
                            let _ = reply.send(());
                            continue;
                        }
                        RealtimeCmd::Disconnect { reply } => {
                            closing = true;
                            let was_connected = connected.swap(false, Ordering::SeqCst);
                            if was_connected {
                                handlers.emit_disconnect(DisconnectReason::new(
                                    "client disconnected",
                                    topics.keys().cloned().collect(),
                                ));
                            }
                            stream = None;
                            parser = SseParser::new();
                            client_id.clear();
                            connect_requested = false;
                            reconnect_pending = false;
                            let _ = reply.send(());
                            continue;
                        }
                    }
                }

                chunk = body.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.push(&bytes) {
                                handlers.emit_receive(&event.data);
                                if event.event == CONNECT_EVENT {
                                    match serde_json::from_str::<ConnectMessage>(&event.data) {
                                        Ok(msg) => {
                                            client_id = msg.client_id;
                                            backoff.reset();
                                            reconnect_attempts.store(0, Ordering::SeqCst);
                                            connected.store(true, Ordering::SeqCst);
                                            handlers.emit_connect();
                                            log::info!(
                                                "[lumen-link] realtime connected (client id {})",
                                                client_id
                                            );
                                            // Covers both the initial submission
                                            // and post-reconnect replay.
                                            if let Err(e) = submit_topics(
                                                &base_url, &http, &auth, &timeouts,
                                                &client_id, &topics,
                                            ).await {
                                                log::warn!(
                                                    "[lumen-link] topic submission failed: {}",
                                                    e
                                                );
                                            }
                                        }
                                        Err(e) => log::warn!(
                                            "[lumen-link] undecodable connect event: {}",
                                            e
                                        ),
                                    }
                                } else {
                                    dispatch_event(&topics, &event);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            handlers.emit_error(ConnectionError::new(e.to_string(), true));
                            connected.store(false, Ordering::SeqCst);
                            handlers.emit_disconnect(DisconnectReason::new(
                                format!("realtime stream error: {}", e),
                                topics.keys().cloned().collect(),
                            ));
                            stream = None;
                            parser = SseParser::new();
                            client_id.clear();
                            reconnect_pending = !topics.is_empty() && !closing;
                            continue;
                        }
                        None => {
                            connected.store(false, Ordering::SeqCst);
                            handlers.emit_disconnect(DisconnectReason::new(
                                "realtime stream ended",
                                topics.keys().cloned().collect(),
                            ));
                            stream = None;
                            parser = SseParser::new();
                            client_id.clear();
                            reconnect_pending = !topics.is_empty() && !closing;
                            continue;
                        }
                    }
                }
            }
        } else if !closing
            && !topics.is_empty()
            && (connect_requested || reconnect_pending)
        {
            // ── Disconnected with listeners: back off, then one attempt ──

            let delay = if reconnect_pending {
                let d = backoff.next_delay();
                reconnect_attempts.store(backoff.attempts(), Ordering::SeqCst);
                d
            } else {
                Duration::ZERO
            };

            if !delay.is_zero() {
                log::info!(
                    "[lumen-link] realtime reconnect in {:?} (attempt {})",
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
                                &mut closing,
                                &mut connect_requested,
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
                if aborted || closing || topics.is_empty() {
                    continue;
                }
            }

            match open_stream(&base_url, &http, &auth, &timeouts).await {
                Ok(body) => {
                    // Not connected yet: the connect event must deliver the
                    // client id before submissions can flow.
                    stream = Some(body);
                    parser = SseParser::new();
                    connect_requested = false;
                }
                Err(e) => {
                    log::warn!("[lumen-link] realtime connect failed: {}", e);
                    handlers.emit_error(ConnectionError::new(e.to_string(), true));
                    connect_requested = false;
                    reconnect_pending = !topics.is_empty() && !closing;
                }
            }
        } else {
            // ── Idle: wait for the next command ──
            let Some(cmd) = cmd_rx.recv().await else {
                return;
            };
            handle_disconnected_cmd(
                cmd,
                &mut topics,
                &mut closing,
                &mut connect_requested,
                &mut reconnect_pending,
                &mut next_listener_id,
            );
        }
    }
}

fn remove_listener(
    topics: &mut HashMap<String, Vec<(u64, RecordListener)>>,
    key: &str,
    listener_id: u64,
) {
    if let Some(entry) = topics.get_mut(key) {
        entry.retain(|(id, _)| *id != listener_id);
        if entry.is_empty() {
            topics.remove(key);
        }
    }
}

/// Remove a base topic across all of its option variants, or everything.
fn remove_topic(topics: &mut HashMap<String, Vec<(u64, RecordListener)>>, topic: Option<&str>) {
    match topic {
        Some(topic) => topics.retain(|key, _| SubscribeOptions::base_topic(key) != topic),
        None => topics.clear(),
    }
}

/// Handle a command while no stream exists.
///
/// Returns `true` when an in-progress backoff wait should be abandoned.
fn handle_disconnected_cmd(
    cmd: RealtimeCmd,
    topics: &mut HashMap<String, Vec<(u64, RecordListener)>>,
    closing: &mut bool,
    connect_requested: &mut bool,
    reconnect_pending: &mut bool,
    next_listener_id: &mut u64,
) -> bool {
    match cmd {
        RealtimeCmd::Subscribe { key, listener, reply } => {
            *closing = false;
            *connect_requested = true;
            let listener_id = *next_listener_id;
            *next_listener_id += 1;
            topics.entry(key).or_default().push((listener_id, listener));
            let _ = reply.send(listener_id);
            false
        }
        RealtimeCmd::RemoveListener { key, listener_id, reply } => {
            remove_listener(topics, &key, listener_id);
            if topics.is_empty() {
                *connect_requested = false;
                *reconnect_pending = false;
            }
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            topics.is_empty()
        }
        RealtimeCmd::Unsubscribe { topic, reply } => {
            remove_topic(topics, topic.as_deref());
            if topics.is_empty() {
                *connect_requested = false;
                *reconnect_pending = false;
            }
            let _ = reply.send(());
            topics.is_empty()
        }
        RealtimeCmd::Disconnect { reply } => {
            *closing = true;
            *connect_requested = false;
            *reconnect_pending = false;
            let _ = reply.send(());
            true
        }
    }
}
