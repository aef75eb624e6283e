//! Main Lumen client with builder pattern.
//!
//! Owns the pooled HTTP client, the shared auth store and the two
//! long-lived channels. Everything else in the SDK hangs off an instance
//! built here.

use crate::{
    auth::AuthStore,
    error::{LumenLinkError, Result},
    event_handlers::EventHandlers,
    pubsub::PubSubChannel,
    realtime::RealtimeChannel,
    timeouts::LumenLinkTimeouts,
};
use std::sync::Arc;

/// Main Lumen client.
///
/// Use [`LumenLinkClientBuilder`] to construct instances with custom
/// configuration. Cloning is cheap: the channels and the auth store are
/// shared between clones.
///
/// # Examples
///
/// ```rust,no_run
/// use lumen_link::LumenLinkClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = LumenLinkClient::builder()
///     .base_url("http://localhost:8090")
///     .auth_token("eyJhbGc...")
///     .build()?;
///
/// let sub = client
///     .realtime()
///     .subscribe("posts/*", |event| println!("{:?}", event.action))
///     .await?;
/// # drop(sub);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LumenLinkClient {
    base_url: String,
    http_client: reqwest::Client,
    auth: AuthStore,
    timeouts: LumenLinkTimeouts,
    realtime: Arc<RealtimeChannel>,
    pubsub: Arc<PubSubChannel>,
}

impl LumenLinkClient {
    /// Create a new builder for configuring the client.
    pub fn builder() -> LumenLinkClientBuilder {
        LumenLinkClientBuilder::new()
    }

    /// The SSE-based record subscription channel.
    pub fn realtime(&self) -> &RealtimeChannel {
        &self.realtime
    }

    /// The WebSocket publish/subscribe channel.
    pub fn pubsub(&self) -> &PubSubChannel {
        &self.pubsub
    }

    /// The shared auth store; setting or clearing the token here affects
    /// the next connection either channel establishes.
    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    /// The configured server base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The configured timeouts.
    pub fn timeouts(&self) -> &LumenLinkTimeouts {
        &self.timeouts
    }

    /// The underlying HTTP client (shared with the realtime channel).
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }
}

/// Builder for configuring [`LumenLinkClient`] instances.
pub struct LumenLinkClientBuilder {
    base_url: Option<String>,
    auth: AuthStore,
    timeouts: LumenLinkTimeouts,
    event_handlers: EventHandlers,
}

impl LumenLinkClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            auth: AuthStore::new(),
            timeouts: LumenLinkTimeouts::default(),
            event_handlers: EventHandlers::new(),
        }
    }

    /// Set the base URL of the Lumen server (required).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Pre-load the auth store with a bearer token.
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth.set_token(token);
        self
    }

    /// Share an existing auth store (e.g. one kept across clients).
    pub fn auth_store(mut self, auth: AuthStore) -> Self {
        self.auth = auth;
        self
    }

    /// Set the timeout configuration for all operations.
    pub fn timeouts(mut self, timeouts: LumenLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Register connection lifecycle hooks; applied to both channels.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<LumenLinkClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| LumenLinkError::ConfigurationError("base_url is required".into()))?;
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LumenLinkError::ConfigurationError(
                "base_url must not be empty".into(),
            ));
        }

        // Pooled HTTP client shared by short requests and the SSE stream.
        // No total request timeout here: it would cut long-lived SSE bodies.
        // Short requests bound themselves with `request_timeout` per call.
        let http_client = reqwest::Client::builder()
            .connect_timeout(self.timeouts.connection_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()
            .map_err(|e| LumenLinkError::ConfigurationError(e.to_string()))?;

        let realtime = Arc::new(RealtimeChannel::new(
            base_url.clone(),
            http_client.clone(),
            self.auth.clone(),
            self.timeouts.clone(),
            self.event_handlers.clone(),
        ));
        let pubsub = Arc::new(PubSubChannel::new(
            base_url.clone(),
            self.auth.clone(),
            self.timeouts.clone(),
            self.event_handlers,
        ));

        Ok(LumenLinkClient {
            base_url,
            http_client,
            auth: self.auth,
            timeouts: self.timeouts,
            realtime,
            pubsub,
        })
    }
}
