//! # lumen-link: Lumen client library
//!
//! Rust client SDK for Lumen servers, centered on the two long-lived
//! channels of the realtime API:
//!
//! - **Realtime (SSE)**: record change subscriptions over a single
//!   Server-Sent-Events connection, with topic submission over a
//!   side-channel POST and automatic reconnection.
//! - **Pub/Sub (WebSocket)**: publish/subscribe over one multiplexed
//!   WebSocket connection with request/acknowledgement correlation,
//!   automatic reconnection and full re-subscription replay.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lumen_link::LumenLinkClient;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = LumenLinkClient::builder()
//!         .base_url("http://localhost:8090")
//!         .build()?;
//!
//!     // Watch record changes.
//!     let _records = client
//!         .realtime()
//!         .subscribe("posts/*", |event| {
//!             println!("{:?}: {}", event.action, event.record);
//!         })
//!         .await?;
//!
//!     // Publish and consume pub/sub messages.
//!     let _chat = client
//!         .pubsub()
//!         .subscribe("chat/general", |msg| println!("<- {}", msg.data))
//!         .await?;
//!     client
//!         .pubsub()
//!         .publish("chat/general", json!({"text": "hello"}))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Connection lifecycle
//!
//! Channels connect lazily on first use and stay up while at least one
//! listener is registered. Unexpected drops trigger reconnection on a
//! fixed, capped delay ladder; active subscriptions are replayed after a
//! successful reconnect. Removing the last listener tears the connection
//! down. [`EventHandlers`] exposes hooks over all of this.

mod ack;
mod backoff;
mod sse;

pub mod auth;
pub mod client;
pub mod error;
pub mod event_handlers;
pub mod models;
pub mod pubsub;
pub mod realtime;
pub mod timeouts;

// Re-export main types for convenience
pub use auth::AuthStore;
pub use client::{LumenLinkClient, LumenLinkClientBuilder};
pub use error::{LumenLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use models::{
    ClientFrame, PubSubMessage, PublishAck, RecordAction, RecordEvent, ServerFrame,
    SubscribeOptions,
};
pub use pubsub::{PubSubChannel, PubSubSubscription};
pub use realtime::{RealtimeChannel, RealtimeSubscription};
pub use timeouts::{LumenLinkTimeouts, LumenLinkTimeoutsBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
