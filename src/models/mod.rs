//! Data models for the lumen-link client.
//!
//! Wire envelopes for the pub/sub WebSocket protocol and the realtime SSE
//! side-channel, plus the decoded payload types handed to listeners.

pub mod frame;
pub mod message;
pub mod publish_ack;
pub mod realtime_wire;
pub mod record_event;
pub mod subscribe_options;

#[cfg(test)]
mod tests;

pub use frame::{ClientFrame, ServerFrame};
pub use message::PubSubMessage;
pub use publish_ack::PublishAck;
pub use realtime_wire::{ConnectMessage, TopicSubmission};
pub use record_event::{RecordAction, RecordEvent};
pub use subscribe_options::SubscribeOptions;
