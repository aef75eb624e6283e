//! Pending-acknowledgement registry for the pub/sub channel.
//!
//! Every outbound control frame (publish, subscribe, unsubscribe, ping)
//! carries a locally generated request id. The registry maps that id to the
//! completion slot of the blocked caller plus the timer that bounds the
//! wait. Entries leave the map in exactly one of three ways: a matching
//! acknowledgement or error frame arrives, the timeout fires, or the
//! connection is torn down and everything pending is rejected at once.

use crate::error::{LumenLinkError, Result};
use crate::models::ServerFrame;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One blocked caller waiting for a correlated server response.
struct PendingAck {
    reply: oneshot::Sender<Result<ServerFrame>>,
    /// Timer task that posts an ack-timeout command back to the channel
    /// task. Aborted when the entry resolves or is rejected first.
    timeout: Option<JoinHandle<()>>,
}

/// Request-id → pending-completion map.
///
/// Owned exclusively by a channel's background task; never shared.
#[derive(Default)]
pub(crate) struct AckRegistry {
    pending: HashMap<String, PendingAck>,
}

impl AckRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Register a pending entry for `request_id`.
    ///
    /// `timeout` is the handle of the timer task bounding this wait; it is
    /// aborted as soon as the entry completes by any other path.
    pub(crate) fn register(
        &mut self,
        request_id: String,
        reply: oneshot::Sender<Result<ServerFrame>>,
        timeout: Option<JoinHandle<()>>,
    ) {
        if let Some(stale) = self
            .pending
            .insert(request_id.clone(), PendingAck { reply, timeout })
        {
            // A colliding id should not happen with generated ids; fail the
            // stale waiter rather than leaving it hanging.
            log::warn!("[lumen-link] duplicate pending request id {}", request_id);
            stale.abort_timer();
            let _ = stale
                .reply
                .send(Err(LumenLinkError::InternalError(format!(
                    "request id {} was reused",
                    request_id
                ))));
        }
    }

    /// Complete the entry for `request_id` with the decoded frame.
    ///
    /// Returns `false` when no such entry exists (e.g. the ack arrived after
    /// its timeout, or it belongs to a replayed subscribe that never waited).
    pub(crate) fn resolve(&mut self, request_id: &str, frame: ServerFrame) -> bool {
        match self.pending.remove(request_id) {
            Some(entry) => {
                entry.abort_timer();
                let _ = entry.reply.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Fail the entry for `request_id`.
    pub(crate) fn reject(&mut self, request_id: &str, error: LumenLinkError) -> bool {
        match self.pending.remove(request_id) {
            Some(entry) => {
                entry.abort_timer();
                let _ = entry.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending entry; used on manual disconnect and on transport
    /// loss so no caller is left hanging.
    pub(crate) fn reject_all(&mut self, error: impl Fn() -> LumenLinkError) {
        for (_, entry) in self.pending.drain() {
            entry.abort_timer();
            let _ = entry.reply.send(Err(error()));
        }
    }
}

impl PendingAck {
    fn abort_timer(&self) {
        if let Some(handle) = &self.timeout {
            handle.abort();
        }
    }
}
