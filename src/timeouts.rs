//! Timeout configuration for Lumen client operations.
//!
//! Centralizes the bounded waits used by the HTTP client and both
//! long-lived channels.

use std::time::Duration;

/// Timeout configuration for lumen-link operations.
///
/// All values have sensible defaults; construct custom configurations with
/// the builder.
///
/// # Examples
///
/// ```rust
/// use lumen_link::LumenLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults (recommended for most cases)
/// let timeouts = LumenLinkTimeouts::default();
///
/// // Custom ack wait for a slow broker
/// let timeouts = LumenLinkTimeouts::builder()
///     .ack_timeout(Duration::from_secs(30))
///     .build();
///
/// // Aggressive timeouts for local development
/// let timeouts = LumenLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone)]
pub struct LumenLinkTimeouts {
    /// Ceiling for establishing a channel connection, covering the transport
    /// handshake and the wait for the server's ready/connect event.
    /// Default: 15 seconds
    pub connection_timeout: Duration,

    /// How long a correlated control request (publish, subscribe, ping)
    /// waits for its acknowledgement frame.
    /// Default: 10 seconds
    pub ack_timeout: Duration,

    /// Timeout for plain HTTP requests (topic submission POST).
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// Keep-alive ping interval for the pub/sub WebSocket.
    /// Set to zero to disable keep-alive pings.
    /// Default: 30 seconds
    pub keepalive_interval: Duration,

    /// After a keep-alive ping, how long to wait for any inbound frame
    /// before treating the connection as dead. Zero disables the check.
    /// Default: 10 seconds
    pub pong_timeout: Duration,
}

impl Default for LumenLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl LumenLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> LumenLinkTimeoutsBuilder {
        LumenLinkTimeoutsBuilder::new()
    }

    /// Timeouts suited to localhost development and tests.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::ZERO,
            pong_timeout: Duration::ZERO,
        }
    }

    /// Timeouts suited to high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(15),
        }
    }

    /// A zero duration means "disabled" for optional waits.
    pub fn is_disabled(value: Duration) -> bool {
        value.is_zero()
    }
}

/// Builder for [`LumenLinkTimeouts`].
#[derive(Debug, Default)]
pub struct LumenLinkTimeoutsBuilder {
    inner: Option<LumenLinkTimeouts>,
}

impl LumenLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            inner: Some(LumenLinkTimeouts::default()),
        }
    }

    fn edit(mut self, f: impl FnOnce(&mut LumenLinkTimeouts)) -> Self {
        let mut inner = self.inner.take().unwrap_or_default();
        f(&mut inner);
        self.inner = Some(inner);
        self
    }

    /// Set the connection-establishment ceiling.
    pub fn connection_timeout(self, value: Duration) -> Self {
        self.edit(|t| t.connection_timeout = value)
    }

    /// Set the acknowledgement wait.
    pub fn ack_timeout(self, value: Duration) -> Self {
        self.edit(|t| t.ack_timeout = value)
    }

    /// Set the HTTP request timeout.
    pub fn request_timeout(self, value: Duration) -> Self {
        self.edit(|t| t.request_timeout = value)
    }

    /// Set the keep-alive ping interval (zero disables).
    pub fn keepalive_interval(self, value: Duration) -> Self {
        self.edit(|t| t.keepalive_interval = value)
    }

    /// Set the pong wait after a keep-alive ping (zero disables).
    pub fn pong_timeout(self, value: Duration) -> Self {
        self.edit(|t| t.pong_timeout = value)
    }

    /// Finish the configuration.
    pub fn build(self) -> LumenLinkTimeouts {
        self.inner.unwrap_or_default()
    }
}
