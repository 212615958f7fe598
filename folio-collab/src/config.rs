//! Configuration for the client-side transport, awareness throttling and the
//! reference relay. Every struct has a `Default`; override single fields
//! with struct-update syntax.

use std::time::Duration;

/// Transport bridge configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint of the room relay, e.g. `ws://127.0.0.1:9090`.
    pub url: String,
    /// Consecutive failed connection attempts before giving up.
    pub reconnect_attempts: u32,
    /// Delay before the first retry.
    pub reconnect_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt.
    pub backoff_factor: u32,
    /// Upper bound for the retry delay.
    pub max_reconnect_delay: Duration,
    /// Timeout for a single TCP + WebSocket handshake.
    pub connect_timeout: Duration,
    /// Keepalive ping interval while connected.
    pub heartbeat_interval: Duration,
    /// Awareness frames buffered for the socket writer; awareness sent
    /// beyond this is dropped. Other frames are never dropped while connected.
    pub outgoing_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            backoff_factor: 2,
            max_reconnect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            outgoing_buffer: 256,
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based):
    /// `min(reconnect_delay * backoff_factor^attempt, max_reconnect_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1).saturating_pow(attempt);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

/// Session credentials presented during the WebSocket handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Stable user identifier announced when joining rooms.
    pub user_id: String,
    /// Opaque bearer token issued by the authentication service.
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }

    /// Value for the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Awareness store tuning.
#[derive(Debug, Clone, Copy)]
pub struct AwarenessConfig {
    /// Minimum gap between two cursor broadcasts from this client.
    pub cursor_interval: Duration,
    /// Remote entries silent for longer than this are dropped.
    pub idle_timeout: Duration,
    /// How often the local state is re-sent while a room is open, so peers
    /// do not time out a client that is connected but not moving. Keep it
    /// below `idle_timeout`.
    pub renew_interval: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(30),
            renew_interval: Duration::from_secs(15),
        }
    }
}

/// Reference relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Bearer token every client must present; `None` admits anyone.
    pub auth_token: Option<String>,
    /// Broadcast channel capacity per room; a forwarder that falls this far
    /// behind loses frames
    pub broadcast_capacity: usize,
    /// Frames queued per connection before its room forwarders wait
    pub connection_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            auth_token: None,
            broadcast_capacity: 256,
            connection_buffer: 256,
        }
    }
}
