//! Client configuration.
//!
//! Transport-independent: the endpoint and credential are supplied at
//! connect time, not here.

use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::ReconnectPolicy;

/// Settings for a [`KvClient`](crate::KvClient).
///
/// # Example
///
/// ```
/// use kvmux::{ClientConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let config = ClientConfig::new("dashboard")
///     .with_request_timeout(Duration::from_secs(5))
///     .with_reconnect(ReconnectPolicy {
///         max_attempts: Some(10),
///         ..ReconnectPolicy::default()
///     });
/// assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // ---
    /// Identifier used in log lines.
    pub client_id: String,

    /// Upper bound on waiting for a reply once a request is sent.
    ///
    /// Default: none. Requests then only fail when the server answers or
    /// the connection drops.
    pub request_timeout: Option<Duration>,

    /// How long a request waits for the connection to become Open before
    /// failing with [`ConnectionError::NotReady`](crate::ConnectionError::NotReady).
    ///
    /// Default: 10 seconds
    pub ready_timeout: Duration,

    /// Automatic reconnection after link loss.
    pub reconnect: ReconnectPolicy,

    /// Reissue one subscribe command per registered key and prefix whenever
    /// a new link opens.
    ///
    /// Default: true
    pub replay_subscriptions: bool,

    /// Capacity of the lifecycle event channel. Slow event receivers skip
    /// ahead rather than block the connection.
    ///
    /// Default: 64
    pub event_capacity: usize,

    /// Largest inbound frame accepted.
    ///
    /// Default: 16 MiB
    pub max_frame_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("kvmux")
    }
}

impl ClientConfig {
    // ---

    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            request_timeout: None,
            ready_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            replay_subscriptions: true,
            event_capacity: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_replay_subscriptions(mut self, replay: bool) -> Self {
        self.replay_subscriptions = replay;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}
