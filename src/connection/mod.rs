//! Connection lifecycle.
//!
//! One driver task per client owns the transport link, the authoritative
//! [`ConnectionState`], and the reconnect policy. Everything else talks to it
//! through [`ConnectionManager`]: control messages in, state and events out.
//!
//! ```text
//!        connect / reconnect
//! Closed ───────────────────▶ Connecting ──open ok──▶ Open
//!   ▲                             │                    │
//!   │◀──────── open failed ───────┘                    │
//!   │◀──────── link lost / reconnect / shutdown ───────┘
//!   │
//!   └── backoff (per ReconnectPolicy) ──▶ Connecting
//! ```

mod backoff;
mod driver;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time;

pub use backoff::ReconnectPolicy;

use crate::{ConnectionError, Endpoint, Inbound, KvError, Result, TransportPtr};

/// Coarse connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A link is being opened.
    Connecting,
    /// A link is up; requests can be sent.
    Open,
    /// No link. Initial state, and the state after any close.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why an open link was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport ended the link (server close, network failure).
    TransportClosed,
    /// The inbound stream could not be framed and was abandoned.
    Protocol(String),
    /// [`KvClient::reconnect`](crate::KvClient::reconnect) or a new
    /// `connect` replaced the link.
    Reconnect,
    /// The client was shut down.
    Shutdown,
}

/// Lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Emitted on every state transition.
    StateChanged(ConnectionState),
    /// Emitted exactly once per Open → Closed edge, whatever the cause.
    Closed { reason: CloseReason },
}

/// Requests from client handles to the driver.
pub(crate) enum Control {
    Connect {
        endpoint: Endpoint,
        done: oneshot::Sender<Result<()>>,
    },
    Reconnect {
        done: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Driver callbacks into the layers above the connection.
///
/// All calls come from the driver task, one at a time, in link order:
/// `link_up`, then any number of `inbound`/`malformed`, then `link_down`.
pub(crate) trait LinkHandler: Send + Sync + 'static {
    /// A link was installed. Called before the state becomes Open.
    fn link_up(&self, outbox: mpsc::UnboundedSender<Bytes>);

    /// One parsed inbound frame, in arrival order.
    fn inbound(&self, frame: Inbound);

    /// A frame that could not be parsed.
    fn malformed(&self, err: KvError);

    /// The link is gone. Called before the state becomes Closed.
    fn link_down(&self);

    /// The driver is exiting for good.
    fn stopped(&self);
}

/// Driver settings taken from [`ClientConfig`](crate::ClientConfig).
pub(crate) struct DriverSettings {
    pub client_id: String,
    pub policy: ReconnectPolicy,
    pub max_frame_len: usize,
    pub event_capacity: usize,
}

/// Handle to the connection driver.
///
/// Dropping the last handle stops the driver.
pub(crate) struct ConnectionManager {
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    control: mpsc::UnboundedSender<Control>,
}

impl ConnectionManager {
    // ---

    /// Spawn the driver task. Must be called inside a Tokio runtime.
    pub fn spawn(
        transport: TransportPtr,
        handler: Arc<dyn LinkHandler>,
        settings: DriverSettings,
    ) -> Self {
        // ---
        let (state_tx, state) = watch::channel(ConnectionState::Closed);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();

        let driver = driver::Driver::new(
            transport,
            handler,
            settings,
            state_tx,
            events.clone(),
            control_rx,
        );
        tokio::spawn(driver.run());

        Self {
            state,
            events,
            control,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Settles once the state is Open.
    ///
    /// The watch receiver is registered before the current value is
    /// checked, so an Open transition can never slip between the check and
    /// the wait.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] once the client has shut down.
    pub async fn wait(&self) -> Result<()> {
        // ---
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == ConnectionState::Open)
            .await
            .map(|_| ())
            .map_err(|_| ConnectionError::Closed.into())
    }

    /// [`wait`](Self::wait), bounded.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotReady`] if the state is not Open within `limit`.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<()> {
        // ---
        match time::timeout(limit, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::NotReady.into()),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Record `endpoint` and open a link to it, replacing any current link.
    ///
    /// Returns the outcome of the first attempt; on failure the driver keeps
    /// retrying in the background per the reconnect policy.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        // ---
        let (done, outcome) = oneshot::channel();
        self.send(Control::Connect { endpoint, done })?;
        outcome.await.unwrap_or(Err(ConnectionError::Closed.into()))
    }

    /// Tear down the current link and open a new one to the last endpoint.
    pub async fn reconnect(&self) -> Result<()> {
        // ---
        let (done, outcome) = oneshot::channel();
        self.send(Control::Reconnect { done })?;
        outcome.await.unwrap_or(Err(ConnectionError::Closed.into()))
    }

    /// Stop the driver. Idempotent.
    pub async fn shutdown(&self) {
        // ---
        let (done, stopped) = oneshot::channel();
        if self.send(Control::Shutdown { done }).is_ok() {
            let _ = stopped.await;
        }
    }

    fn send(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| ConnectionError::Closed.into())
    }
}
