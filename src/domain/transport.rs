// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! A transport knows how to open a raw duplex link to the key-value server.
//! It carries opaque byte deliveries in both directions and nothing more:
//! framing, correlation, subscriptions and reconnection all live above it.
//!
//! Concrete implementations live under `src/transport/`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::Result;

/// A server address.
///
/// Interpretation is transport-specific (`tcp://host:port` for the TCP
/// transport, any label for the memory transport). Addresses are immutable
/// and cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque credential handed to the transport at connect time.
///
/// Its structure is not interpreted by this crate. `Debug` output is
/// redacted so credentials never reach logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self(secret.into())
    }

    /// The raw credential, for transports that must transmit it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Where to connect and with what credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: Address,
    pub credential: Option<Credential>,
}

impl Endpoint {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<Arc<str>>) -> Self {
        self.credential = Some(Credential::new(credential));
        self
    }
}

/// An open duplex link.
///
/// - `outbox` accepts whole outbound frames (without trailing newline). The
///   transport writes them one at a time, so frames never interleave.
/// - `inbox` yields raw deliveries in arrival order. A delivery may contain
///   several newline-terminated frames or only part of one. The inbox ending
///   means the link is gone.
/// - `shutdown` asks the transport to close the link; see [`Link::close`].
pub struct Link {
    pub outbox: mpsc::UnboundedSender<Bytes>,
    pub inbox: mpsc::Receiver<Bytes>,
    pub shutdown: Arc<Notify>,
}

impl Link {
    /// Ask the transport to tear the link down.
    ///
    /// Uses a stored permit, so the request is not lost if the transport
    /// task is busy at the moment of the call.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("outbox_closed", &self.outbox.is_closed())
            .finish_non_exhaustive()
    }
}

/// Transport abstraction.
///
/// Implementations must ensure that:
/// - frames sent on one link's outbox reach the server in send order;
/// - deliveries appear on the inbox in the order the server emitted them;
/// - the inbox ends (returns `None`) once the link is closed for any reason,
///   including [`Link::close`].
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat `open` as a normal
/// `async fn`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Identifier for logging.
    fn transport_id(&self) -> &str;

    /// Open a new link to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the server cannot be
    /// reached.
    async fn open(&self, endpoint: &Endpoint) -> Result<Link>;
}

/// Shared transport pointer.
///
/// `.clone()` only bumps a reference count; the client keeps one for its
/// whole lifetime and calls `open` again on every reconnect.
pub type TransportPtr = Arc<dyn Transport>;
