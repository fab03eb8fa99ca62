//! Multiplexed key-value client over one duplex connection.
//!
//! Many independent callers share a single persistent link to a key-value
//! server: requests are matched to their replies by correlation token, and
//! any number of local handlers per key or prefix share one server-side
//! subscription. Links that drop are reopened with backoff; in-flight
//! requests fail fast and subscriptions are replayed on the new link.
//!
//! # Example
//!
//! ```
//! use kvmux::{create_memory_transport, Endpoint, KvClient, ClientConfig, MemoryServer};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> kvmux::Result<()> {
//! let server = MemoryServer::new();
//! let client = KvClient::new(create_memory_transport(server.clone()), ClientConfig::default());
//! client.connect(Endpoint::new("memory")).await?;
//!
//! let sub = client
//!     .subscribe_key("cfg/foo", |update| println!("{} = {:?}", update.key, update.value))
//!     .await?;
//!
//! client.put("cfg/foo", "42").await?;
//! sub.unsubscribe().await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod builder;
mod client;
mod config;
mod connection;
mod correlation;
mod domain;
mod error;
mod macros;
mod transport;

pub mod protocol;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use builder::KvClientBuilder;
pub use client::{Handler, KvClient, SubscriptionHandle, SubscriptionId};
pub use config::ClientConfig;
pub use connection::{CloseReason, ConnectionEvent, ConnectionState, ReconnectPolicy};

pub use correlation::CorrelationId;
pub use error::{ConnectionError, KvError, Result};

pub use protocol::{Command, FrameBuffer, Inbound, KeyUpdate, Response, SubscriptionKind};

pub use transport::{
    //
    create_memory_transport,
    create_tcp_transport,
    MemoryServer,
    TcpConfig,
    MEMORY_SERVER_VERSION,
};

// --- public re-exports
pub use domain::{
    //
    Address,
    Credential,
    Endpoint,
    Link,
    Transport,
    TransportPtr,
};
