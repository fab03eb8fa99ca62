//! Transport implementations.
//!
//! Concrete implementations of the domain-level `Transport` trait, exposed
//! only through constructor functions. Client code must not depend on
//! transport-specific types beyond their configuration.

mod memory;
mod tcp;

pub use memory::{create_transport as create_memory_transport, MemoryServer, MEMORY_SERVER_VERSION};
pub use tcp::{create_tcp_transport, TcpConfig};
