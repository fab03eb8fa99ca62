// src/transport/memory/mod.rs

//! In-memory transport and reference server.
//!
//! A pure in-process implementation of the domain-level `Transport` trait,
//! paired with [`MemoryServer`], a key-value server that speaks the wire
//! protocol. Intended for tests, demos, and as a reference for transport
//! semantics.
//!
//! ## Reference Semantics
//!
//! - Frames written to a link reach the server in write order and are
//!   handled one at a time.
//! - Replies and pushes for one link are delivered in the order the server
//!   produced them.
//! - Nothing is dropped due to timing or scheduling. The server queues
//!   deliveries without bound and the link inbox applies backpressure to
//!   that queue only, so the sole losses are the ones a test asks for
//!   (`disconnect_all`).
//!
//! ## Non-Goals
//!
//! Persistence, authentication, and network failure modes beyond an abrupt
//! close are not emulated.

mod server;
mod transport;

pub use server::{MemoryServer, MEMORY_SERVER_VERSION};
pub use transport::create_transport;
