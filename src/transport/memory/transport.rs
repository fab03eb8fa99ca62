// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! Every `open` attaches a new link to the shared [`MemoryServer`] and spawns
//! two tasks. One feeds the link's outbound frames to the server; it is the
//! only writer for its link, so frames are handled strictly in order. The
//! other moves the server's deliveries into the bounded link inbox, waiting
//! for room instead of dropping anything.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use super::MemoryServer;
use crate::{
    // ---
    log_debug,
    ConnectionError,
    Endpoint,
    Link,
    Result,
    Transport,
    TransportPtr,
};

const INBOX_CAPACITY: usize = 1024;

/// In-memory transport.
///
/// ## Semantics
///
/// - The endpoint address is only used in log lines; every link goes to the
///   same server.
/// - The credential is recorded by the server (see
///   [`MemoryServer::last_credential`]).
/// - Opening fails while the server refuses connections.
struct MemoryTransport {
    // ---
    server: Arc<MemoryServer>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---

    fn transport_id(&self) -> &str {
        "memory"
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Link> {
        // ---
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (deliveries, deliveries_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let shutdown = Arc::new(Notify::new());
        let kill = Arc::new(Notify::new());

        let credential = endpoint
            .credential
            .as_ref()
            .map(|credential| credential.expose().to_string());

        let link_id = self
            .server
            .attach(credential, deliveries, Arc::clone(&kill))
            .ok_or_else(|| ConnectionError::Open(format!("{}: connection refused", endpoint.address)))?;

        tokio::spawn(forward_deliveries(deliveries_rx, inbox_tx));

        tokio::spawn(serve_link(
            Arc::clone(&self.server),
            link_id,
            outbox_rx,
            Arc::clone(&shutdown),
            kill,
        ));

        Ok(Link {
            outbox,
            inbox,
            shutdown,
        })
    }
}

/// Feed one link's outbound frames to the server until either side closes.
async fn serve_link(
    server: Arc<MemoryServer>,
    link_id: u64,
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
    shutdown: Arc<Notify>,
    kill: Arc<Notify>,
) {
    // ---
    loop {
        tokio::select! {
            frame = outbox.recv() => match frame {
                Some(frame) => server.handle_frame(link_id, &frame),
                None => break,
            },
            _ = shutdown.notified() => break,
            _ = kill.notified() => break,
        }
    }

    log_debug!("memory transport: link {link_id} finished");
    server.detach(link_id);
}

/// Move server deliveries into the link inbox in order.
///
/// Ends once the server detaches the link and its queue drains, which
/// closes the inbox.
async fn forward_deliveries(mut deliveries: mpsc::UnboundedReceiver<Bytes>, inbox: mpsc::Sender<Bytes>) {
    // ---
    while let Some(bytes) = deliveries.recv().await {
        if inbox.send(bytes).await.is_err() {
            break;
        }
    }
}

/// Create an in-memory transport bound to `server`.
pub fn create_transport(server: Arc<MemoryServer>) -> TransportPtr {
    Arc::new(MemoryTransport { server })
}
