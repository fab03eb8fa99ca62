use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::{ConnectionError, CorrelationId, KvError, Response, Result};

/// Receiving half of a pending request's completion.
pub(crate) type Completion = oneshot::Receiver<Result<Response>>;

struct PendingEntry {
    command: &'static str,
    tx: oneshot::Sender<Result<Response>>,
}

/// Tracks requests waiting for a correlated reply.
///
/// Maps correlation tokens to oneshot channels. Every entry leaves the map
/// exactly once: through `complete`, `fail_remote`, `remove` or `fail_all`.
/// A caller that already gave up (dropped its receiver) is not an error; the
/// entry is simply discarded.
pub(crate) struct PendingRequests {
    // ---
    requests: HashMap<CorrelationId, PendingEntry>,
}

impl PendingRequests {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            requests: HashMap::new(),
        }
    }

    /// Register a new pending request for `command`.
    ///
    /// Tokens come from [`CorrelationId::generate`], so a collision with an
    /// in-flight entry would mean a broken generator; the older entry is
    /// failed rather than silently orphaned.
    pub fn register(&mut self, correlation_id: CorrelationId, command: &'static str) -> Completion {
        // ---
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self
            .requests
            .insert(correlation_id, PendingEntry { command, tx })
        {
            let _ = stale.tx.send(Err(KvError::Protocol(format!(
                "{}: correlation token reused",
                stale.command
            ))));
        }
        rx
    }

    /// Settle a pending request with its response.
    ///
    /// Returns false if the token is not pending.
    pub fn complete(&mut self, correlation_id: &CorrelationId, response: Response) -> bool {
        // ---
        match self.requests.remove(correlation_id) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Settle a pending request with the server's `ok: false` message.
    ///
    /// Returns false if the token is not pending.
    pub fn fail_remote(&mut self, correlation_id: &CorrelationId, message: String) -> bool {
        // ---
        match self.requests.remove(correlation_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(KvError::Remote {
                    command: entry.command.to_string(),
                    message,
                }));
                true
            }
            None => false,
        }
    }

    /// Remove a pending request without settling it.
    ///
    /// Used for timeout cleanup.
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        self.requests.remove(correlation_id).is_some()
    }

    /// Settle every pending request with `err`. Returns how many there were.
    pub fn fail_all(&mut self, err: ConnectionError) -> usize {
        // ---
        let count = self.requests.len();
        for (_, entry) in self.requests.drain() {
            let _ = entry.tx.send(Err(err.clone().into()));
        }
        count
    }

    #[cfg(test)]
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.requests.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
