// src/client/mod.rs
//! Key-value client implementation.
//!
//! [`KvClient`] multiplexes any number of concurrent requests and
//! subscriptions over one link owned by the connection driver.
//!
//! # Architecture
//!
//! Each request generates a fresh correlation token and registers a oneshot
//! channel in the pending map before its frame is queued on the link outbox.
//! The driver hands every inbound frame to [`Shared`] (the
//! [`LinkHandler`]), which settles the matching pending entry or fans a push
//! out through the subscription registry.
//!
//! # Concurrency
//!
//! Two `std::sync::Mutex`es, never held across an `.await`:
//!
//! - `core`: the current outbox and the pending map. Installing or clearing
//!   the outbox and purging the pending map happen under one lock, so every
//!   request is either purged or sent on a live link.
//! - `registry`: local subscriptions. Population changes and the matching
//!   server (un)subscribe frame are queued under this lock, so server-side
//!   command order follows local transitions.
//!
//! Lock order is `registry` → `core`.
//!
//! The first subscribe of a key is settled by its own task, so every handler
//! that joined while it was in flight learns the outcome even if the first
//! caller stopped waiting.

mod api;
mod pending;
mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time;

pub use api::{KvClient, SubscriptionHandle};
pub use registry::{Handler, SubscriptionId};

use crate::connection::LinkHandler;
use crate::protocol::encode_request;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Command,
    ConnectionError,
    CorrelationId,
    Inbound,
    KvError,
    Response,
    Result,
    SubscriptionKind,
};
use pending::{Completion, PendingRequests};
use registry::Registry;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Handlers run on their own lanes and never under these locks, so a poisoned
/// lock can only come from a panic in this module's bookkeeping. The worst
/// outcome is a dropped or unmatched response.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Core {
    outbox: Option<mpsc::UnboundedSender<Bytes>>,
    pending: PendingRequests,
}

/// State shared between client handles and the connection driver.
pub(crate) struct Shared {
    // ---
    client_id: String,
    replay_subscriptions: bool,
    core: Mutex<Core>,
    registry: Mutex<Registry>,
    anomalies: AtomicU64,
}

impl Shared {
    // ---

    pub(crate) fn new(client_id: String, replay_subscriptions: bool) -> Self {
        Self {
            client_id,
            replay_subscriptions,
            core: Mutex::new(Core {
                outbox: None,
                pending: PendingRequests::new(),
            }),
            registry: Mutex::new(Registry::new()),
            anomalies: AtomicU64::new(0),
        }
    }

    /// Register and transmit one request.
    ///
    /// Does not wait for the link; fails with
    /// [`ConnectionError::NotReady`] when there is none.
    fn dispatch(&self, command: &Command) -> Result<(CorrelationId, Completion)> {
        // ---
        let correlation_id = CorrelationId::generate();
        let frame = encode_request(command, &correlation_id)?;

        let mut guard = lock_ignore_poison(&self.core);
        let core = &mut *guard;

        let Some(outbox) = core.outbox.as_ref() else {
            return Err(ConnectionError::NotReady.into());
        };

        let completion = core.pending.register(correlation_id.clone(), command.name());

        if outbox.send(frame).is_err() {
            // the link died after install but before the driver noticed
            core.pending.remove(&correlation_id);
            return Err(ConnectionError::Lost.into());
        }

        log_debug!(
            "{}: sent {} ({correlation_id})",
            self.client_id,
            command.name()
        );

        Ok((correlation_id, completion))
    }

    /// Wait for the reply to a dispatched request.
    async fn await_reply(
        &self,
        correlation_id: CorrelationId,
        completion: Completion,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        // ---
        let outcome = match timeout {
            Some(limit) => match time::timeout(limit, completion).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock_ignore_poison(&self.core).pending.remove(&correlation_id);
                    return Err(KvError::Timeout);
                }
            },
            None => completion.await,
        };

        // sender dropped without settling: only happens if the client is torn down
        outcome.unwrap_or(Err(ConnectionError::Lost.into()))
    }

    /// Wait for the answer to the first subscribe of `key` and publish it to
    /// every handler that joined the entry meanwhile.
    ///
    /// A failure drops the entry. After a timeout or a lost link the server
    /// may have applied the subscribe anyway, so it is retracted on whatever
    /// link is current.
    async fn settle_subscribe(
        self: Arc<Self>,
        kind: SubscriptionKind,
        key: String,
        correlation_id: CorrelationId,
        completion: Completion,
        timeout: Option<Duration>,
        settled: watch::Sender<Option<Result<()>>>,
    ) {
        // ---
        let outcome = self
            .await_reply(correlation_id.clone(), completion, timeout)
            .await
            .map(|_| ());

        let mut registry = self.registry();
        let dropped = registry.settle_ack(kind, &key, &correlation_id, outcome.is_ok());

        if let Err(_err) = &outcome {
            log_warn!(
                "{}: subscribe of {key} failed, dropped {dropped} handlers: {_err}",
                self.client_id
            );
        }

        let unknown = matches!(
            outcome,
            Err(KvError::Timeout) | Err(KvError::Connection(ConnectionError::Lost))
        );
        if dropped > 0 && unknown {
            // queued under the registry lock so it precedes any new subscribe
            match self.dispatch(&Command::unsubscribe(kind, key.as_str())) {
                Ok(_) => {
                    log_debug!("{}: retracted subscribe of {key}", self.client_id);
                }
                Err(_err) => {
                    log_debug!("{}: nothing to retract for {key}: {_err}", self.client_id);
                }
            }
        }
        drop(registry);

        let _ = settled.send(Some(outcome));
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock_ignore_poison(&self.registry)
    }

    fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.core).pending.len()
    }

    fn anomaly_count(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    fn anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    /// Await the acknowledgements of replayed subscribe commands.
    fn watch_replay(&self, acks: Vec<(String, CorrelationId, Completion)>) {
        // ---
        let client_id = self.client_id.clone();

        tokio::spawn(async move {
            for (_label, _correlation_id, completion) in acks {
                match completion.await {
                    Ok(Ok(_)) => {
                        log_debug!("{client_id}: resubscribed {_label}");
                    }
                    Ok(Err(_err)) => {
                        log_warn!("{client_id}: resubscribe of {_label} failed: {_err}");
                    }
                    Err(_) => {
                        log_warn!("{client_id}: resubscribe of {_label} abandoned");
                    }
                }
            }
        });
    }
}

impl LinkHandler for Shared {
    // ---

    fn link_up(&self, outbox: mpsc::UnboundedSender<Bytes>) {
        // ---
        let registry = self.registry();

        lock_ignore_poison(&self.core).outbox = Some(outbox);

        if !self.replay_subscriptions {
            return;
        }

        let mut acks = Vec::new();
        for (kind, key) in registry.keys() {
            match self.dispatch(&Command::subscribe(kind, key.as_str())) {
                Ok((correlation_id, completion)) => {
                    acks.push((format!("{kind:?} {key}"), correlation_id, completion))
                }
                Err(_err) => {
                    log_warn!("{}: cannot replay {key}: {_err}", self.client_id);
                }
            }
        }
        drop(registry);

        if !acks.is_empty() {
            log_info!(
                "{}: replaying {} subscriptions",
                self.client_id,
                acks.len()
            );
            self.watch_replay(acks);
        }
    }

    fn inbound(&self, frame: Inbound) {
        // ---
        match frame {
            Inbound::Response(response) => {
                let correlation_id = response.request_id.clone();
                let known = lock_ignore_poison(&self.core)
                    .pending
                    .complete(&correlation_id, response);

                if !known {
                    self.anomaly();
                    log_warn!(
                        "{}: response for unknown request {correlation_id}",
                        self.client_id
                    );
                }
            }

            Inbound::Error {
                request_id: Some(correlation_id),
                message,
            } => {
                let known = lock_ignore_poison(&self.core)
                    .pending
                    .fail_remote(&correlation_id, message);

                if !known {
                    self.anomaly();
                    log_warn!(
                        "{}: error for unknown request {correlation_id}",
                        self.client_id
                    );
                }
            }

            Inbound::Error {
                request_id: None,
                message: _message,
            } => {
                self.anomaly();
                log_warn!("{}: uncorrelated server error: {_message}", self.client_id);
            }

            Inbound::Push(update) => {
                let scheduled = self.registry().dispatch(&update);
                if scheduled == 0 {
                    log_debug!("{}: push for {} had no handlers", self.client_id, update.key);
                }
            }
        }
    }

    fn malformed(&self, _err: KvError) {
        // ---
        self.anomaly();
        log_warn!("{}: dropped inbound frame: {_err}", self.client_id);
    }

    fn link_down(&self) {
        // ---
        let mut core = lock_ignore_poison(&self.core);
        core.outbox = None;
        let _purged = core.pending.fail_all(ConnectionError::Lost);
        drop(core);

        if _purged > 0 {
            log_info!(
                "{}: link lost with {_purged} requests in flight",
                self.client_id
            );
        }
    }

    fn stopped(&self) {
        // ---
        self.link_down();
        self.registry().clear();
    }
}
