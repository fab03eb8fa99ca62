//! Ref-counted subscription registry.
//!
//! One entry per subscribed key (exact) or prefix, each holding the local
//! handlers in registration order. The registry only tracks population; the
//! caller decides what to send to the server from the transitions it
//! reports ([`Added::first`], [`Removal::Emptied`]).
//!
//! Until the server acknowledges an entry's first subscribe, the entry keeps
//! a watch on that acknowledgement. Handlers that join meanwhile wait on the
//! same watch, and a failed acknowledgement drops all of them together.
//!
//! Every entry owns a **delivery lane**: a task fed by an unbounded channel
//! that runs the entry's handlers for each push, in push order. A slow
//! handler therefore only holds up later pushes for its own key or prefix.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::{
    //
    log_debug,
    log_error,
    CorrelationId,
    KeyUpdate,
    Result,
    SubscriptionKind,
};

/// Callback invoked for every matching push.
pub type Handler = Arc<dyn Fn(&KeyUpdate) + Send + Sync>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of an entry's first server subscribe; `None` while in flight.
pub(crate) type AckWatch = watch::Receiver<Option<Result<()>>>;

/// Result of [`Registry::add`].
#[derive(Debug)]
pub(crate) struct Added {
    pub id: SubscriptionId,
    /// The entry did not exist before (refcount 0 → 1).
    pub first: bool,
    /// The entry's server subscribe is still unacknowledged.
    pub ack: Option<AckWatch>,
}

/// Result of [`Registry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    NotFound,
    /// Removed; this many handlers remain.
    Remaining(usize),
    /// Removed the last handler; the entry is gone (refcount 1 → 0).
    Emptied,
}

struct Delivery {
    update: KeyUpdate,
    handlers: Vec<Handler>,
}

struct Entry {
    handlers: Vec<(SubscriptionId, Handler)>,
    lane: mpsc::UnboundedSender<Delivery>,
    ack: Option<(CorrelationId, AckWatch)>,
}

impl Entry {
    fn spawn(label: String) -> Self {
        // ---
        let (lane, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_lane(rx, label));
        Self {
            handlers: Vec::new(),
            lane,
            ack: None,
        }
    }

    fn deliver(&self, update: &KeyUpdate) -> usize {
        // ---
        let handlers: Vec<Handler> = self.handlers.iter().map(|(_, h)| Arc::clone(h)).collect();
        let count = handlers.len();

        let delivery = Delivery {
            update: update.clone(),
            handlers,
        };
        match self.lane.send(delivery) {
            Ok(()) => count,
            Err(_) => 0,
        }
    }
}

async fn run_lane(mut rx: mpsc::UnboundedReceiver<Delivery>, label: String) {
    // ---
    while let Some(Delivery { update, handlers }) = rx.recv().await {
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&update))).is_err() {
                log_error!("subscription handler on {label} panicked for key {}", update.key);
            }
        }
    }

    log_debug!("delivery lane for {label} closed");
}

/// Local subscriptions, exact and prefix.
///
/// Must be used inside a Tokio runtime: creating an entry spawns its lane.
pub(crate) struct Registry {
    // ---
    exact: HashMap<String, Entry>,
    prefixes: BTreeMap<String, Entry>,
    next_id: u64,
}

impl Registry {
    // ---

    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Append `handler` to the entry for `key`, creating the entry.
    pub fn add(&mut self, kind: SubscriptionKind, key: &str, handler: Handler) -> Added {
        // ---
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        let label = || match kind {
            SubscriptionKind::Exact => key.to_string(),
            SubscriptionKind::Prefix => format!("{key}*"),
        };

        let entry = match kind {
            SubscriptionKind::Exact => self
                .exact
                .entry(key.to_string())
                .or_insert_with(|| Entry::spawn(label())),
            SubscriptionKind::Prefix => self
                .prefixes
                .entry(key.to_string())
                .or_insert_with(|| Entry::spawn(label())),
        };

        let first = entry.handlers.is_empty();
        entry.handlers.push((id, handler));
        let ack = entry.ack.as_ref().map(|(_, ack)| ack.clone());

        Added { id, first, ack }
    }

    /// Record that the subscribe `request` for `key` awaits its answer.
    pub fn await_ack(&mut self, kind: SubscriptionKind, key: &str, request: CorrelationId, ack: AckWatch) {
        if let Some(entry) = self.entry_mut(kind, key) {
            entry.ack = Some((request, ack));
        }
    }

    /// Settle the pending acknowledgement `request` of `key`.
    ///
    /// A refused acknowledgement drops the entry with every handler in it.
    /// Returns how many handlers were dropped. An entry that was emptied and
    /// re-created since `request` went out is left alone.
    pub fn settle_ack(
        &mut self,
        kind: SubscriptionKind,
        key: &str,
        request: &CorrelationId,
        acknowledged: bool,
    ) -> usize {
        // ---
        let Some(entry) = self.entry_mut(kind, key) else {
            return 0;
        };
        if entry.ack.as_ref().map(|(id, _)| id) != Some(request) {
            return 0;
        }

        entry.ack = None;
        if acknowledged {
            return 0;
        }

        let dropped = entry.handlers.len();
        match kind {
            SubscriptionKind::Exact => self.exact.remove(key),
            SubscriptionKind::Prefix => self.prefixes.remove(key),
        };
        dropped
    }

    fn entry_mut(&mut self, kind: SubscriptionKind, key: &str) -> Option<&mut Entry> {
        match kind {
            SubscriptionKind::Exact => self.exact.get_mut(key),
            SubscriptionKind::Prefix => self.prefixes.get_mut(key),
        }
    }

    /// Remove exactly the handler registered as `id` under `key`.
    pub fn remove(&mut self, kind: SubscriptionKind, key: &str, id: SubscriptionId) -> Removal {
        // ---
        let entries_len = |entry: &mut Entry| {
            let before = entry.handlers.len();
            entry.handlers.retain(|(handler_id, _)| *handler_id != id);
            (before != entry.handlers.len(), entry.handlers.len())
        };

        let (removed, remaining) = match self.entry_mut(kind, key) {
            Some(entry) => entries_len(entry),
            None => return Removal::NotFound,
        };

        if !removed {
            return Removal::NotFound;
        }
        if remaining > 0 {
            return Removal::Remaining(remaining);
        }

        // dropping the entry closes its lane once queued deliveries drain
        match kind {
            SubscriptionKind::Exact => self.exact.remove(key),
            SubscriptionKind::Prefix => self.prefixes.remove(key),
        };
        Removal::Emptied
    }

    /// Queue `update` on every matching lane: the exact entry for its key,
    /// then every prefix entry whose prefix starts the key.
    ///
    /// Returns how many handlers were scheduled.
    pub fn dispatch(&self, update: &KeyUpdate) -> usize {
        // ---
        let mut scheduled = 0;

        if let Some(entry) = self.exact.get(&update.key) {
            scheduled += entry.deliver(update);
        }

        // a prefix of the key sorts at or before the key
        let upto = (Bound::Unbounded, Bound::Included(update.key.as_str()));
        for (prefix, entry) in self.prefixes.range::<str, _>(upto) {
            if update.key.starts_with(prefix.as_str()) {
                scheduled += entry.deliver(update);
            }
        }

        scheduled
    }

    /// Every subscribed key and prefix, for replay after a reconnect.
    pub fn keys(&self) -> Vec<(SubscriptionKind, String)> {
        // ---
        let exact = self
            .exact
            .keys()
            .map(|key| (SubscriptionKind::Exact, key.clone()));
        let prefixes = self
            .prefixes
            .keys()
            .map(|prefix| (SubscriptionKind::Prefix, prefix.clone()));

        exact.chain(prefixes).collect()
    }

    /// Handlers registered under `key`.
    pub fn handler_count(&self, kind: SubscriptionKind, key: &str) -> usize {
        // ---
        let entry = match kind {
            SubscriptionKind::Exact => self.exact.get(key),
            SubscriptionKind::Prefix => self.prefixes.get(key),
        };
        entry.map_or(0, |entry| entry.handlers.len())
    }

    /// Handlers registered across all entries.
    pub fn len(&self) -> usize {
        // ---
        self.exact
            .values()
            .chain(self.prefixes.values())
            .map(|entry| entry.handlers.len())
            .sum()
    }

    pub fn clear(&mut self) {
        self.exact.clear();
        self.prefixes.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<String>>>;

    fn recorder(tag: &'static str, seen: &Seen) -> Handler {
        let seen = Arc::clone(seen);
        Arc::new(move |update: &KeyUpdate| {
            seen.lock()
                .unwrap()
                .push(format!("{tag}:{}={}", update.key, update.value.as_deref().unwrap_or("-")));
        })
    }

    fn update(key: &str, value: &str) -> KeyUpdate {
        KeyUpdate {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_refcount_transitions() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();

        let a = registry.add(SubscriptionKind::Exact, "cfg/foo", recorder("a", &seen));
        let b = registry.add(SubscriptionKind::Exact, "cfg/foo", recorder("b", &seen));
        assert!(a.first);
        assert!(!b.first);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.handler_count(SubscriptionKind::Exact, "cfg/foo"), 2);

        assert_eq!(registry.remove(SubscriptionKind::Exact, "cfg/foo", a.id), Removal::Remaining(1));
        assert_eq!(registry.remove(SubscriptionKind::Exact, "cfg/foo", a.id), Removal::NotFound);
        assert_eq!(registry.remove(SubscriptionKind::Exact, "cfg/foo", b.id), Removal::Emptied);
        assert_eq!(registry.remove(SubscriptionKind::Exact, "cfg/foo", b.id), Removal::NotFound);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_kinds_are_separate() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();

        let exact = registry.add(SubscriptionKind::Exact, "a/", recorder("e", &seen));
        let prefix = registry.add(SubscriptionKind::Prefix, "a/", recorder("p", &seen));
        assert!(exact.first);
        assert!(prefix.first);

        assert_eq!(registry.remove(SubscriptionKind::Prefix, "a/", exact.id), Removal::NotFound);
        assert_eq!(registry.keys().len(), 2);
    }

    #[tokio::test]
    async fn test_prefix_matching() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();

        registry.add(SubscriptionKind::Prefix, "a/", recorder("a/", &seen));
        registry.add(SubscriptionKind::Prefix, "a/b/", recorder("a/b/", &seen));
        registry.add(SubscriptionKind::Exact, "a/b", recorder("exact", &seen));
        registry.add(SubscriptionKind::Prefix, "b/", recorder("b/", &seen));

        assert_eq!(registry.dispatch(&update("a/b", "1")), 2);
        settle().await;

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a/:a/b=1".to_string(), "exact:a/b=1".to_string()]);
    }

    #[tokio::test]
    async fn test_registration_order_and_push_order() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();

        registry.add(SubscriptionKind::Exact, "k", recorder("first", &seen));
        registry.add(SubscriptionKind::Exact, "k", recorder("second", &seen));

        registry.dispatch(&update("k", "1"));
        registry.dispatch(&update("k", "2"));
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:k=1", "second:k=1", "first:k=2", "second:k=2"]
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_block_others() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();

        registry.add(SubscriptionKind::Exact, "k", Arc::new(|_: &KeyUpdate| panic!("boom")));
        registry.add(SubscriptionKind::Exact, "k", recorder("after", &seen));

        registry.dispatch(&update("k", "1"));
        registry.dispatch(&update("k", "2"));
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["after:k=1", "after:k=2"]);
    }

    #[tokio::test]
    async fn test_refused_ack_drops_joined_handlers() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();
        let request = CorrelationId::generate();
        let (_settled, ack) = watch::channel(None);

        let first = registry.add(SubscriptionKind::Exact, "k", recorder("first", &seen));
        assert!(first.ack.is_none());
        registry.await_ack(SubscriptionKind::Exact, "k", request.clone(), ack);

        let joiner = registry.add(SubscriptionKind::Exact, "k", recorder("joiner", &seen));
        assert!(!joiner.first);
        assert!(joiner.ack.is_some());

        let stale = CorrelationId::generate();
        assert_eq!(registry.settle_ack(SubscriptionKind::Exact, "k", &stale, false), 0);
        assert_eq!(registry.handler_count(SubscriptionKind::Exact, "k"), 2);

        assert_eq!(registry.settle_ack(SubscriptionKind::Exact, "k", &request, false), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.add(SubscriptionKind::Exact, "k", recorder("next", &seen)).first);
    }

    #[tokio::test]
    async fn test_accepted_ack_keeps_entry() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();
        let request = CorrelationId::generate();
        let (_settled, ack) = watch::channel(None);

        registry.add(SubscriptionKind::Prefix, "p/", recorder("first", &seen));
        registry.await_ack(SubscriptionKind::Prefix, "p/", request.clone(), ack);
        assert_eq!(registry.settle_ack(SubscriptionKind::Prefix, "p/", &request, true), 0);

        let later = registry.add(SubscriptionKind::Prefix, "p/", recorder("later", &seen));
        assert!(later.ack.is_none());
        assert_eq!(registry.handler_count(SubscriptionKind::Prefix, "p/"), 2);
    }

    #[tokio::test]
    async fn test_removed_handler_misses_later_pushes() {
        // ---
        let seen = Seen::default();
        let mut registry = Registry::new();

        let added = registry.add(SubscriptionKind::Exact, "k", recorder("h", &seen));
        registry.dispatch(&update("k", "1"));
        registry.remove(SubscriptionKind::Exact, "k", added.id);
        assert_eq!(registry.dispatch(&update("k", "2")), 0);
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["h:k=1"]);
    }
}
