// src/transport/memory/server.rs

//! In-process key-value server.
//!
//! Speaks the same newline-delimited JSON protocol as a real server, so the
//! whole client stack (framing, correlation, subscriptions, reconnect) runs
//! unchanged against it. Besides the store it offers controls for tests:
//! dropping every link, holding and releasing responses, injecting raw
//! bytes, failing commands, and refusing new connections.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::client::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_warn,
    Command,
    CorrelationId,
    Inbound,
    KeyUpdate,
    Response,
    SubscriptionKind,
};

/// Reported by `kversion` unless overridden.
pub const MEMORY_SERVER_VERSION: &str = "kvmux-memory/1";

/// In-memory key-value server.
///
/// Cheap to share: hand `Arc<MemoryServer>` to
/// [`create_memory_transport`](crate::create_memory_transport) and keep a
/// clone to drive and inspect it.
pub struct MemoryServer {
    // ---
    version: String,
    state: Mutex<ServerState>,
}

#[derive(Default)]
struct ServerState {
    store: BTreeMap<String, String>,
    links: HashMap<u64, ServerLink>,
    next_link_id: u64,
    connections_opened: usize,

    hold_responses: bool,
    held: Vec<(u64, Bytes)>,
    refuse_connections: bool,
    failures: HashMap<String, String>,

    received: Vec<(String, Option<CorrelationId>)>,
    last_credential: Option<String>,
}

struct ServerLink {
    inbox: mpsc::UnboundedSender<Bytes>,
    kill: Arc<Notify>,
    keys: HashSet<String>,
    prefixes: HashSet<String>,
}

impl ServerLink {
    fn watches(&self, key: &str) -> bool {
        self.keys.contains(key) || self.prefixes.iter().any(|prefix| key.starts_with(prefix.as_str()))
    }

    fn deliver(&self, bytes: Bytes) {
        if self.inbox.send(bytes).is_err() {
            log_debug!("memory server: link closed, delivery dropped");
        }
    }
}

/// Terminate one frame for the wire.
fn line(frame: &Inbound) -> Option<Bytes> {
    // ---
    match frame.encode() {
        Ok(bytes) => {
            let mut line = BytesMut::with_capacity(bytes.len() + 1);
            line.put_slice(&bytes);
            line.put_u8(b'\n');
            Some(line.freeze())
        }
        Err(_err) => {
            log_warn!("memory server: cannot encode frame: {_err}");
            None
        }
    }
}

impl MemoryServer {
    // ---

    pub fn new() -> Arc<Self> {
        Self::with_version(MEMORY_SERVER_VERSION)
    }

    pub fn with_version(version: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            version: version.into(),
            state: Mutex::new(ServerState::default()),
        })
    }

    // --- store

    /// Set `key` as if another client had written it; subscribers are
    /// notified.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        // ---
        let key = key.into();
        let value = value.into();

        let mut state = lock_ignore_poison(&self.state);
        state.store.insert(key.clone(), value.clone());
        state.push(KeyUpdate {
            key,
            value: Some(value),
        });
    }

    /// Delete `key` as if another client had; subscribers are notified.
    pub fn remove(&self, key: &str) -> bool {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let existed = state.store.remove(key).is_some();
        if existed {
            state.push(KeyUpdate {
                key: key.to_string(),
                value: None,
            });
        }
        existed
    }

    pub fn value(&self, key: &str) -> Option<String> {
        lock_ignore_poison(&self.state).store.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.state).store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- observation

    /// Frames received with command name `command`, including failed ones.
    pub fn command_count(&self, command: &str) -> usize {
        // ---
        lock_ignore_poison(&self.state)
            .received
            .iter()
            .filter(|(name, _)| name == command)
            .count()
    }

    /// Correlation tokens of every `command` frame received, in order.
    pub fn request_ids(&self, command: &str) -> Vec<CorrelationId> {
        // ---
        lock_ignore_poison(&self.state)
            .received
            .iter()
            .filter(|(name, _)| name == command)
            .filter_map(|(_, id)| id.clone())
            .collect()
    }

    /// Links currently open.
    pub fn connection_count(&self) -> usize {
        lock_ignore_poison(&self.state).links.len()
    }

    /// Links opened since the server was created.
    pub fn connections_opened(&self) -> usize {
        lock_ignore_poison(&self.state).connections_opened
    }

    /// Open links subscribed to `key` (exact) or `prefix`.
    pub fn subscriber_count(&self, kind: SubscriptionKind, key: &str) -> usize {
        // ---
        let state = lock_ignore_poison(&self.state);
        state
            .links
            .values()
            .filter(|link| match kind {
                SubscriptionKind::Exact => link.keys.contains(key),
                SubscriptionKind::Prefix => link.prefixes.contains(key),
            })
            .count()
    }

    /// Credential presented by the most recent connection.
    pub fn last_credential(&self) -> Option<String> {
        lock_ignore_poison(&self.state).last_credential.clone()
    }

    // --- fault injection

    /// Drop every open link, as a server restart would.
    pub fn disconnect_all(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        for (_, link) in state.links.drain() {
            link.kill.notify_one();
        }
        state.held.clear();
    }

    /// While set, responses and errors are queued instead of sent. Pushes are
    /// not affected.
    pub fn set_hold_responses(&self, hold: bool) {
        lock_ignore_poison(&self.state).hold_responses = hold;
    }

    /// Responses currently held.
    pub fn held_count(&self) -> usize {
        lock_ignore_poison(&self.state).held.len()
    }

    /// Send every held response. Responses for one link go out as a single
    /// delivery, so the client sees several frames in one read.
    pub fn release_held(&self) {
        self.release(false);
    }

    /// [`release_held`](Self::release_held), newest first.
    pub fn release_held_reversed(&self) {
        self.release(true);
    }

    fn release(&self, reversed: bool) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let mut held = std::mem::take(&mut state.held);
        if reversed {
            held.reverse();
        }

        let mut batches: BTreeMap<u64, BytesMut> = BTreeMap::new();
        for (link_id, frame) in held {
            batches.entry(link_id).or_default().put_slice(&frame);
        }

        for (link_id, batch) in batches {
            if let Some(link) = state.links.get(&link_id) {
                link.deliver(batch.freeze());
            }
        }
    }

    /// Deliver raw bytes to every open link.
    pub fn inject(&self, bytes: impl Into<Bytes>) {
        // ---
        let bytes = bytes.into();
        let state = lock_ignore_poison(&self.state);
        for link in state.links.values() {
            link.deliver(bytes.clone());
        }
    }

    /// Answer every later `command` frame with `ok: false` and `message`.
    pub fn fail_command(&self, command: impl Into<String>, message: impl Into<String>) {
        lock_ignore_poison(&self.state)
            .failures
            .insert(command.into(), message.into());
    }

    pub fn clear_failures(&self) {
        lock_ignore_poison(&self.state).failures.clear();
    }

    /// While set, new links fail to open.
    pub fn refuse_connections(&self, refuse: bool) {
        lock_ignore_poison(&self.state).refuse_connections = refuse;
    }

    // --- link plumbing (used by the memory transport)

    /// Register a new link. `None` when connections are refused.
    pub(super) fn attach(
        &self,
        credential: Option<String>,
        inbox: mpsc::UnboundedSender<Bytes>,
        kill: Arc<Notify>,
    ) -> Option<u64> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.refuse_connections {
            return None;
        }

        state.next_link_id += 1;
        state.connections_opened += 1;
        state.last_credential = credential;

        let link_id = state.next_link_id;
        state.links.insert(
            link_id,
            ServerLink {
                inbox,
                kill,
                keys: HashSet::new(),
                prefixes: HashSet::new(),
            },
        );

        log_debug!("memory server: link {link_id} attached");
        Some(link_id)
    }

    pub(super) fn detach(&self, link_id: u64) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.links.remove(&link_id).is_some() {
            log_debug!("memory server: link {link_id} detached");
        }
    }

    /// Handle one outbound frame from a client link.
    pub(super) fn handle_frame(&self, link_id: u64, frame: &[u8]) {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let mut value: Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(err) => {
                state.reply(
                    link_id,
                    Inbound::Error {
                        request_id: None,
                        message: format!("malformed frame: {err}"),
                    },
                );
                return;
            }
        };

        let request_id = value
            .as_object_mut()
            .and_then(|map| map.remove("request_id"))
            .and_then(|id| id.as_str().map(CorrelationId::from));

        let name = value
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        state.received.push((name.clone(), request_id.clone()));

        let Some(request_id) = request_id else {
            state.reply(
                link_id,
                Inbound::Error {
                    request_id: None,
                    message: format!("{name}: missing request_id"),
                },
            );
            return;
        };

        if let Some(message) = state.failures.get(&name).cloned() {
            state.reply(
                link_id,
                Inbound::Error {
                    request_id: Some(request_id),
                    message,
                },
            );
            return;
        }

        let command: Command = match serde_json::from_value(value) {
            Ok(command) => command,
            Err(err) => {
                state.reply(
                    link_id,
                    Inbound::Error {
                        request_id: Some(request_id),
                        message: format!("{name}: {err}"),
                    },
                );
                return;
            }
        };

        let (data, pushes) = state.execute(link_id, command, &self.version);

        state.reply(
            link_id,
            Inbound::Response(Response {
                request_id,
                cmd: name,
                data,
            }),
        );

        for update in pushes {
            state.push(update);
        }
    }
}

impl ServerState {
    // ---

    /// Apply a command. Returns the response data and the pushes it causes.
    fn execute(
        &mut self,
        link_id: u64,
        command: Command,
        version: &str,
    ) -> (Option<String>, Vec<KeyUpdate>) {
        // ---
        let flag = |ok: bool| Some(ok.to_string());

        match command {
            Command::Get { key } => (self.store.get(&key).cloned(), Vec::new()),

            Command::GetMany { keys } => {
                let found: BTreeMap<&str, &str> = keys
                    .iter()
                    .filter_map(|key| {
                        self.store
                            .get_key_value(key)
                            .map(|(k, v)| (k.as_str(), v.as_str()))
                    })
                    .collect();
                (json_text(&found), Vec::new())
            }

            Command::GetPrefix { prefix } => {
                let found: BTreeMap<&str, &str> = self
                    .store
                    .range(prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(prefix.as_str()))
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                (json_text(&found), Vec::new())
            }

            Command::Set { key, value } => {
                self.store.insert(key.clone(), value.clone());
                (flag(true), vec![KeyUpdate { key, value: Some(value) }])
            }

            Command::SetMany { entries } => {
                let mut pushes = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    self.store.insert(key.clone(), value.clone());
                    pushes.push(KeyUpdate { key, value: Some(value) });
                }
                (flag(true), pushes)
            }

            Command::Subscribe { key } => {
                self.watch(link_id, SubscriptionKind::Exact, key, true);
                (flag(true), Vec::new())
            }

            Command::Unsubscribe { key } => {
                self.watch(link_id, SubscriptionKind::Exact, key, false);
                (flag(true), Vec::new())
            }

            Command::SubscribePrefix { prefix } => {
                self.watch(link_id, SubscriptionKind::Prefix, prefix, true);
                (flag(true), Vec::new())
            }

            Command::UnsubscribePrefix { prefix } => {
                self.watch(link_id, SubscriptionKind::Prefix, prefix, false);
                (flag(true), Vec::new())
            }

            Command::List { prefix } => {
                let prefix = prefix.unwrap_or_default();
                let keys: Vec<&str> = self
                    .store
                    .keys()
                    .filter(|key| key.starts_with(prefix.as_str()))
                    .map(String::as_str)
                    .collect();
                (json_text(&keys), Vec::new())
            }

            Command::Delete { key } => {
                let existed = self.store.remove(&key).is_some();
                let pushes = if existed {
                    vec![KeyUpdate { key, value: None }]
                } else {
                    Vec::new()
                };
                (flag(existed), pushes)
            }

            Command::Version {} => (Some(version.to_string()), Vec::new()),
        }
    }

    fn watch(&mut self, link_id: u64, kind: SubscriptionKind, key: String, on: bool) {
        // ---
        let Some(link) = self.links.get_mut(&link_id) else {
            return;
        };
        let set = match kind {
            SubscriptionKind::Exact => &mut link.keys,
            SubscriptionKind::Prefix => &mut link.prefixes,
        };
        if on {
            set.insert(key);
        } else {
            set.remove(&key);
        }
    }

    /// Send a response or error to one link, or queue it while holding.
    fn reply(&mut self, link_id: u64, frame: Inbound) {
        // ---
        let Some(bytes) = line(&frame) else {
            return;
        };

        if self.hold_responses {
            self.held.push((link_id, bytes));
        } else if let Some(link) = self.links.get(&link_id) {
            link.deliver(bytes);
        }
    }

    /// Notify every link watching the key.
    fn push(&self, update: KeyUpdate) {
        // ---
        let watchers: Vec<&ServerLink> = self
            .links
            .values()
            .filter(|link| link.watches(&update.key))
            .collect();

        if watchers.is_empty() {
            return;
        }

        let Some(bytes) = line(&Inbound::Push(update)) else {
            return;
        };
        for link in watchers {
            link.deliver(bytes.clone());
        }
    }
}

fn json_text<T: serde::Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}
