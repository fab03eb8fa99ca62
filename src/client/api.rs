use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::registry::Removal;
use super::{Handler, Shared, SubscriptionId};
use crate::connection::{ConnectionManager, DriverSettings};
use crate::transport::{create_tcp_transport, TcpConfig};
use crate::{
    // ---
    ClientConfig,
    Command,
    ConnectionError,
    ConnectionEvent,
    ConnectionState,
    Endpoint,
    KeyUpdate,
    KvClientBuilder,
    KvError,
    Response,
    Result,
    SubscriptionKind,
    TransportPtr,
};

/// Client for the key-value server.
///
/// Cheap to clone; every clone shares one connection, one pending-request
/// map, and one subscription registry. There is no global instance: hand a
/// clone to every consumer that needs one.
///
/// The connection driver stops when [`shutdown`](Self::shutdown) is called
/// or the last clone is dropped.
///
/// # Example
///
/// ```
/// use kvmux::{create_memory_transport, ClientConfig, Endpoint, KvClient, MemoryServer};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> kvmux::Result<()> {
/// let server = MemoryServer::new();
/// let client = KvClient::new(create_memory_transport(server), ClientConfig::default());
/// client.connect(Endpoint::new("memory")).await?;
///
/// assert!(client.put("cfg/foo", "42").await?);
/// assert_eq!(client.get("cfg/foo").await?.as_deref(), Some("42"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KvClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    connection: ConnectionManager,
    shared: Arc<Shared>,
}

impl fmt::Debug for KvClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvClient")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl KvClient {
    // ---

    /// Create a client and spawn its connection driver.
    ///
    /// The client starts Closed; call [`connect`](Self::connect). Must be
    /// called inside a Tokio runtime.
    pub fn new(transport: TransportPtr, config: ClientConfig) -> Self {
        // ---
        let shared = Arc::new(Shared::new(
            config.client_id.clone(),
            config.replay_subscriptions,
        ));

        let settings = DriverSettings {
            client_id: config.client_id.clone(),
            policy: config.reconnect.clone(),
            max_frame_len: config.max_frame_len,
            event_capacity: config.event_capacity,
        };

        let connection = ConnectionManager::spawn(transport, shared.clone(), settings);

        Self {
            inner: Arc::new(Inner {
                config,
                connection,
                shared,
            }),
        }
    }

    pub fn builder() -> KvClientBuilder {
        KvClientBuilder::new()
    }

    /// Connect over TCP with default settings.
    ///
    /// Convenience for consumers that are handed only an address and an
    /// optional credential.
    pub async fn open(address: &str, credential: Option<&str>) -> Result<Self> {
        // ---
        let mut endpoint = Endpoint::new(address);
        if let Some(credential) = credential {
            endpoint = endpoint.with_credential(credential);
        }

        let client = Self::new(
            create_tcp_transport(TcpConfig::default()),
            ClientConfig::default(),
        );
        client.connect(endpoint).await?;
        Ok(client)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // --- connection lifecycle

    /// Open a connection to `endpoint`, replacing any current one.
    ///
    /// Returns the outcome of the first attempt. After a failure the driver
    /// keeps retrying per the reconnect policy; use [`wait`](Self::wait) to
    /// find out when it succeeds.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        self.inner.connection.connect(endpoint).await
    }

    /// Drop the current link and reconnect to the last endpoint.
    ///
    /// Pending requests fail with [`ConnectionError::Lost`](crate::ConnectionError::Lost).
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.connection.reconnect().await
    }

    /// Close the connection for good.
    ///
    /// Pending requests fail, subscriptions are dropped, and later requests
    /// fail with [`ConnectionError::Closed`](crate::ConnectionError::Closed).
    pub async fn shutdown(&self) {
        self.inner.connection.shutdown().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Settles once the connection is Open.
    pub async fn wait(&self) -> Result<()> {
        self.inner.connection.wait().await
    }

    pub async fn wait_timeout(&self, limit: Duration) -> Result<()> {
        self.inner.connection.wait_timeout(limit).await
    }

    /// Lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.events()
    }

    // --- requests

    /// Send one command and wait for its correlated reply.
    ///
    /// Waits up to `ready_timeout` for the connection first.
    ///
    /// # Errors
    ///
    /// - [`KvError::Connection`] if the connection is not ready or drops
    ///   before the reply arrives
    /// - [`KvError::Remote`] if the server answers `ok: false`
    /// - [`KvError::Timeout`] if `request_timeout` elapses
    pub async fn send(&self, command: Command) -> Result<Response> {
        // ---
        self.ready().await?;

        let shared = &self.inner.shared;
        let (correlation_id, completion) = shared.dispatch(&command)?;
        shared
            .await_reply(correlation_id, completion, self.inner.config.request_timeout)
            .await
    }

    async fn ready(&self) -> Result<()> {
        self.wait_timeout(self.inner.config.ready_timeout).await
    }

    /// Value of `key`, or `None` if it is not set.
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>> {
        // ---
        let response = self.send(Command::Get { key: key.into() }).await?;
        Ok(response.data)
    }

    /// Values of every listed key that is set.
    pub async fn get_many<I>(&self, keys: I) -> Result<HashMap<String, String>>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        // ---
        let keys = keys.into_iter().map(Into::into).collect();
        self.send(Command::GetMany { keys }).await?.entries()
    }

    /// Every stored key starting with `prefix`, with its value.
    pub async fn get_keys_by_prefix(
        &self,
        prefix: impl Into<String>,
    ) -> Result<HashMap<String, String>> {
        // ---
        let prefix = prefix.into();
        self.send(Command::GetPrefix { prefix }).await?.entries()
    }

    /// Store `value` under `key`. Returns the server's acknowledgement flag.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Result<bool> {
        // ---
        let command = Command::Set {
            key: key.into(),
            value: value.into(),
        };
        self.send(command).await?.flag()
    }

    /// Store several values in one request.
    pub async fn put_many<I, K, V>(&self, entries: I) -> Result<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        // ---
        let entries: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.send(Command::SetMany { entries }).await?.flag()
    }

    /// Decode the JSON value stored under `key`.
    ///
    /// # Errors
    ///
    /// [`KvError::Decode`] if the stored text is not a valid `T`, in
    /// addition to the errors of [`get`](Self::get).
    pub async fn get_json<T: DeserializeOwned>(&self, key: impl Into<String>) -> Result<Option<T>> {
        // ---
        let key = key.into();
        let Some(text) = self.get(key.as_str()).await? else {
            return Ok(None);
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| KvError::Decode { key, source })
    }

    /// Store `value` as JSON under `key`.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<bool> {
        // ---
        let text = serde_json::to_string(value)?;
        self.put(key, text).await
    }

    /// Keys starting with `prefix`, or every key when `prefix` is `None`.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        // ---
        let command = Command::List {
            prefix: prefix.map(str::to_string),
        };
        let keys: Option<Vec<String>> = self.send(command).await?.json()?;
        Ok(keys.unwrap_or_default())
    }

    /// Delete `key`. Returns the server's flag (false if it did not exist).
    pub async fn delete_key(&self, key: impl Into<String>) -> Result<bool> {
        // ---
        self.send(Command::Delete { key: key.into() }).await?.flag()
    }

    /// Server version string.
    pub async fn version(&self) -> Result<String> {
        // ---
        self.send(Command::Version {})
            .await?
            .data
            .ok_or_else(|| KvError::InvalidResponse("kversion: no version in response".into()))
    }

    // --- subscriptions

    /// Call `handler` for every change of `key`.
    ///
    /// The first local subscriber of a key costs one round trip to the
    /// server. Later ones resolve immediately once that subscribe has been
    /// acknowledged, or wait for the acknowledgement while it is in flight.
    ///
    /// # Errors
    ///
    /// If the server subscribe fails, `handler` is not registered and the
    /// error is returned, also to every subscriber that was waiting on the
    /// same acknowledgement.
    pub async fn subscribe_key<F>(&self, key: impl Into<String>, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&KeyUpdate) + Send + Sync + 'static,
    {
        self.subscribe(SubscriptionKind::Exact, key.into(), Arc::new(handler))
            .await
    }

    /// Call `handler` for every change of any key starting with `prefix`.
    pub async fn subscribe_key_prefix<F>(
        &self,
        prefix: impl Into<String>,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&KeyUpdate) + Send + Sync + 'static,
    {
        self.subscribe(SubscriptionKind::Prefix, prefix.into(), Arc::new(handler))
            .await
    }

    /// Remove the handler registered as `id` on `key`.
    ///
    /// Returns `Ok(false)` if no such handler is registered.
    pub async fn unsubscribe_key(&self, key: &str, id: SubscriptionId) -> Result<bool> {
        self.unsubscribe(SubscriptionKind::Exact, key, id).await
    }

    /// Remove the handler registered as `id` on `prefix`.
    pub async fn unsubscribe_key_prefix(&self, prefix: &str, id: SubscriptionId) -> Result<bool> {
        self.unsubscribe(SubscriptionKind::Prefix, prefix, id).await
    }

    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        key: String,
        handler: Handler,
    ) -> Result<SubscriptionHandle> {
        // ---
        self.ready().await?;

        let shared = &self.inner.shared;

        let (id, ack) = {
            let mut registry = shared.registry();
            let added = registry.add(kind, &key, handler);

            if !added.first {
                (added.id, added.ack)
            } else {
                match shared.dispatch(&Command::subscribe(kind, key.as_str())) {
                    Ok((correlation_id, completion)) => {
                        let (settled, ack) = watch::channel(None);
                        registry.await_ack(kind, &key, correlation_id.clone(), ack.clone());

                        // settles even if this caller stops waiting
                        tokio::spawn(Arc::clone(shared).settle_subscribe(
                            kind,
                            key.clone(),
                            correlation_id,
                            completion,
                            self.inner.config.request_timeout,
                            settled,
                        ));
                        (added.id, Some(ack))
                    }
                    Err(err) => {
                        registry.remove(kind, &key, added.id);
                        return Err(err);
                    }
                }
            }
        };

        let handle = SubscriptionHandle {
            client: self.clone(),
            kind,
            key,
            id,
        };

        let Some(mut ack) = ack else {
            return Ok(handle);
        };

        // on failure the entry, this handler included, is already gone
        let outcome = match ack.wait_for(Option::is_some).await {
            Ok(settled) => match &*settled {
                Some(Err(err)) => Err(err.duplicate()),
                _ => Ok(()),
            },
            Err(_) => Err(ConnectionError::Lost.into()),
        };

        outcome.map(|()| handle)
    }

    async fn unsubscribe(&self, kind: SubscriptionKind, key: &str, id: SubscriptionId) -> Result<bool> {
        // ---
        let shared = &self.inner.shared;

        let (correlation_id, completion) = {
            let mut registry = shared.registry();
            match registry.remove(kind, key, id) {
                Removal::NotFound => return Ok(false),
                Removal::Remaining(_) => return Ok(true),
                Removal::Emptied => match shared.dispatch(&Command::unsubscribe(kind, key)) {
                    Ok(request) => request,
                    // server-side subscriptions die with the connection
                    Err(err) if err.is_connection() => return Ok(true),
                    Err(err) => return Err(err),
                },
            }
        };

        match shared
            .await_reply(correlation_id, completion, self.inner.config.request_timeout)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_connection() => Ok(true),
            Err(err) => Err(err),
        }
    }

    // --- introspection

    /// Requests sent and not yet settled.
    pub fn pending_count(&self) -> usize {
        self.inner.shared.pending_count()
    }

    /// Handlers registered across every key and prefix.
    pub fn subscription_count(&self) -> usize {
        self.inner.shared.registry().len()
    }

    /// Handlers registered on one key (`Exact`) or prefix (`Prefix`).
    pub fn handler_count(&self, kind: SubscriptionKind, key: &str) -> usize {
        self.inner.shared.registry().handler_count(kind, key)
    }

    /// Inbound frames that were dropped: unparseable, uncorrelated errors,
    /// and replies for requests no longer pending.
    pub fn anomaly_count(&self) -> u64 {
        self.inner.shared.anomaly_count()
    }
}

/// A registered subscription handler.
///
/// Dropping the handle does **not** unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Clone)]
pub struct SubscriptionHandle {
    client: KvClient,
    kind: SubscriptionKind,
    key: String,
    id: SubscriptionId,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl SubscriptionHandle {
    // ---

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// The key, or the prefix for prefix subscriptions.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove this handler. Returns `Ok(false)` if it was already removed.
    pub async fn unsubscribe(&self) -> Result<bool> {
        self.client.unsubscribe(self.kind, &self.key, self.id).await
    }
}
