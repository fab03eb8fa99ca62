//! Client builder.
//!
//! Fluent alternative to filling in a [`ClientConfig`] by hand.

use std::time::Duration;

use crate::{ClientConfig, Endpoint, KvClient, KvError, ReconnectPolicy, Result, TransportPtr};

/// Builder for [`KvClient`].
///
/// A transport is required. When an endpoint is given,
/// [`connect`](Self::connect) builds the client and opens the connection in
/// one step.
///
/// # Example
///
/// ```no_run
/// use kvmux::{create_tcp_transport, KvClientBuilder, TcpConfig};
/// use std::time::Duration;
///
/// # async fn example() -> kvmux::Result<()> {
/// let client = KvClientBuilder::new()
///     .transport(create_tcp_transport(TcpConfig::default()))
///     .address("tcp://127.0.0.1:7000")
///     .credential("token")
///     .client_id("worker-3")
///     .request_timeout(Duration::from_secs(5))
///     .reconnect_max_attempts(20)
///     .connect()
///     .await?;
///
/// let greeting = client.get("motd").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct KvClientBuilder {
    // ---
    transport: Option<TransportPtr>,
    address: Option<String>,
    credential: Option<String>,
    config: ClientConfig,

    // reconnect overrides (all optional)
    reconnect_enabled: Option<bool>,
    reconnect_max_attempts: Option<u32>,
    reconnect_multiplier: Option<f32>,
    reconnect_initial_delay: Option<Duration>,
    reconnect_max_delay: Option<Duration>,
}

impl KvClientBuilder {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Transport used for every link. Required.
    pub fn transport(mut self, transport: TransportPtr) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Server address, interpreted by the transport.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Opaque credential handed to the transport at connect time.
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Start from an existing configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    /// Default: none.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    /// Default: 10s.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Default: true.
    pub fn replay_subscriptions(mut self, replay: bool) -> Self {
        self.config.replay_subscriptions = replay;
        self
    }

    /// Default: true.
    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect_enabled = Some(enabled);
        self
    }

    /// Default: unlimited.
    pub fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = Some(attempts);
        self
    }

    /// Default: 2.0.
    pub fn reconnect_multiplier(mut self, multiplier: f32) -> Self {
        self.reconnect_multiplier = Some(multiplier);
        self
    }

    /// Default: 250ms.
    pub fn reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = Some(delay);
        self
    }

    /// Default: 30s.
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = Some(delay);
        self
    }

    fn endpoint(&self) -> Option<Endpoint> {
        // ---
        let address = self.address.as_deref()?;
        let endpoint = Endpoint::new(address);
        Some(match self.credential.as_deref() {
            Some(credential) => endpoint.with_credential(credential),
            None => endpoint,
        })
    }

    fn resolve(self) -> Result<(TransportPtr, ClientConfig, Option<Endpoint>)> {
        // ---
        let endpoint = self.endpoint();

        let transport = self
            .transport
            .ok_or_else(|| KvError::MissingConfig("transport".into()))?;

        let mut config = self.config;
        let defaults = &config.reconnect;

        config.reconnect = ReconnectPolicy {
            enabled: self.reconnect_enabled.unwrap_or(defaults.enabled),
            max_attempts: self.reconnect_max_attempts.or(defaults.max_attempts),
            multiplier: self.reconnect_multiplier.unwrap_or(defaults.multiplier),
            initial_delay: self.reconnect_initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.reconnect_max_delay.unwrap_or(defaults.max_delay),
        };

        Ok((transport, config, endpoint))
    }

    /// Build the client without connecting. Must be called inside a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// [`KvError::MissingConfig`] if no transport was set.
    pub fn build(self) -> Result<KvClient> {
        // ---
        let (transport, config, _) = self.resolve()?;
        Ok(KvClient::new(transport, config))
    }

    /// Build the client and connect to the configured address.
    ///
    /// # Errors
    ///
    /// [`KvError::MissingConfig`] without a transport or address, otherwise
    /// the outcome of the first connection attempt.
    pub async fn connect(self) -> Result<KvClient> {
        // ---
        let (transport, config, endpoint) = self.resolve()?;
        let endpoint = endpoint.ok_or_else(|| KvError::MissingConfig("address".into()))?;

        let client = KvClient::new(transport, config);
        client.connect(endpoint).await?;
        Ok(client)
    }
}
