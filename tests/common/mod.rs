// tests/common/mod.rs
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use kvmux::{
    //
    create_memory_transport,
    ClientConfig,
    Endpoint,
    KeyUpdate,
    KvClient,
    MemoryServer,
    ReconnectPolicy,
};

pub const STEP: Duration = Duration::from_secs(2);

/// Reconnect quickly so tests do not sit in backoff.
pub fn fast_config(client_id: &str) -> ClientConfig {
    ClientConfig::new(client_id)
        .with_ready_timeout(STEP)
        .with_reconnect(ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..ReconnectPolicy::default()
        })
}

/// A memory server plus one connected client.
pub async fn connected(client_id: &str) -> (Arc<MemoryServer>, KvClient) {
    // ---
    init_logging();

    let server = MemoryServer::new();
    let client = KvClient::new(create_memory_transport(server.clone()), fast_config(client_id));
    client
        .connect(Endpoint::new("memory"))
        .await
        .expect("connect failed");
    (server, client)
}

/// Handler that forwards every update into a channel.
pub fn forwarder() -> (
    impl Fn(&KeyUpdate) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<KeyUpdate>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |update: &KeyUpdate| {
        let _ = tx.send(update.clone());
    }, rx)
}

/// Handler that records `tag:key=value` strings.
pub fn recorder(
    tag: &'static str,
    seen: &Arc<Mutex<Vec<String>>>,
) -> impl Fn(&KeyUpdate) + Send + Sync + 'static {
    let seen = Arc::clone(seen);
    move |update: &KeyUpdate| {
        seen.lock().unwrap().push(format!(
            "{tag}:{}={}",
            update.key,
            update.value.as_deref().unwrap_or("<deleted>")
        ));
    }
}

pub async fn next_update(rx: &mut mpsc::UnboundedReceiver<KeyUpdate>) -> KeyUpdate {
    tokio::time::timeout(STEP, rx.recv())
        .await
        .expect("no update within timeout")
        .expect("handler channel closed")
}

/// Poll `check` until it holds or the step timeout passes.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    // ---
    let deadline = tokio::time::Instant::now() + STEP;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give spawned lanes and tasks a moment to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
