//! Key-value client against the in-process memory server.
//!
//! Shows correlated requests, a prefix subscription, and an automatic
//! reconnect with subscription replay. No external server needed.
//!
//! Run with: RUST_LOG=kvmux=debug cargo run --example kv_memory

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use kvmux::{create_memory_transport, ClientConfig, Endpoint, KeyUpdate, KvClient, MemoryServer};

#[derive(Debug, Serialize, Deserialize)]
struct Account {
    owner: String,
    points: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = MemoryServer::new();
    let client = KvClient::new(
        create_memory_transport(server.clone()),
        ClientConfig::new("demo").with_request_timeout(Duration::from_secs(5)),
    );
    client.connect(Endpoint::new("memory")).await?;

    println!("server version: {}", client.version().await?);

    // ---
    // Plain and JSON values
    client.put("cfg/theme", "dark").await?;
    client
        .put_json(
            "loyalty/points/alice",
            &Account {
                owner: "alice".into(),
                points: 10,
            },
        )
        .await?;

    println!("cfg/theme = {:?}", client.get("cfg/theme").await?);
    let alice: Option<Account> = client.get_json("loyalty/points/alice").await?;
    println!("alice = {alice:?}");

    // ---
    // Watch a prefix
    let watch = client
        .subscribe_key_prefix("loyalty/points/", |update: &KeyUpdate| match &update.value {
            Some(value) => println!("  push: {} -> {value}", update.key),
            None => println!("  push: {} deleted", update.key),
        })
        .await?;

    client.put("loyalty/points/bob", "7").await?;
    client.delete_key("loyalty/points/bob").await?;

    // ---
    // Simulate a server restart; the subscription comes back by itself
    server.disconnect_all();
    client.wait_timeout(Duration::from_secs(5)).await?;
    println!("reconnected, state = {}", client.state());

    server.insert("loyalty/points/carol", "3");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let points = client.get_keys_by_prefix("loyalty/points/").await?;
    println!("{} accounts under loyalty/points/", points.len());

    watch.unsubscribe().await?;
    client.shutdown().await;

    Ok(())
}
