mod common;

use std::time::Duration;

use tokio::sync::broadcast;

use kvmux::{
    //
    create_memory_transport,
    CloseReason,
    ConnectionError,
    ConnectionEvent,
    ConnectionState,
    Endpoint,
    KvClient,
    KvError,
    MemoryServer,
    ReconnectPolicy,
    Result,
    SubscriptionKind,
};

use common::{connected, eventually, fast_config, forwarder, next_update, STEP};

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(STEP, events.recv())
        .await
        .expect("no event within timeout")
        .expect("event channel closed")
}

/// Skip events until `wanted` shows up.
async fn expect_event(events: &mut broadcast::Receiver<ConnectionEvent>, wanted: ConnectionEvent) {
    loop {
        if next_event(events).await == wanted {
            return;
        }
    }
}

#[tokio::test]
async fn test_disconnect_rejects_every_pending_request() -> Result<()> {
    // ---
    let (server, client) = connected("purge").await;
    server.refuse_connections(true);
    server.set_hold_responses(true);

    let mut tasks = Vec::new();
    for key in ["a", "b", "c"] {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.get(key).await }));
    }

    eventually("three requests in flight", || client.pending_count() == 3).await;

    server.disconnect_all();

    for task in tasks {
        let outcome = tokio::time::timeout(STEP, task)
            .await
            .expect("request hung across disconnect")
            .expect("request task panicked");
        assert!(
            matches!(outcome, Err(KvError::Connection(ConnectionError::Lost))),
            "unexpected outcome: {outcome:?}"
        );
    }
    assert_eq!(client.pending_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_late_replies_after_reconnect_are_discarded() -> Result<()> {
    // ---
    let (server, client) = connected("late").await;
    server.insert("k", "v");
    server.set_hold_responses(true);

    let request = {
        let client = client.clone();
        tokio::spawn(async move { client.get("k").await })
    };
    eventually("request held", || server.held_count() == 1).await;
    let stale_ids = server.request_ids("kget");

    server.disconnect_all();
    let outcome = request.await.expect("request task panicked");
    assert!(matches!(outcome, Err(KvError::Connection(ConnectionError::Lost))));

    client.wait_timeout(STEP).await?;
    server.set_hold_responses(false);

    // the old token arrives on the new link, as a confused server might send it
    let stale = format!(
        "{{\"ok\":true,\"type\":\"response\",\"cmd\":\"kget\",\"request_id\":\"{}\",\"data\":\"stale\"}}\n",
        stale_ids[0]
    );
    server.inject(stale);

    eventually("stale reply counted", || client.anomaly_count() == 1).await;

    // fresh requests are unaffected
    assert_eq!(client.get("k").await?.as_deref(), Some("v"));

    Ok(())
}

#[tokio::test]
async fn test_automatic_reconnect_replays_each_subscription_once() -> Result<()> {
    // ---
    let (server, client) = connected("replay").await;
    let (exact_a, mut exact_a_rx) = forwarder();
    let (exact_b, _exact_b_rx) = forwarder();
    let (prefix, mut prefix_rx) = forwarder();

    client.subscribe_key("cfg/foo", exact_a).await?;
    client.subscribe_key("cfg/foo", exact_b).await?;
    client.subscribe_key_prefix("users/", prefix).await?;
    assert_eq!(server.command_count("ksub"), 1);
    assert_eq!(server.command_count("ksub_prefix"), 1);

    let mut events = client.events();
    server.disconnect_all();

    expect_event(
        &mut events,
        ConnectionEvent::Closed {
            reason: CloseReason::TransportClosed,
        },
    )
    .await;
    expect_event(&mut events, ConnectionEvent::StateChanged(ConnectionState::Open)).await;

    eventually("replayed subscriptions", || {
        server.subscriber_count(SubscriptionKind::Exact, "cfg/foo") == 1
            && server.subscriber_count(SubscriptionKind::Prefix, "users/") == 1
    })
    .await;

    // exactly once per key, not once per handler
    assert_eq!(server.command_count("ksub"), 2);
    assert_eq!(server.command_count("ksub_prefix"), 2);
    assert_eq!(server.connections_opened(), 2);

    server.insert("cfg/foo", "after");
    server.insert("users/7", "ann");
    assert_eq!(next_update(&mut exact_a_rx).await.value.as_deref(), Some("after"));
    assert_eq!(next_update(&mut prefix_rx).await.key, "users/7");

    Ok(())
}

#[tokio::test]
async fn test_replay_can_be_disabled() -> Result<()> {
    // ---
    common::init_logging();

    let server = MemoryServer::new();
    let client = KvClient::new(
        create_memory_transport(server.clone()),
        fast_config("no-replay").with_replay_subscriptions(false),
    );
    client.connect(Endpoint::new("memory")).await?;

    let (handler, _rx) = forwarder();
    client.subscribe_key("k", handler).await?;

    server.disconnect_all();
    eventually("second connection", || server.connections_opened() == 2).await;
    client.wait_timeout(STEP).await?;

    assert_eq!(server.command_count("ksub"), 1);
    assert_eq!(server.subscriber_count(SubscriptionKind::Exact, "k"), 0);
    // still registered locally
    assert_eq!(client.subscription_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_subscribe_lost_to_reconnect_leaves_no_server_subscription() -> Result<()> {
    // ---
    let (server, client) = connected("lost-sub").await;
    server.set_hold_responses(true);

    let (handler, _rx) = forwarder();
    let subscribe = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe_key("k", handler).await })
    };
    eventually("subscribe sent", || server.command_count("ksub") == 1).await;

    client.reconnect().await?;

    let outcome = tokio::time::timeout(STEP, subscribe)
        .await
        .expect("subscribe hung across reconnect")
        .expect("subscribe task panicked");
    assert!(
        matches!(outcome, Err(KvError::Connection(ConnectionError::Lost))),
        "unexpected outcome: {outcome:?}"
    );
    assert_eq!(client.subscription_count(), 0);

    // a replay on the new link, if it went out first, is retracted
    eventually("no server subscription left", || {
        server.subscriber_count(SubscriptionKind::Exact, "k") == 0
    })
    .await;

    server.set_hold_responses(false);
    server.release_held();
    eventually("pending map drained", || client.pending_count() == 0).await;
    assert_eq!(server.subscriber_count(SubscriptionKind::Exact, "k"), 0);

    Ok(())
}

#[tokio::test]
async fn test_explicit_reconnect() -> Result<()> {
    // ---
    let (server, client) = connected("manual").await;
    let mut events = client.events();

    client.reconnect().await?;

    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::StateChanged(ConnectionState::Closed)
    );
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Closed {
            reason: CloseReason::Reconnect,
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::StateChanged(ConnectionState::Open)
    );

    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(server.connections_opened(), 2);
    assert_eq!(server.connection_count(), 1);

    Ok(())
}

#[tokio::test]
async fn test_reconnect_retries_with_backoff_until_server_returns() -> Result<()> {
    // ---
    let (server, client) = connected("backoff").await;
    server.refuse_connections(true);
    server.disconnect_all();

    eventually("link lost", || client.state() != ConnectionState::Open).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connections_opened(), 1);

    server.refuse_connections(false);
    client.wait_timeout(STEP).await?;
    assert_eq!(server.connections_opened(), 2);
    assert!(client.put("back", "1").await?);

    Ok(())
}

#[tokio::test]
async fn test_first_connect_failure_is_reported_then_retried() -> Result<()> {
    // ---
    common::init_logging();

    let server = MemoryServer::new();
    server.refuse_connections(true);

    let client = KvClient::new(create_memory_transport(server.clone()), fast_config("late-server"));

    let err = client.connect(Endpoint::new("memory")).await.unwrap_err();
    assert!(matches!(err, KvError::Connection(ConnectionError::Open(_))));

    server.refuse_connections(false);
    client.wait_timeout(STEP).await?;
    assert_eq!(client.version().await?, kvmux::MEMORY_SERVER_VERSION);

    Ok(())
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() -> Result<()> {
    // ---
    common::init_logging();

    let server = MemoryServer::new();
    let client = KvClient::new(
        create_memory_transport(server.clone()),
        fast_config("bounded").with_reconnect(ReconnectPolicy {
            max_attempts: Some(2),
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            ..ReconnectPolicy::default()
        }),
    );
    client.connect(Endpoint::new("memory")).await?;

    server.refuse_connections(true);
    server.disconnect_all();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.wait_timeout(Duration::from_millis(50)).await.is_err());

    // a manual reconnect still works once the server is back
    server.refuse_connections(false);
    client.reconnect().await?;
    assert_eq!(client.state(), ConnectionState::Open);

    Ok(())
}

#[tokio::test]
async fn test_request_timeout_hardening() -> Result<()> {
    // ---
    common::init_logging();

    let server = MemoryServer::new();
    let client = KvClient::new(
        create_memory_transport(server.clone()),
        fast_config("timeout").with_request_timeout(Duration::from_millis(100)),
    );
    client.connect(Endpoint::new("memory")).await?;

    server.set_hold_responses(true);
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, KvError::Timeout));
    assert_eq!(client.pending_count(), 0);

    // the connection itself is fine
    server.set_hold_responses(false);
    assert!(client.put("k", "v").await?);

    Ok(())
}

#[tokio::test]
async fn test_shutdown_is_final() -> Result<()> {
    // ---
    let (server, client) = connected("shutdown").await;
    let (handler, _rx) = forwarder();
    client.subscribe_key("k", handler).await?;

    server.set_hold_responses(true);
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.get("k").await })
    };
    eventually("request in flight", || client.pending_count() == 1).await;

    let mut events = client.events();
    client.shutdown().await;

    let outcome = pending.await.expect("request task panicked");
    assert!(matches!(outcome, Err(KvError::Connection(ConnectionError::Lost))));

    expect_event(
        &mut events,
        ConnectionEvent::Closed {
            reason: CloseReason::Shutdown,
        },
    )
    .await;

    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.subscription_count(), 0);
    assert!(matches!(
        client.wait().await,
        Err(KvError::Connection(ConnectionError::Closed))
    ));
    assert!(client.get("k").await.unwrap_err().is_connection());
    assert!(client.reconnect().await.is_err());

    // idempotent
    client.shutdown().await;

    eventually("server saw the close", || server.connection_count() == 0).await;

    Ok(())
}

#[tokio::test]
async fn test_wait_settles_for_waiters_registered_before_open() -> Result<()> {
    // ---
    common::init_logging();

    let server = MemoryServer::new();
    let client = KvClient::new(create_memory_transport(server), fast_config("waiters"));

    let mut waiters = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        waiters.push(tokio::spawn(async move { client.wait().await }));
    }
    tokio::task::yield_now().await;

    client.connect(Endpoint::new("memory")).await?;

    for waiter in waiters {
        tokio::time::timeout(STEP, waiter)
            .await
            .expect("waiter never settled")
            .expect("waiter panicked")?;
    }

    Ok(())
}
