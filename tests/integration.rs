mod common;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use kvmux::{
    //
    Command,
    ConnectionError,
    KvError,
    Result,
    MEMORY_SERVER_VERSION,
};

use common::connected;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Settings {
    theme: String,
    retries: u32,
}

#[tokio::test]
async fn test_basic_crud() -> Result<()> {
    // ---
    let (server, client) = connected("crud").await;

    assert_eq!(client.get("cfg/missing").await?, None);

    assert!(client.put("cfg/foo", "42").await?);
    assert_eq!(client.get("cfg/foo").await?.as_deref(), Some("42"));
    assert_eq!(server.value("cfg/foo").as_deref(), Some("42"));

    assert!(client.delete_key("cfg/foo").await?);
    assert!(!client.delete_key("cfg/foo").await?);
    assert_eq!(client.get("cfg/foo").await?, None);

    assert_eq!(client.version().await?, MEMORY_SERVER_VERSION);
    assert_eq!(client.pending_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_get_many_and_put_many() -> Result<()> {
    // ---
    let (_server, client) = connected("many").await;

    assert!(client.put_many([("a", "1"), ("b", "2"), ("c", "3")]).await?);

    let found = client.get_many(["a", "c", "zzz"]).await?;
    let expected: HashMap<String, String> = [("a", "1"), ("c", "3")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(found, expected);

    assert!(client.get_many(Vec::<String>::new()).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_get_keys_by_prefix_is_exact() -> Result<()> {
    // ---
    let (server, client) = connected("prefix").await;

    server.insert("loyalty/points/alice", "10");
    server.insert("loyalty/points/bob", "7");
    server.insert("loyalty/pointsx", "not under the prefix");
    server.insert("loyalty/tier/alice", "gold");
    server.insert("loyalty/points", "no trailing slash");

    client.put("loyalty/points/carol", "3").await?;
    client.put("loyalty/points/bob", "8").await?;

    let points = client.get_keys_by_prefix("loyalty/points/").await?;

    let mut keys: Vec<&str> = points.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec!["loyalty/points/alice", "loyalty/points/bob", "loyalty/points/carol"]
    );
    assert_eq!(points["loyalty/points/bob"], "8");
    assert_eq!(points["loyalty/points/alice"], "10");

    assert!(client.get_keys_by_prefix("nothing/").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_list_with_and_without_prefix() -> Result<()> {
    // ---
    let (server, client) = connected("list").await;

    server.insert("a/1", "x");
    server.insert("a/2", "x");
    server.insert("b/1", "x");

    let mut under_a = client.list(Some("a/")).await?;
    under_a.sort();
    assert_eq!(under_a, vec!["a/1", "a/2"]);

    assert_eq!(client.list(None).await?.len(), 3);
    assert!(client.list(Some("c/")).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_json_wrappers() -> Result<()> {
    // ---
    let (server, client) = connected("json").await;

    let settings = Settings {
        theme: "dark".into(),
        retries: 3,
    };
    assert!(client.put_json("cfg/settings", &settings).await?);
    assert_eq!(client.get_json::<Settings>("cfg/settings").await?, Some(settings));
    assert_eq!(client.get_json::<Settings>("cfg/absent").await?, None);

    server.insert("cfg/broken", "{not json");
    match client.get_json::<Settings>("cfg/broken").await {
        Err(KvError::Decode { key, .. }) => assert_eq!(key, "cfg/broken"),
        other => panic!("expected decode error, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_identical_concurrent_requests_resolve_independently() -> Result<()> {
    // ---
    let (server, client) = connected("identical").await;
    server.insert("hot/key", "v1");

    server.set_hold_responses(true);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.get("hot/key").await }));
    }

    common::eventually("all requests held", || server.held_count() == 8).await;

    // every caller carries its own token
    let ids = server.request_ids("kget");
    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(ids.len(), 8);
    assert_eq!(unique.len(), 8);

    // answer out of order, all in one delivery
    server.release_held_reversed();

    for task in tasks {
        let value = task.await.expect("request task panicked")?;
        assert_eq!(value.as_deref(), Some("v1"));
    }
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.anomaly_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() -> Result<()> {
    // ---
    let (server, client) = connected("ooo").await;
    for i in 0..5 {
        server.insert(format!("k/{i}"), format!("v{i}"));
    }

    server.set_hold_responses(true);

    let mut tasks = Vec::new();
    for i in 0..5 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { (i, client.get(format!("k/{i}")).await) }));
    }

    common::eventually("all requests held", || server.held_count() == 5).await;
    server.release_held_reversed();

    for task in tasks {
        let (i, value) = task.await.expect("request task panicked");
        assert_eq!(value?, Some(format!("v{i}")));
    }

    Ok(())
}

#[tokio::test]
async fn test_remote_error_reaches_only_its_caller() -> Result<()> {
    // ---
    let (server, client) = connected("remote").await;
    server.fail_command("kdelete", "permission denied");

    let (deleted, fetched) = tokio::join!(client.delete_key("cfg/foo"), client.version());

    match deleted {
        Err(KvError::Remote { command, message }) => {
            assert_eq!(command, "kdelete");
            assert_eq!(message, "permission denied");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(fetched?, MEMORY_SERVER_VERSION);

    server.clear_failures();
    assert!(!client.delete_key("cfg/foo").await?);

    Ok(())
}

#[tokio::test]
async fn test_raw_send() -> Result<()> {
    // ---
    let (_server, client) = connected("raw").await;

    let response = client
        .send(Command::Set {
            key: "raw".into(),
            value: "1".into(),
        })
        .await?;
    assert_eq!(response.cmd, "kset");
    assert!(response.flag()?);

    Ok(())
}

#[tokio::test]
async fn test_unknown_tokens_are_anomalies_not_failures() -> Result<()> {
    // ---
    let (server, client) = connected("anomaly").await;

    server.inject(concat!(
        r#"{"ok":true,"type":"response","cmd":"kget","request_id":"nobody","data":"x"}"#,
        "\n",
        r#"{"ok":false,"error":"stray"}"#,
        "\n",
        "not json at all\n",
    ));

    common::eventually("anomalies counted", || client.anomaly_count() == 3).await;

    // the connection is still usable
    assert!(client.put("still", "alive").await?);

    Ok(())
}

#[tokio::test]
async fn test_request_before_connect_is_not_ready() {
    // ---
    common::init_logging();

    let server = kvmux::MemoryServer::new();
    let client = kvmux::KvClient::new(
        kvmux::create_memory_transport(server),
        common::fast_config("early").with_ready_timeout(std::time::Duration::from_millis(50)),
    );

    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, KvError::Connection(ConnectionError::NotReady)));
}
