//! Cross-instance fan-out: two server instances sharing the durable
//! store, the cache tier, and the pub/sub bus.

use std::sync::Arc;

use anyhow::Result;
use common::*;
use scribepad_server::{
    ServerState, cache::DocumentCache, config::EngineConfig, fabric::MemoryBus,
    permissions::Role, server, store::Store,
};
use serde_json::json;

pub mod common;

/// Two instances wired to the same cluster tiers, like two processes
/// behind one load balancer.
async fn cluster() -> Result<(Arc<ServerState>, Arc<ServerState>)> {
    let config = EngineConfig::default();
    let storage = std::env::temp_dir().join(format!("scribepad_cluster_{:x}", rand_suffix()));
    let cache = Arc::new(DocumentCache::new(config.cache_ttl));
    let bus = Arc::new(MemoryBus::new());

    let store1 = Arc::new(Store::new(storage.clone()).await?);
    let store2 = Arc::new(Store::new(storage).await?);
    let first = Arc::new(ServerState::clustered(
        config.clone(),
        store1,
        cache.clone(),
        bus.clone(),
    ));
    let second = Arc::new(ServerState::clustered(config, store2, cache, bus));
    Ok((first, second))
}

fn rand_suffix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}

#[tokio::test]
async fn test_edit_reaches_participants_on_another_instance() -> Result<()> {
    logging();
    let (first, second) = cluster().await?;
    let client1 = TestClient::start(server(first.clone())).await?;
    let client2 = TestClient::start(server(second.clone())).await?;

    // Alice creates the document on the first instance.
    let mut alice = client1.connect_as("alice", "Alice").await?;
    join(&mut alice, "shared", "Shared").await?;
    first
        .set_role(&"alice".parse()?, &"shared".parse()?, "bob", Role::Editor)
        .await
        .unwrap();
    // The grant lives on the first instance's engine; make it durable so
    // the second instance's cold load sees it.
    first.flush_all().await;

    // Bob joins the same document through the second instance.
    let mut bob = client2.connect_as("bob", "Bob").await?;
    let msg = join(&mut bob, "shared", "Shared").await?;
    assert_eq!(
        msg,
        json!({
            "load_document": {
                "data": "",
                "version": 0,
                "role": "editor",
                "can_edit": true
            }
        })
    );

    // Alice's edit crosses the bus to Bob with the transformed delta and
    // the new version.
    send_changes(
        &mut alice,
        0,
        json!([{ "insert": { "position": 0, "content": "hi" } }]),
    )
    .await;
    assert_eq!(
        alice.recv().await?,
        json!({ "ack": { "version": 1, "transformed": false } })
    );
    let msg = bob.recv().await?;
    assert_eq!(
        msg,
        json!({
            "receive_changes": {
                "ops": [{ "insert": { "position": 0, "content": "hi" } }],
                "version": 1,
                "origin": 0
            }
        })
    );

    // Both instances' replicas converged.
    client1.expect_text("shared", "hi").await;
    client2.expect_text("shared", "hi").await;

    // Bob answers; the delta flows the other way.
    send_changes(
        &mut bob,
        1,
        json!([{ "insert": { "position": 2, "content": " there" } }]),
    )
    .await;
    assert_eq!(
        bob.recv().await?,
        json!({ "ack": { "version": 2, "transformed": false } })
    );
    let msg = alice.recv().await?;
    assert_eq!(
        msg,
        json!({
            "receive_changes": {
                "ops": [{ "insert": { "position": 2, "content": " there" } }],
                "version": 2,
                "origin": 0
            }
        })
    );
    client1.expect_text("shared", "hi there").await;
    client2.expect_text("shared", "hi there").await;
    Ok(())
}

#[tokio::test]
async fn test_user_left_crosses_instances() -> Result<()> {
    logging();
    let (first, second) = cluster().await?;
    let client1 = TestClient::start(server(first.clone())).await?;
    let client2 = TestClient::start(server(second.clone())).await?;

    let mut alice = client1.connect_as("alice", "Alice").await?;
    join(&mut alice, "hall", "Hall").await?;
    first
        .set_role(&"alice".parse()?, &"hall".parse()?, "bob", Role::Editor)
        .await
        .unwrap();
    first.flush_all().await;

    let mut bob = client2.connect_as("bob", "Bob").await?;
    join(&mut bob, "hall", "Hall").await?;

    bob.close().await;
    let msg = alice.recv_until("user_left").await?;
    assert_eq!(
        msg,
        json!({ "user_left": { "user_id": "bob", "username": "Bob" } })
    );
    Ok(())
}
