//! tests/component/election.rs
//!
//! Engine-level tests for leader election convergence: a lone node must
//! elect itself and only then start dispatching notifications. There is no
//! `EngineCommand` to ask "am I leader", so leadership is observed through
//! its one externally visible effect -- whether a matching change actually
//! produces a webhook delivery.

use crate::common::harness::{component_config, signed_from_new_peer, wait_for, EngineHarness, MockWebhook};
use nesoi::{engine::EngineCommand, keystore::protocol::GossipPayload};
use std::time::Duration;
use test_log::test;
use tokio::sync::oneshot;

async fn set_app(harness: &EngineHarness, name: &str, value: serde_json::Value) {
    let (reply_tx, reply_rx) = oneshot::channel();
    harness
        .command_tx
        .send(EngineCommand::SetApp(name.to_string(), value, reply_tx))
        .await
        .expect("engine command channel open");
    reply_rx.await.expect("engine replies").expect("write succeeds");
}

async fn watch_app(harness: &EngineHarness, name: &str, hook: serde_json::Value) {
    let (reply_tx, reply_rx) = oneshot::channel();
    harness
        .command_tx
        .send(EngineCommand::WatchApp {
            appname: name.to_string(),
            config: hook,
            hookname: None,
            reply: reply_tx,
        })
        .await
        .expect("engine command channel open");
    reply_rx.await.expect("engine replies").expect("watch registers");
}

#[test(tokio::test)]
async fn test_lone_node_elects_itself_and_dispatches_to_its_own_webhook() {
    let mut config = component_config();
    config.vote_delay_ms = 80;
    let harness = EngineHarness::spawn(config).await.expect("spawn engine");
    let webhook = MockWebhook::spawn(Duration::ZERO).await.expect("spawn mock webhook");

    set_app(&harness, "foo", serde_json::json!({"v": 1})).await;
    watch_app(
        &harness,
        "foo",
        serde_json::json!({"name": "w1", "endpoint": webhook.url()}),
    )
    .await;

    // A lone node is the only possible majority of one, so it should
    // self-elect within roughly one (jittered) vote_delay tick.
    tokio::time::sleep(Duration::from_millis(300)).await;
    set_app(&harness, "foo", serde_json::json!({"v": 2})).await;

    let hit = wait_for(
        || async { (webhook.hit_count().await > 0).then_some(()) },
        Duration::from_secs(3),
    )
    .await;
    assert!(hit.is_some(), "a lone node should become leader and dispatch its own notifications");

    let hits = webhook.hits().await;
    assert_eq!(hits[0]["name"], "w1");
    assert_eq!(hits[0]["uri"], "/app/foo");

    webhook.shutdown();
    harness.shutdown();
}

#[test(tokio::test)]
async fn test_node_with_unresponsive_peer_never_reaches_majority_and_does_not_dispatch() {
    // Introducing a peer that never actually casts a vote leaves the
    // election stuck in `Voting` forever (majority of 2 needs two votes),
    // so this node must never become leader and must never fire.
    let mut harness = EngineHarness::spawn(component_config()).await.expect("spawn engine");
    let (_peer_name, signed) = signed_from_new_peer(GossipPayload::AntiEntropyDigest { entries: vec![] });
    harness
        .inbound_tx
        .send(nesoi::transport::InboundMessage {
            peer_addr: "127.0.0.1:9401".parse().unwrap(),
            message: signed,
        })
        .await
        .expect("inbound channel open");

    let webhook = MockWebhook::spawn(Duration::ZERO).await.expect("spawn mock webhook");
    set_app(&harness, "foo", serde_json::json!({"v": 1})).await;
    watch_app(
        &harness,
        "foo",
        serde_json::json!({"name": "w1", "endpoint": webhook.url()}),
    )
    .await;
    set_app(&harness, "foo", serde_json::json!({"v": 2})).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(webhook.hit_count().await, 0, "a non-leader must never dispatch notifications");

    webhook.shutdown();
    harness.shutdown();
}
