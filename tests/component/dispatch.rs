//! tests/component/dispatch.rs
//!
//! Engine-level tests tying the dispatcher's effects to the webhook
//! commands that create and remove watchers: unwatching must stop further
//! deliveries, and a successful delivery must be the only thing that
//! advances a watcher's `last_hit`.

use crate::common::harness::{component_config, wait_for, EngineHarness, MockWebhook};
use nesoi::engine::EngineCommand;
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

async fn unwatch_app(harness: &EngineHarness, name: &str, hookname: &str) {
    let (reply_tx, reply_rx) = oneshot::channel();
    harness
        .command_tx
        .send(EngineCommand::UnwatchApp {
            appname: name.to_string(),
            hookname: hookname.to_string(),
            reply: reply_tx,
        })
        .await
        .expect("engine command channel open");
    reply_rx.await.expect("engine replies").expect("unwatch succeeds");
}

async fn app_watcher(harness: &EngineHarness, name: &str, hookname: &str) -> nesoi::model::Watcher {
    let (reply_tx, reply_rx) = oneshot::channel();
    harness
        .command_tx
        .send(EngineCommand::AppWatcher(name.to_string(), hookname.to_string(), reply_tx))
        .await
        .expect("engine command channel open");
    reply_rx.await.expect("engine replies").expect("watcher exists")
}

async fn become_leader(_harness: &EngineHarness) {
    // A lone node converges on itself after roughly one vote_delay tick.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[test(tokio::test)]
async fn test_unwatching_stops_further_dispatches() {
    let mut config = component_config();
    config.vote_delay_ms = 80;
    let harness = EngineHarness::spawn(config).await.expect("spawn engine");
    let webhook = MockWebhook::spawn(Duration::ZERO).await.expect("spawn mock webhook");

    set_app(&harness, "foo", serde_json::json!({"v": 1})).await;
    watch_app(&harness, "foo", serde_json::json!({"name": "w1", "endpoint": webhook.url()})).await;
    become_leader(&harness).await;

    set_app(&harness, "foo", serde_json::json!({"v": 2})).await;
    wait_for(|| async { (webhook.hit_count().await > 0).then_some(()) }, Duration::from_secs(3))
        .await
        .expect("first change should dispatch");

    unwatch_app(&harness, "foo", "w1").await;
    set_app(&harness, "foo", serde_json::json!({"v": 3})).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(webhook.hit_count().await, 1, "an unwatched hook must not receive further deliveries");

    webhook.shutdown();
    harness.shutdown();
}

#[test(tokio::test)]
async fn test_last_hit_only_advances_after_a_successful_delivery() {
    let mut config = component_config();
    config.vote_delay_ms = 80;
    let harness = EngineHarness::spawn(config).await.expect("spawn engine");
    let webhook = MockWebhook::spawn(Duration::ZERO).await.expect("spawn mock webhook");

    set_app(&harness, "foo", serde_json::json!({"v": 1})).await;
    watch_app(&harness, "foo", serde_json::json!({"name": "w1", "endpoint": webhook.url()})).await;
    become_leader(&harness).await;

    // `watch_app` stamps `last_hit` with the registration time itself (the
    // watcher has "never been hit" as far as notification matching is
    // concerned, since no key change is newer than it yet), not zero.
    let before = app_watcher(&harness, "foo", "w1").await;

    set_app(&harness, "foo", serde_json::json!({"v": 2})).await;
    wait_for(|| async { (webhook.hit_count().await > 0).then_some(()) }, Duration::from_secs(3))
        .await
        .expect("change should dispatch");

    let after = wait_for(
        || async {
            let w = app_watcher(&harness, "foo", "w1").await;
            (w.last_hit > before.last_hit).then_some(w)
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(after.is_some(), "last_hit must advance once the completion is written back");

    webhook.shutdown();
    harness.shutdown();
}
