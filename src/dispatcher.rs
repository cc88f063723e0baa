//! src/dispatcher.rs
//!
//! The leader-only webhook notification dispatcher.
//! Grounded on `KeyStore._notify`/`_check_notify` (`nesoi/keystore.py`):
//! a watcher fires when a key under its pattern changes more recently
//! than the watcher's own `last-hit`, and firing is a fire-and-forget
//! POST of `{"name": <watcher name>, "uri": <watcher uri>}` to the
//! watcher's endpoint with a bounded timeout.
//!
//! The dispatcher never touches the keystore directly from inside an
//! in-flight request — to avoid an object cycle between the two, POSTs
//! run as detached tasks that report back to the engine over a channel,
//! and only the engine (which owns the one `Keystore`) re-validates and
//! writes the updated `last_hit` back.

use crate::domain::{Clock, Key, SystemClock};
use crate::error::Result;
use crate::keystore::Keystore;
use crate::model::Watcher;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(3);

/// Reported back to the engine once a detached notification attempt
/// finishes. `hit_at` is only `Some` when the POST actually succeeded;
/// on timeout or transport error it is `None` so the engine leaves
/// `last_hit` unchanged and the next triggering change retries delivery.
#[derive(Debug)]
pub struct DispatchCompleted {
    pub watcher_key: Key,
    pub hit_at: Option<u64>,
}

pub struct Dispatcher {
    client: reqwest::Client,
    in_flight: HashSet<Key>,
    /// Watchers that matched a change while a POST for them was already
    /// in flight. The match itself was coalesced (no second concurrent
    /// POST), but `on_completed` must re-check these once the in-flight
    /// request finishes so the change isn't silently dropped.
    pending: HashSet<Key>,
    completions: mpsc::UnboundedSender<DispatchCompleted>,
}

impl Dispatcher {
    pub fn new(completions: mpsc::UnboundedSender<DispatchCompleted>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("reqwest client with a fixed timeout always builds");
        Self {
            client,
            in_flight: HashSet::new(),
            pending: HashSet::new(),
            completions,
        }
    }

    /// Called by the engine whenever a non-watcher key changes locally or
    /// via gossip. Scans every registered watcher and fires the ones whose
    /// pattern matches `changed_key` and whose `last_hit` predates it
    /// (mirrors `_check_notify`). A watcher that matches while its own POST
    /// is already outstanding is coalesced into `pending` rather than
    /// fired again immediately, and `on_completed` re-checks it once that
    /// request finishes.
    pub fn check_notify(&mut self, ks: &Keystore, changed_key: &Key) {
        if changed_key.is_reserved() || changed_key.as_str().starts_with("watcher:") {
            return;
        }
        let Some(changed_at) = ks.timestamp_of(changed_key) else {
            return;
        };
        for wkey in ks.keys("watcher:") {
            let Some(value) = ks.get(&wkey) else { continue };
            let Ok(watcher) = serde_json::from_value::<Watcher>(value) else {
                continue;
            };
            if !changed_key.starts_with(&watcher.pattern) || watcher.last_hit >= changed_at {
                continue;
            }
            if self.in_flight.contains(&wkey) {
                self.pending.insert(wkey);
            } else {
                self.fire(wkey, watcher);
            }
        }
    }

    /// Called once per key on becoming leader, sweeping the whole
    /// namespace in case anything changed while this peer was a follower
    /// (mirrors `leader_elected`).
    pub fn sweep_all(&mut self, ks: &Keystore) {
        for key in ks.keys("app:").into_iter().chain(ks.keys("srv:")) {
            self.check_notify(ks, &key);
        }
    }

    fn fire(&mut self, wkey: Key, watcher: Watcher) {
        self.in_flight.insert(wkey.clone());
        let client = self.client.clone();
        let completions = self.completions.clone();
        let hook_name = watcher.name.clone();
        tokio::spawn(async move {
            let result = client
                .post(&watcher.endpoint)
                .json(&serde_json::json!({ "name": watcher.name, "uri": watcher.uri }))
                .send()
                .await;
            let hit_at = match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(hook = %hook_name, "webhook delivered");
                    Some(SystemClock.now_ms())
                }
                Ok(resp) => {
                    warn!(hook = %hook_name, status = %resp.status(), "webhook endpoint returned an error");
                    None
                }
                Err(e) => {
                    warn!(hook = %hook_name, error = %e, "webhook delivery failed");
                    None
                }
            };
            let _ = completions.send(DispatchCompleted { watcher_key: wkey, hit_at });
        });
    }

    /// Clears the in-flight marker and, if the watcher still exists
    /// (it may have been deleted while the request was outstanding) and
    /// the POST actually succeeded, writes its new `last_hit` back
    /// through the keystore. A timed-out or failed delivery leaves
    /// `last_hit` untouched so the next matching change retries it.
    ///
    /// If another change matched this watcher while the request was in
    /// flight (recorded in `pending`), re-checks it now: the coalesced
    /// match must still eventually produce a delivery, not be silently
    /// absorbed by the just-written `last_hit`.
    pub fn on_completed(&mut self, ks: &mut Keystore, completed: DispatchCompleted) -> Result<()> {
        self.in_flight.remove(&completed.watcher_key);
        let was_pending = self.pending.remove(&completed.watcher_key);

        if let Some(hit_at) = completed.hit_at {
            if let Some(value) = ks.get(&completed.watcher_key) {
                if let Ok(mut watcher) = serde_json::from_value::<Watcher>(value) {
                    watcher.last_hit = hit_at;
                    let value = serde_json::to_value(&watcher).expect("Watcher is always serializable");
                    ks.set(completed.watcher_key.clone(), value)?;
                }
            }
        }

        if was_pending {
            self.recheck(ks, &completed.watcher_key);
        }
        Ok(())
    }

    /// Re-evaluates a single watcher against its own pattern's current
    /// state, firing again if any matching key is still newer than its
    /// (possibly just-updated) `last_hit`. Used only to resolve a match
    /// that was coalesced while a prior POST for the same watcher was
    /// outstanding.
    fn recheck(&mut self, ks: &Keystore, wkey: &Key) {
        let Some(value) = ks.get(wkey) else { return };
        let Ok(watcher) = serde_json::from_value::<Watcher>(value) else { return };
        let still_stale = ks
            .keys(&watcher.pattern)
            .into_iter()
            .filter_map(|k| ks.timestamp_of(&k))
            .any(|ts| ts > watcher.last_hit);
        if still_stale {
            self.fire(wkey.clone(), watcher);
        }
    }
}
