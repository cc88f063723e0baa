//! src/model.rs
//!
//! The typed resource facade over the raw keystore: apps,
//! service hosts, and webhook watchers. This is the only layer the REST
//! front-end talks to — it owns field validation and the `updated_at`
//! stamping the keystore itself knows nothing about.
//!
//! Grounded on the original `ResourceModel` (`nesoi/model.py`): method
//! names and the key layout (`app:<name>`, `srv:<svc>:<host>`,
//! `watcher:<pattern>:<hookname>`) are carried over unchanged. One bug in
//! that source is fixed here rather than reproduced: `app_watcher` there
//! referenced an undefined `appname` instead of its `srvname` parameter;
//! `app_watcher`/`app_watchers` below use the bound parameter name
//! consistently with `service_watcher`/`service_watchers`.

use crate::domain::Key;
use crate::error::{Error, Result};
use crate::keystore::{Change, Keystore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A webhook subscription on an app or service key pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Watcher {
    pub name: String,
    pub endpoint: String,
    pub uri: String,
    pub pattern: String,
    pub last_hit: u64,
}

/// The subset of a watcher creation request the caller supplies; `uri`,
/// `pattern`, and `last_hit` are filled in by the model.
#[derive(Clone, Debug, Deserialize)]
pub struct WatcherRequest {
    pub name: String,
    pub endpoint: String,
}

pub struct ResourceModel;

impl ResourceModel {
    // --- Apps ---

    pub fn apps(ks: &Keystore) -> Vec<String> {
        ks.keys("app:")
            .into_iter()
            .filter_map(|k| k.as_str().strip_prefix("app:").map(str::to_string))
            .collect()
    }

    pub fn app(ks: &Keystore, appname: &str) -> Result<serde_json::Value> {
        ks.get(&Key::app(appname))
            .ok_or_else(|| Error::NotFound(format!("no such app: {appname}")))
    }

    /// Requires a `config` field, per the source model's only validated
    /// field for app configs.
    pub fn set_app(ks: &mut Keystore, appname: &str, mut config: serde_json::Value) -> Result<Change> {
        require_object_field(&config, "config")?;
        stamp_updated_at(&mut config, ks.clock_now());
        ks.set(Key::app(appname), config)
    }

    pub fn del_app(ks: &mut Keystore, appname: &str) -> Result<Change> {
        if ks.get(&Key::app(appname)).is_none() {
            return Err(Error::NotFound(format!("no such app: {appname}")));
        }
        ks.delete(Key::app(appname))
    }

    // --- Services / hosts ---

    pub fn hosts(ks: &Keystore, srvname: &str) -> Vec<String> {
        let prefix = format!("srv:{srvname}:");
        ks.keys(&prefix)
            .into_iter()
            .filter_map(|k| k.as_str().strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn host(ks: &Keystore, srvname: &str, hostname: &str) -> Result<serde_json::Value> {
        ks.get(&Key::service_host(srvname, hostname))
            .ok_or_else(|| Error::NotFound(format!("no such host: {srvname}/{hostname}")))
    }

    /// Requires an `endpoints` field, per the source model.
    pub fn set_host(
        ks: &mut Keystore,
        srvname: &str,
        hostname: &str,
        mut config: serde_json::Value,
    ) -> Result<Change> {
        require_object_field(&config, "endpoints")?;
        stamp_updated_at(&mut config, ks.clock_now());
        ks.set(Key::service_host(srvname, hostname), config)
    }

    pub fn del_host(ks: &mut Keystore, srvname: &str, hostname: &str) -> Result<Change> {
        if ks.get(&Key::service_host(srvname, hostname)).is_none() {
            return Err(Error::NotFound(format!("no such host: {srvname}/{hostname}")));
        }
        ks.delete(Key::service_host(srvname, hostname))
    }

    /// Distinct service names across all `srv:<name>:<host>` keys.
    pub fn services(ks: &Keystore) -> BTreeSet<String> {
        ks.keys("srv:")
            .into_iter()
            .filter_map(|k| {
                let rest = k.as_str().strip_prefix("srv:")?;
                rest.split_once(':').map(|(srv, _host)| srv.to_string())
            })
            .collect()
    }

    // --- Watchers ---

    pub fn watch_app(
        ks: &mut Keystore,
        appname: &str,
        config: serde_json::Value,
        hookname: Option<&str>,
    ) -> Result<(Change, Watcher)> {
        watch(ks, &format!("app:{appname}"), &format!("/app/{appname}"), config, hookname)
    }

    pub fn unwatch_app(ks: &mut Keystore, appname: &str, hookname: &str) -> Result<Change> {
        unwatch(ks, &format!("app:{appname}"), hookname)
    }

    pub fn app_watcher(ks: &Keystore, appname: &str, hookname: &str) -> Result<Watcher> {
        watcher_at(ks, &format!("app:{appname}"), hookname)
    }

    pub fn app_watchers(ks: &Keystore, appname: &str) -> Vec<Watcher> {
        watchers_for(ks, &format!("app:{appname}"))
    }

    pub fn watch_service(
        ks: &mut Keystore,
        srvname: &str,
        config: serde_json::Value,
        hookname: Option<&str>,
    ) -> Result<(Change, Watcher)> {
        watch(ks, &format!("srv:{srvname}"), &format!("/srv/{srvname}"), config, hookname)
    }

    pub fn unwatch_service(ks: &mut Keystore, srvname: &str, hookname: &str) -> Result<Change> {
        unwatch(ks, &format!("srv:{srvname}"), hookname)
    }

    pub fn service_watcher(ks: &Keystore, srvname: &str, hookname: &str) -> Result<Watcher> {
        watcher_at(ks, &format!("srv:{srvname}"), hookname)
    }

    pub fn service_watchers(ks: &Keystore, srvname: &str) -> Vec<Watcher> {
        watchers_for(ks, &format!("srv:{srvname}"))
    }
}

fn watch(
    ks: &mut Keystore,
    pattern: &str,
    uri: &str,
    config: serde_json::Value,
    hookname: Option<&str>,
) -> Result<(Change, Watcher)> {
    let request: WatcherRequest = serde_json::from_value(config)
        .map_err(|e| Error::Validation(format!("invalid watcher body: {e}")))?;
    if let Some(expected) = hookname {
        if request.name != expected {
            return Err(Error::Validation("watcher name does not match hook name in path".into()));
        }
    }
    let wkey = Key::watcher(pattern, &request.name);
    if hookname.is_none() && ks.get(&wkey).is_some() {
        return Err(Error::AlreadyExists(format!("watcher already exists: {}", request.name)));
    }
    let watcher = Watcher {
        name: request.name,
        endpoint: request.endpoint,
        uri: uri.to_string(),
        pattern: pattern.to_string(),
        last_hit: ks.clock_now(),
    };
    let value = serde_json::to_value(&watcher).expect("Watcher is always serializable");
    let change = ks.set(wkey, value)?;
    Ok((change, watcher))
}

fn unwatch(ks: &mut Keystore, pattern: &str, hookname: &str) -> Result<Change> {
    let wkey = Key::watcher(pattern, hookname);
    if ks.get(&wkey).is_none() {
        return Err(Error::NotFound(format!("no such watcher: {hookname}")));
    }
    ks.delete(wkey)
}

fn watcher_at(ks: &Keystore, pattern: &str, hookname: &str) -> Result<Watcher> {
    let value = ks
        .get(&Key::watcher(pattern, hookname))
        .ok_or_else(|| Error::NotFound(format!("no such hook: {hookname}")))?;
    serde_json::from_value(value).map_err(|e| Error::Validation(format!("corrupt watcher record: {e}")))
}

fn watchers_for(ks: &Keystore, pattern: &str) -> Vec<Watcher> {
    let prefix = format!("watcher:{pattern}:");
    ks.keys(&prefix)
        .into_iter()
        .filter_map(|k| ks.get(&k))
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}

fn require_object_field(config: &serde_json::Value, field: &str) -> Result<()> {
    match config.get(field) {
        Some(_) => Ok(()),
        None => Err(Error::Validation(format!("missing field \"{field}\" in config"))),
    }
}

fn stamp_updated_at(config: &mut serde_json::Value, now_ms: u64) {
    if let Some(obj) = config.as_object_mut() {
        obj.insert("updated_at".to_string(), serde_json::json!(now_ms));
    }
}
