//! src/api/mod.rs
//!
//! The REST front-end. Every handler here is a thin translation layer:
//! decode the path/body, send an `EngineCommand` to the engine actor, wait
//! for its `oneshot` reply, and translate the result into a response. No
//! handler ever touches a `Keystore` directly — the engine is the only
//! task that does.
//!
//! Route table grounded on `nesoi/service.py`'s router wiring and the
//! resource semantics in `nesoi/api.py`.

pub mod dto;

use crate::{
    api::dto::{Segment, Segment2},
    engine::EngineCommand,
    error::Error,
    model::Watcher,
};
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::{collections::BTreeMap, net::SocketAddr};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.rest_status().unwrap_or(500);
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = dto::ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub engine_tx: mpsc::Sender<EngineCommand>,
}

/// Sends `build(reply_tx)` to the engine and awaits its answer, collapsing
/// both "engine channel closed" and "engine dropped the reply" into
/// `Error::EngineGone` — the engine only ever exits on shutdown.
async fn call<T>(
    state: &ApiState,
    build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
) -> Result<T, Error> {
    let (tx, rx) = oneshot::channel();
    state
        .engine_tx
        .send(build(tx))
        .await
        .map_err(|_| Error::EngineGone)?;
    rx.await.map_err(|_| Error::EngineGone)
}

pub struct ApiServer {
    bind_addr: SocketAddr,
    engine_tx: mpsc::Sender<EngineCommand>,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, engine_tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { bind_addr, engine_tx }
    }

    pub async fn run(self, shutdown_token: CancellationToken) -> crate::error::Result<()> {
        let state = ApiState {
            engine_tx: self.engine_tx,
        };

        let app = Router::new()
            .route("/app", get(apps_index))
            .route("/app/:appname", get(app_show).put(app_put).delete(app_delete))
            .route(
                "/app/:appname/web-hooks",
                get(app_webhooks_index).post(app_webhooks_create),
            )
            .route(
                "/app/:appname/web-hooks/:hookname",
                get(app_webhook_show).put(app_webhook_put).delete(app_webhook_delete),
            )
            .route("/srv", get(services_index))
            .route("/srv/:srvname", get(service_hosts_index))
            .route(
                "/srv/:srvname/:hostname",
                get(service_host_show).put(service_host_put).delete(service_host_delete),
            )
            .route(
                "/srv/:srvname/web-hooks",
                get(service_webhooks_index).post(service_webhooks_create),
            )
            .route(
                "/srv/:srvname/web-hooks/:hookname",
                get(service_webhook_show)
                    .put(service_webhook_put)
                    .delete(service_webhook_delete),
            )
            .with_state(state);

        tracing::info!(listen_addr = %self.bind_addr, "REST API server listening");

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
                tracing::info!("API server received shutdown signal.");
            })
            .await?;

        Ok(())
    }
}

fn webhooks_link(path: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("<{path}/web-hooks>; rel=\"Subscriptions\""))
        .expect("generated Link header value is always valid ASCII")
}

fn watcher_map(watchers: Vec<Watcher>) -> BTreeMap<String, Watcher> {
    watchers.into_iter().map(|w| (w.name.clone(), w)).collect()
}

// --- Apps ---

async fn apps_index(State(state): State<ApiState>) -> Result<Json<dto::AppsResponse>, Error> {
    let apps = call(&state, EngineCommand::Apps).await?;
    Ok(Json(dto::AppsResponse { apps }))
}

async fn app_show(
    State(state): State<ApiState>,
    Segment(appname): Segment,
) -> Result<Response, Error> {
    let value = call(&state, |reply| EngineCommand::GetApp(appname.clone(), reply)).await??;
    let mut response = Json(value).into_response();
    response
        .headers_mut()
        .insert("Link", webhooks_link(&format!("/app/{appname}")));
    Ok(response)
}

async fn app_put(
    State(state): State<ApiState>,
    Segment(appname): Segment,
    Json(config): Json<serde_json::Value>,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::SetApp(appname, config, reply)).await??;
    Ok(StatusCode::NO_CONTENT)
}

async fn app_delete(
    State(state): State<ApiState>,
    Segment(appname): Segment,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::DelApp(appname, reply)).await??;
    Ok(StatusCode::NO_CONTENT)
}

async fn app_webhooks_index(
    State(state): State<ApiState>,
    Segment(appname): Segment,
) -> Result<Json<BTreeMap<String, Watcher>>, Error> {
    let watchers = call(&state, |reply| EngineCommand::AppWatchers(appname, reply)).await?;
    Ok(Json(watcher_map(watchers)))
}

async fn app_webhooks_create(
    State(state): State<ApiState>,
    Segment(appname): Segment,
    Json(config): Json<serde_json::Value>,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::WatchApp {
        appname,
        config,
        hookname: None,
        reply,
    })
    .await??;
    Ok(StatusCode::CREATED)
}

async fn app_webhook_show(
    State(state): State<ApiState>,
    Segment2(appname, hookname): Segment2,
) -> Result<Json<Watcher>, Error> {
    let watcher = call(&state, |reply| EngineCommand::AppWatcher(appname, hookname, reply)).await??;
    Ok(Json(watcher))
}

async fn app_webhook_put(
    State(state): State<ApiState>,
    Segment2(appname, hookname): Segment2,
    Json(config): Json<serde_json::Value>,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::WatchApp {
        appname,
        config,
        hookname: Some(hookname),
        reply,
    })
    .await??;
    Ok(StatusCode::CREATED)
}

async fn app_webhook_delete(
    State(state): State<ApiState>,
    Segment2(appname, hookname): Segment2,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::UnwatchApp {
        appname,
        hookname,
        reply,
    })
    .await??;
    Ok(StatusCode::NO_CONTENT)
}

// --- Services / hosts ---

async fn services_index(State(state): State<ApiState>) -> Result<Json<dto::ServicesResponse>, Error> {
    let names = call(&state, EngineCommand::Services).await?;
    let mut services = BTreeMap::new();
    for name in names {
        let hosts = call(&state, |reply| EngineCommand::Hosts(name.clone(), reply)).await?;
        services.insert(name, dto::ServiceSummary { hosts });
    }
    Ok(Json(dto::ServicesResponse { services }))
}

async fn service_hosts_index(
    State(state): State<ApiState>,
    Segment(srvname): Segment,
) -> Result<Response, Error> {
    let hostnames = call(&state, |reply| EngineCommand::Hosts(srvname.clone(), reply)).await?;
    let mut hosts = BTreeMap::new();
    for hostname in hostnames {
        let config = call(&state, |reply| {
            EngineCommand::GetHost(srvname.clone(), hostname.clone(), reply)
        })
        .await??;
        hosts.insert(hostname, config);
    }
    let mut response = Json(hosts).into_response();
    response
        .headers_mut()
        .insert("Link", webhooks_link(&format!("/srv/{srvname}")));
    Ok(response)
}

async fn service_host_show(
    State(state): State<ApiState>,
    Segment2(srvname, hostname): Segment2,
) -> Result<Json<serde_json::Value>, Error> {
    let value = call(&state, |reply| EngineCommand::GetHost(srvname, hostname, reply)).await??;
    Ok(Json(value))
}

async fn service_host_put(
    State(state): State<ApiState>,
    Segment2(srvname, hostname): Segment2,
    Json(config): Json<serde_json::Value>,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::SetHost(srvname, hostname, config, reply)).await??;
    Ok(StatusCode::NO_CONTENT)
}

async fn service_host_delete(
    State(state): State<ApiState>,
    Segment2(srvname, hostname): Segment2,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::DelHost(srvname, hostname, reply)).await??;
    Ok(StatusCode::NO_CONTENT)
}

async fn service_webhooks_index(
    State(state): State<ApiState>,
    Segment(srvname): Segment,
) -> Result<Json<BTreeMap<String, Watcher>>, Error> {
    let watchers = call(&state, |reply| EngineCommand::ServiceWatchers(srvname, reply)).await?;
    Ok(Json(watcher_map(watchers)))
}

async fn service_webhooks_create(
    State(state): State<ApiState>,
    Segment(srvname): Segment,
    Json(config): Json<serde_json::Value>,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::WatchService {
        srvname,
        config,
        hookname: None,
        reply,
    })
    .await??;
    Ok(StatusCode::CREATED)
}

async fn service_webhook_show(
    State(state): State<ApiState>,
    Segment2(srvname, hookname): Segment2,
) -> Result<Json<Watcher>, Error> {
    let watcher = call(&state, |reply| EngineCommand::ServiceWatcher(srvname, hookname, reply)).await??;
    Ok(Json(watcher))
}

async fn service_webhook_put(
    State(state): State<ApiState>,
    Segment2(srvname, hookname): Segment2,
    Json(config): Json<serde_json::Value>,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::WatchService {
        srvname,
        config,
        hookname: Some(hookname),
        reply,
    })
    .await??;
    Ok(StatusCode::CREATED)
}

async fn service_webhook_delete(
    State(state): State<ApiState>,
    Segment2(srvname, hookname): Segment2,
) -> Result<StatusCode, Error> {
    call(&state, |reply| EngineCommand::UnwatchService {
        srvname,
        hookname,
        reply,
    })
    .await??;
    Ok(StatusCode::NO_CONTENT)
}
