//! tests/common/harness.rs
//!
//! A small test harness for spinning up real `nesoi` nodes over loopback
//! QUIC, each in its own temp directory with its own throwaway identity and
//! TLS certificate set, and driving them through their REST front-end.

use anyhow::{Context, Result};
use axum::{extract::State, routing::post, Json, Router};
use nesoi::{
    config::RestConfig,
    domain::{Clock, Identity, PeerName, Signed, SystemClock},
    engine::{Engine, EngineCommand},
    keystore::protocol::GossipPayload,
    keystore::Keystore,
    store::Store,
    transport::{ConnectionEvent, InboundMessage, TransportCommand},
    App, Config,
};
use rcgen::{Certificate, CertificateParams, DistinguishedName};
use std::{
    fs,
    net::{SocketAddr, UdpSocket},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tempfile::{tempdir, TempDir};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A CA plus a single node certificate signed by it, shared across every
/// node in a simulated cluster so QUIC handshakes succeed.
#[derive(Clone)]
pub struct CertSet {
    pub ca_cert_der: Vec<u8>,
    pub node_cert_der: Vec<u8>,
    pub node_key_der: Vec<u8>,
}

impl CertSet {
    /// Writes `certs/{ca.cert,node.cert,node.key}` under `dir`, the layout
    /// `src/transport/tls.rs::configure_tls` expects relative to the
    /// process's current directory.
    pub fn write_to_disk(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("ca.cert"), &self.ca_cert_der)?;
        fs::write(dir.join("node.cert"), &self.node_cert_der)?;
        fs::write(dir.join("node.key"), &self.node_key_der)?;
        Ok(())
    }
}

/// Generates a throwaway CA and a single node certificate signed by it.
/// Every node in a test cluster shares the same `CertSet` so they all
/// trust one another.
pub fn generate_certs(domain: &str) -> CertSet {
    let ca_params = CertificateParams::new(vec![domain.to_string()]);
    let ca_cert = Certificate::from_params(ca_params).expect("CA cert params are valid");
    let ca_cert_der = ca_cert.serialize_der().expect("CA cert serializes");

    let mut node_params = CertificateParams::new(vec![domain.to_string()]);
    node_params.distinguished_name = DistinguishedName::new();
    let node_cert = Certificate::from_params(node_params).expect("node cert params are valid");
    let node_cert_der = node_cert
        .serialize_der_with_signer(&ca_cert)
        .expect("node cert signs with CA");
    let node_key_der = node_cert.serialize_private_key_der();

    CertSet {
        ca_cert_der,
        node_cert_der,
        node_key_der,
    }
}

/// A handle to one running node in a test cluster.
pub struct TestNode {
    pub listen_addr: SocketAddr,
    pub rest_addr: SocketAddr,
    shutdown_token: CancellationToken,
    _temp_dir: TempDir,
    http: reqwest::Client,
}

impl TestNode {
    /// Spawns a node in the background, bootstrapping from `seed` if given.
    /// The node's `certs/` directory is populated from `certs` before the
    /// node starts, and the process's current directory is pinned to the
    /// node's temp dir for the brief synchronous window
    /// (`Transport::new`/`configure_tls`) during which it reads them —
    /// see the comment at the call site below.
    pub async fn spawn(seed: Option<SocketAddr>, certs: &CertSet) -> Result<Self> {
        let temp_dir = tempdir().context("creating node temp dir")?;
        certs
            .write_to_disk(&temp_dir.path().join("certs"))
            .context("writing test certs")?;

        let listen_addr = ephemeral_udp_addr()?;
        let rest_addr = ephemeral_udp_addr()?;

        let config = Config {
            identity_path: temp_dir.path().join("identity.key"),
            listen_address: listen_addr,
            seed,
            data_file: temp_dir.path().join("nesoi.data"),
            gossip_interval_ms: 150,
            gossip_factor: 4,
            node_ttl_ms: 5_000,
            cleanup_interval_ms: 300,
            vote_delay_ms: 150,
            priority: 0,
            rest: Some(RestConfig { bind_addr: rest_addr }),
        };

        let shutdown_token = CancellationToken::new();
        let node_dir = temp_dir.path().to_path_buf();
        let run_token = shutdown_token.clone();

        tokio::spawn(async move {
            // `Transport::new` (called synchronously at the start of
            // `App::run`, before its first `.await`) reads `certs/*`
            // relative to the current directory, so this must run before
            // the task yields control for the first time.
            std::env::set_current_dir(&node_dir).expect("set node cwd");
            if let Err(e) = App::new(config).expect("app constructs").run().await {
                if !run_token.is_cancelled() {
                    tracing::error!(error = %e, "test node exited with an error");
                }
            }
        });

        // Give the node time to bind its sockets and start its REST/gossip
        // loops before the caller starts issuing requests against it.
        tokio::time::sleep(Duration::from_millis(150)).await;

        Ok(Self {
            listen_addr,
            rest_addr,
            shutdown_token,
            _temp_dir: temp_dir,
            http: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.rest_addr)
    }

    pub async fn put_app(&self, name: &str, body: serde_json::Value) -> reqwest::Result<reqwest::Response> {
        self.http
            .put(format!("{}/app/{name}", self.base_url()))
            .json(&body)
            .send()
            .await
    }

    pub async fn get_app(&self, name: &str) -> reqwest::Result<reqwest::Response> {
        self.http.get(format!("{}/app/{name}", self.base_url())).send().await
    }

    pub async fn delete_app(&self, name: &str) -> reqwest::Result<reqwest::Response> {
        self.http
            .delete(format!("{}/app/{name}", self.base_url()))
            .send()
            .await
    }

    pub async fn create_webhook(
        &self,
        appname: &str,
        body: serde_json::Value,
    ) -> reqwest::Result<reqwest::Response> {
        self.http
            .post(format!("{}/app/{appname}/web-hooks", self.base_url()))
            .json(&body)
            .send()
            .await
    }

    pub async fn delete_webhook(&self, appname: &str, hookname: &str) -> reqwest::Result<reqwest::Response> {
        self.http
            .delete(format!("{}/app/{appname}/web-hooks/{hookname}", self.base_url()))
            .send()
            .await
    }

    /// Updates an existing webhook in place (e.g. re-pointing its
    /// `endpoint`), unlike `create_webhook` which fails with 409 if a
    /// watcher under that hook name already exists.
    pub async fn put_webhook(
        &self,
        appname: &str,
        hookname: &str,
        body: serde_json::Value,
    ) -> reqwest::Result<reqwest::Response> {
        self.http
            .put(format!("{}/app/{appname}/web-hooks/{hookname}", self.base_url()))
            .json(&body)
            .send()
            .await
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

/// A minimal HTTP server standing in for a webhook subscriber. Records
/// every POST body it receives so tests can assert on delivery count and
/// content without depending on an external service.
pub struct MockWebhook {
    pub addr: SocketAddr,
    hits: Arc<Mutex<Vec<serde_json::Value>>>,
    shutdown_token: CancellationToken,
}

#[derive(Clone)]
struct MockWebhookState {
    hits: Arc<Mutex<Vec<serde_json::Value>>>,
    /// Artificial per-request delay, used to widen the in-flight window
    /// for coalescing/deletion-race tests.
    delay: Duration,
}

impl MockWebhook {
    /// Starts the mock server. `delay` is applied before every response
    /// is sent, giving tests a window in which to race a deletion or a
    /// second triggering change against the in-flight POST.
    pub async fn spawn(delay: Duration) -> Result<Self> {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let state = MockWebhookState { hits: hits.clone(), delay };
        let app = Router::new().route("/hook", post(receive)).with_state(state);

        let addr = ephemeral_udp_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("binding mock webhook listener")?;
        let bound_addr = listener.local_addr()?;

        let shutdown_token = CancellationToken::new();
        let server_token = shutdown_token.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await;
        });

        Ok(Self { addr: bound_addr, hits, shutdown_token })
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    pub async fn hit_count(&self) -> usize {
        self.hits.lock().await.len()
    }

    pub async fn hits(&self) -> Vec<serde_json::Value> {
        self.hits.lock().await.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

async fn receive(
    State(state): State<MockWebhookState>,
    Json(body): Json<serde_json::Value>,
) -> axum::http::StatusCode {
    if state.delay > Duration::ZERO {
        tokio::time::sleep(state.delay).await;
    }
    state.hits.lock().await.push(body);
    axum::http::StatusCode::OK
}

/// Drives a single `Engine` directly through its real channels, with no
/// transport or REST layer attached. `transport_rx` lets a test observe
/// every `TransportCommand` the engine would have handed to the transport
/// actor, which is how gossip fan-out decisions get asserted on without a
/// real socket.
pub struct EngineHarness {
    pub peer_name: PeerName,
    pub command_tx: mpsc::Sender<EngineCommand>,
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub conn_event_tx: mpsc::Sender<ConnectionEvent>,
    pub transport_rx: mpsc::Receiver<TransportCommand>,
    shutdown_token: CancellationToken,
    _temp_dir: TempDir,
}

impl EngineHarness {
    /// Spawns an engine with the given config overrides (priority and
    /// timing knobs only; identity, data file and channels are always
    /// fresh per harness).
    pub async fn spawn(config: Config) -> Result<Self> {
        let temp_dir = tempdir().context("creating engine temp dir")?;
        let identity = Identity::from_file(temp_dir.path().join("identity.key"))?;
        let store = Store::open(temp_dir.path().join("nesoi.data"))?;
        let keystore = Keystore::new(store, Arc::new(SystemClock), identity.peer_name.clone());
        let peer_name = identity.peer_name.clone();

        let (command_tx, command_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let (conn_event_tx, conn_event_rx) = mpsc::channel(16);
        let (transport_tx, transport_rx) = mpsc::channel(16);

        let engine = Engine::new(identity, config, keystore, inbound_rx, conn_event_rx, command_rx, transport_tx);
        let shutdown_token = CancellationToken::new();
        let run_token = shutdown_token.clone();
        tokio::spawn(engine.run(run_token));

        Ok(Self {
            peer_name,
            command_tx,
            inbound_tx,
            conn_event_tx,
            transport_rx,
            shutdown_token,
            _temp_dir: temp_dir,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

/// Builds a signed gossip envelope as if it came from a brand-new peer
/// identity, for feeding into an `EngineHarness`'s `inbound_tx`.
pub fn signed_from_new_peer(payload: GossipPayload) -> (PeerName, Signed<GossipPayload>) {
    let identity = Identity::new();
    let peer_name = identity.peer_name.clone();
    (peer_name, identity.sign(payload))
}

/// A bare-minimum `Config` for component tests: zeroed network addresses
/// (the engine never binds a socket itself) with fast timing knobs so
/// tests don't wait on production-sized intervals.
pub fn component_config() -> Config {
    use std::net::{IpAddr, Ipv4Addr};
    Config {
        identity_path: Default::default(),
        listen_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0),
        seed: None,
        data_file: Default::default(),
        gossip_interval_ms: 60_000,
        gossip_factor: 4,
        node_ttl_ms: 60_000,
        cleanup_interval_ms: 60_000,
        vote_delay_ms: 80,
        priority: 0,
        rest: None,
    }
}

fn ephemeral_udp_addr() -> Result<SocketAddr> {
    let socket = UdpSocket::bind("127.0.0.1:0").context("binding ephemeral UDP port")?;
    let addr = socket.local_addr()?;
    drop(socket);
    Ok(addr)
}

/// Polls `check` until it returns `Some(_)` or `timeout` elapses.
pub async fn wait_for<F, Fut, T>(mut check: F, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
