//! src/engine/mod.rs
//!
//! The core application actor: the only thing that ever mutates the
//! keystore, election state, or dispatcher in-flight set. Everything else
//! (REST handlers, the transport layer) reaches it through channels, so
//! there is never a `Mutex<Keystore>` to contend on — the pattern is the
//! same single-owner `tokio::select!` loop the transport actor uses, just
//! driving a richer set of event sources.

use crate::{
    config::Config,
    dispatcher::{DispatchCompleted, Dispatcher},
    domain::{election_key, Identity, Key, PeerName},
    election::Election,
    error::Result,
    keystore::{
        protocol::{select_peers, GossipPayload},
        Change, Keystore,
    },
    model::{ResourceModel, Watcher},
    transport::{ConnectionEvent, InboundMessage, TransportCommand},
};
use rand::Rng;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// The REST front-end's only way to touch application state; every
/// variant pairs a request with a `oneshot` reply so a handler can `await`
/// the engine's answer without holding any lock itself.
pub enum EngineCommand {
    Apps(oneshot::Sender<Vec<String>>),
    GetApp(String, oneshot::Sender<Result<serde_json::Value>>),
    SetApp(String, serde_json::Value, oneshot::Sender<Result<()>>),
    DelApp(String, oneshot::Sender<Result<()>>),
    Services(oneshot::Sender<BTreeSet<String>>),
    Hosts(String, oneshot::Sender<Vec<String>>),
    GetHost(String, String, oneshot::Sender<Result<serde_json::Value>>),
    SetHost(String, String, serde_json::Value, oneshot::Sender<Result<()>>),
    DelHost(String, String, oneshot::Sender<Result<()>>),
    WatchApp {
        appname: String,
        config: serde_json::Value,
        hookname: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    UnwatchApp {
        appname: String,
        hookname: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AppWatchers(String, oneshot::Sender<Vec<Watcher>>),
    AppWatcher(String, String, oneshot::Sender<Result<Watcher>>),
    WatchService {
        srvname: String,
        config: serde_json::Value,
        hookname: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    UnwatchService {
        srvname: String,
        hookname: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ServiceWatchers(String, oneshot::Sender<Vec<Watcher>>),
    ServiceWatcher(String, String, oneshot::Sender<Result<Watcher>>),
}

pub struct Engine {
    identity: Identity,
    config: Config,
    keystore: Keystore,
    election: Election,
    dispatcher: Dispatcher,
    known_peers: HashMap<PeerName, SocketAddr>,
    peer_last_seen: HashMap<PeerName, Instant>,
    active_peer_addrs: HashSet<SocketAddr>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    conn_event_rx: mpsc::Receiver<ConnectionEvent>,
    command_rx: mpsc::Receiver<EngineCommand>,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchCompleted>,
    transport_tx: mpsc::Sender<TransportCommand>,
    gossip_interval: Duration,
    cleanup_interval: Duration,
    node_ttl: Duration,
    vote_delay: Duration,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Identity,
        config: Config,
        keystore: Keystore,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        conn_event_rx: mpsc::Receiver<ConnectionEvent>,
        command_rx: mpsc::Receiver<EngineCommand>,
        transport_tx: mpsc::Sender<TransportCommand>,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let election = Election::new(identity.peer_name.clone(), config.priority);
        Self {
            gossip_interval: Duration::from_millis(config.gossip_interval_ms),
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
            node_ttl: Duration::from_millis(config.node_ttl_ms),
            vote_delay: Duration::from_millis(config.vote_delay_ms),
            identity,
            config,
            keystore,
            election,
            dispatcher: Dispatcher::new(dispatch_tx),
            known_peers: HashMap::new(),
            peer_last_seen: HashMap::new(),
            active_peer_addrs: HashSet::new(),
            inbound_rx,
            conn_event_rx,
            command_rx,
            dispatch_rx,
            transport_tx,
        }
    }

    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(peer = %self.identity.peer_name, "Engine service started");

        self.announce_priority().await;
        let mut vote_deadline = Some(self.start_election_round().await);

        let mut gossip_timer = time::interval(self.gossip_interval);
        let mut cleanup_timer = time::interval(self.cleanup_interval);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Engine service received shutdown signal.");
                    break;
                },
                _ = gossip_timer.tick() => {
                    self.gossip_anti_entropy().await;
                },
                _ = cleanup_timer.tick() => {
                    if let Some(deadline) = self.cleanup_stale_peers().await {
                        vote_deadline = Some(deadline);
                    }
                },
                _ = sleep_until_opt(vote_deadline) => {
                    vote_deadline = None;
                    self.tally_and_maybe_claim().await;
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    if let Some(deadline) = self.handle_inbound(inbound).await {
                        vote_deadline = Some(deadline);
                    }
                },
                Some(event) = self.conn_event_rx.recv() => {
                    self.handle_connection_event(event);
                },
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                },
                Some(completed) = self.dispatch_rx.recv() => {
                    if let Err(e) = self.dispatcher.on_completed(&mut self.keystore, completed) {
                        tracing::warn!(error = %e, "failed to write back watcher last_hit");
                    }
                },
                else => {
                    tracing::info!("Channel closed. Engine service shutting down.");
                    break;
                }
            }
        }
    }

    // --- Election bootstrap and tallying ---

    async fn announce_priority(&mut self) {
        let key = election_key::prio_key(&self.identity.peer_name);
        let timestamp = self
            .keystore
            .raw_set(&key, serde_json::json!(self.config.priority), self.identity.peer_name.clone());
        self.fan_out(
            GossipPayload::KeyUpdate {
                key: Key::from(key),
                value: Some(serde_json::json!(self.config.priority)),
                timestamp,
            },
            None,
        )
        .await;
    }

    async fn start_election_round(&mut self) -> Instant {
        let target = self.election.start_election();
        let key = election_key::vote_key(&self.identity.peer_name);
        let timestamp = self
            .keystore
            .raw_set(&key, serde_json::json!(target.0), self.identity.peer_name.clone());
        self.fan_out(
            GossipPayload::KeyUpdate {
                key: Key::from(key),
                value: Some(serde_json::json!(target.0)),
                timestamp,
            },
            None,
        )
        .await;
        Instant::now() + self.jittered_vote_delay()
    }

    /// Coalesces flurries of membership events: the base `vote_delay`
    /// jittered by up to +/-50ms so simultaneous `peer_alive`/`peer_dead`
    /// observations across the cluster don't all tally at the exact same
    /// instant.
    fn jittered_vote_delay(&self) -> Duration {
        let jitter_ms: i64 = rand::thread_rng().gen_range(-50..=50);
        let base_ms = self.vote_delay.as_millis() as i64;
        Duration::from_millis(base_ms.saturating_add(jitter_ms).max(0) as u64)
    }

    async fn tally_and_maybe_claim(&mut self) {
        let Some(winner) = self.election.tally() else {
            return;
        };
        if winner != self.identity.peer_name {
            return;
        }
        let was_leader = self.election.is_leader();
        let timestamp = self.keystore.raw_set(
            election_key::LEADER,
            serde_json::json!(winner.0),
            self.identity.peer_name.clone(),
        );
        self.election.apply_leader_claim(winner.clone(), timestamp);
        self.fan_out(
            GossipPayload::KeyUpdate {
                key: Key::from(election_key::LEADER),
                value: Some(serde_json::json!(winner.0)),
                timestamp,
            },
            None,
        )
        .await;
        self.maybe_sweep_on_new_leadership(was_leader);
    }

    fn maybe_sweep_on_new_leadership(&mut self, was_leader: bool) {
        if !was_leader && self.election.is_leader() {
            tracing::info!(peer = %self.identity.peer_name, "elected cluster leader");
            self.dispatcher.sweep_all(&self.keystore);
        }
    }

    // --- Inbound gossip ---

    async fn handle_inbound(&mut self, inbound: InboundMessage) -> Option<Instant> {
        if let Err(e) = inbound.message.verify() {
            tracing::warn!(error = %e, "received message with invalid signature, discarding");
            return None;
        }
        let originator = inbound.message.originator.clone();
        let is_new_peer = originator != self.identity.peer_name
            && !self.known_peers.contains_key(&originator);
        self.known_peers.insert(originator.clone(), inbound.peer_addr);
        self.peer_last_seen.insert(originator.clone(), Instant::now());

        let mut new_deadline = None;
        if is_new_peer {
            self.election.on_peer_alive(originator.clone());
            new_deadline = Some(self.start_election_round().await);
        }

        match inbound.message.payload {
            GossipPayload::KeyUpdate { key, value, timestamp } => {
                self.handle_key_update(originator, key, value, timestamp).await;
            }
            GossipPayload::AntiEntropyDigest { entries } => {
                self.handle_digest(originator, entries).await;
            }
            GossipPayload::AntiEntropyRequest { keys } => {
                self.handle_anti_entropy_request(originator, keys).await;
            }
        }
        new_deadline
    }

    async fn handle_key_update(
        &mut self,
        originator: PeerName,
        key: Key,
        value: Option<serde_json::Value>,
        timestamp: u64,
    ) {
        let accepted = match self
            .keystore
            .apply_remote(originator, key.clone(), value.clone(), timestamp)
        {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to persist remote keystore update");
                return;
            }
        };
        if !accepted {
            return;
        }
        self.fan_out(
            GossipPayload::KeyUpdate {
                key: key.clone(),
                value: value.clone(),
                timestamp,
            },
            None,
        )
        .await;
        self.route_reserved_update(&key, &value, timestamp).await;
        self.on_key_changed(&key);
    }

    async fn route_reserved_update(&mut self, key: &Key, value: &Option<serde_json::Value>, timestamp: u64) {
        let raw = key.as_str();
        if raw == election_key::LEADER {
            if let Some(name) = value.as_ref().and_then(|v| v.as_str()) {
                let was_leader = self.election.is_leader();
                self.election.apply_leader_claim(PeerName(name.to_string()), timestamp);
                self.maybe_sweep_on_new_leadership(was_leader);
            }
        } else if let Some(peer) = raw.strip_prefix(election_key::VOTE_PREFIX) {
            if let Some(target) = value.as_ref().and_then(|v| v.as_str()) {
                self.election
                    .on_vote(PeerName(peer.to_string()), PeerName(target.to_string()));
                self.tally_and_maybe_claim().await;
            }
        } else if let Some(peer) = raw.strip_prefix(election_key::PRIO_PREFIX) {
            if let Some(priority) = value.as_ref().and_then(|v| v.as_i64()) {
                self.election.on_priority(PeerName(peer.to_string()), priority);
            }
        }
    }

    async fn handle_digest(&mut self, from: PeerName, entries: Vec<(Key, u64)>) {
        let missing: Vec<Key> = entries
            .into_iter()
            .filter(|(key, their_ts)| {
                self.keystore
                    .timestamp_of(key)
                    .map_or(true, |local_ts| local_ts < *their_ts)
            })
            .map(|(key, _)| key)
            .collect();
        if !missing.is_empty() {
            self.send_to(&from, GossipPayload::AntiEntropyRequest { keys: missing }).await;
        }
    }

    async fn handle_anti_entropy_request(&mut self, from: PeerName, keys: Vec<Key>) {
        for key in keys {
            if let Some(record) = self.keystore.record(&key) {
                self.send_to(
                    &from,
                    GossipPayload::KeyUpdate {
                        key,
                        value: record.value.clone(),
                        timestamp: record.timestamp,
                    },
                )
                .await;
            }
        }
    }

    async fn gossip_anti_entropy(&mut self) {
        let entries = self.keystore.entries();
        if entries.is_empty() {
            return;
        }
        self.fan_out(GossipPayload::AntiEntropyDigest { entries }, None).await;
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::PeerConnected { peer_addr } => {
                self.active_peer_addrs.insert(peer_addr);
            }
            ConnectionEvent::PeerDisconnected { peer_addr } => {
                self.active_peer_addrs.remove(&peer_addr);
            }
        }
    }

    /// Drops any peer not heard from within `node_ttl` and restarts the
    /// election if membership actually shrank.
    async fn cleanup_stale_peers(&mut self) -> Option<Instant> {
        let now = Instant::now();
        let stale: Vec<PeerName> = self
            .peer_last_seen
            .iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) > self.node_ttl)
            .map(|(peer, _)| peer.clone())
            .collect();
        if stale.is_empty() {
            return None;
        }
        for peer in &stale {
            tracing::info!(peer = %peer, "peer timed out, pruning from membership");
            self.known_peers.remove(peer);
            self.peer_last_seen.remove(peer);
            self.election.on_peer_dead(peer.clone());
        }
        Some(self.start_election_round().await)
    }

    fn on_key_changed(&mut self, key: &Key) {
        if self.election.is_leader() {
            self.dispatcher.check_notify(&self.keystore, key);
        }
    }

    // --- Outbound gossip plumbing ---

    async fn announce_change(&mut self, change: &Change) {
        self.fan_out(
            GossipPayload::KeyUpdate {
                key: change.key.clone(),
                value: change.value.clone(),
                timestamp: change.timestamp,
            },
            None,
        )
        .await;
        self.on_key_changed(&change.key);
    }

    async fn fan_out(&self, payload: GossipPayload, exclude: Option<&PeerName>) {
        let signed = self.identity.sign(payload);
        let exclude_name = exclude.unwrap_or(&self.identity.peer_name);
        let targets = select_peers(&self.known_peers, exclude_name, self.config.gossip_factor);
        for (_, addr) in targets {
            let command = TransportCommand::SendMessage(*addr, signed.clone());
            if let Err(e) = self.transport_tx.send(command).await {
                tracing::warn!(error = %e, "failed to enqueue gossip message");
            }
        }
    }

    async fn send_to(&self, peer: &PeerName, payload: GossipPayload) {
        let Some(addr) = self.known_peers.get(peer) else {
            return;
        };
        let signed = self.identity.sign(payload);
        if let Err(e) = self.transport_tx.send(TransportCommand::SendMessage(*addr, signed)).await {
            tracing::warn!(error = %e, "failed to send targeted gossip message");
        }
    }

    // --- REST command handling ---

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Apps(reply) => {
                let _ = reply.send(ResourceModel::apps(&self.keystore));
            }
            EngineCommand::GetApp(name, reply) => {
                let _ = reply.send(ResourceModel::app(&self.keystore, &name));
            }
            EngineCommand::SetApp(name, config, reply) => {
                let result = self.apply_model_write(|ks| ResourceModel::set_app(ks, &name, config)).await;
                let _ = reply.send(result);
            }
            EngineCommand::DelApp(name, reply) => {
                let result = self.apply_model_write(|ks| ResourceModel::del_app(ks, &name)).await;
                let _ = reply.send(result);
            }
            EngineCommand::Services(reply) => {
                let _ = reply.send(ResourceModel::services(&self.keystore));
            }
            EngineCommand::Hosts(srv, reply) => {
                let _ = reply.send(ResourceModel::hosts(&self.keystore, &srv));
            }
            EngineCommand::GetHost(srv, host, reply) => {
                let _ = reply.send(ResourceModel::host(&self.keystore, &srv, &host));
            }
            EngineCommand::SetHost(srv, host, config, reply) => {
                let result = self
                    .apply_model_write(|ks| ResourceModel::set_host(ks, &srv, &host, config))
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::DelHost(srv, host, reply) => {
                let result = self.apply_model_write(|ks| ResourceModel::del_host(ks, &srv, &host)).await;
                let _ = reply.send(result);
            }
            EngineCommand::WatchApp { appname, config, hookname, reply } => {
                let result = self
                    .apply_model_watch(|ks| {
                        ResourceModel::watch_app(ks, &appname, config, hookname.as_deref())
                    })
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::UnwatchApp { appname, hookname, reply } => {
                let result = self
                    .apply_model_write(|ks| ResourceModel::unwatch_app(ks, &appname, &hookname))
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::AppWatchers(appname, reply) => {
                let _ = reply.send(ResourceModel::app_watchers(&self.keystore, &appname));
            }
            EngineCommand::AppWatcher(appname, hookname, reply) => {
                let _ = reply.send(ResourceModel::app_watcher(&self.keystore, &appname, &hookname));
            }
            EngineCommand::WatchService { srvname, config, hookname, reply } => {
                let result = self
                    .apply_model_watch(|ks| {
                        ResourceModel::watch_service(ks, &srvname, config, hookname.as_deref())
                    })
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::UnwatchService { srvname, hookname, reply } => {
                let result = self
                    .apply_model_write(|ks| ResourceModel::unwatch_service(ks, &srvname, &hookname))
                    .await;
                let _ = reply.send(result);
            }
            EngineCommand::ServiceWatchers(srvname, reply) => {
                let _ = reply.send(ResourceModel::service_watchers(&self.keystore, &srvname));
            }
            EngineCommand::ServiceWatcher(srvname, hookname, reply) => {
                let _ = reply.send(ResourceModel::service_watcher(&self.keystore, &srvname, &hookname));
            }
        }
    }

    /// Runs a `ResourceModel` write, announcing the resulting change over
    /// gossip and re-checking notifications on success.
    async fn apply_model_write<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut Keystore) -> Result<Change>,
    {
        let change = write(&mut self.keystore)?;
        self.announce_change(&change).await;
        Ok(())
    }

    async fn apply_model_watch<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut Keystore) -> Result<(Change, Watcher)>,
    {
        let (change, _watcher) = write(&mut self.keystore)?;
        self.announce_change(&change).await;
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
