//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local identity key path (ed25519 keypair, created on first run).
    pub identity_path: PathBuf,
    /// Address the gossip transport (QUIC) listens on. Required: startup
    /// fails if this is left as the unspecified address.
    pub listen_address: SocketAddr,
    /// A single peer address to contact at startup, if any.
    pub seed: Option<SocketAddr>,
    /// File backing the persistent key-value store.
    pub data_file: PathBuf,
    /// How often this node gossips its own key changes / anti-entropy digest.
    pub gossip_interval_ms: u64,
    /// Number of peers to fan out a gossiped update to.
    pub gossip_factor: usize,
    /// How long a peer can go unseen before it's considered dead.
    pub node_ttl_ms: u64,
    /// How often the peer-liveness sweep runs.
    pub cleanup_interval_ms: u64,
    /// Randomized coalescing window before an election round tallies votes.
    pub vote_delay_ms: u64,
    /// This node's election priority. Always defaults to 0.
    pub priority: i64,
    /// Optional REST front-end.
    pub rest: Option<RestConfig>,
}

/// Configuration for the REST front-end server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestConfig {
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Loads configuration from `config.toml` and `NESOI_`-prefixed
    /// environment variables, layered over `Config::default()`.
    pub fn load() -> Result<Self, figment::Error> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("NESOI_"))
            .extract()?;

        if config.listen_address.ip().is_unspecified() && config.listen_address.port() == 0 {
            return Err(figment::Error::from(
                "listen address must be specified".to_string(),
            ));
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity_path: PathBuf::from("identity.key"),
            // Deliberately the unspecified/zero address: `Config::load` rejects
            // this combination so a missing `listen_address` fails startup per
            // rather than silently binding to a wildcard port.
            listen_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 0),
            seed: None,
            data_file: PathBuf::from("nesoi.data"),
            gossip_interval_ms: 5000,
            gossip_factor: 2,
            node_ttl_ms: 300_000, // 5 minutes
            cleanup_interval_ms: 60_000,
            vote_delay_ms: 300,
            priority: 0,
            rest: None,
        }
    }
}
