//! src/domain.rs
//!
//! Consolidates the core data structures shared across the keystore,
//! election, dispatcher, and model: cryptographic node identity, the
//! `Key` type and its reserved prefixes, and the `Clock` abstraction that
//! lets every stateful component be driven by a virtual clock in tests.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

// --- Cryptographic Identity ---

/// Represents the cryptographic identity of a single node.
#[derive(Debug)]
pub struct Identity {
    keypair: SigningKey,
    pub peer_name: PeerName,
}

impl Identity {
    /// Generates a new, random identity.
    pub fn new() -> Self {
        let mut csprng = OsRng;
        // In ed25519-dalek v2, we generate a secret key and derive the signing key from it.
        let mut secret_key_bytes = [0u8; 32];
        csprng.fill_bytes(&mut secret_key_bytes);
        let keypair = SigningKey::from_bytes(&secret_key_bytes);
        let peer_name = PeerName::from_verifying_key(&keypair.verifying_key());
        Self { keypair, peer_name }
    }

    /// Loads an identity from a file, or creates a new one if the file doesn't exist.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => {
                let keypair_bytes: [u8; 32] =
                    bytes.try_into().map_err(|_| Error::InvalidKeyFile)?;
                let keypair = SigningKey::from_bytes(&keypair_bytes);
                let peer_name = PeerName::from_verifying_key(&keypair.verifying_key());
                Ok(Self { keypair, peer_name })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Self::new();
                // Store only the secret part of the keypair.
                fs::write(path.as_ref(), identity.keypair.to_bytes())?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Signs an arbitrary bincode-serializable payload, producing a `Signed<T>`.
    pub fn sign<T: Serialize + Clone>(&self, payload: T) -> Signed<T> {
        let bytes = bincode::serialize(&payload).expect("gossip payload is serializable");
        let signature = self.keypair.sign(&bytes);
        Signed {
            payload,
            originator: self.peer_name.clone(),
            signature,
        }
    }
}

/// A node's stable, tie-break-comparable name, derived from its public key.
///
/// Spec.md §3 defines `Origin` as "the peer name that proposed the value;
/// used only for tie-breaking" and requires lexicographic comparison; using
/// the hex encoding of the node's ed25519 public key gives a name that is
/// both deterministic and an authenticated claim of identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerName(pub String);

impl PeerName {
    fn from_verifying_key(key: &VerifyingKey) -> Self {
        PeerName(hex::encode(key.to_bytes()))
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer::{}", &self.0[..8.min(self.0.len())])
    }
}

/// A signed envelope around any gossiped payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Signed<T> {
    pub payload: T,
    pub originator: PeerName,
    pub signature: Signature,
}

impl<T: Serialize> Signed<T> {
    /// Verifies that the payload was authentically signed by its originator.
    pub fn verify(&self) -> Result<()> {
        let key_bytes = hex::decode(&self.originator.0).map_err(|_| Error::InvalidKeyFile)?;
        let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| Error::InvalidKeyFile)?;
        let public_key = VerifyingKey::from_bytes(&key_bytes)?;
        let bytes = bincode::serialize(&self.payload)?;
        public_key.verify(&bytes, &self.signature)?;
        Ok(())
    }
}

// --- Keys ---

/// The three key prefixes with fixed, well-known meaning.
pub mod prefix {
    pub const APP: &str = "app:";
    pub const SRV: &str = "srv:";
    pub const WATCHER: &str = "watcher:";
}

/// The three reserved election slots. Never surfaced by `Keystore::keys`/`get`
/// Election keys are never handed to application callers. `__vote__` and `__prio__` are genuinely per-peer state, so each
/// peer gets its own suffixed key (`__vote__:<peer>`); `__leader__` names a
/// single cluster-wide claim and carries no suffix.
pub mod election_key {
    pub const LEADER: &str = "__leader__";
    pub const VOTE_PREFIX: &str = "__vote__:";
    pub const PRIO_PREFIX: &str = "__prio__:";

    pub fn vote_key(peer: &super::PeerName) -> String {
        format!("{VOTE_PREFIX}{}", peer.0)
    }

    pub fn prio_key(peer: &super::PeerName) -> String {
        format!("{PRIO_PREFIX}{}", peer.0)
    }

    pub fn is_reserved(key: &str) -> bool {
        key == LEADER || key.starts_with(VOTE_PREFIX) || key.starts_with(PRIO_PREFIX)
    }
}

/// A textual keystore key. A thin newtype so call sites can't confuse a
/// bare `String` for a well-formed key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub String);

impl Key {
    pub fn app(name: &str) -> Self {
        Key(format!("{}{}", prefix::APP, name))
    }

    pub fn service_host(service: &str, host: &str) -> Self {
        Key(format!("{}{}:{}", prefix::SRV, service, host))
    }

    /// `watcher:<pattern>:<hookname>`, where `pattern` is itself a key prefix
    /// (`app:<name>` or `srv:<name>`).
    pub fn watcher(pattern: &str, hookname: &str) -> Self {
        Key(format!("{}{}:{}", prefix::WATCHER, pattern, hookname))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    pub fn is_reserved(&self) -> bool {
        election_key::is_reserved(&self.0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s)
    }
}

// --- Clock abstraction ---

/// A source of monotonically non-decreasing, millisecond-resolution
/// timestamps. Injected into every stateful component so that property
/// tests can drive a shared `VirtualClock` deterministically across
/// simulated peers.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// The real wall-clock, used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the epoch")
            .as_millis() as u64
    }
}

/// A manually-advanced clock for tests. Cloning shares the same counter, so
/// multiple simulated peers can observe a single, globally-advancing clock.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: std::sync::Arc<AtomicU64>,
}

impl VirtualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: std::sync::Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
