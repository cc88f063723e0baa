//! src/election.rs
//!
//! The three-key gossip-visible leader election state machine:
//! `__leader__`, `__vote__`, `__prio__`. All three ride on the same
//! replicated keystore mechanism as application data — `__vote__` and
//! `__prio__` just use a key suffixed with the announcing peer's own name
//! (`__vote__:<peer>`), since only that peer ever writes it, so ordinary
//! last-writer-wins per key is enough to make every peer's vote visible to
//! everyone without a new wire format. `Keystore::is_reserved` is what
//! keeps these keys out of the REST-facing API; this module only tracks
//! the *decoded* view (who's alive, who they voted for, current leader)
//! that the engine builds by watching those keys change.

use crate::domain::PeerName;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Voting,
    Elected,
    Follower,
}

pub struct Election {
    local: PeerName,
    local_priority: i64,
    state: ElectionState,
    priorities: HashMap<PeerName, i64>,
    live_peers: HashSet<PeerName>,
    votes: HashMap<PeerName, PeerName>,
    leader: Option<PeerName>,
    leader_timestamp: u64,
}

impl Election {
    pub fn new(local: PeerName, priority: i64) -> Self {
        let mut priorities = HashMap::new();
        priorities.insert(local.clone(), priority);
        Self {
            local,
            local_priority: priority,
            state: ElectionState::Idle,
            priorities,
            live_peers: HashSet::new(),
            votes: HashMap::new(),
            leader: None,
            leader_timestamp: 0,
        }
    }

    pub fn local_priority(&self) -> i64 {
        self.local_priority
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Elected
    }

    pub fn leader(&self) -> Option<&PeerName> {
        self.leader.as_ref()
    }

    /// Entering `Voting` on startup, `peer_alive`, or `peer_dead`. Returns
    /// this peer's own vote so the caller can write
    /// it into `__vote__:<local>` and gossip the change.
    pub fn start_election(&mut self) -> PeerName {
        self.state = ElectionState::Voting;
        self.votes.clear();
        self.cast_own_vote()
    }

    fn membership(&self) -> HashSet<PeerName> {
        let mut m = self.live_peers.clone();
        m.insert(self.local.clone());
        m
    }

    /// The peer with the highest `(priority, name)` currently visible,
    /// ties broken by the lexicographically smallest name.
    fn best_candidate(&self) -> PeerName {
        let mut candidates: Vec<(i64, PeerName)> = self
            .membership()
            .into_iter()
            .map(|p| {
                let prio = *self.priorities.get(&p).unwrap_or(&0);
                (prio, p)
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        candidates
            .into_iter()
            .next()
            .map(|(_, name)| name)
            .unwrap_or_else(|| self.local.clone())
    }

    fn cast_own_vote(&mut self) -> PeerName {
        let target = self.best_candidate();
        self.votes.insert(self.local.clone(), target.clone());
        target
    }

    pub fn on_peer_alive(&mut self, peer: PeerName) -> PeerName {
        self.live_peers.insert(peer);
        self.start_election()
    }

    pub fn on_peer_dead(&mut self, peer: PeerName) -> PeerName {
        self.live_peers.remove(&peer);
        self.priorities.remove(&peer);
        self.votes.remove(&peer);
        self.start_election()
    }

    pub fn on_priority(&mut self, peer: PeerName, priority: i64) {
        self.priorities.insert(peer, priority);
    }

    pub fn on_vote(&mut self, voter: PeerName, target: PeerName) {
        self.votes.insert(voter, target);
    }

    /// Tallies votes across the live membership. Returns `Some(winner)`
    /// only if a strict majority agrees — no decision is itself an
    /// acceptable outcome of a round; `None` just means the caller waits
    /// for the next membership or vote change to retry.
    pub fn tally(&self) -> Option<PeerName> {
        let membership = self.membership();
        let mut counts: HashMap<&PeerName, usize> = HashMap::new();
        for (voter, target) in &self.votes {
            if membership.contains(voter) {
                *counts.entry(target).or_insert(0) += 1;
            }
        }
        let majority = membership.len() / 2 + 1;
        counts
            .into_iter()
            .find(|(_, count)| *count >= majority)
            .map(|(peer, _)| peer.clone())
    }

    /// Observes an accepted `__leader__` write, whether it was this peer's
    /// own (it writes its own name into `__leader__` on winning a tally)
    /// or a peer's, arriving over gossip. LWW by timestamp, ties
    /// broken by the smaller name — matches `Keystore::apply_remote`'s
    /// rule, since both paths go through the same keystore write.
    pub fn apply_leader_claim(&mut self, leader: PeerName, timestamp: u64) -> bool {
        let accept = match &self.leader {
            None => true,
            Some(current) => {
                timestamp > self.leader_timestamp
                    || (timestamp == self.leader_timestamp && leader < *current)
            }
        };
        if !accept {
            return false;
        }
        self.leader_timestamp = timestamp;
        self.leader = Some(leader.clone());
        self.state = if leader == self.local {
            ElectionState::Elected
        } else {
            ElectionState::Follower
        };
        true
    }
}
