//! Peer Management Module
//!
//! Each transport keeps its own ordered set of peers: the flood relay
//! records every origin address it hears from, the star relay records the
//! endpoints it is currently connected to.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Information about a peer seen on one transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
}

impl PeerInfo {
    pub fn new(address: String) -> Self {
        let now = Utc::now();
        Self {
            address,
            first_seen: now,
            last_seen: now,
            message_count: 0,
        }
    }
}

/// Insertion-ordered peer set, safe to share between tasks
#[derive(Debug, Default)]
pub struct PeerList {
    peers: RwLock<Vec<PeerInfo>>,
}

impl PeerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `address`. Returns true only the first time it is seen.
    pub fn insert(&self, address: &str) -> bool {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.iter_mut().find(|p| p.address == address) {
            peer.last_seen = Utc::now();
            return false;
        }
        peers.push(PeerInfo::new(address.to_string()));
        log::info!("New peer discovered: {}", address);
        true
    }

    /// Record traffic from `address`, adding it if needed
    pub fn record_traffic(&self, address: &str) -> bool {
        let is_new = self.insert(address);
        if let Some(peer) = self.peers.write().iter_mut().find(|p| p.address == address) {
            peer.message_count += 1;
        }
        is_new
    }

    /// Returns true if the peer was present
    pub fn remove(&self, address: &str) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.address != address);
        peers.len() != before
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.read().iter().any(|p| p.address == address)
    }

    /// Peer addresses in first-seen order
    pub fn addresses(&self) -> Vec<String> {
        self.peers.read().iter().map(|p| p.address.clone()).collect()
    }

    pub fn get_all_peers(&self) -> Vec<PeerInfo> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn clear(&self) {
        self.peers.write().clear();
    }
}
