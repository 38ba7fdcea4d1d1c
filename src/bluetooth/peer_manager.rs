//! Peer Management Module
//!
//! Tracks every node heard on the mesh: nickname, friend code, sighting
//! counters, direct-neighbor status, and the per-sender announcement
//! cooldown. Peers fall out of the table once they go quiet.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;

/// A peer is online while its last sighting is younger than this.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum interval between accepted announcements from one sender.
pub const ANNOUNCE_COOLDOWN: Duration = Duration::from_secs(3);

/// Cooldown records older than this are dropped by maintenance.
pub const COOLDOWN_RETENTION: Duration = Duration::from_secs(120);

/// Everything observed about one remote node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub hash: u16,
    pub nickname: Option<String>,
    pub friend_code: Option<String>,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub recv_count: u64,
    pub relay_count: u64,
    pub rssi: Option<i16>,
    pub is_direct_neighbor: bool,
}

impl Peer {
    fn new(hash: u16) -> Self {
        let now = SystemTime::now();
        Self {
            hash,
            nickname: None,
            friend_code: None,
            first_seen: now,
            last_seen: now,
            recv_count: 0,
            relay_count: 0,
            rssi: None,
            is_direct_neighbor: false,
        }
    }

    /// Online iff heard within the liveness window.
    pub fn is_online(&self) -> bool {
        match self.last_seen.elapsed() {
            Ok(elapsed) => elapsed < PEER_TIMEOUT,
            Err(_) => true,
        }
    }

    /// Display name, falling back to the friend-code rendering.
    pub fn display_name(&self) -> String {
        match &self.nickname {
            Some(name) if !name.is_empty() => name.clone(),
            _ => crate::identity::friend_code_of(self.hash),
        }
    }
}

/// Concurrent peer table plus sighting-derived side state.
pub struct PeerManager {
    peers: Arc<DashMap<u16, Peer>>,
    own_nickname: Arc<RwLock<String>>,
    announce_cooldowns: Arc<DashMap<u16, Instant>>,
}

impl PeerManager {
    pub fn new(own_nickname: String) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            own_nickname: Arc::new(RwLock::new(own_nickname)),
            announce_cooldowns: Arc::new(DashMap::new()),
        }
    }

    pub async fn own_nickname(&self) -> String {
        self.own_nickname.read().await.clone()
    }

    pub async fn set_own_nickname(&self, nickname: String) {
        *self.own_nickname.write().await = nickname;
    }

    /// Record a frame received from `hash`: refresh lastSeen, bump the
    /// receive counter, capture RSSI. Returns the updated snapshot.
    pub fn record_sighting(&self, hash: u16, rssi: Option<i16>) -> Peer {
        let mut entry = self.peers.entry(hash).or_insert_with(|| {
            log::info!("discovered new peer {:04X}", hash);
            Peer::new(hash)
        });
        entry.last_seen = SystemTime::now();
        entry.recv_count += 1;
        if rssi.is_some() {
            entry.rssi = rssi;
        }
        entry.clone()
    }

    /// Refresh lastSeen without counting a received message (ack frames).
    pub fn touch(&self, hash: u16) {
        if let Some(mut peer) = self.peers.get_mut(&hash) {
            peer.last_seen = SystemTime::now();
        }
    }

    pub fn update_nickname(&self, hash: u16, nickname: &str) {
        if nickname.is_empty() {
            return;
        }
        if let Some(mut peer) = self.peers.get_mut(&hash) {
            peer.nickname = Some(nickname.to_string());
        }
    }

    pub fn update_friend_code(&self, hash: u16, friend_code: &str) {
        if let Some(mut peer) = self.peers.get_mut(&hash) {
            peer.friend_code = Some(friend_code.to_uppercase());
        }
    }

    /// Count one relayed frame originated by `hash`.
    pub fn increment_relay_count(&self, hash: u16) {
        if let Some(mut peer) = self.peers.get_mut(&hash) {
            peer.relay_count += 1;
        }
    }

    /// Mark a node heard at hop 0. Sightings keep the flag fresh because
    /// the peer entry itself is refreshed.
    pub fn mark_direct_neighbor(&self, hash: u16) {
        if let Some(mut peer) = self.peers.get_mut(&hash) {
            peer.is_direct_neighbor = true;
        }
    }

    pub fn direct_neighbors(&self) -> Vec<u16> {
        self.peers
            .iter()
            .filter(|entry| entry.value().is_direct_neighbor && entry.value().is_online())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Apply the per-sender announcement cooldown. True means the
    /// announcement is accepted and the window restarts; false means the
    /// frame must be dropped entirely.
    pub fn accept_announcement(&self, sender_hash: u16, now: Instant) -> bool {
        if let Some(last) = self.announce_cooldowns.get(&sender_hash) {
            if now.duration_since(*last) < ANNOUNCE_COOLDOWN {
                return false;
            }
        }
        self.announce_cooldowns.insert(sender_hash, now);
        true
    }

    pub fn get_peer(&self, hash: u16) -> Option<Peer> {
        self.peers.get(&hash).map(|entry| entry.value().clone())
    }

    pub fn nickname_of(&self, hash: u16) -> Option<String> {
        self.peers.get(&hash).and_then(|entry| entry.nickname.clone())
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn online_peers(&self) -> Vec<Peer> {
        self.peers
            .iter()
            .filter(|entry| entry.value().is_online())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Evict peers that have gone offline. Returns how many went.
    pub fn remove_offline_peers(&self) -> usize {
        let stale: Vec<u16> = self
            .peers
            .iter()
            .filter(|entry| !entry.value().is_online())
            .map(|entry| *entry.key())
            .collect();

        for hash in &stale {
            self.peers.remove(hash);
            log::debug!("removed offline peer {:04X}", hash);
        }
        stale.len()
    }

    /// Drop cooldown records past their retention window.
    pub fn prune_cooldowns(&self, now: Instant) -> usize {
        let stale: Vec<u16> = self
            .announce_cooldowns
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) >= COOLDOWN_RETENTION)
            .map(|entry| *entry.key())
            .collect();

        for hash in &stale {
            self.announce_cooldowns.remove(hash);
        }
        stale.len()
    }

    pub async fn statistics(&self) -> serde_json::Value {
        let total = self.peers.len();
        let online = self.online_peers().len();
        let direct = self.direct_neighbors().len();

        serde_json::json!({
            "total_peers": total,
            "online_peers": online,
            "direct_neighbors": direct,
            "own_nickname": self.own_nickname().await,
        })
    }
}
