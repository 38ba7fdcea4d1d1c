//! Event Streams
//!
//! Fan-out of classified engine events to any number of subscribers.
//! Every stream is single-producer multi-consumer; sends to streams with
//! no live subscriber are dropped silently.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::bluetooth::peer_manager::Peer;
use crate::bluetooth::protocol::PacketType;
use crate::message::message_types::MeshMessage;

/// Buffered events per stream before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// A sender's friend code learned from an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendCodeDiscovery {
    pub sender_hash: u16,
    pub friend_code: String,
}

/// An inbound friend request addressed to this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestEvent {
    pub sender_hash: u16,
    pub nickname: String,
    pub friend_code: String,
}

/// Raw-packet observability record, emitted for every scanned frame,
/// including ones that are ultimately dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketDiagnostic {
    pub hex: String,
    pub peer_address: Option<String>,
    pub rssi: Option<i16>,
    pub packet_type: Option<PacketType>,
    pub ttl: Option<u8>,
    pub msg_id_hash: Option<u16>,
    pub sender_hash: Option<u16>,
    pub is_duplicate: bool,
    pub is_from_self: bool,
    pub decode_error: Option<String>,
}

/// The engine's subscription surface.
pub struct MeshEvents {
    messages: broadcast::Sender<MeshMessage>,
    directed: broadcast::Sender<MeshMessage>,
    peers: broadcast::Sender<Peer>,
    friend_codes: broadcast::Sender<FriendCodeDiscovery>,
    friend_requests: broadcast::Sender<FriendRequestEvent>,
    diagnostics: broadcast::Sender<PacketDiagnostic>,
    status: broadcast::Sender<String>,
    errors: broadcast::Sender<String>,
}

impl MeshEvents {
    pub fn new() -> Self {
        Self {
            messages: broadcast::channel(CHANNEL_CAPACITY).0,
            directed: broadcast::channel(CHANNEL_CAPACITY).0,
            peers: broadcast::channel(CHANNEL_CAPACITY).0,
            friend_codes: broadcast::channel(CHANNEL_CAPACITY).0,
            friend_requests: broadcast::channel(CHANNEL_CAPACITY).0,
            diagnostics: broadcast::channel(CHANNEL_CAPACITY).0,
            status: broadcast::channel(CHANNEL_CAPACITY).0,
            errors: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Broadcast and SOS messages.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<MeshMessage> {
        self.messages.subscribe()
    }

    /// Directed messages addressed to this node.
    pub fn subscribe_directed(&self) -> broadcast::Receiver<MeshMessage> {
        self.directed.subscribe()
    }

    pub fn subscribe_peers(&self) -> broadcast::Receiver<Peer> {
        self.peers.subscribe()
    }

    pub fn subscribe_friend_codes(&self) -> broadcast::Receiver<FriendCodeDiscovery> {
        self.friend_codes.subscribe()
    }

    pub fn subscribe_friend_requests(&self) -> broadcast::Receiver<FriendRequestEvent> {
        self.friend_requests.subscribe()
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<PacketDiagnostic> {
        self.diagnostics.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<String> {
        self.status.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    pub fn publish_message(&self, message: MeshMessage) {
        let _ = self.messages.send(message);
    }

    pub fn publish_directed(&self, message: MeshMessage) {
        let _ = self.directed.send(message);
    }

    pub fn publish_peer(&self, peer: Peer) {
        let _ = self.peers.send(peer);
    }

    pub fn publish_friend_code(&self, discovery: FriendCodeDiscovery) {
        let _ = self.friend_codes.send(discovery);
    }

    pub fn publish_friend_request(&self, request: FriendRequestEvent) {
        let _ = self.friend_requests.send(request);
    }

    pub fn publish_diagnostic(&self, diagnostic: PacketDiagnostic) {
        let _ = self.diagnostics.send(diagnostic);
    }

    pub fn publish_status(&self, status: impl Into<String>) {
        let status = status.into();
        log::info!("status: {status}");
        let _ = self.status.send(status);
    }

    pub fn publish_error(&self, error: impl Into<String>) {
        let error = error.into();
        log::warn!("engine error: {error}");
        let _ = self.errors.send(error);
    }
}

impl Default for MeshEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishing_without_subscribers_does_not_panic() {
        let events = MeshEvents::new();
        events.publish_status("starting");
        events.publish_error("nothing listening");
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_event() {
        let events = MeshEvents::new();
        let mut a = events.subscribe_friend_codes();
        let mut b = events.subscribe_friend_codes();

        events.publish_friend_code(FriendCodeDiscovery {
            sender_hash: 0x1234,
            friend_code: "1234".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().friend_code, "1234");
        assert_eq!(b.recv().await.unwrap().friend_code, "1234");
    }
}
