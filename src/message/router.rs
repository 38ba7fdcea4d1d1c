//! Message Router
//!
//! The inbound pipeline: decode → dedup → classify by type → peer table
//! update → local delivery → relay decision. Also owns the relay queue,
//! the outbound frame builders, and the friend-request retry map.

use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bluetooth::peer_manager::PeerManager;
use crate::bluetooth::protocol::{
    hash16, message_key, now_epoch, truncate_utf8, DecodedFrame, MeshCodec, MeshFrame, PacketType,
    DEFAULT_TTL, DIRECTED_BODY_SIZE, HEADER_SIZE, MAX_BROADCAST_TEXT, MAX_FRAME_SIZE,
};
use crate::events::{FriendCodeDiscovery, FriendRequestEvent, MeshEvents, PacketDiagnostic};
use crate::identity::{friend_code_of, LocalIdentity};
use crate::message::dedup::{DedupCache, Freshness, RelayLedger, CACHE_TTL};
use crate::message::message_types::MeshMessage;
use crate::message::storage::MessageLog;

/// Total friend-request transmissions per add (1 immediate + retries).
pub const FRIEND_REQUEST_ATTEMPTS: u8 = 5;

/// Announcements relay at most this many hops from the origin.
const MAX_ANNOUNCE_HOPS: u8 = 3;

/// Directed text budget that survives the total frame cap.
const DIRECTED_TEXT_BUDGET: usize = MAX_FRAME_SIZE - HEADER_SIZE - DIRECTED_BODY_SIZE;

/// Classification, delivery, and relay decisions for one node.
pub struct MeshRouter {
    identity: LocalIdentity,
    peer_manager: Arc<PeerManager>,
    events: Arc<MeshEvents>,
    log: MessageLog,
    dedup: Mutex<DedupCache>,
    relay_ledger: Mutex<RelayLedger>,
    relay_queue: Mutex<VecDeque<Vec<u8>>>,
    pending_friend_requests: Mutex<HashMap<String, u8>>,
}

impl MeshRouter {
    pub fn new(
        identity: LocalIdentity,
        peer_manager: Arc<PeerManager>,
        events: Arc<MeshEvents>,
    ) -> Self {
        Self {
            identity,
            peer_manager,
            events,
            log: MessageLog::new(),
            dedup: Mutex::new(DedupCache::new()),
            relay_ledger: Mutex::new(RelayLedger::new()),
            relay_queue: Mutex::new(VecDeque::new()),
            pending_friend_requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn message_log(&self) -> &MessageLog {
        &self.log
    }

    // ------------------------------------------------------------------
    // Inbound pipeline
    // ------------------------------------------------------------------

    /// Process one scanned manufacturer-data payload. Emits a diagnostic
    /// for every packet, including the ones that go no further.
    pub async fn handle_packet(&self, data: &[u8], rssi: Option<i16>, peer_address: Option<String>) {
        let decoded = MeshCodec::decode(data);

        let DecodedFrame { frame, utf8_error } = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("undecodable packet ({e}), {} bytes", data.len());
                self.events.publish_diagnostic(PacketDiagnostic {
                    hex: hex_of(data),
                    peer_address,
                    rssi,
                    packet_type: None,
                    ttl: None,
                    msg_id_hash: None,
                    sender_hash: None,
                    is_duplicate: false,
                    is_from_self: false,
                    decode_error: Some(e.to_string()),
                });
                return;
            }
        };

        let key = message_key(frame.msg_id_hash);
        let is_from_self = frame.sender_hash == self.identity.node_hash;
        let freshness = self
            .dedup
            .lock()
            .await
            .observe(&key, frame.ttl, Instant::now());
        let is_duplicate = freshness == Freshness::Duplicate;

        self.events.publish_diagnostic(PacketDiagnostic {
            hex: hex_of(data),
            peer_address,
            rssi,
            packet_type: Some(frame.packet_type),
            ttl: Some(frame.ttl),
            msg_id_hash: Some(frame.msg_id_hash),
            sender_hash: Some(frame.sender_hash),
            is_duplicate,
            is_from_self,
            decode_error: utf8_error
                .then(|| crate::bluetooth::protocol::DecodeError::MalformedUtf8.to_string()),
        });

        if is_duplicate {
            debug!("dropping duplicate {key}");
            return;
        }
        if is_from_self {
            debug!("dropping own frame {key}");
            return;
        }

        match frame.packet_type {
            PacketType::Announce => self.handle_announce(&frame, rssi).await,
            PacketType::Message | PacketType::Sos => {
                self.handle_broadcast(&frame, freshness, rssi).await
            }
            PacketType::Direct | PacketType::FriendRequest => {
                self.handle_directed(&frame, freshness, rssi).await
            }
            PacketType::Ack => {
                // Acknowledgment semantics are not part of this mesh;
                // the sighting still proves the peer is alive.
                self.peer_manager.touch(frame.sender_hash);
            }
        }
    }

    /// Announce frames: hop-0 neighbor marking, per-sender cooldown,
    /// nickname/friend-code learning, bounded relay.
    async fn handle_announce(&self, frame: &MeshFrame, rssi: Option<i16>) {
        let hop_count = frame.hop_count();

        if !self
            .peer_manager
            .accept_announcement(frame.sender_hash, Instant::now())
        {
            if hop_count == 0 {
                self.peer_manager.mark_direct_neighbor(frame.sender_hash);
            }
            debug!(
                "announcement from {:04X} inside cooldown, dropped",
                frame.sender_hash
            );
            return;
        }

        let peer = self.peer_manager.record_sighting(frame.sender_hash, rssi);
        if hop_count == 0 {
            self.peer_manager.mark_direct_neighbor(frame.sender_hash);
        }

        let (nickname, friend_code) = parse_identity_text(frame.text());
        if let Some(nickname) = nickname {
            self.peer_manager.update_nickname(frame.sender_hash, nickname);
        }
        if let Some(code) = friend_code {
            self.peer_manager.update_friend_code(frame.sender_hash, code);
            self.events.publish_friend_code(FriendCodeDiscovery {
                sender_hash: frame.sender_hash,
                friend_code: code.to_uppercase(),
            });
        }

        self.events.publish_peer(
            self.peer_manager
                .get_peer(frame.sender_hash)
                .unwrap_or(peer),
        );

        // A direct neighbor rebroadcasts itself; only relayed copies
        // within the hop budget travel further.
        if frame.ttl > 0 && hop_count > 0 && hop_count < MAX_ANNOUNCE_HOPS {
            self.consider_relay(frame).await;
        }
    }

    /// Message and SOS broadcasts: deliver once, flood while TTL lasts.
    async fn handle_broadcast(&self, frame: &MeshFrame, freshness: Freshness, rssi: Option<i16>) {
        let peer = self.peer_manager.record_sighting(frame.sender_hash, rssi);
        self.events.publish_peer(peer.clone());

        if freshness == Freshness::New {
            let message = MeshMessage::from_frame(frame, peer.nickname);
            self.log.append(message.clone()).await;
            self.events.publish_message(message);
        }

        if frame.ttl > 0 {
            self.consider_relay(frame).await;
        }
    }

    /// Directed frames: address-filtered local delivery, unconditional
    /// relay. The mesh does not hide who is being talked to.
    async fn handle_directed(&self, frame: &MeshFrame, freshness: Freshness, rssi: Option<i16>) {
        let peer = self.peer_manager.record_sighting(frame.sender_hash, rssi);
        self.events.publish_peer(peer.clone());

        let target_matches = frame.target_hash() == Some(self.identity.node_hash);

        if target_matches && freshness == Freshness::New {
            match frame.packet_type {
                PacketType::FriendRequest => {
                    let (nickname, friend_code) = parse_identity_text(frame.text());
                    let friend_code = friend_code
                        .map(str::to_uppercase)
                        .unwrap_or_else(|| friend_code_of(frame.sender_hash));

                    // Mutual add: they asked us, stop asking them.
                    self.cancel_pending_friend_request(&friend_code).await;

                    self.events.publish_friend_request(FriendRequestEvent {
                        sender_hash: frame.sender_hash,
                        nickname: nickname.unwrap_or_default().to_string(),
                        friend_code,
                    });
                }
                _ => {
                    let message = MeshMessage::from_frame(frame, peer.nickname);
                    self.events.publish_directed(message);
                }
            }
        }

        if frame.ttl > 0 {
            self.consider_relay(frame).await;
        }
    }

    /// Enqueue a TTL-decremented copy if the flood rules allow it.
    async fn consider_relay(&self, frame: &MeshFrame) {
        let Some(relayed) = frame.decrement_ttl() else {
            return;
        };
        // A spent copy is delivered but travels no further.
        if relayed.ttl == 0 {
            return;
        }

        let key = message_key(frame.msg_id_hash);
        let now = Instant::now();
        {
            let mut ledger = self.relay_ledger.lock().await;
            if !ledger.permits(&key, relayed.ttl, now) {
                debug!("relay of {key} suppressed by ledger");
                return;
            }
            ledger.record(&key, relayed.ttl, now);
        }

        self.relay_queue
            .lock()
            .await
            .push_back(MeshCodec::encode(&relayed));
        self.peer_manager.increment_relay_count(frame.sender_hash);
        debug!("enqueued relay of {key} at ttl {}", relayed.ttl);
    }

    // ------------------------------------------------------------------
    // Relay queue
    // ------------------------------------------------------------------

    /// Next frame ready for transmission, FIFO.
    pub async fn pop_relay_frame(&self) -> Option<Vec<u8>> {
        self.relay_queue.lock().await.pop_front()
    }

    /// Requeue a frame the advertiser refused (front, to keep FIFO order).
    pub async fn requeue_relay_frame(&self, data: Vec<u8>) {
        self.relay_queue.lock().await.push_front(data);
    }

    /// Queue a locally originated frame for the next free transmit slot.
    pub async fn enqueue_outbound(&self, data: Vec<u8>) {
        self.relay_queue.lock().await.push_back(data);
    }

    pub async fn relay_queue_len(&self) -> usize {
        self.relay_queue.lock().await.len()
    }

    // ------------------------------------------------------------------
    // Outbound frame builders
    // ------------------------------------------------------------------

    /// Build a locally originated broadcast frame and pre-register its id
    /// so echoed copies are dropped as duplicates.
    pub async fn build_broadcast(
        &self,
        packet_type: PacketType,
        text: &str,
        latitude: Option<f32>,
        longitude: Option<f32>,
    ) -> MeshFrame {
        let msg_id_hash = fresh_message_id();
        let frame = MeshFrame::new_broadcast(
            packet_type,
            DEFAULT_TTL,
            msg_id_hash,
            self.identity.node_hash,
            now_epoch(),
            latitude,
            longitude,
            text,
        );
        self.register_own_frame(msg_id_hash).await;
        frame
    }

    /// Build a locally originated directed frame (direct or
    /// friendRequest).
    pub async fn build_directed(
        &self,
        packet_type: PacketType,
        target_hash: u16,
        text: &str,
    ) -> MeshFrame {
        let msg_id_hash = fresh_message_id();
        let frame = MeshFrame::new_directed(
            packet_type,
            DEFAULT_TTL,
            msg_id_hash,
            self.identity.node_hash,
            target_hash,
            now_epoch(),
            text,
        );
        self.register_own_frame(msg_id_hash).await;
        frame
    }

    /// The announcement payload: nickname truncated so the friend code
    /// always survives the broadcast text budget.
    pub async fn announce_text(&self) -> String {
        let nickname = self.peer_manager.own_nickname().await;
        let code = &self.identity.friend_code;
        let nick_budget = MAX_BROADCAST_TEXT.saturating_sub(code.len() + 1);
        format!("{}|{}", truncate_utf8(&nickname, nick_budget), code)
    }

    /// The friend-request payload, sized for the directed budget.
    pub async fn friend_request_text(&self) -> String {
        let nickname = self.peer_manager.own_nickname().await;
        let code = &self.identity.friend_code;
        let nick_budget = DIRECTED_TEXT_BUDGET.saturating_sub(code.len() + 1);
        format!("{}|{}", truncate_utf8(&nickname, nick_budget), code)
    }

    async fn register_own_frame(&self, msg_id_hash: u16) {
        self.dedup
            .lock()
            .await
            .observe(&message_key(msg_id_hash), DEFAULT_TTL, Instant::now());
    }

    // ------------------------------------------------------------------
    // Friend-request retry map
    // ------------------------------------------------------------------

    /// Schedule retries for a just-sent friend request.
    pub async fn schedule_friend_request_retries(&self, friend_code: &str) {
        self.pending_friend_requests
            .lock()
            .await
            .insert(friend_code.to_uppercase(), FRIEND_REQUEST_ATTEMPTS - 1);
    }

    /// Pop one pending target for retransmission: decrement its counter,
    /// dropping the entry when it reaches zero.
    pub async fn next_friend_request_retry(&self) -> Option<String> {
        let mut pending = self.pending_friend_requests.lock().await;
        let code = pending.keys().next().cloned()?;
        let remaining = pending.get_mut(&code).expect("key just observed");
        *remaining -= 1;
        if *remaining == 0 {
            pending.remove(&code);
        }
        Some(code)
    }

    pub async fn cancel_pending_friend_request(&self, friend_code: &str) {
        if self
            .pending_friend_requests
            .lock()
            .await
            .remove(&friend_code.to_uppercase())
            .is_some()
        {
            debug!("cancelled pending friend request to {friend_code}");
        }
    }

    pub async fn pending_friend_requests(&self) -> usize {
        self.pending_friend_requests.lock().await.len()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Periodic cache pass: expired dedup entries, stale relay records,
    /// aged-out log messages.
    pub async fn run_maintenance(&self) {
        let now = Instant::now();
        let dedup_removed = self.dedup.lock().await.prune(now, CACHE_TTL);
        let ledger_removed = self.relay_ledger.lock().await.prune(now, CACHE_TTL);
        let log_removed = self.log.prune_expired().await;

        if dedup_removed + ledger_removed + log_removed > 0 {
            debug!(
                "maintenance: dropped {dedup_removed} dedup, {ledger_removed} relay, \
                 {log_removed} log entries"
            );
        }
    }

    pub async fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "dedup_entries": self.dedup.lock().await.len(),
            "relay_records": self.relay_ledger.lock().await.len(),
            "relay_queue": self.relay_queue_len().await,
            "pending_friend_requests": self.pending_friend_requests().await,
            "log": self.log.statistics().await,
        })
    }
}

/// Random per-send message id: 16-bit hash of a fresh UUID.
fn fresh_message_id() -> u16 {
    hash16(&Uuid::new_v4().to_string())
}

/// Split `"nickname|friendCode"`; the legacy form omits the code.
fn parse_identity_text(text: &str) -> (Option<&str>, Option<&str>) {
    match text.split_once('|') {
        Some((nickname, code)) if !code.trim().is_empty() => {
            (non_empty(nickname), Some(code.trim()))
        }
        Some((nickname, _)) => (non_empty(nickname), None),
        None => (non_empty(text), None),
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn hex_of(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(node_id: &str, nickname: &str) -> LocalIdentity {
        let node_hash = hash16(node_id);
        LocalIdentity {
            node_id: node_id.to_string(),
            node_hash,
            friend_code: friend_code_of(node_hash),
            nickname: nickname.to_string(),
        }
    }

    fn test_router() -> (Arc<MeshRouter>, Arc<MeshEvents>, LocalIdentity) {
        let identity = test_identity("a1b2c3d4", "alice");
        let events = Arc::new(MeshEvents::new());
        let peer_manager = Arc::new(PeerManager::new(identity.nickname.clone()));
        let router = Arc::new(MeshRouter::new(
            identity.clone(),
            peer_manager,
            events.clone(),
        ));
        (router, events, identity)
    }

    fn remote_broadcast(msg_id_hash: u16, sender_hash: u16, ttl: u8, text: &str) -> Vec<u8> {
        MeshCodec::encode(&MeshFrame::new_broadcast(
            PacketType::Message,
            ttl,
            msg_id_hash,
            sender_hash,
            1_700_000_000,
            None,
            None,
            text,
        ))
    }

    #[tokio::test]
    async fn broadcast_is_delivered_once_and_relayed() {
        let (router, events, _) = test_router();
        let mut messages = events.subscribe_messages();

        router
            .handle_packet(&remote_broadcast(0x0A0A, 0x1234, 5, "hi"), None, None)
            .await;

        let delivered = messages.recv().await.unwrap();
        assert_eq!(delivered.content, "hi");
        assert_eq!(delivered.hop_count, 0);
        assert!(!delivered.was_relayed);

        let relayed = router.pop_relay_frame().await.expect("relay enqueued");
        let decoded = MeshCodec::decode(&relayed).unwrap();
        assert_eq!(decoded.frame.ttl, 4);
    }

    #[tokio::test]
    async fn duplicate_receipt_neither_delivers_nor_relays_again() {
        let (router, events, _) = test_router();
        let mut messages = events.subscribe_messages();

        let packet = remote_broadcast(0x0A0A, 0x1234, 5, "hi");
        router.handle_packet(&packet, None, None).await;
        router.handle_packet(&packet, None, None).await;

        assert!(messages.recv().await.is_ok());
        assert!(messages.try_recv().is_err());

        assert!(router.pop_relay_frame().await.is_some());
        assert!(router.pop_relay_frame().await.is_none());
    }

    #[tokio::test]
    async fn fresher_copy_relays_but_does_not_redeliver() {
        let (router, events, _) = test_router();
        let mut messages = events.subscribe_messages();

        router
            .handle_packet(&remote_broadcast(0x0B0B, 0x1234, 3, "hi"), None, None)
            .await;
        // The spacing window must pass before the fresher copy can relay.
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        router
            .handle_packet(&remote_broadcast(0x0B0B, 0x1234, 4, "hi"), None, None)
            .await;

        assert!(messages.recv().await.is_ok());
        assert!(messages.try_recv().is_err());

        let first = router.pop_relay_frame().await.unwrap();
        assert_eq!(MeshCodec::decode(&first).unwrap().frame.ttl, 2);
        let second = router.pop_relay_frame().await.unwrap();
        assert_eq!(MeshCodec::decode(&second).unwrap().frame.ttl, 3);
    }

    #[tokio::test]
    async fn own_frames_are_dropped_with_diagnostic() {
        let (router, events, identity) = test_router();
        let mut messages = events.subscribe_messages();
        let mut diagnostics = events.subscribe_diagnostics();

        router
            .handle_packet(
                &remote_broadcast(0x0C0C, identity.node_hash, 5, "echo"),
                None,
                None,
            )
            .await;

        let diagnostic = diagnostics.recv().await.unwrap();
        assert!(diagnostic.is_from_self);
        assert!(messages.try_recv().is_err());
        assert!(router.pop_relay_frame().await.is_none());
    }

    #[tokio::test]
    async fn hop_zero_announce_is_not_relayed() {
        let (router, events, _) = test_router();
        let mut codes = events.subscribe_friend_codes();

        let announce = MeshCodec::encode(&MeshFrame::new_broadcast(
            PacketType::Announce,
            5,
            0x0D0D,
            0x1234,
            1_700_000_000,
            None,
            None,
            "bob|1234",
        ));
        router.handle_packet(&announce, None, None).await;

        assert_eq!(codes.recv().await.unwrap().friend_code, "1234");
        assert!(router.pop_relay_frame().await.is_none());
    }

    #[tokio::test]
    async fn relayed_announce_within_hop_budget_is_relayed() {
        let (router, _, _) = test_router();

        let announce = MeshCodec::encode(&MeshFrame::new_broadcast(
            PacketType::Announce,
            4,
            0x0E0E,
            0x1234,
            1_700_000_000,
            None,
            None,
            "bob|1234",
        ));
        router.handle_packet(&announce, None, None).await;
        assert!(router.pop_relay_frame().await.is_some());

        // Three hops out is past the announce budget.
        let far = MeshCodec::encode(&MeshFrame::new_broadcast(
            PacketType::Announce,
            2,
            0x0E0F,
            0x5678,
            1_700_000_000,
            None,
            None,
            "carol|5678",
        ));
        router.handle_packet(&far, None, None).await;
        assert!(router.pop_relay_frame().await.is_none());
    }

    #[tokio::test]
    async fn announce_cooldown_drops_rapid_repeat_entirely() {
        let (router, events, _) = test_router();
        let mut peers = events.subscribe_peers();

        let first = MeshCodec::encode(&MeshFrame::new_broadcast(
            PacketType::Announce,
            5,
            0x1111,
            0x1234,
            1_700_000_000,
            None,
            None,
            "bob|1234",
        ));
        let second = MeshCodec::encode(&MeshFrame::new_broadcast(
            PacketType::Announce,
            5,
            0x2222,
            0x1234,
            1_700_000_001,
            None,
            None,
            "bob|1234",
        ));

        router.handle_packet(&first, None, None).await;
        router.handle_packet(&second, None, None).await;

        assert!(peers.recv().await.is_ok());
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test]
    async fn directed_frame_for_us_is_delivered_and_relayed() {
        let (router, events, identity) = test_router();
        let mut directed = events.subscribe_directed();

        let frame = MeshCodec::encode(&MeshFrame::new_directed(
            PacketType::Direct,
            5,
            0x3333,
            0x5678,
            identity.node_hash,
            1_700_000_000,
            "hello",
        ));
        router.handle_packet(&frame, None, None).await;

        assert_eq!(directed.recv().await.unwrap().content, "hello");
        assert!(router.pop_relay_frame().await.is_some());
    }

    #[tokio::test]
    async fn directed_frame_for_someone_else_relays_without_delivery() {
        let (router, events, _) = test_router();
        let mut directed = events.subscribe_directed();

        let frame = MeshCodec::encode(&MeshFrame::new_directed(
            PacketType::Direct,
            5,
            0x4444,
            0x5678,
            0x9999,
            1_700_000_000,
            "not yours",
        ));
        router.handle_packet(&frame, None, None).await;

        assert!(directed.try_recv().is_err());
        assert!(router.pop_relay_frame().await.is_some());
    }

    #[tokio::test]
    async fn inbound_friend_request_cancels_matching_pending_retry() {
        let (router, events, identity) = test_router();
        let mut requests = events.subscribe_friend_requests();

        router.schedule_friend_request_retries("5678").await;
        assert_eq!(router.pending_friend_requests().await, 1);

        let sender_hash = 0x5678;
        let frame = MeshCodec::encode(&MeshFrame::new_directed(
            PacketType::FriendRequest,
            5,
            0x5555,
            sender_hash,
            identity.node_hash,
            1_700_000_000,
            "bob|5678",
        ));
        router.handle_packet(&frame, None, None).await;

        let request = requests.recv().await.unwrap();
        assert_eq!(request.friend_code, "5678");
        assert_eq!(request.nickname, "bob");
        assert_eq!(router.pending_friend_requests().await, 0);
    }

    #[tokio::test]
    async fn retry_map_counts_down_to_removal() {
        let (router, _, _) = test_router();
        router.schedule_friend_request_retries("abcd").await;

        for _ in 0..(FRIEND_REQUEST_ATTEMPTS - 1) {
            assert_eq!(router.next_friend_request_retry().await.as_deref(), Some("ABCD"));
        }
        assert_eq!(router.next_friend_request_retry().await, None);
    }

    #[tokio::test]
    async fn spent_ttl_is_never_enqueued() {
        let (router, _, _) = test_router();

        router
            .handle_packet(&remote_broadcast(0x6666, 0x1234, 1, "last"), None, None)
            .await;
        assert!(router.pop_relay_frame().await.is_none());

        router
            .handle_packet(&remote_broadcast(0x7777, 0x1234, 0, "dead"), None, None)
            .await;
        assert!(router.pop_relay_frame().await.is_none());
    }

    #[tokio::test]
    async fn announce_text_keeps_the_code_for_long_nicknames() {
        let identity = test_identity("a1b2c3d4", "bartholomew");
        let events = Arc::new(MeshEvents::new());
        let peer_manager = Arc::new(PeerManager::new("bartholomew".to_string()));
        let router = MeshRouter::new(identity.clone(), peer_manager, events);

        let text = router.announce_text().await;
        assert!(text.len() <= MAX_BROADCAST_TEXT);
        assert!(text.ends_with(&format!("|{}", identity.friend_code)));
    }

    #[tokio::test]
    async fn own_send_registration_makes_echo_a_duplicate() {
        let (router, events, _) = test_router();
        let mut diagnostics = events.subscribe_diagnostics();

        let frame = router
            .build_broadcast(PacketType::Message, "hi", None, None)
            .await;
        // A neighbor relays our frame back at ttl 4.
        let echoed = MeshCodec::encode(&frame.decrement_ttl().unwrap());
        router.handle_packet(&echoed, None, None).await;

        let diagnostic = diagnostics.recv().await.unwrap();
        assert!(diagnostic.is_duplicate);
        assert!(router.pop_relay_frame().await.is_none());
    }

    #[test]
    fn identity_text_parsing_handles_legacy_form() {
        assert_eq!(parse_identity_text("bob|1234"), (Some("bob"), Some("1234")));
        assert_eq!(parse_identity_text("bob"), (Some("bob"), None));
        assert_eq!(parse_identity_text("bob|"), (Some("bob"), None));
        assert_eq!(parse_identity_text(""), (None, None));
    }

    #[tokio::test]
    async fn maintenance_is_callable_on_an_idle_router() {
        let (router, _, _) = test_router();
        router.run_maintenance().await;
        assert_eq!(router.relay_queue_len().await, 0);
    }
}
