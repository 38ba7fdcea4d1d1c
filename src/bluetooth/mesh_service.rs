//! Bluetooth LE Mesh Service
//!
//! The engine: owns the scan loop, the announcer, the relay-queue
//! processor, the friend-request retry ticker, and periodic cache
//! maintenance. Everything observable leaves through the event streams;
//! everything transmitted goes through the advertising mutex.

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time;

use super::advertiser::{Advertiser, DEFAULT_BROADCAST_WINDOW};
use super::peer_manager::PeerManager;
use super::protocol::{MeshCodec, MeshFrame, PacketType, MANUFACTURER_ID};
use super::radio::MeshRadio;
use crate::events::MeshEvents;
use crate::identity::{parse_friend_code, LocalIdentity, NICKNAME_KEY};
use crate::location::{LocationProvider, LocationService};
use crate::message::router::MeshRouter;
use crate::persistence::KeyValueStore;

/// Engine timing knobs. Defaults reflect the deployed protocol; tests
/// shrink them to keep wall-clock time down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// One scan window.
    pub scan_window: Duration,
    /// Random restart delay after a scan window ends, [min, max).
    pub scan_restart_min: Duration,
    pub scan_restart_max: Duration,
    /// Prefer low-latency scanning where the radio supports it.
    pub low_latency_scan: bool,
    /// How long one advertisement is held on air.
    pub broadcast_window: Duration,
    /// Relay-queue processing cadence.
    pub relay_tick: Duration,
    /// Random pre-send delay for relayed frames, [min, max).
    pub relay_delay_min: Duration,
    pub relay_delay_max: Duration,
    /// Random gap between presence announcements, [min, max).
    pub announce_min: Duration,
    pub announce_max: Duration,
    /// Friend-request retry cadence.
    pub friend_retry_interval: Duration,
    /// Cache maintenance cadence.
    pub maintenance_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(10),
            scan_restart_min: Duration::from_millis(500),
            scan_restart_max: Duration::from_millis(1000),
            low_latency_scan: true,
            broadcast_window: DEFAULT_BROADCAST_WINDOW,
            relay_tick: Duration::from_millis(100),
            relay_delay_min: Duration::from_millis(50),
            relay_delay_max: Duration::from_millis(200),
            announce_min: Duration::from_millis(4000),
            announce_max: Duration::from_millis(7000),
            friend_retry_interval: Duration::from_secs(3),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// The mesh engine. Instantiate once at the application root and hand
/// out stream subscriptions; there are no process-wide singletons.
pub struct MeshService {
    config: MeshConfig,
    radio: Arc<dyn MeshRadio>,
    store: Arc<dyn KeyValueStore>,
    peer_manager: Arc<PeerManager>,
    router: Arc<MeshRouter>,
    advertiser: Arc<Advertiser>,
    events: Arc<MeshEvents>,
    location: Arc<LocationService>,
    is_running: Arc<RwLock<bool>>,
    // Cleared when the radio refuses to start (permissions, no adapter).
    operational: Arc<AtomicBool>,
}

impl MeshService {
    pub fn new(radio: Arc<dyn MeshRadio>, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Self::with_config(radio, store, MeshConfig::default(), None)
    }

    pub fn with_config(
        radio: Arc<dyn MeshRadio>,
        store: Arc<dyn KeyValueStore>,
        config: MeshConfig,
        location_provider: Option<Arc<dyn LocationProvider>>,
    ) -> Result<Self> {
        let identity = LocalIdentity::load_or_create(store.as_ref())
            .context("failed to load node identity")?;
        info!(
            "node {} (hash {:04X}, friend code {})",
            identity.node_id, identity.node_hash, identity.friend_code
        );

        let events = Arc::new(MeshEvents::new());
        let peer_manager = Arc::new(PeerManager::new(identity.nickname.clone()));
        let router = Arc::new(MeshRouter::new(
            identity,
            peer_manager.clone(),
            events.clone(),
        ));
        let advertiser = Arc::new(Advertiser::with_window(
            radio.clone(),
            events.clone(),
            config.broadcast_window,
        ));

        Ok(Self {
            config,
            radio,
            store,
            peer_manager,
            router,
            advertiser,
            events,
            location: Arc::new(LocationService::new(location_provider)),
            is_running: Arc::new(RwLock::new(false)),
            operational: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn events(&self) -> &Arc<MeshEvents> {
        &self.events
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub fn identity(&self) -> &LocalIdentity {
        self.router.identity()
    }

    /// The code others type to add this node.
    pub fn my_friend_code(&self) -> &str {
        &self.router.identity().friend_code
    }

    pub fn router(&self) -> &Arc<MeshRouter> {
        &self.router
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn is_operational(&self) -> bool {
        self.operational.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start scanning and all background tasks. Radio failures do not
    /// fail the call: the engine comes up degraded and reports on the
    /// error stream.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        self.events.publish_status("mesh engine starting");

        self.try_start_scan().await;
        self.spawn_scan_restart_task();
        self.spawn_scan_result_task();
        self.spawn_relay_processor();
        self.spawn_announcer();
        self.spawn_friend_retry_ticker();
        self.spawn_maintenance_task();

        self.events.publish_status(if self.is_operational() {
            "mesh engine running"
        } else {
            "mesh engine degraded: radio unavailable"
        });
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        if let Err(e) = self.radio.stop_scan().await {
            debug!("stop_scan during shutdown failed: {e:#}");
        }
        let _ = self.radio.stop_advertising().await;

        self.events.publish_status("mesh engine stopped");
        Ok(())
    }

    /// Re-attempt radio bring-up after a permission grant or adapter
    /// change.
    pub async fn retry_radio(&self) {
        self.operational.store(true, Ordering::SeqCst);
        self.try_start_scan().await;
    }

    async fn try_start_scan(&self) {
        if !self.is_operational() {
            return;
        }
        if let Err(e) = self
            .radio
            .start_scan(self.config.scan_window, self.config.low_latency_scan)
            .await
        {
            self.operational.store(false, Ordering::SeqCst);
            self.events
                .publish_error(format!("scan start failed: {e:#}"));
        }
    }

    // ------------------------------------------------------------------
    // Outbound operations
    // ------------------------------------------------------------------

    /// Broadcast a chat message, annotated with coordinates when a
    /// location provider is available.
    pub async fn send_message(&self, text: &str) -> Result<String> {
        self.send_positioned(PacketType::Message, text).await
    }

    /// Broadcast an SOS beacon.
    pub async fn send_sos(&self, text: &str) -> Result<String> {
        self.send_positioned(PacketType::Sos, text).await
    }

    async fn send_positioned(&self, packet_type: PacketType, text: &str) -> Result<String> {
        let fix = self.location.acquire().await;
        let (latitude, longitude) = match fix {
            Some((lat, lon)) => (Some(lat), Some(lon)),
            None => (None, None),
        };

        let frame = self
            .router
            .build_broadcast(packet_type, text, latitude, longitude)
            .await;
        let id = super::protocol::message_key(frame.msg_id_hash);
        self.transmit_or_queue(&frame).await;
        Ok(id)
    }

    /// Send a private message to the holder of `friend_code`.
    pub async fn send_direct(&self, friend_code: &str, text: &str) -> Result<String> {
        let Some(target_hash) = parse_friend_code(friend_code) else {
            bail!("invalid friend code: {friend_code:?}");
        };

        let frame = self
            .router
            .build_directed(PacketType::Direct, target_hash, text)
            .await;
        let id = super::protocol::message_key(frame.msg_id_hash);
        self.transmit_or_queue(&frame).await;
        Ok(id)
    }

    /// Initiate a friend handshake: one transmission now, retries on the
    /// ticker until exhausted or answered.
    pub async fn add_friend(&self, friend_code: &str) -> Result<()> {
        let Some(target_hash) = parse_friend_code(friend_code) else {
            bail!("invalid friend code: {friend_code:?}");
        };

        let text = self.router.friend_request_text().await;
        let frame = self
            .router
            .build_directed(PacketType::FriendRequest, target_hash, &text)
            .await;
        // Retries go on the books first so a mutual add arriving during
        // the transmission window can already cancel them.
        self.router
            .schedule_friend_request_retries(friend_code)
            .await;
        self.transmit_or_queue(&frame).await;
        info!("friend request sent to {friend_code}");
        Ok(())
    }

    /// Update and persist the display nickname.
    pub async fn set_nickname(&self, nickname: &str) -> Result<()> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            bail!("nickname must not be empty");
        }
        self.store.set_string(NICKNAME_KEY, nickname)?;
        self.peer_manager.set_own_nickname(nickname.to_string()).await;
        Ok(())
    }

    /// Transmit immediately when the advertising slot is free, otherwise
    /// queue for the next relay tick.
    async fn transmit_or_queue(&self, frame: &MeshFrame) {
        let data = MeshCodec::encode(frame);
        if !self.advertiser.broadcast(&data).await {
            debug!("advertiser busy, queueing outbound frame");
            self.router.enqueue_outbound(data).await;
        }
    }

    pub async fn status(&self) -> Value {
        serde_json::json!({
            "running": self.is_running().await,
            "operational": self.is_operational(),
            "node_id": self.identity().node_id,
            "friend_code": self.identity().friend_code,
            "nickname": self.peer_manager.own_nickname().await,
            "manufacturer_id": MANUFACTURER_ID,
            "peers": self.peer_manager.statistics().await,
            "router": self.router.statistics().await,
        })
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Restart scanning with jitter whenever the radio reports the scan
    /// ended.
    fn spawn_scan_restart_task(&self) {
        let radio = self.radio.clone();
        let events = self.events.clone();
        let is_running = self.is_running.clone();
        let operational = self.operational.clone();
        let config = self.config.clone();
        let mut scan_state = self.radio.scan_state();

        tokio::spawn(async move {
            loop {
                match scan_state.recv().await {
                    Ok(true) => {}
                    Ok(false) => {
                        if !*is_running.read().await {
                            break;
                        }
                        if !operational.load(Ordering::SeqCst) {
                            continue;
                        }
                        time::sleep(jitter(
                            config.scan_restart_min,
                            config.scan_restart_max,
                        ))
                        .await;
                        if !*is_running.read().await {
                            break;
                        }
                        if let Err(e) = radio
                            .start_scan(config.scan_window, config.low_latency_scan)
                            .await
                        {
                            operational.store(false, Ordering::SeqCst);
                            events.publish_error(format!("scan restart failed: {e:#}"));
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("scan-state stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("scan restart task ended");
        });
    }

    /// Filter scan results by manufacturer id and feed the router.
    fn spawn_scan_result_task(&self) {
        let router = self.router.clone();
        let is_running = self.is_running.clone();
        let mut results = self.radio.scan_results();

        tokio::spawn(async move {
            loop {
                match results.recv().await {
                    Ok(result) => {
                        if !*is_running.read().await {
                            break;
                        }
                        let Some(data) = result.manufacturer_data.get(&MANUFACTURER_ID) else {
                            continue;
                        };
                        router
                            .handle_packet(data, result.rssi, Some(result.peer_address.clone()))
                            .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("scan-result stream lagged by {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("scan result task ended");
        });
    }

    /// Drain the relay queue: one frame per tick, jittered, gated on the
    /// advertising mutex.
    fn spawn_relay_processor(&self) {
        let router = self.router.clone();
        let advertiser = self.advertiser.clone();
        let is_running = self.is_running.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut tick = time::interval(config.relay_tick);
            tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                if !*is_running.read().await {
                    break;
                }
                if advertiser.is_busy() {
                    continue;
                }
                let Some(frame) = router.pop_relay_frame().await else {
                    continue;
                };

                time::sleep(jitter(config.relay_delay_min, config.relay_delay_max)).await;
                if !advertiser.broadcast(&frame).await {
                    // Slot taken while we were jittering; retry next tick.
                    router.requeue_relay_frame(frame).await;
                }
            }
            debug!("relay processor ended");
        });
    }

    /// Presence beacons on a randomized interval.
    fn spawn_announcer(&self) {
        let router = self.router.clone();
        let advertiser = self.advertiser.clone();
        let is_running = self.is_running.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                time::sleep(jitter(config.announce_min, config.announce_max)).await;
                if !*is_running.read().await {
                    break;
                }

                let text = router.announce_text().await;
                let frame = router
                    .build_broadcast(PacketType::Announce, &text, None, None)
                    .await;
                // A busy slot just skips this beacon; the next one is
                // seconds away.
                if !advertiser.broadcast(&MeshCodec::encode(&frame)).await {
                    debug!("announcement skipped, advertiser busy");
                }
            }
            debug!("announcer ended");
        });
    }

    /// Retransmit one pending friend request per tick.
    fn spawn_friend_retry_ticker(&self) {
        let router = self.router.clone();
        let advertiser = self.advertiser.clone();
        let is_running = self.is_running.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut tick = time::interval(config.friend_retry_interval);
            tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            tick.tick().await;

            loop {
                tick.tick().await;
                if !*is_running.read().await {
                    break;
                }
                let Some(code) = router.next_friend_request_retry().await else {
                    continue;
                };
                let Some(target_hash) = parse_friend_code(&code) else {
                    error!("pending friend request with unparsable code {code:?}");
                    continue;
                };

                let text = router.friend_request_text().await;
                let frame = router
                    .build_directed(PacketType::FriendRequest, target_hash, &text)
                    .await;
                let data = MeshCodec::encode(&frame);
                if !advertiser.broadcast(&data).await {
                    router.enqueue_outbound(data).await;
                }
                debug!("retransmitted friend request to {code}");
            }
            debug!("friend retry ticker ended");
        });
    }

    /// Periodic cache pruning.
    fn spawn_maintenance_task(&self) {
        let router = self.router.clone();
        let peer_manager = self.peer_manager.clone();
        let is_running = self.is_running.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut tick = time::interval(config.maintenance_interval);
            tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            tick.tick().await;

            loop {
                tick.tick().await;
                if !*is_running.read().await {
                    break;
                }
                router.run_maintenance().await;
                let offline = peer_manager.remove_offline_peers();
                let cooldowns = peer_manager.prune_cooldowns(Instant::now());
                if offline + cooldowns > 0 {
                    debug!("maintenance: {offline} offline peers, {cooldowns} cooldowns");
                }
            }
            debug!("maintenance task ended");
        });
    }
}

/// Uniform random duration in [min, max).
fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let spread = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::radio::ScanResult;
    use crate::persistence::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    /// Radio that accepts everything and records nothing.
    struct NullRadio {
        results_tx: broadcast::Sender<ScanResult>,
        state_tx: broadcast::Sender<bool>,
        advertising: AtomicBool,
    }

    impl NullRadio {
        fn new() -> Self {
            Self {
                results_tx: broadcast::channel(16).0,
                state_tx: broadcast::channel(16).0,
                advertising: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MeshRadio for NullRadio {
        async fn start_scan(&self, _window: Duration, _low_latency: bool) -> Result<()> {
            let _ = self.state_tx.send(true);
            Ok(())
        }

        async fn stop_scan(&self) -> Result<()> {
            let _ = self.state_tx.send(false);
            Ok(())
        }

        fn scan_results(&self) -> broadcast::Receiver<ScanResult> {
            self.results_tx.subscribe()
        }

        fn scan_state(&self) -> broadcast::Receiver<bool> {
            self.state_tx.subscribe()
        }

        async fn start_advertising(&self, _manufacturer_id: u16, _data: &[u8]) -> Result<()> {
            self.advertising.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_advertising(&self) -> Result<()> {
            self.advertising.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_advertising(&self) -> bool {
            self.advertising.load(Ordering::SeqCst)
        }
    }

    fn test_service() -> MeshService {
        MeshService::new(Arc::new(NullRadio::new()), Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_works() {
        let service = test_service();
        service.start().await.unwrap();
        service.start().await.unwrap();
        assert!(service.is_running().await);

        service.stop().await.unwrap();
        assert!(!service.is_running().await);
    }

    #[tokio::test]
    async fn set_nickname_persists_and_rejects_empty() {
        let store = Arc::new(MemoryStore::new());
        let service =
            MeshService::new(Arc::new(NullRadio::new()), store.clone()).unwrap();

        service.set_nickname("ember").await.unwrap();
        assert_eq!(
            store.get_string(NICKNAME_KEY).unwrap(),
            Some("ember".to_string())
        );
        assert!(service.set_nickname("  ").await.is_err());
    }

    #[tokio::test]
    async fn send_direct_rejects_bad_codes() {
        let service = test_service();
        assert!(service.send_direct("nope!", "hi").await.is_err());
        assert!(service.send_direct("12345", "hi").await.is_err());
    }

    #[tokio::test]
    async fn add_friend_schedules_retries() {
        let service = test_service();
        service.add_friend("5678").await.unwrap();
        assert_eq!(service.router().pending_friend_requests().await, 1);
    }

    #[tokio::test]
    async fn status_reports_identity() {
        let service = test_service();
        let status = service.status().await;
        assert_eq!(status["friend_code"], service.my_friend_code());
        assert_eq!(status["manufacturer_id"], MANUFACTURER_ID);
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(50), Duration::from_millis(200));
            assert!(d >= Duration::from_millis(50));
            assert!(d < Duration::from_millis(200));
        }
        assert_eq!(
            jitter(Duration::from_millis(7), Duration::from_millis(7)),
            Duration::from_millis(7)
        );
    }
}
