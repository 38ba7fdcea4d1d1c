//! Advertising Mutex
//!
//! BLE peripheral advertising is a single-slot resource. All outbound
//! frames funnel through this mutex: one advertisement in flight, a
//! quiesce delay after stopping a running one, and a random pre-jitter
//! so co-located nodes running the same logic desynchronize.

use anyhow::Result;
use log::debug;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;

use super::protocol::MANUFACTURER_ID;
use super::radio::MeshRadio;
use crate::events::MeshEvents;

/// Wait after stopping a running advertisement before starting the next.
pub const QUIESCE_DELAY: Duration = Duration::from_millis(150);

/// Upper bound (exclusive) of the random pre-transmission jitter.
pub const PRE_JITTER_MS: u64 = 200;

/// Default hold time for one advertisement.
pub const DEFAULT_BROADCAST_WINDOW: Duration = Duration::from_millis(1500);

/// Single-slot gate in front of the radio's advertiser.
pub struct Advertiser {
    radio: Arc<dyn MeshRadio>,
    events: Arc<MeshEvents>,
    busy: AtomicBool,
    broadcast_window: Duration,
}

impl Advertiser {
    pub fn new(radio: Arc<dyn MeshRadio>, events: Arc<MeshEvents>) -> Self {
        Self::with_window(radio, events, DEFAULT_BROADCAST_WINDOW)
    }

    pub fn with_window(
        radio: Arc<dyn MeshRadio>,
        events: Arc<MeshEvents>,
        broadcast_window: Duration,
    ) -> Self {
        Self {
            radio,
            events,
            busy: AtomicBool::new(false),
            broadcast_window,
        }
    }

    /// Whether an advertisement is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Transmit one frame. Returns false when the slot is busy or the
    /// radio failed; relay callers simply retry on their next tick.
    pub async fn broadcast(&self, data: &[u8]) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("advertising slot busy, refusing broadcast");
            return false;
        }

        let result = self.advertise_once(data).await;
        self.busy.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => true,
            Err(e) => {
                self.events.publish_error(format!("advertising failed: {e:#}"));
                false
            }
        }
    }

    async fn advertise_once(&self, data: &[u8]) -> Result<()> {
        if self.radio.is_advertising() {
            self.radio.stop_advertising().await?;
            time::sleep(QUIESCE_DELAY).await;
        }

        time::sleep(pre_jitter()).await;

        self.radio.start_advertising(MANUFACTURER_ID, data).await?;
        debug!("advertising {} bytes for {:?}", data.len(), self.broadcast_window);
        time::sleep(self.broadcast_window).await;
        self.radio.stop_advertising().await?;
        Ok(())
    }
}

fn pre_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..PRE_JITTER_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::radio::ScanResult;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;

    /// Radio double that records transmissions and optionally fails.
    struct FakeRadio {
        advertising: AtomicBool,
        starts: AtomicUsize,
        fail_start: bool,
        results_tx: broadcast::Sender<ScanResult>,
        state_tx: broadcast::Sender<bool>,
    }

    impl FakeRadio {
        fn new(fail_start: bool) -> Self {
            Self {
                advertising: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                fail_start,
                results_tx: broadcast::channel(8).0,
                state_tx: broadcast::channel(8).0,
            }
        }
    }

    #[async_trait]
    impl MeshRadio for FakeRadio {
        async fn start_scan(&self, _window: Duration, _low_latency: bool) -> Result<()> {
            Ok(())
        }

        async fn stop_scan(&self) -> Result<()> {
            Ok(())
        }

        fn scan_results(&self) -> broadcast::Receiver<ScanResult> {
            self.results_tx.subscribe()
        }

        fn scan_state(&self) -> broadcast::Receiver<bool> {
            self.state_tx.subscribe()
        }

        async fn start_advertising(&self, _manufacturer_id: u16, _data: &[u8]) -> Result<()> {
            if self.fail_start {
                bail!("adapter refused");
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
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

    #[tokio::test(start_paused = true)]
    async fn broadcast_holds_then_releases_the_slot() {
        let radio = Arc::new(FakeRadio::new(false));
        let events = Arc::new(MeshEvents::new());
        let advertiser = Arc::new(Advertiser::with_window(
            radio.clone(),
            events,
            Duration::from_millis(100),
        ));

        let handle = {
            let advertiser = advertiser.clone();
            tokio::spawn(async move { advertiser.broadcast(b"frame").await })
        };

        // Let the task reach its jitter sleep, then observe the busy flag.
        tokio::task::yield_now().await;
        assert!(advertiser.is_busy());

        assert!(handle.await.unwrap());
        assert!(!advertiser.is_busy());
        assert_eq!(radio.starts.load(Ordering::SeqCst), 1);
        assert!(!radio.is_advertising());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_broadcast_is_refused() {
        let radio = Arc::new(FakeRadio::new(false));
        let events = Arc::new(MeshEvents::new());
        let advertiser = Arc::new(Advertiser::with_window(
            radio.clone(),
            events,
            Duration::from_millis(500),
        ));

        let first = {
            let advertiser = advertiser.clone();
            tokio::spawn(async move { advertiser.broadcast(b"one").await })
        };
        tokio::task::yield_now().await;

        assert!(!advertiser.broadcast(b"two").await);
        assert!(first.await.unwrap());
        assert_eq!(radio.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn radio_failure_frees_the_mutex_and_reports() {
        let radio = Arc::new(FakeRadio::new(true));
        let events = Arc::new(MeshEvents::new());
        let mut errors = events.subscribe_errors();
        let advertiser = Advertiser::with_window(radio, events.clone(), Duration::from_millis(100));

        assert!(!advertiser.broadcast(b"frame").await);
        assert!(!advertiser.is_busy());
        assert!(errors.recv().await.unwrap().contains("advertising failed"));
    }
}
