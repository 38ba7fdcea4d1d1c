//! Radio Collaborator
//!
//! The engine drives BLE through the `MeshRadio` seam: scanning with
//! result and state subscriptions, and single-slot manufacturer-data
//! advertising. A `btleplug`-backed adapter ships for the scan side;
//! platforms without a peripheral role report advertising as
//! unsupported, which the engine surfaces on its error stream.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures::stream::StreamExt;
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time;

/// One advertisement heard during a scan window.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
    pub peer_address: String,
}

/// Scan and advertise primitives the engine depends on.
#[async_trait]
pub trait MeshRadio: Send + Sync {
    /// Begin a scan window. The radio reports `false` on its scan-state
    /// stream when the window ends or the scan dies.
    async fn start_scan(&self, window: Duration, low_latency: bool) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Advertisements observed while scanning.
    fn scan_results(&self) -> broadcast::Receiver<ScanResult>;

    /// Scanning-state transitions (true = scanning).
    fn scan_state(&self) -> broadcast::Receiver<bool>;

    /// Start advertising `data` as manufacturer-specific payload.
    async fn start_advertising(&self, manufacturer_id: u16, data: &[u8]) -> Result<()>;

    async fn stop_advertising(&self) -> Result<()>;

    fn is_advertising(&self) -> bool;
}

const RADIO_CHANNEL_CAPACITY: usize = 256;

/// `MeshRadio` over a btleplug central adapter.
///
/// btleplug exposes the central role only, so this adapter scans and
/// never advertises; `start_advertising` fails with a descriptive error.
pub struct BtleplugRadio {
    adapter: Mutex<Option<Adapter>>,
    results_tx: broadcast::Sender<ScanResult>,
    state_tx: broadcast::Sender<bool>,
    scanning: Arc<AtomicBool>,
    // Generation guard so a stale window timer cannot kill a newer scan.
    scan_generation: Arc<AtomicU64>,
    pump_started: AtomicBool,
}

impl BtleplugRadio {
    pub fn new() -> Self {
        Self {
            adapter: Mutex::new(None),
            results_tx: broadcast::channel(RADIO_CHANNEL_CAPACITY).0,
            state_tx: broadcast::channel(RADIO_CHANNEL_CAPACITY).0,
            scanning: Arc::new(AtomicBool::new(false)),
            scan_generation: Arc::new(AtomicU64::new(0)),
            pump_started: AtomicBool::new(false),
        }
    }

    /// Bind the first Bluetooth adapter and start the event pump once.
    async fn ensure_adapter(&self) -> Result<Adapter> {
        let mut slot = self.adapter.lock().await;
        if let Some(adapter) = slot.as_ref() {
            return Ok(adapter.clone());
        }

        let manager = Manager::new()
            .await
            .context("failed to create Bluetooth manager")?;
        let adapters = manager
            .adapters()
            .await
            .context("failed to enumerate Bluetooth adapters")?;
        let adapter = adapters
            .into_iter()
            .next()
            .context("no Bluetooth adapter found")?;

        info!(
            "using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.unwrap_or_default()
        );

        if !self.pump_started.swap(true, Ordering::SeqCst) {
            self.spawn_event_pump(&adapter).await?;
        }

        *slot = Some(adapter.clone());
        Ok(adapter)
    }

    async fn spawn_event_pump(&self, adapter: &Adapter) -> Result<()> {
        let mut events = adapter
            .events()
            .await
            .context("failed to subscribe to adapter events")?;
        let results_tx = self.results_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::ManufacturerDataAdvertisement {
                    id,
                    manufacturer_data,
                } = event
                {
                    debug!("advertisement from {:?}", id);
                    let _ = results_tx.send(ScanResult {
                        manufacturer_data,
                        rssi: None,
                        peer_address: format!("{:?}", id),
                    });
                }
            }
            error!("adapter event stream ended");
        });

        Ok(())
    }
}

impl Default for BtleplugRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshRadio for BtleplugRadio {
    async fn start_scan(&self, window: Duration, low_latency: bool) -> Result<()> {
        let adapter = self.ensure_adapter().await?;

        // btleplug has no scan-mode knob; the flag is honored by adapters
        // that do.
        let _ = low_latency;

        adapter
            .start_scan(ScanFilter::default())
            .await
            .context("failed to start BLE scan")?;

        self.scanning.store(true, Ordering::SeqCst);
        let generation = self.scan_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.state_tx.send(true);

        // End the window ourselves; the engine restarts with jitter.
        let scanning = self.scanning.clone();
        let scan_generation = self.scan_generation.clone();
        let state_tx = self.state_tx.clone();
        let window_adapter = adapter.clone();
        tokio::spawn(async move {
            time::sleep(window).await;
            if scan_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if scanning.swap(false, Ordering::SeqCst) {
                let _ = window_adapter.stop_scan().await;
                let _ = state_tx.send(false);
            }
        });

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let adapter = self.ensure_adapter().await?;
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.scan_generation.fetch_add(1, Ordering::SeqCst);
            adapter.stop_scan().await.context("failed to stop BLE scan")?;
            let _ = self.state_tx.send(false);
        }
        Ok(())
    }

    fn scan_results(&self) -> broadcast::Receiver<ScanResult> {
        self.results_tx.subscribe()
    }

    fn scan_state(&self) -> broadcast::Receiver<bool> {
        self.state_tx.subscribe()
    }

    async fn start_advertising(&self, _manufacturer_id: u16, _data: &[u8]) -> Result<()> {
        bail!("peripheral advertising is not supported by the btleplug central adapter")
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        false
    }
}
