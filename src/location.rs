//! Location Collaborator
//!
//! Coordinates annotate outbound messages when a provider is wired in.
//! Acquisition is bounded; a slow or failing provider falls back to the
//! last known fix, or to no coordinates at all.

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;

/// Upper bound on one position acquisition.
pub const LOCATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces (latitude, longitude) fixes.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_fix(&self) -> Result<(f64, f64)>;
}

/// Bounded acquisition with last-known-fix fallback.
pub struct LocationService {
    provider: Option<Arc<dyn LocationProvider>>,
    last_known: Mutex<Option<(f32, f32)>>,
}

impl LocationService {
    pub fn new(provider: Option<Arc<dyn LocationProvider>>) -> Self {
        Self {
            provider,
            last_known: Mutex::new(None),
        }
    }

    /// Best coordinates available right now, wire-precision.
    pub async fn acquire(&self) -> Option<(f32, f32)> {
        let provider = self.provider.as_ref()?;

        match time::timeout(LOCATION_TIMEOUT, provider.current_fix()).await {
            Ok(Ok((latitude, longitude))) => {
                let fix = (latitude as f32, longitude as f32);
                *self.last_known.lock().await = Some(fix);
                Some(fix)
            }
            Ok(Err(e)) => {
                debug!("location provider failed ({e}), using last known fix");
                *self.last_known.lock().await
            }
            Err(_) => {
                debug!("location acquisition timed out, using last known fix");
                *self.last_known.lock().await
            }
        }
    }
}
