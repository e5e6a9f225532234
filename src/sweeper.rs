use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::engine::ReservationEngine;
use crate::model::now_ms;
use crate::store::{StoreError, WalBookingStore, WalWindowStore};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that periodically releases windows left held without a
/// booking (a claim whose compensation could not run).
pub async fn run_reconciler(engine: ReservationEngine, interval: Duration, grace: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match engine.reconcile(now_ms(), grace).await {
            Ok(0) => {}
            Ok(n) => info!("reconciler released {n} orphaned holds"),
            Err(e) => tracing::warn!("reconcile pass failed: {e}"),
        }
    }
}

/// A log-backed store that can rewrite its log.
#[async_trait]
pub trait Compact: Send + Sync {
    fn name(&self) -> &'static str;
    async fn appends_since_compact(&self) -> u64;
    async fn compact(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl Compact for WalWindowStore {
    fn name(&self) -> &'static str {
        "windows"
    }
    async fn appends_since_compact(&self) -> u64 {
        WalWindowStore::appends_since_compact(self).await
    }
    async fn compact(&self) -> Result<(), StoreError> {
        WalWindowStore::compact(self).await
    }
}

#[async_trait]
impl Compact for WalBookingStore {
    fn name(&self) -> &'static str {
        "bookings"
    }
    async fn appends_since_compact(&self) -> u64 {
        WalBookingStore::appends_since_compact(self).await
    }
    async fn compact(&self) -> Result<(), StoreError> {
        WalBookingStore::compact(self).await
    }
}

/// Compact `store` if it accumulated at least `threshold` appends. Returns
/// whether a compaction ran.
pub async fn compact_if_due(store: &dyn Compact, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!("compacted {} log after {appends} appends", store.name());
            true
        }
        Err(e) => {
            tracing::error!("{} log compaction failed: {e}", store.name());
            false
        }
    }
}

/// Background task that compacts each store's log once it grows past
/// `threshold` appends.
pub async fn run_compactor(stores: Vec<Arc<dyn Compact>>, threshold: u64) {
    let mut ticker = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        for store in &stores {
            compact_if_due(store.as_ref(), threshold).await;
        }
    }
}
