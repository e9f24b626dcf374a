//! Concurrency Ledger (§4.2): a scoped resource wrapping the atomic per-source in-flight
//! counters exposed by [`Store`]. `try_acquire` hands back a [`ConcurrencySlot`] guard that
//! releases itself exactly once — on explicit [`ConcurrencySlot::release`] or on drop — so a
//! request that bails out anywhere after acquisition (validation failure, upstream error,
//! panic) can never leak a slot (§9, "Concurrency slot is another scoped resource").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::Result;
use crate::metrics::DispatchMetrics;
use crate::store::{AcquireOutcome, Store};

/// A held (or deliberately un-acquired) concurrency slot on one source.
///
/// `None` models the queued-default overflow path (§4.4 step 2c): no slot was acquired, so
/// there is nothing to release, but the type still flows through the relay uniformly.
pub struct ConcurrencySlot<S: Store> {
    store: S,
    source_id: Option<String>,
    released: Arc<AtomicBool>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl<S: Store> ConcurrencySlot<S> {
    /// A slot that holds no counter reservation (queued-default fallback).
    pub fn none(store: S) -> Self {
        Self {
            store,
            source_id: None,
            released: Arc::new(AtomicBool::new(true)),
            metrics: None,
        }
    }

    fn held(store: S, source_id: String, metrics: Option<Arc<DispatchMetrics>>) -> Self {
        Self {
            store,
            source_id: Some(source_id),
            released: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    /// Release the slot. Idempotent: subsequent calls (including the one in `Drop`) are
    /// no-ops, guaranteeing exactly-once release per successful acquisition (§4.6).
    pub async fn release(&self) {
        let Some(source_id) = &self.source_id else { return };
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.store.decr_concurrency(source_id).await;
        record_occupancy(&self.store, &self.metrics, source_id).await;
    }
}

impl<S: Store> Drop for ConcurrencySlot<S> {
    fn drop(&mut self) {
        let Some(source_id) = self.source_id.clone() else { return };
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        // Best-effort: a slot dropped without an explicit `release().await` (panic unwind,
        // forgotten await point) still gets reclaimed, just asynchronously and without a
        // caller to observe failure. The 600s TTL (§4.2) is the final backstop if even this
        // task never runs.
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            store.decr_concurrency(&source_id).await;
            record_occupancy(&store, &metrics, &source_id).await;
        });
    }
}

/// Reads the counter back after a mutation and mirrors it onto the occupancy gauge.
/// Best-effort: a failed read just skips the gauge update for this call.
async fn record_occupancy<S: Store>(store: &S, metrics: &Option<Arc<DispatchMetrics>>, source_id: &str) {
    if let Some(metrics) = metrics {
        if let Ok(value) = store.read_concurrency(source_id).await {
            metrics.set_concurrency_occupancy(source_id, value);
        }
    }
}

/// Try to acquire one slot on `source_id` against `limit`. `limit == 0` disables the source
/// for acquisition (§4.2); the ledger never mutates the counter in that case.
pub async fn try_acquire<S: Store>(
    store: &S,
    source_id: &str,
    limit: u32,
    ttl_secs: u64,
    metrics: Option<&Arc<DispatchMetrics>>,
) -> Result<Option<ConcurrencySlot<S>>> {
    match store.try_acquire_concurrency(source_id, limit, ttl_secs).await? {
        AcquireOutcome::Acquired(value) => {
            if let Some(metrics) = metrics {
                metrics.set_concurrency_occupancy(source_id, value);
            }
            Ok(Some(ConcurrencySlot::held(store.clone(), source_id.to_string(), metrics.cloned())))
        }
        AcquireOutcome::Denied(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn release_decrements_exactly_once_even_if_called_twice() {
        let store = InMemoryStore::default();
        let slot = try_acquire(&store, "default", 5, 600, None).await.unwrap().expect("should acquire");
        assert_eq!(store.read_concurrency("default").await.unwrap(), 1);

        slot.release().await;
        slot.release().await;
        assert_eq!(store.read_concurrency("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn drop_without_explicit_release_still_reclaims_the_slot() {
        let store = InMemoryStore::default();
        {
            let _slot = try_acquire(&store, "default", 5, 600, None).await.unwrap().expect("should acquire");
            assert_eq!(store.read_concurrency("default").await.unwrap(), 1);
        }
        // the release is spawned, not synchronous with drop
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.read_concurrency("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_limit_denies_without_mutating_counter() {
        let store = InMemoryStore::default();
        let slot = try_acquire(&store, "disabled", 0, 600, None).await.unwrap();
        assert!(slot.is_none());
        assert_eq!(store.read_concurrency("disabled").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn none_slot_release_is_a_no_op() {
        let store = InMemoryStore::default();
        let slot = ConcurrencySlot::none(store.clone());
        slot.release().await;
        assert!(slot.owner_id().is_none());
    }

    #[tokio::test]
    async fn acquire_and_release_mirror_the_counter_onto_the_occupancy_gauge() {
        let registry = prometheus::Registry::new();
        let metrics = Arc::new(DispatchMetrics::new(&registry).unwrap());
        let store = InMemoryStore::default();

        let slot = try_acquire(&store, "default", 5, 600, Some(&metrics)).await.unwrap().expect("should acquire");
        let families = registry.gather();
        let gauge = families.iter().find(|f| f.name() == "dispatch_concurrency_occupancy").expect("gauge registered");
        assert_eq!(gauge.get_metric()[0].get_gauge().value(), 1.0);

        slot.release().await;
        let families = registry.gather();
        let gauge = families.iter().find(|f| f.name() == "dispatch_concurrency_occupancy").expect("gauge registered");
        assert_eq!(gauge.get_metric()[0].get_gauge().value(), 0.0);
    }
}
