// Query cache
// Memoizes retrieval results keyed by a normalized query fingerprint.
// Purely an optimization: results are reconstructible, so eviction and
// expiry never lose data. Concurrent misses on one fingerprint coalesce
// into a single retrieval computation.

#[cfg(test)]
mod tests;

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::CacheConfig;
use crate::retrieval::{RetrievalResult, normalize_query};
use crate::{RagError, Result};

/// Deterministic cache key for a query. Lower-cased, whitespace-collapsed
/// query text plus the parameters that change the result shape.
#[inline]
pub fn fingerprint(query: &str, top_k: usize, doc_filter: Option<&str>) -> String {
    let normalized = normalize_query(query);
    match doc_filter {
        Some(filter) => format!("{normalized}|k={top_k}|f={filter}"),
        None => format!("{normalized}|k={top_k}"),
    }
}

struct CacheEntry {
    result: RetrievalResult,
    inserted_at: Instant,
}

pub struct QueryCache {
    /// `None` when the configured capacity is zero: the cache is disabled
    /// and every lookup misses.
    entries: Option<Mutex<LruCache<String, CacheEntry>>>,
    inflight: tokio::sync::Mutex<HashMap<String, Arc<OnceCell<RetrievalResult>>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    #[inline]
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity_ttl(config.capacity, Duration::from_secs(config.ttl_seconds))
    }

    #[inline]
    pub fn with_capacity_ttl(capacity: usize, ttl: Duration) -> Self {
        let entries = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            entries,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint. Expired entries are invalidated on read.
    #[inline]
    pub fn get(&self, fingerprint: &str) -> Option<RetrievalResult> {
        let result = self.get_inner(fingerprint);
        match &result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn get_inner(&self, fingerprint: &str) -> Option<RetrievalResult> {
        let entries = self.entries.as_ref()?;
        let mut entries = entries.lock().expect("cache lock poisoned");

        let expired = entries
            .get(fingerprint)
            .is_some_and(|e| e.inserted_at.elapsed() >= self.ttl);
        if expired {
            entries.pop(fingerprint);
            debug!(fingerprint, "cache entry expired");
            return None;
        }

        entries.get(fingerprint).map(|e| e.result.clone())
    }

    /// Store a result under a fingerprint, evicting the least recently
    /// used entry at capacity.
    #[inline]
    pub fn put(&self, fingerprint: &str, result: RetrievalResult) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        let mut entries = entries.lock().expect("cache lock poisoned");
        entries.put(
            fingerprint.to_string(),
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Cache-or-compute with at most one concurrent computation per
    /// fingerprint. Returns the result and whether it was a cache hit.
    ///
    /// The computation runs on a detached task: a caller that disconnects
    /// mid-flight does not cancel it, and a completed result is always
    /// cached for the next caller.
    #[inline]
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        compute: F,
    ) -> Result<(RetrievalResult, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<RetrievalResult>> + Send + 'static,
    {
        if let Some(result) = self.get(fingerprint) {
            return Ok((result, true));
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(fingerprint.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let outcome = cell
            .get_or_try_init(|| {
                let future = compute();
                async move {
                    // Detached so client cancellation cannot abort the
                    // retrieval once it has started.
                    tokio::spawn(future).await.map_err(|e| {
                        RagError::Other(anyhow::anyhow!("retrieval task failed: {e}"))
                    })?
                }
            })
            .await
            .cloned();

        if let Ok(result) = &outcome {
            self.put(fingerprint, result.clone());
        }

        {
            let mut inflight = self.inflight.lock().await;
            let same_cell = inflight
                .get(fingerprint)
                .is_some_and(|c| Arc::ptr_eq(c, &cell));
            if same_cell {
                inflight.remove(fingerprint);
            }
        }

        outcome.map(|result| (result, false))
    }

    /// Hits and misses since startup.
    #[inline]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Fraction of lookups served from cache. Zero before any lookup.
    #[inline]
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.stats();
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}
