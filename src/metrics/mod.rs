// Metrics
// In-process counters and a coarse latency histogram, surfaced on the
// stats endpoint for an external monitoring collaborator to scrape.

#[cfg(test)]
mod tests;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the retrieval latency buckets, in milliseconds. The
/// last bucket is unbounded.
const LATENCY_BOUNDS_MS: [u64; 7] = [5, 10, 25, 50, 100, 250, 1000];

#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    #[inline]
    pub fn record(&self, elapsed: Duration) {
        let ms = elapsed.as_millis().min(u128::from(u64::MAX)) as u64;
        let idx = LATENCY_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_ms = self.sum_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                sum_ms as f64 / count as f64
            },
            buckets: LATENCY_BOUNDS_MS
                .iter()
                .enumerate()
                .map(|(i, bound)| BucketSnapshot {
                    le_ms: Some(*bound),
                    count: self.buckets[i].load(Ordering::Relaxed),
                })
                .chain(std::iter::once(BucketSnapshot {
                    le_ms: None,
                    count: self.buckets[LATENCY_BOUNDS_MS.len()].load(Ordering::Relaxed),
                }))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BucketSnapshot {
    /// Upper bound in milliseconds; `None` for the overflow bucket.
    pub le_ms: Option<u64>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub buckets: Vec<BucketSnapshot>,
}

/// Counters for the serving core. Everything is monotonic; rates are the
/// consumer's job.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub admission_rejections: AtomicU64,
    pub failovers: AtomicU64,
    pub upstream_failures: AtomicU64,
    pub replica_transitions: AtomicU64,
    pub documents_ingested: AtomicU64,
    pub ingest_failures: AtomicU64,
    pub chunks_indexed: AtomicU64,
    pub retrieval_latency: LatencyHistogram,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub admission_rejections: u64,
    pub failovers: u64,
    pub upstream_failures: u64,
    pub replica_transitions: u64,
    pub documents_ingested: u64,
    pub ingest_failures: u64,
    pub chunks_indexed: u64,
    pub retrieval_latency: LatencySnapshot,
}

impl Metrics {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            admission_rejections: self.admission_rejections.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            replica_transitions: self.replica_transitions.load(Ordering::Relaxed),
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            ingest_failures: self.ingest_failures.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            retrieval_latency: self.retrieval_latency.snapshot(),
        }
    }
}
