use super::*;
use crate::retrieval::ScoredChunk;
use std::sync::atomic::AtomicU32;

fn result_with(chunk_id: &str) -> RetrievalResult {
    RetrievalResult {
        chunks: vec![ScoredChunk {
            chunk_id: chunk_id.to_string(),
            doc_id: "doc".to_string(),
            doc_version: 1,
            content: "content".to_string(),
            page: None,
            low_confidence: false,
            score: 0.9,
        }],
    }
}

#[test]
fn fingerprint_is_deterministic_and_normalized() {
    let a = fingerprint("  What IS   the warranty period? ", 5, None);
    let b = fingerprint("what is the warranty period?", 5, None);
    assert_eq!(a, b);

    assert_ne!(fingerprint("q", 5, None), fingerprint("q", 6, None));
    assert_ne!(
        fingerprint("q", 5, Some("doc-a")),
        fingerprint("q", 5, None)
    );
}

#[test]
fn get_after_put_returns_result() {
    let cache = QueryCache::with_capacity_ttl(8, Duration::from_secs(60));
    let fp = fingerprint("warranty", 5, None);

    assert!(cache.get(&fp).is_none());
    cache.put(&fp, result_with("a"));
    assert_eq!(cache.get(&fp), Some(result_with("a")));
}

#[test]
fn entries_expire_after_ttl() {
    let cache = QueryCache::with_capacity_ttl(8, Duration::from_millis(40));
    let fp = fingerprint("warranty", 5, None);

    cache.put(&fp, result_with("a"));
    assert!(cache.get(&fp).is_some());

    std::thread::sleep(Duration::from_millis(60));
    assert!(cache.get(&fp).is_none(), "expired entry must miss");
}

#[test]
fn lru_evicts_least_recently_used() {
    let cache = QueryCache::with_capacity_ttl(2, Duration::from_secs(60));

    cache.put("a", result_with("a"));
    cache.put("b", result_with("b"));
    // Touch "a" so "b" is the eviction candidate.
    assert!(cache.get("a").is_some());
    cache.put("c", result_with("c"));

    assert!(cache.get("a").is_some());
    assert!(cache.get("b").is_none());
    assert!(cache.get("c").is_some());
}

#[test]
fn zero_capacity_disables_cache() {
    let cache = QueryCache::with_capacity_ttl(0, Duration::from_secs(60));
    cache.put("a", result_with("a"));
    assert!(cache.get("a").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_compute_exactly_once() {
    let cache = Arc::new(QueryCache::with_capacity_ttl(8, Duration::from_secs(60)));
    let computations = Arc::new(AtomicU32::new(0));
    let fp = fingerprint("single flight", 5, None);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let computations = Arc::clone(&computations);
        let fp = fp.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_compute(&fp, move || async move {
                    computations.fetch_add(1, Ordering::SeqCst);
                    // Hold the computation open long enough for every
                    // other task to arrive at the same fingerprint.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(result_with("computed"))
                })
                .await
        }));
    }

    for handle in handles {
        let (result, _) = handle
            .await
            .expect("task panicked")
            .expect("compute failed");
        assert_eq!(result.chunks[0].chunk_id, "computed");
    }

    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn computed_result_is_cached_for_next_caller() {
    let cache = QueryCache::with_capacity_ttl(8, Duration::from_secs(60));
    let fp = fingerprint("cache me", 5, None);

    let (_, hit) = cache
        .get_or_compute(&fp, || async { Ok(result_with("x")) })
        .await
        .expect("compute failed");
    assert!(!hit);

    let (result, hit) = cache
        .get_or_compute(&fp, || async {
            panic!("second caller must not recompute")
        })
        .await
        .expect("compute failed");
    assert!(hit);
    assert_eq!(result.chunks[0].chunk_id, "x");
}

#[tokio::test]
async fn failed_computation_is_not_cached() {
    let cache = QueryCache::with_capacity_ttl(8, Duration::from_secs(60));
    let fp = fingerprint("flaky", 5, None);

    let outcome = cache
        .get_or_compute(&fp, || async {
            Err(crate::RagError::IndexUnavailable("down".to_string()))
        })
        .await;
    assert!(outcome.is_err());

    // The failure must not poison the fingerprint.
    let (result, hit) = cache
        .get_or_compute(&fp, || async { Ok(result_with("recovered")) })
        .await
        .expect("compute failed");
    assert!(!hit);
    assert_eq!(result.chunks[0].chunk_id, "recovered");
}

#[test]
fn hit_rate_tracks_lookups() {
    let cache = QueryCache::with_capacity_ttl(8, Duration::from_secs(60));
    cache.put("a", result_with("a"));

    assert!(cache.get("a").is_some());
    assert!(cache.get("missing").is_none());

    let (hits, misses) = cache.stats();
    assert_eq!((hits, misses), (1, 1));
    assert!((cache.hit_rate() - 0.5).abs() < 1e-9);
}
