use super::*;
use crate::config::{EmbeddingProvider, IndexConfig, ServingConfig};
use crate::embeddings::{EmbeddingBackend, HashingEmbedder, Precision};
use crate::ingest::IngestPipeline;
use crate::normalize::{Modality, Normalizer};
use crate::ocr::{OcrBackend, OcrBlock};
use std::sync::atomic::{AtomicU32, Ordering};

/// Generation stub that fails a configured number of times before
/// answering. Probes always succeed.
struct StubGeneration {
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl StubGeneration {
    fn failing(times: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(times),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl crate::generation::GenerationBackend for StubGeneration {
    fn generate(
        &self,
        _endpoint: &url::Url,
        query: &str,
        context: &[ScoredChunk],
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(RagError::BackendUnavailable("stub failure".to_string()));
        }
        Ok(format!("answer to '{query}' from {} chunks", context.len()))
    }

    fn probe(&self, _endpoint: &url::Url) -> bool {
        true
    }
}

struct NoOcr;

impl OcrBackend for NoOcr {
    fn extract(&self, _image_bytes: &[u8]) -> Result<Vec<OcrBlock>> {
        Err(RagError::OcrFailure("no OCR in this test".to_string()))
    }
}

async fn test_state(
    generation: Arc<dyn crate::generation::GenerationBackend>,
    max_in_flight: usize,
) -> (tempfile::TempDir, Arc<AppState>, Arc<IngestPipeline>) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    let mut config = Config::default();
    config.base_dir = dir.path().to_path_buf();
    config.embedding.provider = EmbeddingProvider::Hashing;
    config.embedding.dimension = 64;
    config.generation.replicas = vec![
        "http://replica-0:8700".to_string(),
        "http://replica-1:8700".to_string(),
    ];
    config.serving = ServingConfig {
        max_in_flight,
        ..ServingConfig::default()
    };

    let metrics = Arc::new(Metrics::default());
    let catalog = Arc::new(
        Catalog::open(&config.catalog_path())
            .await
            .expect("catalog open failed"),
    );
    let index = Arc::new(
        IndexStore::open(&config.vector_store_path(), 64, &IndexConfig::default())
            .await
            .expect("index open failed"),
    );
    let embedder: Arc<dyn EmbeddingBackend> = Arc::new(HashingEmbedder::new(64, Precision::Fp32));
    let normalizer = Arc::new(
        Normalizer::new(Arc::new(NoOcr), &config.ocr, &config.redaction)
            .expect("normalizer failed"),
    );

    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&catalog),
        normalizer,
        Arc::clone(&embedder),
        Arc::clone(&index),
        config.chunking.clone(),
        Arc::clone(&metrics),
    ));

    let retrieval = Arc::new(RetrievalEngine::new(
        embedder,
        Arc::clone(&index),
        config.retrieval.clone(),
    ));
    let replicas = Arc::new(
        ReplicaRegistry::new(&config.generation.replicas, &config.serving, Arc::clone(&metrics))
            .expect("registry failed"),
    );

    let state = Arc::new(AppState::new(
        config,
        retrieval,
        generation,
        replicas,
        index,
        catalog,
        metrics,
    ));

    (dir, state, pipeline)
}

fn request(query: &str) -> QueryRequest {
    QueryRequest {
        query: query.to_string(),
        top_k: Some(5),
        filters: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replica_failing_once_succeeds_via_single_retry() {
    let stub = StubGeneration::failing(1);
    let (_dir, state, pipeline) = test_state(stub.clone(), 16).await;
    pipeline
        .submit(
            Some("manual".to_string()),
            Modality::Text,
            b"The warranty period is 24 months.".to_vec(),
        )
        .await
        .expect("ingest failed");

    let response = query_handler(State(Arc::clone(&state)), Json(request("warranty period")))
        .await
        .expect("query failed");

    assert!(response.0.answer.contains("answer to"));
    assert_eq!(stub.calls(), 2, "exactly one retry");
    assert_eq!(
        state.metrics.failovers.load(Ordering::Relaxed),
        1,
        "one failover recorded"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_failure_surfaces_upstream_failure() {
    let stub = StubGeneration::failing(u32::MAX);
    let (_dir, state, pipeline) = test_state(stub.clone(), 16).await;
    pipeline
        .submit(
            Some("manual".to_string()),
            Modality::Text,
            b"The warranty period is 24 months.".to_vec(),
        )
        .await
        .expect("ingest failed");

    let error = query_handler(State(Arc::clone(&state)), Json(request("warranty period")))
        .await
        .expect_err("query must fail");

    assert_eq!(error.kind, "upstream_failure");
    assert_eq!(stub.calls(), 2, "no unbounded retries");
    assert_eq!(state.metrics.upstream_failures.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_rejects_beyond_ceiling() {
    let stub = StubGeneration::failing(0);
    let (_dir, state, _pipeline) = test_state(stub, 1).await;

    // Occupy the only slot.
    let _permit = Arc::clone(&state.admission)
        .try_acquire_owned()
        .expect("permit should be free");

    let error = query_handler(State(Arc::clone(&state)), Json(request("anything")))
        .await
        .expect_err("request must be rejected");

    assert_eq!(error.kind, "overloaded");
    assert_eq!(error.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(state.metrics.admission_rejections.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_end_to_end_populates_cache() {
    let stub = StubGeneration::failing(0);
    let (_dir, state, pipeline) = test_state(stub, 16).await;
    pipeline
        .submit(
            Some("manual".to_string()),
            Modality::Text,
            b"The warranty period is 24 months.".to_vec(),
        )
        .await
        .expect("ingest failed");

    let first = query_handler(State(Arc::clone(&state)), Json(request("warranty period")))
        .await
        .expect("query failed");
    assert!(!first.0.cache_hit);
    assert!(!first.0.sources.is_empty());
    assert_eq!(first.0.sources[0].doc_id, "manual");
    assert!(first.0.sources[0].excerpt.contains("24 months"));

    let second = query_handler(State(Arc::clone(&state)), Json(request("warranty period")))
        .await
        .expect("query failed");
    assert!(second.0.cache_hit, "second identical query must hit cache");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_query_is_rejected() {
    let stub = StubGeneration::failing(0);
    let (_dir, state, _pipeline) = test_state(stub, 16).await;

    let error = query_handler(State(Arc::clone(&state)), Json(request("   ")))
        .await
        .expect_err("empty query must fail");
    assert_eq!(error.kind, "invalid_request");
    assert_eq!(error.status, StatusCode::BAD_REQUEST);
}

#[test]
fn error_status_mapping() {
    let cases = [
        (RagError::Overloaded, StatusCode::TOO_MANY_REQUESTS),
        (
            RagError::UpstreamFailure("x".to_string()),
            StatusCode::BAD_GATEWAY,
        ),
        (
            RagError::IndexUnavailable("x".to_string()),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
        (
            RagError::Timeout(std::time::Duration::from_secs(1)),
            StatusCode::GATEWAY_TIMEOUT,
        ),
        (
            RagError::CorruptPayload("x".to_string()),
            StatusCode::BAD_REQUEST,
        ),
    ];
    for (error, status) in cases {
        assert_eq!(ApiError::from(error).status, status);
    }
}

#[test]
fn excerpt_truncates_long_content() {
    let long = "word ".repeat(200);
    let short = excerpt(&long);
    assert!(short.chars().count() <= EXCERPT_CHARS + 1);
    assert!(short.ends_with('…'));

    assert_eq!(excerpt("short content"), "short content");
}
