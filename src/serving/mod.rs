// Serving layer
// HTTP front of the core. Each request passes admission control, is
// served from the query cache or through single-flight retrieval, and has
// its answer composed by a generation-backend replica chosen by
// load-aware, health-aware routing with one-shot failover. The serving
// layer orchestrates the cache and the retrieval engine; they never call
// each other.

pub mod replicas;

#[cfg(test)]
mod tests;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::{QueryCache, fingerprint};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::generation::GenerationBackend;
use crate::index::IndexStore;
use crate::metrics::Metrics;
use crate::retrieval::{RetrievalEngine, ScoredChunk};
use crate::{RagError, Result};
use replicas::ReplicaRegistry;

const MAX_TOP_K: usize = 100;
const EXCERPT_CHARS: usize = 300;

pub struct AppState {
    pub config: Config,
    pub cache: QueryCache,
    pub retrieval: Arc<RetrievalEngine>,
    pub generation: Arc<dyn GenerationBackend>,
    pub replicas: Arc<ReplicaRegistry>,
    pub index: Arc<IndexStore>,
    pub catalog: Arc<Catalog>,
    pub metrics: Arc<Metrics>,
    admission: Arc<Semaphore>,
    started_at: Instant,
}

impl AppState {
    #[inline]
    pub fn new(
        config: Config,
        retrieval: Arc<RetrievalEngine>,
        generation: Arc<dyn GenerationBackend>,
        replicas: Arc<ReplicaRegistry>,
        index: Arc<IndexStore>,
        catalog: Arc<Catalog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cache = QueryCache::new(&config.cache);
        let admission = Arc::new(Semaphore::new(config.serving.max_in_flight));
        Self {
            config,
            cache,
            retrieval,
            generation,
            replicas,
            index,
            catalog,
            metrics,
            admission,
            started_at: Instant::now(),
        }
    }

    /// Spawn the health-check and compaction loops.
    #[inline]
    pub fn spawn_background(self: &Arc<Self>) {
        let registry = Arc::clone(&self.replicas);
        let backend = Arc::clone(&self.generation);
        let probe_interval =
            std::time::Duration::from_secs(self.config.serving.probe_interval_seconds);
        tokio::spawn(registry.health_check_loop(backend, probe_interval));

        let index = Arc::clone(&self.index);
        let compaction_interval =
            std::time::Duration::from_secs(self.config.index.compaction_interval_seconds);
        tokio::spawn(index.compaction_loop(compaction_interval));
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceRef {
    pub chunk_id: String,
    pub doc_id: String,
    pub excerpt: String,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub cache_hit: bool,
    pub response_time_ms: u64,
}

/// Typed error envelope. Every failure maps to exactly one taxonomy kind
/// and one status code; there is no partial-success response shape.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
        }
    }
}

impl From<RagError> for ApiError {
    #[inline]
    fn from(error: RagError) -> Self {
        let (status, kind) = match &error {
            RagError::Overloaded => (StatusCode::TOO_MANY_REQUESTS, "overloaded"),
            RagError::UpstreamFailure(_) => (StatusCode::BAD_GATEWAY, "upstream_failure"),
            RagError::BackendUnavailable(_) => (StatusCode::BAD_GATEWAY, "backend_unavailable"),
            RagError::EmbeddingBackendUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "embedding_backend_unavailable")
            }
            RagError::IndexUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "index_unavailable"),
            RagError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            RagError::UnsupportedModality(_) => (StatusCode::BAD_REQUEST, "unsupported_modality"),
            RagError::CorruptPayload(_) => (StatusCode::BAD_REQUEST, "corrupt_payload"),
            RagError::OcrFailure(_) => (StatusCode::BAD_GATEWAY, "ocr_failure"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            kind,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    #[inline]
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

#[inline]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/v1/rag/query", post(query_handler))
        .route("/v1/rag/stats", get(stats_handler))
        .with_state(state)
}

/// Bind and run the HTTP server until shutdown.
#[inline]
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.serving.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("serving on {addr}");
    state.spawn_background();
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| RagError::Other(anyhow::anyhow!("server error: {e}")))?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    // Ready means retrieval-dependent requests can be served: the index
    // must be reachable. Cache hits alone do not make a fresh process
    // useful.
    match state.index.persisted_chunks().await {
        Ok(_) => Json(json!({ "status": "ready" })).into_response(),
        Err(e) => {
            warn!("readiness check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (cache_hits, cache_misses) = state.cache.stats();
    let active_documents = state.catalog.count_active().await.unwrap_or(0);
    Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "cache": {
            "hits": cache_hits,
            "misses": cache_misses,
            "hit_rate": state.cache.hit_rate(),
        },
        "index": {
            "visible_chunks": state.index.visible_chunks(),
            "compaction_generation": state.index.generation(),
            "active_documents": active_documents,
        },
        "replicas": state.replicas.snapshot(),
        "metrics": state.metrics.snapshot(),
    }))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> std::result::Result<Json<QueryResponse>, ApiError> {
    let started = Instant::now();
    Metrics::incr(&state.metrics.requests_total);

    // Admission check: fail fast at the ceiling rather than queueing.
    let Ok(_permit) = Arc::clone(&state.admission).try_acquire_owned() else {
        Metrics::incr(&state.metrics.admission_rejections);
        return Err(ApiError::from(RagError::Overloaded));
    };

    if request.query.trim().is_empty() {
        return Err(ApiError::invalid("query must not be empty"));
    }
    let top_k = request
        .top_k
        .unwrap_or(state.config.retrieval.top_k)
        .clamp(1, MAX_TOP_K);
    let doc_filter = request
        .filters
        .as_ref()
        .and_then(|f| f.get("doc_id"))
        .cloned();

    let result = answer_query(&state, &request.query, top_k, doc_filter.as_deref())
        .await
        .inspect_err(|_| Metrics::incr(&state.metrics.requests_failed))?;

    Ok(Json(QueryResponse {
        answer: result.answer,
        sources: result.sources,
        cache_hit: result.cache_hit,
        response_time_ms: started.elapsed().as_millis() as u64,
    }))
}

struct AnsweredQuery {
    answer: String,
    sources: Vec<SourceRef>,
    cache_hit: bool,
}

async fn answer_query(
    state: &Arc<AppState>,
    query: &str,
    top_k: usize,
    doc_filter: Option<&str>,
) -> Result<AnsweredQuery> {
    let fp = fingerprint(query, top_k, doc_filter);

    let retrieval = Arc::clone(&state.retrieval);
    let metrics = Arc::clone(&state.metrics);
    let query_owned = query.to_string();
    let filter_owned = doc_filter.map(str::to_string);

    let (retrieved, cache_hit) = state
        .cache
        .get_or_compute(&fp, move || async move {
            let retrieval_started = Instant::now();
            let result = retrieval
                .retrieve(&query_owned, top_k, filter_owned.as_deref())
                .await?;
            metrics.retrieval_latency.record(retrieval_started.elapsed());
            Ok(result)
        })
        .await?;

    debug!(cache_hit, chunk_count = retrieved.chunks.len(), "retrieval resolved");

    let answer = generate_with_failover(state, query, &retrieved.chunks).await?;

    let sources = retrieved
        .chunks
        .iter()
        .map(|chunk| SourceRef {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: chunk.doc_id.clone(),
            excerpt: excerpt(&chunk.content),
            score: chunk.score,
        })
        .collect();

    Ok(AnsweredQuery {
        answer,
        sources,
        cache_hit,
    })
}

/// Run generation on the best eligible replica, retrying exactly once on
/// a different replica after a retryable failure. A second failure
/// surfaces as `UpstreamFailure`.
async fn generate_with_failover(
    state: &Arc<AppState>,
    query: &str,
    chunks: &[ScoredChunk],
) -> Result<String> {
    let mut excluded = None;
    let mut last_error: Option<RagError> = None;

    for attempt in 0..2 {
        let Some(guard) = state.replicas.select(excluded) else {
            Metrics::incr(&state.metrics.upstream_failures);
            return Err(RagError::UpstreamFailure(match last_error {
                Some(e) => format!("no eligible replica after failure: {e}"),
                None => "no eligible replica".to_string(),
            }));
        };
        let replica_id = guard.replica().id;
        let endpoint = guard.replica().endpoint.clone();

        let backend = Arc::clone(&state.generation);
        let query_owned = query.to_string();
        let context = chunks.to_vec();
        let outcome =
            tokio::task::spawn_blocking(move || backend.generate(&endpoint, &query_owned, &context))
                .await
                .map_err(|e| RagError::Other(anyhow::anyhow!("generation task failed: {e}")))?;
        drop(guard);

        match outcome {
            Ok(answer) => return Ok(answer),
            Err(e) if e.is_retryable() && attempt == 0 => {
                warn!(replica = replica_id, "replica failed, retrying once elsewhere: {e}");
                Metrics::incr(&state.metrics.failovers);
                excluded = Some(replica_id);
                last_error = Some(e);
            }
            Err(e) if e.is_retryable() => {
                Metrics::incr(&state.metrics.upstream_failures);
                return Err(RagError::UpstreamFailure(format!(
                    "failover exhausted: {e}"
                )));
            }
            Err(e) => return Err(e),
        }
    }

    Metrics::incr(&state.metrics.upstream_failures);
    Err(RagError::UpstreamFailure(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "failover exhausted".to_string()),
    ))
}

fn excerpt(content: &str) -> String {
    if content.chars().count() <= EXCERPT_CHARS {
        return content.to_string();
    }
    let cut: String = content.chars().take(EXCERPT_CHARS).collect();
    format!("{}…", cut.trim_end())
}
