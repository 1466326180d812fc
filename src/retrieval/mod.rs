// Retrieval engine
// Turns a query into a ranked, deduplicated set of chunks: embed the query
// on the ingestion path, over-fetch from the hybrid index, cap per-document
// contribution, optionally re-rank, and truncate deterministically.


use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::Result;
use crate::config::RetrievalConfig;
use crate::embeddings::{EmbeddingBackend, tokenize};
use crate::index::{Hit, IndexStore};

/// One retrieved chunk with its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub doc_version: u32,
    pub content: String,
    pub page: Option<u32>,
    pub low_confidence: bool,
    pub score: f32,
}

/// Ordered retrieval result. Scores are non-increasing and chunk ids are
/// unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
}

/// Thresholds for the dynamic top-k reduction: when at least `MIN_STRONG`
/// hits score `STRONG_SCORE` or better, the tail is unlikely to help the
/// generation step and the result shrinks to `REDUCED_K`.
const DYNAMIC_MIN_STRONG: usize = 3;
const DYNAMIC_STRONG_SCORE: f32 = 0.8;
const DYNAMIC_REDUCED_K: usize = 5;

pub struct RetrievalEngine {
    embedder: Arc<dyn EmbeddingBackend>,
    index: Arc<IndexStore>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    #[inline]
    pub fn new(
        embedder: Arc<dyn EmbeddingBackend>,
        index: Arc<IndexStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            config,
        }
    }

    /// Retrieve the best chunks for a query. Fails with `IndexUnavailable`
    /// when the index cannot be read and with the embedding backend's
    /// error when the query cannot be embedded.
    #[inline]
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        doc_filter: Option<&str>,
    ) -> Result<RetrievalResult> {
        let top_k = top_k.max(1);
        let query = normalize_query(query_text);

        // Same embedding path as ingestion keeps the vector spaces
        // comparable.
        let embedder = Arc::clone(&self.embedder);
        let query_for_embed = query.clone();
        let query_vector = tokio::task::spawn_blocking(move || {
            embedder.embed_batch(std::slice::from_ref(&query_for_embed))
        })
        .await
        .map_err(|e| crate::RagError::Other(anyhow::anyhow!("embedding task failed: {e}")))??
        .into_iter()
        .next()
        .unwrap_or_default();

        let overfetch = top_k * self.config.overfetch_factor.max(1);
        let hits = self
            .index
            .search(&query_vector, &query, overfetch, doc_filter)
            .await?;

        let ranked = self.rank(&query, hits, top_k);
        debug!(
            query_len = query.len(),
            result_count = ranked.chunks.len(),
            "retrieval complete"
        );
        Ok(ranked)
    }

    fn rank(&self, query: &str, hits: Vec<Hit>, top_k: usize) -> RetrievalResult {
        let mut scored: Vec<ScoredChunk> = Vec::with_capacity(hits.len());

        for hit in hits {
            let mut score = hit.score;

            if self.config.rerank {
                let overlap = lexical_overlap(query, &hit.meta.content);
                let w = self.config.rerank_weight.clamp(0.0, 1.0);
                score = (1.0 - w) * score + w * overlap;
            }

            // Low-confidence OCR content stays retrievable, just ranked
            // below equally relevant high-confidence content.
            if hit.meta.low_confidence {
                score *= self.config.low_confidence_penalty.clamp(0.0, 1.0);
            }

            if score < self.config.min_score {
                continue;
            }

            scored.push(ScoredChunk {
                chunk_id: hit.meta.chunk_id,
                doc_id: hit.meta.doc_id,
                doc_version: hit.meta.doc_version,
                content: hit.meta.content,
                page: hit.meta.page,
                low_confidence: hit.meta.low_confidence,
                score,
            });
        }

        // Score descending; ties go to the newer document version, then to
        // the lexicographically smaller chunk id for determinism.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.doc_version.cmp(&a.doc_version))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        // Per-document cap prevents one document from crowding out the
        // rest of the corpus.
        let mut per_doc: HashMap<String, usize> = HashMap::new();
        let mut chunks: Vec<ScoredChunk> = Vec::with_capacity(top_k);
        for chunk in scored {
            let seen = per_doc.entry(chunk.doc_id.clone()).or_insert(0);
            if *seen >= self.config.max_per_doc {
                continue;
            }
            *seen += 1;
            chunks.push(chunk);
            if chunks.len() >= top_k {
                break;
            }
        }

        if self.config.dynamic_top_k {
            let strong = chunks
                .iter()
                .filter(|c| c.score >= DYNAMIC_STRONG_SCORE)
                .count();
            if strong >= DYNAMIC_MIN_STRONG {
                chunks.truncate(DYNAMIC_REDUCED_K);
            }
        }

        RetrievalResult { chunks }
    }
}

/// Lowercase and collapse whitespace. The same normalization feeds the
/// cache fingerprint so equivalent queries share cache entries.
#[inline]
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fraction of query terms present in the content. A cheap secondary
/// relevance signal for re-ranking.
fn lexical_overlap(query: &str, content: &str) -> f32 {
    let query_terms = tokenize(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_terms: std::collections::HashSet<String> =
        tokenize(content).into_iter().collect();
    let matched = query_terms
        .iter()
        .filter(|t| content_terms.contains(*t))
        .count();
    matched as f32 / query_terms.len() as f32
}
