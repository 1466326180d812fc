// Ingestion pipeline
// Orchestrates catalog registration, normalization, chunking, embedding,
// and index writes for one document at a time. Runs either inline or on
// background workers decoupled from query serving, so bulk re-indexing
// never blocks query latency. A failure aborts only the document that
// caused it.


use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::embeddings::chunking::{ChunkingConfig, chunk_blocks};
use crate::embeddings::EmbeddingBackend;
use crate::index::{ChunkMeta, ChunkRecord, IndexStore};
use crate::metrics::Metrics;
use crate::normalize::{Document, Modality, Normalizer};
use crate::{RagError, Result};

pub struct IngestPipeline {
    catalog: Arc<Catalog>,
    normalizer: Arc<Normalizer>,
    embedder: Arc<dyn EmbeddingBackend>,
    index: Arc<IndexStore>,
    chunking: ChunkingConfig,
    metrics: Arc<Metrics>,
}

impl IngestPipeline {
    #[inline]
    pub fn new(
        catalog: Arc<Catalog>,
        normalizer: Arc<Normalizer>,
        embedder: Arc<dyn EmbeddingBackend>,
        index: Arc<IndexStore>,
        chunking: ChunkingConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            catalog,
            normalizer,
            embedder,
            index,
            chunking,
            metrics,
        }
    }

    /// Ingest one document: register a version, normalize, chunk, embed,
    /// and index. Returns the document id. Re-submitting an existing
    /// `doc_id` supersedes its prior version, which is tombstoned.
    #[inline]
    pub async fn submit(
        &self,
        doc_id: Option<String>,
        modality: Modality,
        payload: Vec<u8>,
    ) -> Result<String> {
        let doc_id = doc_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let registered = self.catalog.register_version(&doc_id, modality).await?;
        for version in &registered.superseded {
            self.index.tombstone_doc_version(&doc_id, *version);
        }

        let document = Document {
            doc_id: doc_id.clone(),
            modality,
            payload,
            version: registered.version,
            ingested_at: Utc::now(),
        };

        match self.process(&document).await {
            Ok(chunk_count) => {
                Metrics::incr(&self.metrics.documents_ingested);
                Metrics::add(&self.metrics.chunks_indexed, chunk_count as u64);
                info!(
                    doc_id = %doc_id,
                    version = registered.version,
                    chunk_count,
                    "document ingested"
                );
                Ok(doc_id)
            }
            Err(e) => {
                // The failure stays scoped to this document version.
                Metrics::incr(&self.metrics.ingest_failures);
                self.catalog
                    .mark_failed(&doc_id, registered.version)
                    .await?;
                error!(doc_id = %doc_id, version = registered.version, "ingestion failed: {e}");
                Err(e)
            }
        }
    }

    async fn process(&self, document: &Document) -> Result<usize> {
        // Normalization may call the blocking OCR client.
        let normalizer = Arc::clone(&self.normalizer);
        let doc = document.clone();
        let blocks = tokio::task::spawn_blocking(move || normalizer.normalize(&doc))
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("normalize task failed: {e}")))??;

        let chunks = chunk_blocks(&blocks, &self.chunking)?;
        if chunks.is_empty() {
            return Err(RagError::CorruptPayload(format!(
                "{}: no indexable content after chunking",
                document.doc_id
            )));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embedder = Arc::clone(&self.embedder);
        let vectors = tokio::task::spawn_blocking(move || embedder.embed_batch(&texts))
            .await
            .map_err(|e| RagError::Other(anyhow::anyhow!("embedding task failed: {e}")))??;

        let records: Vec<ChunkRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChunkRecord {
                meta: ChunkMeta {
                    chunk_id: chunk_id(&document.doc_id, document.version, chunk.seq),
                    doc_id: document.doc_id.clone(),
                    doc_version: document.version,
                    seq: chunk.seq as u32,
                    content: chunk.content.clone(),
                    page: chunk.page,
                    ocr_confidence: chunk.ocr_confidence,
                    low_confidence: chunk.low_confidence,
                },
                vector,
            })
            .collect();

        // One batch per document keeps chunk writes in seq order.
        self.index.upsert_chunks(&records).await?;
        Ok(records.len())
    }

    /// Retire every live version of a document: catalog update plus index
    /// tombstones. Idempotent; retiring an unknown id is an ack, not an
    /// error.
    #[inline]
    pub async fn retire(&self, doc_id: &str) -> Result<()> {
        let retired = self.catalog.retire_all(doc_id).await?;
        for version in retired {
            self.index.tombstone_doc_version(doc_id, version);
        }
        Ok(())
    }
}

/// Deterministic chunk identity. The zero-padded seq keeps lexicographic
/// order aligned with document order, which the tie-break in retrieval
/// relies on.
fn chunk_id(doc_id: &str, version: u32, seq: usize) -> String {
    format!("{doc_id}@v{version}#{seq:05}")
}

/// One queued ingestion job. The reply channel, when present, receives the
/// assigned document id or the per-document failure.
pub struct IngestJob {
    pub doc_id: Option<String>,
    pub modality: Modality,
    pub payload: Vec<u8>,
    pub reply: Option<oneshot::Sender<Result<String>>>,
}

/// Handle for enqueueing ingestion jobs onto the background workers.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<IngestJob>,
}

impl IngestQueue {
    #[inline]
    pub async fn enqueue(&self, job: IngestJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| RagError::Other(anyhow::anyhow!("ingest workers are shut down")))
    }
}

/// Spawn `workers` background ingestion workers sharing one queue.
/// Documents are processed independently; ordering across documents is
/// unspecified.
#[inline]
pub fn spawn_workers(
    pipeline: Arc<IngestPipeline>,
    workers: usize,
    queue_depth: usize,
) -> IngestQueue {
    let (tx, rx) = mpsc::channel::<IngestJob>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    for worker_id in 0..workers.max(1) {
        let pipeline = Arc::clone(&pipeline);
        let rx = Arc::clone(&rx);
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(job) = job else {
                    debug!(worker_id, "ingest worker shutting down");
                    break;
                };

                let outcome = pipeline
                    .submit(job.doc_id, job.modality, job.payload)
                    .await;
                if let Some(reply) = job.reply {
                    // The submitter may have gone away; that is fine.
                    let _ = reply.send(outcome);
                } else if let Err(e) = outcome {
                    error!(worker_id, "background ingestion failed: {e}");
                }
            }
        });
    }

    IngestQueue { tx }
}
