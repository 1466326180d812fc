// Index store
// Owns the persisted hybrid index: dense vectors in LanceDB, a sparse
// keyword index in memory, and the tombstone set that makes deletion
// visible to readers before compaction physically removes rows.

pub mod sparse;
pub mod vector_store;


use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::IndexConfig;
use sparse::SparseIndex;
use vector_store::VectorStore;

/// Chunk metadata carried alongside the vector; everything retrieval needs
/// to assemble a hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub doc_id: String,
    pub doc_version: u32,
    pub seq: u32,
    pub content: String,
    pub page: Option<u32>,
    pub ocr_confidence: Option<f32>,
    pub low_confidence: bool,
}

/// A chunk ready for indexing: metadata plus its embedding.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub meta: ChunkMeta,
    pub vector: Vec<f32>,
}

/// One hybrid search hit. `score` is the fused dense+sparse score in
/// [0, 1]; the raw per-side scores are retained for re-ranking.
#[derive(Debug, Clone)]
pub struct Hit {
    pub meta: ChunkMeta,
    pub score: f32,
    pub dense_score: f32,
    pub sparse_score: f32,
}

/// Identity of one document version in the index.
type DocKey = (String, u32);

/// Hybrid index over chunk vectors and keywords.
///
/// Writes are serialized per logical shard (sharded by `doc_id`) while
/// reads proceed concurrently. Deletion tombstones a document version
/// immediately; readers filter tombstoned entries until the background
/// compaction pass physically removes them.
pub struct IndexStore {
    vectors: VectorStore,
    sparse: SparseIndex,
    /// chunk_id -> owning document version, for read-time filtering and
    /// sparse-hit metadata assembly.
    metadata: RwLock<HashMap<String, ChunkMeta>>,
    tombstones: RwLock<HashSet<DocKey>>,
    generation: AtomicU64,
    write_shards: Vec<tokio::sync::Mutex<()>>,
    dense_weight: f32,
    sparse_weight: f32,
}

impl IndexStore {
    /// Open the store, rebuilding the in-memory sparse index and metadata
    /// map from the persisted vector table.
    #[inline]
    pub async fn open(path: &std::path::Path, dimension: usize, config: &IndexConfig) -> Result<Self> {
        let vectors = VectorStore::open(path, dimension).await?;
        let sparse = SparseIndex::new();
        let mut metadata = HashMap::new();

        for meta in vectors.scan_metadata().await? {
            sparse.add_chunk(&meta.chunk_id, &meta.content);
            metadata.insert(meta.chunk_id.clone(), meta);
        }
        if !metadata.is_empty() {
            info!("rehydrated {} chunks into the sparse index", metadata.len());
        }

        let write_shards = (0..config.shards.max(1))
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();

        Ok(Self {
            vectors,
            sparse,
            metadata: RwLock::new(metadata),
            tombstones: RwLock::new(HashSet::new()),
            generation: AtomicU64::new(0),
            write_shards,
            dense_weight: config.dense_weight,
            sparse_weight: config.sparse_weight,
        })
    }

    fn shard_for(&self, doc_id: &str) -> &tokio::sync::Mutex<()> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        doc_id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.write_shards.len();
        &self.write_shards[idx]
    }

    /// Insert a document version's chunks. All records must belong to one
    /// document; they are applied in slice order and are visible to
    /// searches issued after this call returns.
    #[inline]
    pub async fn upsert_chunks(&self, records: &[ChunkRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let doc_id = first.meta.doc_id.clone();

        let shard = self.shard_for(&doc_id);
        let _write_guard = shard.lock().await;

        self.vectors.add_chunks(records).await?;

        for record in records {
            self.sparse.add_chunk(&record.meta.chunk_id, &record.meta.content);
        }
        {
            let mut metadata = self.metadata.write().expect("metadata lock poisoned");
            for record in records {
                metadata.insert(record.meta.chunk_id.clone(), record.meta.clone());
            }
        }

        debug!(doc_id = %doc_id, count = records.len(), "indexed chunks");
        Ok(())
    }

    /// Tombstone every chunk of one document version. Takes effect for
    /// readers immediately; physical removal happens in compaction.
    /// Idempotent.
    #[inline]
    pub fn tombstone_doc_version(&self, doc_id: &str, version: u32) {
        let mut tombstones = self.tombstones.write().expect("tombstone lock poisoned");
        if tombstones.insert((doc_id.to_string(), version)) {
            debug!(doc_id, version, "tombstoned document version");
        }
    }

    /// Whether a chunk's owning document version is tombstoned.
    fn is_tombstoned(&self, tombstones: &HashSet<DocKey>, meta: &ChunkMeta) -> bool {
        tombstones.contains(&(meta.doc_id.clone(), meta.doc_version))
    }

    /// Hybrid search: dense cosine hits fused with sparse keyword hits by
    /// per-side max-normalization and a weighted sum. Tombstoned entries
    /// are filtered before fusion.
    #[inline]
    pub async fn search(
        &self,
        query_vector: &[f32],
        query_text: &str,
        k: usize,
        doc_filter: Option<&str>,
    ) -> Result<Vec<Hit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // Over-fetch both sides so tombstone filtering cannot starve the
        // fused result.
        let fetch = k * 2;
        let tombstones = self
            .tombstones
            .read()
            .expect("tombstone lock poisoned")
            .clone();

        let dense_hits = self.vectors.search(query_vector, fetch, doc_filter).await?;
        let sparse_hits = self.sparse.search(query_text, fetch);

        let mut fused: HashMap<String, (f32, f32)> = HashMap::new();

        let dense_max = dense_hits
            .iter()
            .map(|h| h.similarity)
            .fold(0f32, f32::max);
        let mut metas: HashMap<String, ChunkMeta> = HashMap::new();
        for hit in dense_hits {
            if self.is_tombstoned(&tombstones, &hit.meta) {
                continue;
            }
            let norm = if dense_max > 0.0 {
                hit.similarity / dense_max
            } else {
                0.0
            };
            fused.entry(hit.meta.chunk_id.clone()).or_insert((0.0, 0.0)).0 = norm;
            metas.insert(hit.meta.chunk_id.clone(), hit.meta);
        }

        let sparse_max = sparse_hits.iter().map(|(_, s)| *s).fold(0f32, f32::max);
        {
            let metadata = self.metadata.read().expect("metadata lock poisoned");
            for (chunk_id, score) in sparse_hits {
                let Some(meta) = metadata.get(&chunk_id) else {
                    continue;
                };
                if self.is_tombstoned(&tombstones, meta) {
                    continue;
                }
                if let Some(doc_id) = doc_filter {
                    if meta.doc_id != doc_id {
                        continue;
                    }
                }
                let norm = if sparse_max > 0.0 { score / sparse_max } else { 0.0 };
                fused.entry(chunk_id.clone()).or_insert((0.0, 0.0)).1 = norm;
                metas.entry(chunk_id).or_insert_with(|| meta.clone());
            }
        }

        let weight_sum = self.dense_weight + self.sparse_weight;
        let mut hits: Vec<Hit> = fused
            .into_iter()
            .filter_map(|(chunk_id, (dense, sparse))| {
                let meta = metas.remove(&chunk_id)?;
                let score =
                    (self.dense_weight * dense + self.sparse_weight * sparse) / weight_sum;
                Some(Hit {
                    meta,
                    score,
                    dense_score: dense,
                    sparse_score: sparse,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.meta.chunk_id.cmp(&b.meta.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Physically remove tombstoned entries. Snapshots the tombstone set,
    /// deletes those rows, then clears exactly the snapshotted keys, so a
    /// retire that lands mid-compaction survives to the next pass.
    #[inline]
    pub async fn run_compaction_once(&self) -> Result<usize> {
        let snapshot: Vec<DocKey> = {
            let tombstones = self.tombstones.read().expect("tombstone lock poisoned");
            tombstones.iter().cloned().collect()
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        for (doc_id, version) in &snapshot {
            let shard = self.shard_for(doc_id);
            let _write_guard = shard.lock().await;

            self.vectors.delete_doc_version(doc_id, *version).await?;

            let removed: Vec<String> = {
                let metadata = self.metadata.read().expect("metadata lock poisoned");
                metadata
                    .values()
                    .filter(|m| m.doc_id == *doc_id && m.doc_version == *version)
                    .map(|m| m.chunk_id.clone())
                    .collect()
            };
            for chunk_id in &removed {
                self.sparse.remove_chunk(chunk_id);
            }
            {
                let mut metadata = self.metadata.write().expect("metadata lock poisoned");
                for chunk_id in &removed {
                    metadata.remove(chunk_id);
                }
            }
        }

        self.vectors.optimize().await?;

        {
            let mut tombstones = self.tombstones.write().expect("tombstone lock poisoned");
            for key in &snapshot {
                tombstones.remove(key);
            }
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            removed_versions = snapshot.len(),
            generation, "compaction pass complete"
        );
        Ok(snapshot.len())
    }

    /// Compaction generation, bumped once per completed pass.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Chunks visible to search (indexed minus tombstoned).
    #[inline]
    pub fn visible_chunks(&self) -> usize {
        let tombstones = self.tombstones.read().expect("tombstone lock poisoned");
        let metadata = self.metadata.read().expect("metadata lock poisoned");
        metadata
            .values()
            .filter(|m| !tombstones.contains(&(m.doc_id.clone(), m.doc_version)))
            .count()
    }

    /// Total persisted rows, including tombstoned ones awaiting compaction.
    #[inline]
    pub async fn persisted_chunks(&self) -> Result<u64> {
        self.vectors.count().await
    }

    /// Run compaction on an interval until the store is dropped. Intended
    /// to be spawned once at startup.
    #[inline]
    pub async fn compaction_loop(self: std::sync::Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_compaction_once().await {
                Ok(0) => {}
                Ok(n) => debug!("compacted {n} document versions"),
                Err(e) => warn!("compaction pass failed: {e}"),
            }
        }
    }
}
