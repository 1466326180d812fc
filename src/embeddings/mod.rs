// Embeddings module
// Chunking of normalized content and vector embedding of chunks and queries.

pub mod chunking;
pub mod client;


pub use chunking::{ChunkingConfig, TextChunk, chunk_blocks};
pub use client::HttpEmbeddingClient;

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::Result;

/// Numeric precision for embedding inference. Lower precision trades exact
/// reproducibility for memory; ranking order is preserved within tolerance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Int8,
}

impl Precision {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
            Precision::Int8 => "int8",
        }
    }
}

/// Produces dense vectors for chunk and query text. Queries must use the
/// same implementation that embedded the corpus for the vector spaces to be
/// comparable.
pub trait EmbeddingBackend: Send + Sync {
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per input, each of `dimension()`
    /// length. Fails with `EmbeddingBackendUnavailable` when the backend
    /// cannot be reached.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic term-hashing embedder.
///
/// Tokenizes into lowercase alphanumeric terms, hashes each term into a
/// bucket, and L2-normalizes the resulting counts. No model weights and no
/// network; used for offline operation and tests. Shared terms between two
/// texts yield a higher cosine similarity, which is all hybrid retrieval
/// needs from it.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    precision: Precision,
}

impl HashingEmbedder {
    #[inline]
    pub fn new(dimension: usize, precision: Precision) -> Self {
        Self {
            dimension,
            precision,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        for term in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            term.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % self.dimension;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
        for v in &mut vector {
            *v /= norm;
        }

        match self.precision {
            Precision::Fp32 => {}
            // Simulated reduced precision: coarser value grids keep the
            // relative ordering of clearly separated scores.
            Precision::Fp16 => {
                for v in &mut vector {
                    *v = (*v * 2048.0).round() / 2048.0;
                }
            }
            Precision::Int8 => {
                for v in &mut vector {
                    *v = (*v * 127.0).round() / 127.0;
                }
            }
        }

        vector
    }
}

impl EmbeddingBackend for HashingEmbedder {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Lowercase alphanumeric terms of a text. Shared by the hashing embedder
/// and the sparse keyword index so both sides of hybrid search agree on
/// term boundaries.
#[inline]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
