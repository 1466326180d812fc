
use std::collections::HashMap;
use std::sync::RwLock;

use crate::embeddings::tokenize;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// In-memory inverted index over chunk text, scored BM25-style. This is
/// the sparse half of hybrid search; the dense half lives in the vector
/// store. Rebuilt from the vector store's metadata on startup.
pub struct SparseIndex {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// term -> chunk_id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
    /// chunk_id -> token count
    lengths: HashMap<String, u32>,
    total_len: u64,
}

impl Default for SparseIndex {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SparseIndex {
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    #[inline]
    pub fn add_chunk(&self, chunk_id: &str, content: &str) {
        let terms = tokenize(content);
        let mut inner = self.inner.write().expect("sparse index lock poisoned");

        // Re-adding a chunk replaces its postings.
        if inner.lengths.contains_key(chunk_id) {
            remove_chunk_locked(&mut inner, chunk_id);
        }

        inner.total_len += terms.len() as u64;
        inner.lengths.insert(chunk_id.to_string(), terms.len() as u32);
        for term in terms {
            *inner
                .postings
                .entry(term)
                .or_default()
                .entry(chunk_id.to_string())
                .or_insert(0) += 1;
        }
    }

    #[inline]
    pub fn remove_chunk(&self, chunk_id: &str) {
        let mut inner = self.inner.write().expect("sparse index lock poisoned");
        remove_chunk_locked(&mut inner, chunk_id);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("sparse index lock poisoned")
            .lengths
            .len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top `k` chunks by BM25 score for the query text. Scores are
    /// non-negative; chunks sharing no term with the query are absent.
    #[inline]
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        let terms = tokenize(query);
        if terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let inner = self.inner.read().expect("sparse index lock poisoned");
        let doc_count = inner.lengths.len();
        if doc_count == 0 {
            return Vec::new();
        }
        let avg_len = inner.total_len as f32 / doc_count as f32;

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in &terms {
            let Some(posting) = inner.postings.get(term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((doc_count as f32 - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (chunk_id, tf) in posting {
                let len = *inner.lengths.get(chunk_id).unwrap_or(&0) as f32;
                let tf = *tf as f32;
                let norm = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                *scores.entry(chunk_id.as_str()).or_insert(0.0) += idf * tf / norm;
            }
        }

        let mut ranked: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        ranked
    }
}

fn remove_chunk_locked(inner: &mut Inner, chunk_id: &str) {
    let Some(len) = inner.lengths.remove(chunk_id) else {
        return;
    };
    inner.total_len = inner.total_len.saturating_sub(u64::from(len));
    inner.postings.retain(|_, posting| {
        posting.remove(chunk_id);
        !posting.is_empty()
    });
}
