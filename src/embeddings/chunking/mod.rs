
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::normalize::Block;

/// A chunk of normalized content ready for embedding. `seq` is the stable
/// position within the source document and is what context reconstruction
/// orders by.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    pub seq: usize,
    pub page: Option<u32>,
    pub ocr_confidence: Option<f32>,
    pub low_confidence: bool,
}

/// Configuration for content chunking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk size in characters.
    pub target_chars: usize,
    /// Overlap carried from the end of one chunk into the next. Preserves
    /// context across chunk boundaries; at least 10% of the target size is
    /// the recommended floor.
    pub overlap_chars: usize,
    /// Whether oversized blocks are split at sentence boundaries before
    /// falling back to word boundaries.
    pub sentence_boundary_splitting: bool,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            target_chars: 1200,
            overlap_chars: 150,
            sentence_boundary_splitting: true,
        }
    }
}

/// Chunk normalized blocks into embedding-ready pieces.
///
/// Blocks are packed in order. Blocks merge into the same chunk only when
/// they share a page and a confidence flag, so provenance survives
/// chunking. Oversized blocks are split at sentence boundaries, then words.
#[inline]
pub fn chunk_blocks(blocks: &[Block], config: &ChunkingConfig) -> Result<Vec<TextChunk>> {
    let mut chunks: Vec<TextChunk> = Vec::new();

    for block in blocks {
        let text = block.text.trim();
        if text.is_empty() {
            continue;
        }

        if text.chars().count() <= config.target_chars {
            append_or_merge(&mut chunks, block, text, config);
            continue;
        }

        let splits = if config.sentence_boundary_splitting {
            split_by_sentences(text, config.target_chars)
        } else {
            split_by_words(text, config.target_chars)
        };
        for split in splits {
            push_chunk(&mut chunks, block, split);
        }
    }

    if config.overlap_chars > 0 {
        add_overlap(&mut chunks, config.overlap_chars);
    }

    for (seq, chunk) in chunks.iter_mut().enumerate() {
        chunk.seq = seq;
    }

    debug!(
        chunk_count = chunks.len(),
        "chunked {} blocks into {} chunks",
        blocks.len(),
        chunks.len()
    );

    Ok(chunks)
}

fn append_or_merge(chunks: &mut Vec<TextChunk>, block: &Block, text: &str, config: &ChunkingConfig) {
    if let Some(last) = chunks.last_mut() {
        let fits =
            last.content.chars().count() + text.chars().count() + 2 <= config.target_chars;
        if fits && last.page == block.page && last.low_confidence == block.low_confidence {
            last.content.push_str("\n\n");
            last.content.push_str(text);
            last.ocr_confidence = match (last.ocr_confidence, block.ocr_confidence) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            return;
        }
    }
    push_chunk(chunks, block, text.to_string());
}

fn push_chunk(chunks: &mut Vec<TextChunk>, block: &Block, content: String) {
    chunks.push(TextChunk {
        content,
        seq: 0,
        page: block.page,
        ocr_confidence: block.ocr_confidence,
        low_confidence: block.low_confidence,
    });
}

/// Split text at sentence boundaries, packing sentences up to the budget.
/// Sentences longer than the budget fall back to word splitting.
fn split_by_sentences(text: &str, budget: usize) -> Vec<String> {
    let mut splits = Vec::new();
    let mut current = String::new();

    for sentence in sentence_segments(text) {
        if sentence.chars().count() > budget {
            if !current.trim().is_empty() {
                splits.push(current.trim().to_string());
                current.clear();
            }
            splits.extend(split_by_words(&sentence, budget));
            continue;
        }

        if current.chars().count() + sentence.chars().count() > budget
            && !current.trim().is_empty()
        {
            splits.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(&sentence);
        current.push(' ');
    }

    if !current.trim().is_empty() {
        splits.push(current.trim().to_string());
    }

    splits
}

/// Split text at word boundaries as a last resort.
fn split_by_words(text: &str, budget: usize) -> Vec<String> {
    let mut splits = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.chars().count() + word.chars().count() + 1 > budget
            && !current.trim().is_empty()
        {
            splits.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(word);
        current.push(' ');
    }

    if !current.trim().is_empty() {
        splits.push(current.trim().to_string());
    }

    splits
}

/// Segment text into sentences on terminal punctuation, keeping the
/// punctuation attached.
fn sentence_segments(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            if !current.trim().is_empty() {
                segments.push(current.trim().to_string());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        segments.push(current.trim().to_string());
    }

    segments
}

/// Prepend the tail of each chunk onto its successor when both sit on the
/// same page, so a fact straddling a boundary is retrievable from either
/// side.
fn add_overlap(chunks: &mut [TextChunk], overlap_chars: usize) {
    let mut i = 1;
    while i < chunks.len() {
        if chunks[i - 1].page == chunks[i].page
            && chunks[i - 1].low_confidence == chunks[i].low_confidence
        {
            let overlap = tail_overlap(&chunks[i - 1].content, overlap_chars);
            if !overlap.is_empty() {
                chunks[i].content = format!("{}\n\n{}", overlap, chunks[i].content);
            }
        }
        i += 1;
    }
}

/// The last `overlap_chars` of a chunk, extended left to a word boundary.
/// Returns nothing when the chunk is too short to be worth repeating.
fn tail_overlap(content: &str, overlap_chars: usize) -> String {
    let total = content.chars().count();
    if total <= overlap_chars {
        return String::new();
    }

    let mut tail: Vec<&str> = Vec::new();
    let mut taken = 0;
    for word in content.split_whitespace().rev() {
        taken += word.chars().count() + 1;
        tail.push(word);
        if taken >= overlap_chars {
            break;
        }
    }
    tail.reverse();
    tail.join(" ")
}
