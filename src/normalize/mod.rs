// Document normalizer
// Converts heterogeneous source documents (plain text, PDF, image, scan)
// into a canonical stream of text blocks with provenance. Normalization is
// pure with respect to the index: nothing here writes to storage.

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use fancy_regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{OcrConfig, RedactionConfig};
use crate::ocr::OcrBackend;
use crate::{RagError, Result};

/// Source modality of a document. Closed set: each variant has exactly one
/// normalization strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Pdf,
    Image,
    Scan,
}

impl FromStr for Modality {
    type Err = RagError;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(Modality::Text),
            "pdf" => Ok(Modality::Pdf),
            "image" | "png" | "jpg" | "jpeg" => Ok(Modality::Image),
            "scan" => Ok(Modality::Scan),
            other => Err(RagError::UnsupportedModality(other.to_string())),
        }
    }
}

impl fmt::Display for Modality {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Modality::Text => "text",
            Modality::Pdf => "pdf",
            Modality::Image => "image",
            Modality::Scan => "scan",
        };
        f.write_str(name)
    }
}

impl Modality {
    /// Guess a modality from a file extension. Scans cannot be
    /// distinguished from images by extension and must be declared
    /// explicitly.
    #[inline]
    pub fn from_extension(ext: &str) -> Result<Self> {
        ext.parse()
    }
}

/// A source document as submitted for ingestion. Versions are allocated by
/// the catalog; a document is never mutated in place.
#[derive(Debug, Clone)]
pub struct Document {
    pub doc_id: String,
    pub modality: Modality,
    pub payload: Vec<u8>,
    pub version: u32,
    pub ingested_at: DateTime<Utc>,
}

/// A normalized text block with provenance. Blocks preserve source order;
/// the chunker may merge or split them but never reorders.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub text: String,
    pub page: Option<u32>,
    pub ocr_confidence: Option<f32>,
    pub low_confidence: bool,
}

impl Block {
    fn plain(text: String, page: Option<u32>) -> Self {
        Self {
            text,
            page,
            ocr_confidence: None,
            low_confidence: false,
        }
    }
}

/// Masks configured sensitive patterns with a fixed placeholder before any
/// content reaches the chunker or the index.
#[derive(Debug)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

const REDACTION_MASK: &str = "[***]";

impl Redactor {
    #[inline]
    pub fn new(config: &RedactionConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let mut patterns = Vec::new();
        for kind in &config.kinds {
            let pattern = match kind.as_str() {
                "phone" => r"(?<!\d)\+?\d(?:[-\s]?\d){6,14}(?!\d)",
                "email" => r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
                "id_number" => r"(?<!\d)\d{15}(?:\d{2}[0-9Xx])?(?!\d)",
                other => {
                    return Err(RagError::Config(format!("Unknown redaction kind: {other}")));
                }
            };
            let regex = Regex::new(pattern)
                .map_err(|e| RagError::Config(format!("Invalid redaction pattern: {e}")))?;
            patterns.push(regex);
        }

        Ok(Some(Self { patterns }))
    }

    #[inline]
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for regex in &self.patterns {
            match regex.replace_all(&out, REDACTION_MASK) {
                std::borrow::Cow::Owned(replaced) => out = replaced,
                std::borrow::Cow::Borrowed(_) => {}
            }
        }
        out
    }
}

/// Normalizes documents into canonical blocks, routing image content
/// through the OCR backend.
pub struct Normalizer {
    ocr: Arc<dyn OcrBackend>,
    confidence_threshold: f32,
    redactor: Option<Redactor>,
}

impl Normalizer {
    #[inline]
    pub fn new(
        ocr: Arc<dyn OcrBackend>,
        ocr_config: &OcrConfig,
        redaction: &RedactionConfig,
    ) -> Result<Self> {
        Ok(Self {
            ocr,
            confidence_threshold: ocr_config.confidence_threshold,
            redactor: Redactor::new(redaction)?,
        })
    }

    /// Normalize a document into ordered text blocks.
    ///
    /// Errors: `CorruptPayload` for undecodable input, `OcrFailure` when
    /// the OCR backend fails on image content.
    #[inline]
    pub fn normalize(&self, document: &Document) -> Result<Vec<Block>> {
        let blocks = match document.modality {
            Modality::Text => self.normalize_text(document)?,
            Modality::Pdf => self.normalize_pdf(document)?,
            Modality::Image | Modality::Scan => self.normalize_via_ocr(&document.payload, None)?,
        };

        debug!(
            doc_id = %document.doc_id,
            modality = %document.modality,
            block_count = blocks.len(),
            "normalized document"
        );

        Ok(self.apply_redaction(blocks))
    }

    fn normalize_text(&self, document: &Document) -> Result<Vec<Block>> {
        let text = String::from_utf8(document.payload.clone()).map_err(|_| {
            RagError::CorruptPayload(format!("{}: not valid UTF-8", document.doc_id))
        })?;

        if text.trim().is_empty() {
            return Err(RagError::CorruptPayload(format!(
                "{}: empty text payload",
                document.doc_id
            )));
        }

        Ok(split_paragraphs(&text)
            .into_iter()
            .map(|p| Block::plain(p, None))
            .collect())
    }

    fn normalize_pdf(&self, document: &Document) -> Result<Vec<Block>> {
        let pdf = lopdf::Document::load_mem(&document.payload).map_err(|e| {
            RagError::CorruptPayload(format!("{}: unreadable PDF: {e}", document.doc_id))
        })?;

        let mut blocks = Vec::new();
        let mut image_only_pages = 0usize;

        let page_numbers: Vec<u32> = pdf.get_pages().keys().copied().collect();
        for page in &page_numbers {
            let text = pdf.extract_text(&[*page]).unwrap_or_default();
            if text.trim().is_empty() {
                image_only_pages += 1;
                continue;
            }
            for paragraph in split_paragraphs(&text) {
                blocks.push(Block::plain(paragraph, Some(*page)));
            }
        }

        // Pages without extractable text are image-only; the OCR backend
        // rasterizes and reads them from the original bytes.
        if image_only_pages > 0 {
            warn!(
                doc_id = %document.doc_id,
                image_only_pages,
                "routing image-only PDF pages through OCR"
            );
            blocks.extend(self.normalize_via_ocr(&document.payload, None)?);
        }

        if blocks.is_empty() {
            return Err(RagError::CorruptPayload(format!(
                "{}: PDF contains no extractable content",
                document.doc_id
            )));
        }

        Ok(blocks)
    }

    fn normalize_via_ocr(&self, payload: &[u8], page: Option<u32>) -> Result<Vec<Block>> {
        if payload.is_empty() {
            return Err(RagError::CorruptPayload("empty image payload".to_string()));
        }

        let ocr_blocks = self.ocr.extract(payload)?;

        // Low-confidence blocks are kept and flagged, never discarded;
        // retrieval down-weights them instead.
        Ok(ocr_blocks
            .into_iter()
            .filter(|b| !b.text.trim().is_empty())
            .map(|b| {
                let low_confidence = b.confidence < self.confidence_threshold;
                Block {
                    text: b.text,
                    page,
                    ocr_confidence: Some(b.confidence),
                    low_confidence,
                }
            })
            .collect())
    }

    fn apply_redaction(&self, blocks: Vec<Block>) -> Vec<Block> {
        match &self.redactor {
            None => blocks,
            Some(redactor) => blocks
                .into_iter()
                .map(|mut b| {
                    b.text = redactor.redact(&b.text);
                    b
                })
                .collect(),
        }
    }
}

/// Split text into paragraph-bounded units on blank lines.
fn split_paragraphs(text: &str) -> Vec<String> {
    let unified = text.replace("\r\n", "\n");
    unified
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}
