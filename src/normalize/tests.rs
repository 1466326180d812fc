use super::*;
use crate::config::{OcrConfig, RedactionConfig};
use crate::ocr::{OcrBackend, OcrBlock};

/// OCR stub returning a fixed block list.
struct StubOcr {
    blocks: Vec<OcrBlock>,
}

impl OcrBackend for StubOcr {
    fn extract(&self, _image_bytes: &[u8]) -> crate::Result<Vec<OcrBlock>> {
        Ok(self.blocks.clone())
    }
}

struct FailingOcr;

impl OcrBackend for FailingOcr {
    fn extract(&self, _image_bytes: &[u8]) -> crate::Result<Vec<OcrBlock>> {
        Err(RagError::OcrFailure("engine crashed".to_string()))
    }
}

fn normalizer_with(ocr: Arc<dyn OcrBackend>) -> Normalizer {
    Normalizer::new(ocr, &OcrConfig::default(), &RedactionConfig::default())
        .expect("Failed to build normalizer")
}

fn doc(modality: Modality, payload: &[u8]) -> Document {
    Document {
        doc_id: "doc-1".to_string(),
        modality,
        payload: payload.to_vec(),
        version: 1,
        ingested_at: chrono::Utc::now(),
    }
}

#[test]
fn text_splits_into_paragraphs() {
    let normalizer = normalizer_with(Arc::new(StubOcr { blocks: vec![] }));
    let payload = b"First paragraph.\n\nSecond paragraph.\r\n\r\nThird.";

    let blocks = normalizer
        .normalize(&doc(Modality::Text, payload))
        .expect("normalize failed");

    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].text, "First paragraph.");
    assert_eq!(blocks[2].text, "Third.");
    assert!(blocks.iter().all(|b| !b.low_confidence));
}

#[test]
fn invalid_utf8_is_corrupt() {
    let normalizer = normalizer_with(Arc::new(StubOcr { blocks: vec![] }));
    let result = normalizer.normalize(&doc(Modality::Text, &[0xff, 0xfe, 0xfd]));
    assert!(matches!(result, Err(RagError::CorruptPayload(_))));
}

#[test]
fn empty_text_is_corrupt() {
    let normalizer = normalizer_with(Arc::new(StubOcr { blocks: vec![] }));
    let result = normalizer.normalize(&doc(Modality::Text, b"   \n\n  "));
    assert!(matches!(result, Err(RagError::CorruptPayload(_))));
}

#[test]
fn unreadable_pdf_is_corrupt() {
    let normalizer = normalizer_with(Arc::new(StubOcr { blocks: vec![] }));
    let result = normalizer.normalize(&doc(Modality::Pdf, b"definitely not a pdf"));
    assert!(matches!(result, Err(RagError::CorruptPayload(_))));
}

#[test]
fn scan_goes_through_ocr_and_flags_low_confidence() {
    let ocr = StubOcr {
        blocks: vec![
            OcrBlock {
                text: "Clear heading".to_string(),
                confidence: 0.95,
            },
            OcrBlock {
                text: "smudged footnote".to_string(),
                confidence: 0.35,
            },
            OcrBlock {
                text: "   ".to_string(),
                confidence: 0.9,
            },
        ],
    };
    let normalizer = normalizer_with(Arc::new(ocr));

    let blocks = normalizer
        .normalize(&doc(Modality::Scan, b"fake image bytes"))
        .expect("normalize failed");

    // Whitespace-only OCR output is dropped; low-confidence text is kept
    // and flagged.
    assert_eq!(blocks.len(), 2);
    assert!(!blocks[0].low_confidence);
    assert!(blocks[1].low_confidence);
    assert_eq!(blocks[1].ocr_confidence, Some(0.35));
}

#[test]
fn ocr_failure_propagates() {
    let normalizer = normalizer_with(Arc::new(FailingOcr));
    let result = normalizer.normalize(&doc(Modality::Image, b"bytes"));
    assert!(matches!(result, Err(RagError::OcrFailure(_))));
}

#[test]
fn empty_image_is_corrupt() {
    let normalizer = normalizer_with(Arc::new(StubOcr { blocks: vec![] }));
    let result = normalizer.normalize(&doc(Modality::Image, b""));
    assert!(matches!(result, Err(RagError::CorruptPayload(_))));
}

#[test]
fn redaction_masks_configured_patterns() {
    let redaction = RedactionConfig {
        enabled: true,
        kinds: vec!["phone".to_string(), "email".to_string()],
    };
    let normalizer = Normalizer::new(
        Arc::new(StubOcr { blocks: vec![] }),
        &OcrConfig::default(),
        &redaction,
    )
    .expect("Failed to build normalizer");

    let payload = b"Contact sales at sales@example.com or +1 555-0123-4567 for pricing.";
    let blocks = normalizer
        .normalize(&doc(Modality::Text, payload))
        .expect("normalize failed");

    assert!(!blocks[0].text.contains("sales@example.com"));
    assert!(!blocks[0].text.contains("555"));
    assert!(blocks[0].text.contains("[***]"));
    assert!(blocks[0].text.contains("for pricing"));
}

#[test]
fn redaction_disabled_leaves_text_alone() {
    let normalizer = normalizer_with(Arc::new(StubOcr { blocks: vec![] }));
    let payload = b"Reach us at help@example.com any time.";
    let blocks = normalizer
        .normalize(&doc(Modality::Text, payload))
        .expect("normalize failed");
    assert!(blocks[0].text.contains("help@example.com"));
}

#[test]
fn modality_parsing() {
    assert_eq!("pdf".parse::<Modality>().expect("parse failed"), Modality::Pdf);
    assert_eq!("TXT".parse::<Modality>().expect("parse failed"), Modality::Text);
    assert_eq!(
        "jpeg".parse::<Modality>().expect("parse failed"),
        Modality::Image
    );
    assert!(matches!(
        "docx".parse::<Modality>(),
        Err(RagError::UnsupportedModality(_))
    ));
}
