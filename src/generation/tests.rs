use super::*;
use crate::config::GenerationConfig;

fn chunk(doc_id: &str, content: &str, page: Option<u32>) -> ScoredChunk {
    ScoredChunk {
        chunk_id: format!("{doc_id}@v1#00000"),
        doc_id: doc_id.to_string(),
        doc_version: 1,
        content: content.to_string(),
        page,
        low_confidence: false,
        score: 0.9,
    }
}

#[test]
fn prompt_contains_context_and_query() {
    let client = HttpGenerationClient::new(&GenerationConfig::default());
    let context = vec![
        chunk("manual", "The warranty period is 24 months.", Some(3)),
        chunk("faq", "Refunds are processed within a week.", None),
    ];

    let prompt = client.render_prompt("What is the warranty period?", &context);

    assert!(prompt.contains("What is the warranty period?"));
    assert!(prompt.contains("The warranty period is 24 months."));
    assert!(prompt.contains("(source: manual, page 3)"));
    assert!(prompt.contains("(source: faq)"));
    assert!(!prompt.contains("{context}"));
    assert!(!prompt.contains("{query}"));
}

#[test]
fn prompt_respects_context_limit() {
    let config = GenerationConfig {
        max_context_chunks: 1,
        ..GenerationConfig::default()
    };
    let client = HttpGenerationClient::new(&config);
    let context = vec![
        chunk("first", "included content", None),
        chunk("second", "excluded content", None),
    ];

    let prompt = client.render_prompt("question", &context);
    assert!(prompt.contains("included content"));
    assert!(!prompt.contains("excluded content"));
}

#[test]
fn prompt_with_empty_context() {
    let client = HttpGenerationClient::new(&GenerationConfig::default());
    let prompt = client.render_prompt("orphan question", &[]);
    assert!(prompt.contains("orphan question"));
}

#[test]
fn client_configuration() {
    let config = GenerationConfig {
        model: "test-llm".to_string(),
        timeout_seconds: 7,
        ..GenerationConfig::default()
    };
    let client = HttpGenerationClient::new(&config);
    assert_eq!(client.model, "test-llm");
    assert_eq!(client.timeout, Duration::from_secs(7));
}

#[test]
fn response_parses_text() {
    let response: GenerateResponse =
        serde_json::from_str(r#"{"text":"the answer"}"#).expect("parse failed");
    assert_eq!(response.text, "the answer");
}
