use super::*;
use crate::config::OcrConfig;

#[test]
fn client_configuration() {
    let config = OcrConfig {
        endpoint: "http://ocr-host:7000".to_string(),
        language: "de".to_string(),
        ..OcrConfig::default()
    };
    let client = HttpOcrClient::new(&config).expect("Failed to create client");

    assert_eq!(client.base_url.host_str(), Some("ocr-host"));
    assert_eq!(client.base_url.port(), Some(7000));
    assert_eq!(client.language, "de");
    assert_eq!(client.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
}

#[test]
fn extract_url_carries_language() {
    let config = OcrConfig {
        language: "en".to_string(),
        ..OcrConfig::default()
    };
    let client = HttpOcrClient::new(&config).expect("Failed to create client");
    let url = client.extract_url().expect("Failed to build URL");

    assert!(url.path().ends_with("/v1/extract"));
    assert_eq!(url.query(), Some("lang=en"));
}

#[test]
fn rejects_invalid_endpoint() {
    let config = OcrConfig {
        endpoint: "::bad::".to_string(),
        ..OcrConfig::default()
    };
    assert!(HttpOcrClient::new(&config).is_err());
}

#[test]
fn response_deserializes_blocks() {
    let json = r#"{"blocks":[{"text":"hello","confidence":0.93},{"text":"faint","confidence":0.41}]}"#;
    let response: OcrResponse = serde_json::from_str(json).expect("parse failed");
    assert_eq!(response.blocks.len(), 2);
    assert_eq!(response.blocks[0].text, "hello");
    assert!((response.blocks[1].confidence - 0.41).abs() < 1e-6);
}
