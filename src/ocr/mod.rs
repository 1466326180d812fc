// OCR backend client
// The OCR service is an external collaborator: it accepts raw image or
// scanned-document bytes and returns text blocks with confidence scores.
// Rasterization of scanned PDFs happens inside the service.

#[cfg(test)]
mod tests;

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::OcrConfig;
use crate::{RagError, Result};

const DEFAULT_RETRY_ATTEMPTS: u32 = 2;

/// One extracted text region with the engine's confidence in it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OcrBlock {
    pub text: String,
    pub confidence: f32,
}

pub trait OcrBackend: Send + Sync {
    /// Extract text blocks from image bytes. Fails with `OcrFailure` when
    /// the engine cannot process the payload and `Timeout` when the call
    /// budget is exceeded.
    fn extract(&self, image_bytes: &[u8]) -> Result<Vec<OcrBlock>>;
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    blocks: Vec<OcrBlock>,
}

/// HTTP client for the OCR service.
#[derive(Debug, Clone)]
pub struct HttpOcrClient {
    base_url: Url,
    language: String,
    timeout: Duration,
    agent: ureq::Agent,
    retry_attempts: u32,
}

impl HttpOcrClient {
    #[inline]
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let base_url = Url::parse(&config.endpoint)
            .map_err(|e| RagError::Config(format!("Invalid OCR endpoint: {e}")))?;

        let timeout = Duration::from_secs(config.timeout_seconds);
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Ok(Self {
            base_url,
            language: config.language.clone(),
            timeout,
            agent,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    fn extract_url(&self) -> Result<Url> {
        let mut url = self
            .base_url
            .join("/v1/extract")
            .map_err(|e| RagError::Config(format!("Failed to build OCR URL: {e}")))?;
        url.query_pairs_mut().append_pair("lang", &self.language);
        Ok(url)
    }
}

impl OcrBackend for HttpOcrClient {
    #[inline]
    fn extract(&self, image_bytes: &[u8]) -> Result<Vec<OcrBlock>> {
        let url = self.extract_url()?;
        let mut timed_out = false;
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!(
                payload_bytes = image_bytes.len(),
                "OCR request attempt {}/{}", attempt, self.retry_attempts
            );

            let outcome = self
                .agent
                .post(url.as_str())
                .header("Content-Type", "application/octet-stream")
                .send(image_bytes)
                .and_then(|mut resp| resp.body_mut().read_to_string());

            match outcome {
                Ok(response_text) => {
                    let response: OcrResponse =
                        serde_json::from_str(&response_text).map_err(|e| {
                            RagError::OcrFailure(format!("Malformed OCR response: {e}"))
                        })?;
                    return Ok(response.blocks);
                }
                Err(ureq::Error::StatusCode(status)) if status < 500 => {
                    // The engine rejected the payload itself; retrying the
                    // same bytes cannot succeed.
                    return Err(RagError::OcrFailure(format!("HTTP {status}")));
                }
                Err(error) => {
                    if matches!(error, ureq::Error::Timeout(_)) {
                        timed_out = true;
                    }
                    warn!(
                        "OCR backend error: {}, attempt {}/{}",
                        error, attempt, self.retry_attempts
                    );
                    last_error = Some(error.to_string());
                }
            }
        }

        if timed_out {
            return Err(RagError::Timeout(self.timeout));
        }
        Err(RagError::OcrFailure(
            last_error.unwrap_or_else(|| "request failed after retries".to_string()),
        ))
    }
}
