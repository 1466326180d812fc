
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::EmbeddingConfig;
use crate::embeddings::{EmbeddingBackend, Precision};
use crate::{RagError, Result};

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

/// Client for a remote embedding inference service.
///
/// Batches are bounded by the configured batch size to cap the backend's
/// peak memory; inference precision is forwarded per request so a
/// quantized backend can be selected by configuration alone.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    base_url: Url,
    model: String,
    batch_size: u32,
    dimension: usize,
    precision: Precision,
    timeout: Duration,
    agent: ureq::Agent,
    retry_attempts: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    inputs: &'a [String],
    precision: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl HttpEmbeddingClient {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = Url::parse(&config.endpoint)
            .map_err(|e| RagError::Config(format!("Invalid embedding endpoint: {e}")))?;

        let timeout = Duration::from_secs(config.timeout_seconds);
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            batch_size: config.batch_size,
            dimension: config.dimension as usize,
            precision: config.precision,
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

    fn embed_single_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self
            .base_url
            .join("/v1/embed")
            .map_err(|e| RagError::Config(format!("Failed to build embedding URL: {e}")))?;

        let request = EmbedRequest {
            model: &self.model,
            inputs: texts,
            precision: self.precision.as_str(),
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| RagError::EmbeddingBackendUnavailable(e.to_string()))?;

        let response_text = self.request_with_retry(&url, &request_json)?;

        let response: EmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::EmbeddingBackendUnavailable(format!("Malformed embedding response: {e}"))
        })?;

        if response.embeddings.len() != texts.len() {
            return Err(RagError::EmbeddingBackendUnavailable(format!(
                "Embedding count mismatch: requested {}, received {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        for vector in &response.embeddings {
            if vector.len() != self.dimension {
                return Err(RagError::EmbeddingBackendUnavailable(format!(
                    "Embedding dimension mismatch: expected {}, received {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }

        Ok(response.embeddings)
    }

    fn request_with_retry(&self, url: &Url, body: &str) -> Result<String> {
        let mut timed_out = false;
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            debug!("Embedding request attempt {}/{}", attempt, self.retry_attempts);

            let outcome = self
                .agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(body)
                .and_then(|mut resp| resp.body_mut().read_to_string());

            match outcome {
                Ok(response_text) => return Ok(response_text),
                Err(error) => {
                    let retryable = match &error {
                        ureq::Error::StatusCode(status) => {
                            if *status >= 500 {
                                warn!(
                                    "Embedding backend server error (status {}), attempt {}/{}",
                                    status, attempt, self.retry_attempts
                                );
                                true
                            } else {
                                return Err(RagError::EmbeddingBackendUnavailable(format!(
                                    "HTTP {status}"
                                )));
                            }
                        }
                        ureq::Error::Timeout(_) => {
                            warn!(
                                "Embedding backend timeout, attempt {}/{}",
                                attempt, self.retry_attempts
                            );
                            timed_out = true;
                            true
                        }
                        ureq::Error::ConnectionFailed
                        | ureq::Error::HostNotFound
                        | ureq::Error::Io(_) => {
                            warn!(
                                "Embedding backend transport error: {}, attempt {}/{}",
                                error, attempt, self.retry_attempts
                            );
                            true
                        }
                        _ => {
                            return Err(RagError::EmbeddingBackendUnavailable(error.to_string()));
                        }
                    };

                    if retryable {
                        last_error = Some(error.to_string());
                        if attempt < self.retry_attempts {
                            let delay_ms = EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) * 1000;
                            std::thread::sleep(Duration::from_millis(delay_ms));
                        }
                    }
                }
            }
        }

        if timed_out {
            return Err(RagError::Timeout(self.timeout));
        }
        Err(RagError::EmbeddingBackendUnavailable(
            last_error.unwrap_or_else(|| "request failed after retries".to_string()),
        ))
    }
}

impl EmbeddingBackend for HttpEmbeddingClient {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Embedding {} texts", texts.len());

        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size as usize) {
            results.extend(self.embed_single_batch(batch)?);
        }
        Ok(results)
    }
}
