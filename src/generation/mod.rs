// Generation backend client
// The LLM is an opaque external collaborator: the core renders a prompt
// from the retrieved context and delegates answer generation to one of the
// configured backend replicas. Replica choice and failover live in the
// serving layer, not here.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::GenerationConfig;
use crate::retrieval::ScoredChunk;
use crate::{RagError, Result};

pub trait GenerationBackend: Send + Sync {
    /// Generate an answer for the query grounded in the context chunks,
    /// using the replica at `endpoint`. Fails with `BackendUnavailable` or
    /// `Timeout`; both are treated by the caller as replica failures.
    fn generate(&self, endpoint: &Url, query: &str, context: &[ScoredChunk]) -> Result<String>;

    /// Liveness probe of the replica at `endpoint`.
    fn probe(&self, endpoint: &Url) -> bool;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

/// HTTP client for generation backend replicas.
#[derive(Debug, Clone)]
pub struct HttpGenerationClient {
    model: String,
    prompt_template: String,
    max_context_chunks: usize,
    timeout: Duration,
    agent: ureq::Agent,
}

impl HttpGenerationClient {
    #[inline]
    pub fn new(config: &GenerationConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Self {
            model: config.model.clone(),
            prompt_template: config.prompt_template.clone(),
            max_context_chunks: config.max_context_chunks,
            timeout,
            agent,
        }
    }

    /// Render the prompt template with the context block and the query.
    fn render_prompt(&self, query: &str, context: &[ScoredChunk]) -> String {
        let mut rendered = String::new();
        for (i, chunk) in context.iter().take(self.max_context_chunks).enumerate() {
            let page = chunk
                .page
                .map(|p| format!(", page {p}"))
                .unwrap_or_default();
            rendered.push_str(&format!(
                "[{}] (source: {}{page})\n{}\n\n",
                i + 1,
                chunk.doc_id,
                chunk.content
            ));
        }

        self.prompt_template
            .replace("{context}", rendered.trim_end())
            .replace("{query}", query)
    }
}

impl GenerationBackend for HttpGenerationClient {
    #[inline]
    fn generate(&self, endpoint: &Url, query: &str, context: &[ScoredChunk]) -> Result<String> {
        let url = endpoint
            .join("/v1/generate")
            .map_err(|e| RagError::Config(format!("Failed to build generation URL: {e}")))?;

        let request = GenerateRequest {
            model: &self.model,
            prompt: self.render_prompt(query, context),
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| RagError::BackendUnavailable(e.to_string()))?;

        debug!(endpoint = %endpoint, context_chunks = context.len(), "generation request");

        let outcome = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .and_then(|mut resp| resp.body_mut().read_to_string());

        let response_text = match outcome {
            Ok(text) => text,
            Err(ureq::Error::Timeout(_)) => {
                warn!(endpoint = %endpoint, "generation backend timed out");
                return Err(RagError::Timeout(self.timeout));
            }
            Err(error) => {
                warn!(endpoint = %endpoint, "generation backend error: {error}");
                return Err(RagError::BackendUnavailable(error.to_string()));
            }
        };

        let response: GenerateResponse = serde_json::from_str(&response_text).map_err(|e| {
            RagError::BackendUnavailable(format!("Malformed generation response: {e}"))
        })?;

        Ok(response.text)
    }

    #[inline]
    fn probe(&self, endpoint: &Url) -> bool {
        let Ok(url) = endpoint.join("/health") else {
            return false;
        };
        self.agent.get(url.as_str()).call().is_ok()
    }
}
