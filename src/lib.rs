use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported modality: {0}")]
    UnsupportedModality(String),

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("OCR failure: {0}")]
    OcrFailure(String),

    #[error("Embedding backend unavailable: {0}")]
    EmbeddingBackendUnavailable(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Server overloaded: in-flight request ceiling reached")]
    Overloaded,

    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Whether the serving layer may retry this failure against a different
    /// replica. Only transport-level failures qualify; errors that describe
    /// the request itself never do.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::Timeout(_) | RagError::BackendUnavailable(_))
    }
}

pub mod cache;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod embeddings;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod normalize;
pub mod ocr;
pub mod retrieval;
pub mod serving;
