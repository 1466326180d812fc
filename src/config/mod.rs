// Configuration management module
// Loads and validates the TOML configuration for every subsystem.


use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::Precision;
use crate::embeddings::chunking::ChunkingConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub ocr: OcrConfig,
    pub redaction: RedactionConfig,
    pub chunking: ChunkingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub serving: ServingConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            ocr: OcrConfig::default(),
            redaction: RedactionConfig::default(),
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            serving: ServingConfig::default(),
            base_dir: default_base_dir(),
        }
    }
}

/// Which embedding implementation to construct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Remote embedding inference service.
    Http,
    /// Deterministic local term-hashing embedder. No model, no network;
    /// suitable for offline operation and tests.
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub endpoint: String,
    pub model: String,
    pub batch_size: u32,
    pub dimension: u32,
    pub precision: Precision,
    pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Http,
            endpoint: "http://localhost:8601".to_string(),
            model: "bge-large".to_string(),
            batch_size: 32,
            dimension: 384,
            precision: Precision::Fp32,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// One endpoint per backend replica. All replicas serve the same model.
    pub replicas: Vec<String>,
    pub model: String,
    pub prompt_template: String,
    pub max_context_chunks: usize,
    pub timeout_seconds: u64,
}

impl Default for GenerationConfig {
    #[inline]
    fn default() -> Self {
        Self {
            replicas: vec!["http://localhost:8700".to_string()],
            model: "deepseek-chat".to_string(),
            prompt_template: "Answer the question using only the reference passages below.\n\
                              {context}\n\nQuestion: {query}\n\
                              Cite the source of each claim. If the passages do not \
                              contain the answer, say so."
                .to_string(),
            max_context_chunks: 8,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OcrConfig {
    pub endpoint: String,
    pub language: String,
    /// Blocks scoring below this confidence are flagged low-confidence but
    /// never dropped.
    pub confidence_threshold: f32,
    pub timeout_seconds: u64,
}

impl Default for OcrConfig {
    #[inline]
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8602".to_string(),
            language: "en".to_string(),
            confidence_threshold: 0.6,
            timeout_seconds: 45,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedactionConfig {
    pub enabled: bool,
    /// Which sensitive-data patterns to mask. Known kinds: "phone",
    /// "email", "id_number".
    pub kinds: Vec<String>,
}

impl Default for RedactionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            enabled: false,
            kinds: vec![
                "phone".to_string(),
                "email".to_string(),
                "id_number".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Logical write shards. Writes are serialized per shard, reads are
    /// concurrent across shards.
    pub shards: usize,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub compaction_interval_seconds: u64,
}

impl Default for IndexConfig {
    #[inline]
    fn default() -> Self {
        Self {
            shards: 4,
            dense_weight: 0.7,
            sparse_weight: 0.3,
            compaction_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Hybrid search fetches `overfetch_factor * top_k` candidates before
    /// dedup and re-ranking.
    pub overfetch_factor: usize,
    /// Maximum chunks any single document may contribute to one result.
    pub max_per_doc: usize,
    /// Hits scoring below this are dropped.
    pub min_score: f32,
    pub rerank: bool,
    pub rerank_weight: f32,
    /// Score multiplier applied to chunks whose OCR confidence fell below
    /// the configured threshold.
    pub low_confidence_penalty: f32,
    /// Shrink the result set to at most five entries when at least three
    /// hits score 0.8 or higher.
    pub dynamic_top_k: bool,
}

impl Default for RetrievalConfig {
    #[inline]
    fn default() -> Self {
        Self {
            top_k: 8,
            overfetch_factor: 3,
            max_per_doc: 2,
            min_score: 0.0,
            rerank: true,
            rerank_weight: 0.3,
            low_confidence_penalty: 0.8,
            dynamic_top_k: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached retrieval results. Zero disables the cache.
    pub capacity: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    #[inline]
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl_seconds: 86400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServingConfig {
    pub bind_addr: String,
    /// Admission-control ceiling on concurrently served requests.
    pub max_in_flight: usize,
    pub probe_interval_seconds: u64,
    /// Consecutive failed probes before a replica is marked unhealthy.
    pub unhealthy_after: u32,
    /// Consecutive successful probes before a replica is marked healthy.
    pub healthy_after: u32,
    /// Effective-load multiplier applied to degraded replicas during
    /// routing so they receive a reduced traffic share.
    pub degraded_load_penalty: u32,
}

impl Default for ServingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_in_flight: 256,
            probe_interval_seconds: 5,
            unhealthy_after: 3,
            healthy_after: 2,
            degraded_load_penalty: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
    #[error("No generation replicas configured")]
    NoReplicas,
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid embedding dimension: {0} (must be between 16 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid confidence threshold: {0} (must be between 0.0 and 1.0)")]
    InvalidConfidenceThreshold(f32),
    #[error("Unknown redaction kind: {0}")]
    UnknownRedactionKind(String),
    #[error("Invalid shard count: {0} (must be between 1 and 64)")]
    InvalidShardCount(usize),
    #[error("Invalid hybrid weights: dense={0}, sparse={1} (must be non-negative, not both zero)")]
    InvalidHybridWeights(f32, f32),
    #[error("Invalid top_k: {0} (must be between 1 and 100)")]
    InvalidTopK(usize),
    #[error("Invalid over-fetch factor: {0} (must be between 1 and 10)")]
    InvalidOverfetchFactor(usize),
    #[error("Invalid per-document cap: {0} (must be at least 1)")]
    InvalidPerDocCap(usize),
    #[error("Invalid in-flight ceiling: {0} (must be at least 1)")]
    InvalidInFlightCeiling(usize),
    #[error("Invalid hysteresis counters: unhealthy_after={0}, healthy_after={1} (must be at least 1)")]
    InvalidHysteresis(u32, u32),
    #[error("Invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("Prompt template must contain {{context}} and {{query}} placeholders")]
    InvalidPromptTemplate,
    #[error("Invalid chunk sizes: target={target}, overlap={overlap} (overlap must be smaller than target)")]
    InvalidChunkSizes { target: usize, overlap: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ragserve")
}

impl Config {
    /// Load configuration from `<base_dir>/config.toml`, falling back to
    /// defaults when the file does not exist.
    #[inline]
    pub fn load<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let config_path = base_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            let mut config = Self::default();
            config.base_dir = base_dir.as_ref().to_path_buf();
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = base_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Load from the default base directory.
    #[inline]
    pub fn load_default() -> Result<Self> {
        Self::load(default_base_dir())
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.base_dir.join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.embedding.endpoint)?;
        validate_endpoint(&self.ocr.endpoint)?;
        if self.generation.replicas.is_empty() {
            return Err(ConfigError::NoReplicas);
        }
        for replica in &self.generation.replicas {
            validate_endpoint(replica)?;
        }

        if self.embedding.batch_size == 0 || self.embedding.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.embedding.batch_size));
        }
        if !(16..=4096).contains(&self.embedding.dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding.dimension,
            ));
        }

        if !(0.0..=1.0).contains(&self.ocr.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.ocr.confidence_threshold,
            ));
        }

        for kind in &self.redaction.kinds {
            if !matches!(kind.as_str(), "phone" | "email" | "id_number") {
                return Err(ConfigError::UnknownRedactionKind(kind.clone()));
            }
        }

        if !(1..=64).contains(&self.index.shards) {
            return Err(ConfigError::InvalidShardCount(self.index.shards));
        }
        if self.index.dense_weight < 0.0
            || self.index.sparse_weight < 0.0
            || self.index.dense_weight + self.index.sparse_weight <= 0.0
        {
            return Err(ConfigError::InvalidHybridWeights(
                self.index.dense_weight,
                self.index.sparse_weight,
            ));
        }

        if !(1..=100).contains(&self.retrieval.top_k) {
            return Err(ConfigError::InvalidTopK(self.retrieval.top_k));
        }
        if !(1..=10).contains(&self.retrieval.overfetch_factor) {
            return Err(ConfigError::InvalidOverfetchFactor(
                self.retrieval.overfetch_factor,
            ));
        }
        if self.retrieval.max_per_doc == 0 {
            return Err(ConfigError::InvalidPerDocCap(self.retrieval.max_per_doc));
        }

        if self.serving.max_in_flight == 0 {
            return Err(ConfigError::InvalidInFlightCeiling(
                self.serving.max_in_flight,
            ));
        }
        if self.serving.unhealthy_after == 0 || self.serving.healthy_after == 0 {
            return Err(ConfigError::InvalidHysteresis(
                self.serving.unhealthy_after,
                self.serving.healthy_after,
            ));
        }
        if self.serving.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.serving.bind_addr.clone()));
        }

        if !self.generation.prompt_template.contains("{context}")
            || !self.generation.prompt_template.contains("{query}")
        {
            return Err(ConfigError::InvalidPromptTemplate);
        }

        if self.chunking.overlap_chars >= self.chunking.target_chars {
            return Err(ConfigError::InvalidChunkSizes {
                target: self.chunking.target_chars,
                overlap: self.chunking.overlap_chars,
            });
        }

        Ok(())
    }

    /// Path of the SQLite document catalog.
    #[inline]
    pub fn catalog_path(&self) -> PathBuf {
        self.base_dir.join("catalog.db")
    }

    /// Directory of the LanceDB vector store.
    #[inline]
    pub fn vector_store_path(&self) -> PathBuf {
        self.base_dir.join("vectors")
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let url =
        Url::parse(endpoint).map_err(|_| ConfigError::InvalidEndpoint(endpoint.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(())
}
