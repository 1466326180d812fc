use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::{Config, EmbeddingProvider};
use crate::embeddings::{EmbeddingBackend, HashingEmbedder, HttpEmbeddingClient};
use crate::generation::HttpGenerationClient;
use crate::index::IndexStore;
use crate::ingest::{IngestJob, IngestPipeline, spawn_workers};
use crate::metrics::Metrics;
use crate::normalize::{Modality, Normalizer};
use crate::ocr::HttpOcrClient;
use crate::retrieval::RetrievalEngine;
use crate::serving::replicas::ReplicaRegistry;
use crate::serving::{AppState, serve};
use crate::{RagError, Result};

const INGEST_WORKERS: usize = 4;
const INGEST_QUEUE_DEPTH: usize = 64;

/// The wired-up core shared by every command.
pub struct Core {
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub index: Arc<IndexStore>,
    pub embedder: Arc<dyn EmbeddingBackend>,
    pub pipeline: Arc<IngestPipeline>,
    pub metrics: Arc<Metrics>,
}

/// Construct the storage and pipeline components from configuration.
#[inline]
pub async fn build_core(config: Config) -> Result<Core> {
    let metrics = Arc::new(Metrics::default());

    let catalog = Arc::new(Catalog::open(&config.catalog_path()).await?);
    let index = Arc::new(
        IndexStore::open(
            &config.vector_store_path(),
            config.embedding.dimension as usize,
            &config.index,
        )
        .await?,
    );

    let embedder: Arc<dyn EmbeddingBackend> = match config.embedding.provider {
        EmbeddingProvider::Http => Arc::new(HttpEmbeddingClient::new(&config.embedding)?),
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(
            config.embedding.dimension as usize,
            config.embedding.precision,
        )),
    };

    let ocr = Arc::new(HttpOcrClient::new(&config.ocr)?);
    let normalizer = Arc::new(Normalizer::new(ocr, &config.ocr, &config.redaction)?);

    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&catalog),
        normalizer,
        Arc::clone(&embedder),
        Arc::clone(&index),
        config.chunking.clone(),
        Arc::clone(&metrics),
    ));

    Ok(Core {
        config,
        catalog,
        index,
        embedder,
        pipeline,
        metrics,
    })
}

/// Print the effective configuration.
#[inline]
pub fn show_config(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config)
        .map_err(|e| RagError::Config(format!("Failed to render config: {e}")))?;
    println!("# data directory: {}", config.base_dir.display());
    println!("{rendered}");
    Ok(())
}

/// Ingest the given files through the background worker pool.
#[inline]
pub async fn ingest_paths(
    config: Config,
    paths: Vec<PathBuf>,
    modality: Option<String>,
    doc_id: Option<String>,
) -> Result<()> {
    if paths.is_empty() {
        return Err(RagError::Config("no input files given".to_string()));
    }
    if doc_id.is_some() && paths.len() > 1 {
        return Err(RagError::Config(
            "--doc-id can only be used with a single input file".to_string(),
        ));
    }

    let declared: Option<Modality> = modality.as_deref().map(str::parse).transpose()?;

    let core = build_core(config).await?;
    let queue = spawn_workers(
        Arc::clone(&core.pipeline),
        INGEST_WORKERS,
        INGEST_QUEUE_DEPTH,
    );

    let mut replies = Vec::with_capacity(paths.len());
    for path in &paths {
        let modality = match declared {
            Some(m) => m,
            None => modality_from_path(path)?,
        };
        let payload = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        queue
            .enqueue(IngestJob {
                doc_id: doc_id.clone().or_else(|| doc_id_from_path(path)),
                modality,
                payload,
                reply: Some(tx),
            })
            .await?;
        replies.push((path.clone(), rx));
    }

    let mut failures = 0usize;
    for (path, rx) in replies {
        match rx.await {
            Ok(Ok(doc_id)) => println!("ingested {} as {doc_id}", path.display()),
            Ok(Err(e)) => {
                failures += 1;
                eprintln!("failed to ingest {}: {e}", path.display());
            }
            Err(_) => {
                failures += 1;
                eprintln!("ingest worker dropped {}", path.display());
            }
        }
    }

    if failures > 0 {
        return Err(RagError::Other(anyhow!("{failures} documents failed")));
    }
    Ok(())
}

/// Retire a document. Idempotent: retiring twice or retiring an unknown id
/// still acknowledges.
#[inline]
pub async fn retire_doc(config: Config, doc_id: &str) -> Result<()> {
    let core = build_core(config).await?;
    core.pipeline.retire(doc_id).await?;
    println!("retired {doc_id}");
    Ok(())
}

/// Run a retrieval-only query and print the ranked chunks. Answer
/// generation needs running backend replicas and is exercised through the
/// server, not the CLI.
#[inline]
pub async fn run_query(config: Config, query: &str, top_k: Option<usize>) -> Result<()> {
    let retrieval_config = config.retrieval.clone();
    let core = build_core(config).await?;
    let engine = RetrievalEngine::new(
        Arc::clone(&core.embedder),
        Arc::clone(&core.index),
        retrieval_config,
    );

    let top_k = top_k.unwrap_or(core.config.retrieval.top_k);
    let result = engine.retrieve(query, top_k, None).await?;

    if result.chunks.is_empty() {
        println!("no matching chunks");
        return Ok(());
    }
    for (rank, chunk) in result.chunks.iter().enumerate() {
        println!(
            "{:>2}. [{:.4}] {} (doc {}, v{}){}",
            rank + 1,
            chunk.score,
            chunk.chunk_id,
            chunk.doc_id,
            chunk.doc_version,
            if chunk.low_confidence {
                " [low confidence]"
            } else {
                ""
            }
        );
        let preview: String = chunk.content.chars().take(160).collect();
        println!("    {}", preview.replace('\n', " "));
    }
    Ok(())
}

/// Start the HTTP serving layer.
#[inline]
pub async fn serve_http(config: Config) -> Result<()> {
    let core = build_core(config).await?;
    let config = core.config.clone();

    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::clone(&core.embedder),
        Arc::clone(&core.index),
        config.retrieval.clone(),
    ));
    let generation = Arc::new(HttpGenerationClient::new(&config.generation));
    let replicas = Arc::new(ReplicaRegistry::new(
        &config.generation.replicas,
        &config.serving,
        Arc::clone(&core.metrics),
    )?);

    info!(
        replicas = replicas.len(),
        bind = %config.serving.bind_addr,
        "starting serving layer"
    );

    let state = Arc::new(AppState::new(
        config,
        retrieval,
        generation,
        replicas,
        Arc::clone(&core.index),
        Arc::clone(&core.catalog),
        Arc::clone(&core.metrics),
    ));

    serve(state).await
}

/// Print catalog and index status.
#[inline]
pub async fn show_status(config: Config) -> Result<()> {
    let core = build_core(config).await?;

    let documents = core.catalog.list().await?;
    let persisted = core.index.persisted_chunks().await?;
    let visible = core.index.visible_chunks();

    println!("documents: {}", documents.len());
    for doc in &documents {
        println!(
            "  {} v{} [{}] {} ({})",
            doc.doc_id, doc.version, doc.status, doc.modality, doc.ingested_at
        );
    }
    println!("chunks: {visible} visible, {persisted} persisted");
    println!("compaction generation: {}", core.index.generation());
    Ok(())
}

fn modality_from_path(path: &Path) -> Result<Modality> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| RagError::UnsupportedModality(path.display().to_string()))?;
    Modality::from_extension(ext)
}

fn doc_id_from_path(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}
