
use arrow::array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ChunkMeta, ChunkRecord};
use crate::{RagError, Result};

const TABLE_NAME: &str = "chunks";

/// Dense-vector side of the index, persisted in LanceDB.
///
/// One row per chunk: the embedding vector plus the metadata needed to
/// assemble retrieval hits without a second lookup.
pub struct VectorStore {
    connection: Connection,
    dimension: usize,
}

/// One dense search hit: chunk metadata plus cosine similarity.
#[derive(Debug, Clone)]
pub struct DenseHit {
    pub meta: ChunkMeta,
    pub similarity: f32,
}

impl VectorStore {
    /// Open (creating if needed) the vector store at `path` for vectors of
    /// the given dimension.
    #[inline]
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let uri = format!("file://{}", path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to connect: {e}")))?;

        let store = Self {
            connection,
            dimension,
        };
        store.ensure_table().await?;
        info!("Vector store opened at {}", path.display());
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to list tables: {e}")))?;
        if names.contains(&TABLE_NAME.to_string()) {
            return Ok(());
        }

        self.connection
            .create_empty_table(TABLE_NAME, self.schema())
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to create table: {e}")))?;
        debug!("created chunk table with dimension {}", self.dimension);
        Ok(())
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.dimension as i32,
                ),
                false,
            ),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("doc_version", DataType::UInt32, false),
            Field::new("seq", DataType::UInt32, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("page", DataType::UInt32, true),
            Field::new("ocr_confidence", DataType::Float32, true),
            Field::new("low_confidence", DataType::Boolean, false),
        ]))
    }

    async fn open_table(&self) -> Result<lancedb::Table> {
        self.connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to open table: {e}")))
    }

    /// Append a batch of chunk records. Records are written in slice order.
    #[inline]
    pub async fn add_chunks(&self, records: &[ChunkRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        for record in records {
            if record.vector.len() != self.dimension {
                return Err(RagError::IndexUnavailable(format!(
                    "Vector dimension mismatch for {}: expected {}, got {}",
                    record.meta.chunk_id,
                    self.dimension,
                    record.vector.len()
                )));
            }
        }

        let batch = self.record_batch(records)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);

        let table = self.open_table().await?;
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to insert chunks: {e}")))?;

        debug!("stored {} chunk vectors", records.len());
        Ok(())
    }

    fn record_batch(&self, records: &[ChunkRecord]) -> Result<RecordBatch> {
        let len = records.len();

        let mut chunk_ids = Vec::with_capacity(len);
        let mut doc_ids = Vec::with_capacity(len);
        let mut doc_versions = Vec::with_capacity(len);
        let mut seqs = Vec::with_capacity(len);
        let mut contents = Vec::with_capacity(len);
        let mut pages = Vec::with_capacity(len);
        let mut confidences = Vec::with_capacity(len);
        let mut low_confidences = Vec::with_capacity(len);
        let mut flat_values = Vec::with_capacity(len * self.dimension);

        for record in records {
            chunk_ids.push(record.meta.chunk_id.as_str());
            doc_ids.push(record.meta.doc_id.as_str());
            doc_versions.push(record.meta.doc_version);
            seqs.push(record.meta.seq);
            contents.push(record.meta.content.as_str());
            pages.push(record.meta.page);
            confidences.push(record.meta.ocr_confidence);
            low_confidences.push(record.meta.low_confidence);
            flat_values.extend_from_slice(&record.vector);
        }

        let values = Float32Array::from(flat_values);
        let item_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vectors =
            FixedSizeListArray::try_new(item_field, self.dimension as i32, Arc::new(values), None)
                .map_err(|e| {
                    RagError::IndexUnavailable(format!("Failed to build vector array: {e}"))
                })?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(chunk_ids)),
            Arc::new(vectors),
            Arc::new(StringArray::from(doc_ids)),
            Arc::new(UInt32Array::from(doc_versions)),
            Arc::new(UInt32Array::from(seqs)),
            Arc::new(StringArray::from(contents)),
            Arc::new(UInt32Array::from(pages)),
            Arc::new(Float32Array::from(confidences)),
            Arc::new(BooleanArray::from(low_confidences)),
        ];

        RecordBatch::try_new(self.schema(), arrays)
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to build record batch: {e}")))
    }

    /// Nearest-neighbor search by cosine similarity.
    #[inline]
    pub async fn search(
        &self,
        query_vector: &[f32],
        limit: usize,
        doc_filter: Option<&str>,
    ) -> Result<Vec<DenseHit>> {
        let table = self.open_table().await?;

        let mut query = table
            .vector_search(query_vector)
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to build search: {e}")))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(limit);

        if let Some(doc_id) = doc_filter {
            query = query.only_if(format!("doc_id = '{}'", escape_predicate(doc_id)));
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Search failed: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to read results: {e}")))?;

        let mut hits = Vec::new();
        for batch in &batches {
            hits.extend(parse_hits(batch)?);
        }
        debug!("dense search returned {} hits", hits.len());
        Ok(hits)
    }

    /// Delete every chunk of one document version.
    #[inline]
    pub async fn delete_doc_version(&self, doc_id: &str, version: u32) -> Result<()> {
        let table = self.open_table().await?;
        let predicate = format!(
            "doc_id = '{}' AND doc_version = {}",
            escape_predicate(doc_id),
            version
        );
        table
            .delete(&predicate)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to delete chunks: {e}")))?;
        Ok(())
    }

    /// Every row's metadata, for rebuilding the in-memory structures on
    /// startup. Vectors are not materialized.
    #[inline]
    pub async fn scan_metadata(&self) -> Result<Vec<ChunkMeta>> {
        let table = self.open_table().await?;

        let stream = table
            .query()
            .limit(usize::MAX >> 1)
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Scan failed: {e}")))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to read scan: {e}")))?;

        let mut metas = Vec::new();
        for batch in &batches {
            for hit in parse_hits(batch)? {
                metas.push(hit.meta);
            }
        }
        Ok(metas)
    }

    /// Total stored chunk count.
    #[inline]
    pub async fn count(&self) -> Result<u64> {
        let table = self.open_table().await?;
        let count = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to count rows: {e}")))?;
        Ok(count as u64)
    }

    /// Compact fragments and prune deleted rows.
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        let table = self.open_table().await?;
        table
            .optimize(lancedb::table::OptimizeAction::All)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to optimize: {e}")))?;
        debug!("vector store optimized");
        Ok(())
    }
}

fn escape_predicate(value: &str) -> String {
    value.replace('\'', "''")
}

fn parse_hits(batch: &RecordBatch) -> Result<Vec<DenseHit>> {
    let column_error = |name: &str| RagError::IndexUnavailable(format!("Missing column: {name}"));
    let type_error = |name: &str| RagError::IndexUnavailable(format!("Bad column type: {name}"));

    let chunk_ids = batch
        .column_by_name("chunk_id")
        .ok_or_else(|| column_error("chunk_id"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| type_error("chunk_id"))?;
    let doc_ids = batch
        .column_by_name("doc_id")
        .ok_or_else(|| column_error("doc_id"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| type_error("doc_id"))?;
    let doc_versions = batch
        .column_by_name("doc_version")
        .ok_or_else(|| column_error("doc_version"))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| type_error("doc_version"))?;
    let seqs = batch
        .column_by_name("seq")
        .ok_or_else(|| column_error("seq"))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| type_error("seq"))?;
    let contents = batch
        .column_by_name("content")
        .ok_or_else(|| column_error("content"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| type_error("content"))?;
    let pages = batch
        .column_by_name("page")
        .ok_or_else(|| column_error("page"))?
        .as_any()
        .downcast_ref::<UInt32Array>()
        .ok_or_else(|| type_error("page"))?;
    let confidences = batch
        .column_by_name("ocr_confidence")
        .ok_or_else(|| column_error("ocr_confidence"))?
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| type_error("ocr_confidence"))?;
    let low_confidences = batch
        .column_by_name("low_confidence")
        .ok_or_else(|| column_error("low_confidence"))?
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| type_error("low_confidence"))?;

    // Cosine distance column is present on vector searches, absent on
    // plain scans.
    let distances = batch
        .column_by_name("_distance")
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    let mut hits = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let distance = distances.map_or(0.0, |d| if d.is_null(row) { 0.0 } else { d.value(row) });

        hits.push(DenseHit {
            meta: ChunkMeta {
                chunk_id: chunk_ids.value(row).to_string(),
                doc_id: doc_ids.value(row).to_string(),
                doc_version: doc_versions.value(row),
                seq: seqs.value(row),
                content: contents.value(row).to_string(),
                page: if pages.is_null(row) {
                    None
                } else {
                    Some(pages.value(row))
                },
                ocr_confidence: if confidences.is_null(row) {
                    None
                } else {
                    Some(confidences.value(row))
                },
                low_confidence: low_confidences.value(row),
            },
            similarity: 1.0 - distance,
        });
    }

    Ok(hits)
}
