// Document catalog
// SQLite-backed registry of document versions. Owns the version lifecycle:
// a re-ingested doc_id gets a new version and the prior active version is
// retired; retirement is idempotent. The catalog never stores content,
// only identity and status.


use chrono::{NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::normalize::Modality;
use crate::{RagError, Result};

/// Lifecycle status of one document version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    Active,
    Retired,
    Failed,
}

impl DocStatus {
    fn as_str(self) -> &'static str {
        match self {
            DocStatus::Active => "active",
            DocStatus::Retired => "retired",
            DocStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(DocStatus::Active),
            "retired" => Ok(DocStatus::Retired),
            "failed" => Ok(DocStatus::Failed),
            other => Err(RagError::Database(format!(
                "Unknown document status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    pub doc_id: String,
    pub version: i64,
    pub modality: String,
    pub status: String,
    pub ingested_at: NaiveDateTime,
}

impl DocumentRow {
    #[inline]
    pub fn status(&self) -> Result<DocStatus> {
        DocStatus::parse(&self.status)
    }
}

/// Outcome of registering a new document version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredVersion {
    pub version: u32,
    /// Prior active versions superseded by this registration. Their index
    /// entries must be tombstoned by the caller.
    pub superseded: Vec<u32>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    doc_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    modality TEXT NOT NULL,
    status TEXT NOT NULL,
    ingested_at TEXT NOT NULL,
    PRIMARY KEY (doc_id, version)
)";

const STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents (doc_id, status)";

pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (creating if needed) the catalog database at `path`.
    #[inline]
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| RagError::Database(format!("Failed to open catalog: {e}")))?;

        let catalog = Self { pool };
        catalog.init_schema().await?;
        info!("Document catalog opened at {}", path.display());
        Ok(catalog)
    }

    /// In-memory catalog. A single connection keeps every query on the same
    /// database.
    #[inline]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RagError::Database(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| RagError::Database(format!("Failed to open catalog: {e}")))?;

        let catalog = Self { pool };
        catalog.init_schema().await?;
        Ok(catalog)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| RagError::Database(format!("Failed to create schema: {e}")))?;
        sqlx::query(STATUS_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| RagError::Database(format!("Failed to create index: {e}")))?;
        Ok(())
    }

    /// Allocate the next version for `doc_id`, retiring any prior active
    /// versions. Returns the new version and the versions it superseded.
    #[inline]
    pub async fn register_version(
        &self,
        doc_id: &str,
        modality: Modality,
    ) -> Result<RegisteredVersion> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        let superseded: Vec<u32> =
            sqlx::query("SELECT version FROM documents WHERE doc_id = ? AND status = 'active'")
                .bind(doc_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| RagError::Database(e.to_string()))?
                .iter()
                .map(|row| row.get::<i64, _>("version") as u32)
                .collect();

        let max_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM documents WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| RagError::Database(e.to_string()))?;
        let version = (max_version.unwrap_or(0) + 1) as u32;

        sqlx::query("UPDATE documents SET status = 'retired' WHERE doc_id = ? AND status = 'active'")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO documents (doc_id, version, modality, status, ingested_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(doc_id)
        .bind(version as i64)
        .bind(modality.to_string())
        .bind(DocStatus::Active.as_str())
        .bind(Utc::now().naive_utc())
        .execute(&mut *tx)
        .await
        .map_err(|e| RagError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        debug!(doc_id, version, ?superseded, "registered document version");
        Ok(RegisteredVersion {
            version,
            superseded,
        })
    }

    /// Mark one version failed after an aborted ingestion.
    #[inline]
    pub async fn mark_failed(&self, doc_id: &str, version: u32) -> Result<()> {
        sqlx::query("UPDATE documents SET status = 'failed' WHERE doc_id = ? AND version = ?")
            .bind(doc_id)
            .bind(version as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;
        Ok(())
    }

    /// Retire every live version of `doc_id`. Idempotent: retiring an
    /// already-retired or unknown document changes nothing and is not an
    /// error. Returns the versions that transitioned to retired.
    #[inline]
    pub async fn retire_all(&self, doc_id: &str) -> Result<Vec<u32>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        let retiring: Vec<u32> =
            sqlx::query("SELECT version FROM documents WHERE doc_id = ? AND status = 'active'")
                .bind(doc_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| RagError::Database(e.to_string()))?
                .iter()
                .map(|row| row.get::<i64, _>("version") as u32)
                .collect();

        sqlx::query("UPDATE documents SET status = 'retired' WHERE doc_id = ? AND status = 'active'")
            .bind(doc_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RagError::Database(e.to_string()))?;

        if !retiring.is_empty() {
            debug!(doc_id, ?retiring, "retired document versions");
        }
        Ok(retiring)
    }

    /// Current active version of `doc_id`, if any.
    #[inline]
    pub async fn current_version(&self, doc_id: &str) -> Result<Option<u32>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM documents WHERE doc_id = ? AND status = 'active'",
        )
        .bind(doc_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RagError::Database(e.to_string()))?;
        Ok(version.map(|v| v as u32))
    }

    /// All catalog rows, newest first.
    #[inline]
    pub async fn list(&self) -> Result<Vec<DocumentRow>> {
        sqlx::query_as::<_, DocumentRow>(
            "SELECT doc_id, version, modality, status, ingested_at
             FROM documents ORDER BY ingested_at DESC, doc_id, version DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RagError::Database(e.to_string()))
    }

    /// Count of active document versions.
    #[inline]
    pub async fn count_active(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = 'active'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| RagError::Database(e.to_string()))?;
        Ok(count as u64)
    }
}
