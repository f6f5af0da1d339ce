use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::db::queries;
use crate::models::detection::DetectionResult;

/// Keyed storage of detection results.
///
/// `upsert` may be called any number of times for one job; the store keeps
/// exactly one result per `job_id`, the last one written.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn upsert(&self, result: &DetectionResult) -> Result<(), ResultStoreError>;

    /// `Ok(None)` means unknown or not yet processed.
    async fn get(&self, job_id: &str) -> Result<Option<DetectionResult>, ResultStoreError>;

    async fn health_check(&self) -> Result<(), ResultStoreError> {
        Ok(())
    }
}

/// PostgreSQL-backed result store.
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn upsert(&self, result: &DetectionResult) -> Result<(), ResultStoreError> {
        queries::upsert_result(&self.pool, result).await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<DetectionResult>, ResultStoreError> {
        Ok(queries::get_result(&self.pool, job_id).await?)
    }

    async fn health_check(&self) -> Result<(), ResultStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Process-local result store.
#[derive(Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<String, DetectionResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert(&self, result: &DetectionResult) -> Result<(), ResultStoreError> {
        self.results
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(result.job_id.clone(), result.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<DetectionResult>, ResultStoreError> {
        Ok(self
            .results
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(job_id)
            .cloned())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResultStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Result store unavailable: {0}")]
    Unavailable(String),
}
