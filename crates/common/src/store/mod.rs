//! Storage abstraction for documents, generated content and pipeline jobs
//!
//! Provides:
//! - The `PipelineStore` trait consumed by the pipeline and the read layer
//! - An in-memory implementation for tests and single-process runs
//! - The Postgres implementation lives in `db::Repository`

mod memory;

pub use memory::MemoryStore;

use crate::config::{AppConfig, StorageBackend};
use crate::db::{DbPool, Repository};
use crate::errors::{AppError, Result};
use crate::types::{
    Document, Fingerprint, GeneratedContent, JobScope, JobState, JobStatus, NewGeneratedContent,
    PipelineJob, StageUnit,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Durable state of the generation pipeline.
///
/// `insert_content` must be atomic at the fingerprint level: when two writers
/// race on one fingerprint exactly one row is stored and the loser receives
/// `AppError::DuplicateFingerprint`.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    // ------------------------------------------------------------------
    // Documents (written by ingestion, read-only to the pipeline)
    // ------------------------------------------------------------------

    async fn insert_document(&self, document: Document) -> Result<Document>;

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    /// Documents matching the scope, ordered by company, type, then period
    async fn documents_in_scope(&self, scope: &JobScope) -> Result<Vec<Document>>;

    // ------------------------------------------------------------------
    // Generated content
    // ------------------------------------------------------------------

    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<GeneratedContent>>;

    async fn insert_content(&self, content: NewGeneratedContent) -> Result<GeneratedContent>;

    async fn get_content(&self, id: Uuid) -> Result<Option<GeneratedContent>>;

    /// Content for a company, optionally narrowed to one document type, newest first
    async fn list_content_by_company(
        &self,
        company_ref: &str,
        document_type: Option<&str>,
    ) -> Result<Vec<GeneratedContent>>;

    /// Content that consumed the document directly
    async fn list_content_by_document(&self, document_id: Uuid) -> Result<Vec<GeneratedContent>>;

    async fn list_content(&self) -> Result<Vec<GeneratedContent>>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn create_job(&self, job: PipelineJob) -> Result<PipelineJob>;

    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>>;

    /// Jobs currently in `state`, oldest first
    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<PipelineJob>>;

    /// Compare-and-set state change; fails with `InvalidTransition` when the
    /// job is not in `from` or the edge is not part of the state machine
    async fn transition_job(
        &self,
        id: Uuid,
        from: JobState,
        to: JobState,
        detail: Option<String>,
    ) -> Result<PipelineJob>;

    async fn request_cancel(&self, id: Uuid) -> Result<PipelineJob>;

    /// Insert or replace stage units by id
    async fn save_units(&self, units: &[StageUnit]) -> Result<()>;

    async fn list_units(&self, job_id: Uuid) -> Result<Vec<StageUnit>>;

    async fn save_unit(&self, unit: &StageUnit) -> Result<()> {
        self.save_units(std::slice::from_ref(unit)).await
    }

    async fn job_status(&self, id: Uuid) -> Result<JobStatus> {
        let job = self
            .get_job(id)
            .await?
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })?;
        let units = self.list_units(id).await?;
        Ok(JobStatus::from_units(job, &units))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the backend selected by `storage.backend`, running migrations
/// first when configured
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn PipelineStore>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using the in-memory store; all state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let pool = DbPool::new(&config.database).await?;
            if config.database.run_migrations {
                pool.migrate().await?;
            }
            Ok(Arc::new(Repository::new(pool)))
        }
    }
}

/// Shared check used by backends before writing a transition
pub(crate) fn check_transition(job: &PipelineJob, from: JobState, to: JobState) -> Result<()> {
    if job.state != from || !from.can_transition_to(to) {
        return Err(AppError::InvalidTransition {
            job_id: job.id.to_string(),
            expected: from.to_string(),
            requested: format!("{} (current {})", to, job.state),
        });
    }
    Ok(())
}
