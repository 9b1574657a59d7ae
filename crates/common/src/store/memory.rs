//! In-memory `PipelineStore`
//!
//! Every operation takes one lock on the whole state, which makes the
//! fingerprint check-and-insert atomic.

use super::{check_transition, PipelineStore};
use crate::errors::{AppError, Result};
use crate::types::{
    Document, Fingerprint, GeneratedContent, InputRef, JobScope, JobState, NewGeneratedContent,
    PipelineJob, StageUnit,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    documents: HashMap<Uuid, Document>,
    contents: HashMap<Uuid, GeneratedContent>,
    by_fingerprint: HashMap<Fingerprint, Uuid>,
    jobs: HashMap<Uuid, PipelineJob>,
    units: HashMap<Uuid, BTreeMap<Uuid, StageUnit>>,
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored generated-content rows
    pub async fn content_count(&self) -> usize {
        self.inner.read().await.contents.len()
    }
}

fn sort_newest_first(rows: &mut [GeneratedContent]) {
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_document(&self, document: Document) -> Result<Document> {
        let mut inner = self.inner.write().await;
        if inner.documents.contains_key(&document.id) {
            return Err(AppError::Duplicate {
                message: format!("document {} already exists", document.id),
            });
        }
        inner.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.inner.read().await.documents.get(&id).cloned())
    }

    async fn documents_in_scope(&self, scope: &JobScope) -> Result<Vec<Document>> {
        let inner = self.inner.read().await;
        let mut docs: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| scope.matches(d))
            .cloned()
            .collect();
        docs.sort_by(|a, b| {
            (&a.company_ref, &a.document_type, &a.period_ref, a.id)
                .cmp(&(&b.company_ref, &b.document_type, &b.period_ref, b.id))
        });
        Ok(docs)
    }

    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<GeneratedContent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| inner.contents.get(id))
            .cloned())
    }

    async fn insert_content(&self, content: NewGeneratedContent) -> Result<GeneratedContent> {
        let mut inner = self.inner.write().await;

        if inner.by_fingerprint.contains_key(&content.fingerprint) {
            debug!(fingerprint = %content.fingerprint.short(), "Fingerprint already stored");
            return Err(AppError::DuplicateFingerprint {
                fingerprint: content.fingerprint.to_string(),
            });
        }

        // Inputs must already exist, so provenance edges always point backwards
        for input in &content.inputs {
            let known = match input {
                InputRef::Document(id) => inner.documents.contains_key(id),
                InputRef::Content(id) => inner.contents.contains_key(id),
            };
            if !known {
                return Err(AppError::Validation {
                    message: format!("unknown input {}", input),
                    field: Some("inputs".into()),
                });
            }
        }

        let row = content.into_content(Uuid::now_v7(), Utc::now());
        inner.by_fingerprint.insert(row.fingerprint.clone(), row.id);
        inner.contents.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<GeneratedContent>> {
        Ok(self.inner.read().await.contents.get(&id).cloned())
    }

    async fn list_content_by_company(
        &self,
        company_ref: &str,
        document_type: Option<&str>,
    ) -> Result<Vec<GeneratedContent>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<GeneratedContent> = inner
            .contents
            .values()
            .filter(|c| c.company_ref.eq_ignore_ascii_case(company_ref))
            .filter(|c| document_type.map_or(true, |t| c.document_type.as_deref() == Some(t)))
            .cloned()
            .collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    async fn list_content_by_document(&self, document_id: Uuid) -> Result<Vec<GeneratedContent>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<GeneratedContent> = inner
            .contents
            .values()
            .filter(|c| c.inputs.contains(&InputRef::Document(document_id)))
            .cloned()
            .collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    async fn list_content(&self) -> Result<Vec<GeneratedContent>> {
        let mut rows: Vec<GeneratedContent> =
            self.inner.read().await.contents.values().cloned().collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    async fn create_job(&self, job: PipelineJob) -> Result<PipelineJob> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(AppError::Duplicate {
                message: format!("job {} already exists", job.id),
            });
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<PipelineJob>> {
        let mut jobs: Vec<PipelineJob> = self
            .inner
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: JobState,
        to: JobState,
        detail: Option<String>,
    ) -> Result<PipelineJob> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })?;
        check_transition(job, from, to)?;
        job.stamp_transition(to, detail);
        Ok(job.clone())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<PipelineJob> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })?;
        if !job.state.is_terminal() {
            job.cancel_requested = true;
        }
        Ok(job.clone())
    }

    async fn save_units(&self, units: &[StageUnit]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for unit in units {
            if !inner.jobs.contains_key(&unit.job_id) {
                return Err(AppError::JobNotFound {
                    id: unit.job_id.to_string(),
                });
            }
            inner
                .units
                .entry(unit.job_id)
                .or_default()
                .insert(unit.id, unit.clone());
        }
        Ok(())
    }

    async fn list_units(&self, job_id: Uuid) -> Result<Vec<StageUnit>> {
        let inner = self.inner.read().await;
        let mut units: Vec<StageUnit> = inner
            .units
            .get(&job_id)
            .map(|u| u.values().cloned().collect())
            .unwrap_or_default();
        units.sort_by_key(|u| (u.stage.stage, u.created_at, u.id));
        Ok(units)
    }
}
