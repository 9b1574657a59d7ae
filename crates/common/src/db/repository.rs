//! Repository pattern for database operations
//!
//! Postgres implementation of `PipelineStore`. Fingerprint uniqueness is
//! enforced by the unique index on `generated_contents.fingerprint`; inserts
//! use `ON CONFLICT DO NOTHING` so a lost race surfaces as
//! `AppError::DuplicateFingerprint` instead of a raw database error.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::store::PipelineStore;
use crate::types::{
    Document, Fingerprint, GeneratedContent, InputRef, JobScope, JobState, NewGeneratedContent,
    PipelineJob, StageUnit,
};
use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    SqlErr,
};
use tracing::debug;
use uuid::Uuid;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    fn is_unique_violation(err: &DbErr) -> bool {
        matches!(err, DbErr::RecordNotInserted)
            || matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
    }

    fn convert_contents(rows: Vec<GeneratedContentRow>) -> Result<Vec<GeneratedContent>> {
        rows.into_iter().map(GeneratedContent::try_from).collect()
    }

    async fn load_job(&self, id: Uuid) -> Result<PipelineJob> {
        PipelineJobEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })?
            .try_into()
    }
}

#[async_trait]
impl PipelineStore for Repository {
    // ========================================================================
    // Health Check
    // ========================================================================

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Document Operations
    // ========================================================================

    async fn insert_document(&self, document: Document) -> Result<Document> {
        let model: DocumentActiveModel = document.clone().into();
        match DocumentEntity::insert(model).exec(self.write_conn()).await {
            Ok(_) => Ok(document),
            Err(e) if Self::is_unique_violation(&e) => Err(AppError::Duplicate {
                message: format!("document {} already exists", document.id),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(DocumentEntity::find_by_id(id)
            .one(self.read_conn())
            .await?
            .map(Document::from))
    }

    async fn documents_in_scope(&self, scope: &JobScope) -> Result<Vec<Document>> {
        let companies = scope.companies.iter().fold(Condition::any(), |cond, company| {
            cond.add(Expr::cust_with_values(
                "upper(company_ref) = upper($1)",
                [company.clone()],
            ))
        });

        let mut query = DocumentEntity::find().filter(companies);
        if !scope.document_types.is_empty() {
            query = query.filter(DocumentColumn::DocumentType.is_in(scope.document_types.clone()));
        }

        let rows = query
            .order_by_asc(DocumentColumn::CompanyRef)
            .order_by_asc(DocumentColumn::DocumentType)
            .order_by_asc(DocumentColumn::PeriodRef)
            .order_by_asc(DocumentColumn::Id)
            .all(self.read_conn())
            .await?;

        // Period bounds need the parsed fiscal year
        Ok(rows
            .into_iter()
            .map(Document::from)
            .filter(|d| scope.matches(d))
            .collect())
    }

    // ========================================================================
    // Generated Content Operations
    // ========================================================================

    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<GeneratedContent>> {
        GeneratedContentEntity::find()
            .filter(GeneratedContentColumn::Fingerprint.eq(fingerprint.as_str()))
            .one(self.write_conn())
            .await?
            .map(GeneratedContent::try_from)
            .transpose()
    }

    async fn insert_content(&self, content: NewGeneratedContent) -> Result<GeneratedContent> {
        let id = Uuid::now_v7();
        let now = chrono::Utc::now();
        let model = GeneratedContentActiveModel::from_new(id, now, &content)?;

        let result = GeneratedContentEntity::insert(model)
            .on_conflict(
                OnConflict::column(GeneratedContentColumn::Fingerprint)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(self.write_conn())
            .await;

        match result {
            Ok(_) => Ok(content.into_content(id, now)),
            Err(e) if Self::is_unique_violation(&e) => {
                debug!(fingerprint = %content.fingerprint.short(), "Fingerprint already stored");
                Err(AppError::DuplicateFingerprint {
                    fingerprint: content.fingerprint.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_content(&self, id: Uuid) -> Result<Option<GeneratedContent>> {
        GeneratedContentEntity::find_by_id(id)
            .one(self.read_conn())
            .await?
            .map(GeneratedContent::try_from)
            .transpose()
    }

    async fn list_content_by_company(
        &self,
        company_ref: &str,
        document_type: Option<&str>,
    ) -> Result<Vec<GeneratedContent>> {
        let mut query = GeneratedContentEntity::find().filter(Expr::cust_with_values(
            "upper(company_ref) = upper($1)",
            [company_ref.to_string()],
        ));
        if let Some(doc_type) = document_type {
            query = query.filter(GeneratedContentColumn::DocumentType.eq(doc_type));
        }

        let rows = query
            .order_by_desc(GeneratedContentColumn::CreatedAt)
            .order_by_desc(GeneratedContentColumn::Id)
            .all(self.read_conn())
            .await?;
        Self::convert_contents(rows)
    }

    async fn list_content_by_document(&self, document_id: Uuid) -> Result<Vec<GeneratedContent>> {
        let needle = serde_json::json!([InputRef::Document(document_id).to_string()]);
        let rows = GeneratedContentEntity::find()
            .filter(Expr::cust_with_values("inputs @> $1::jsonb", [needle]))
            .order_by_desc(GeneratedContentColumn::CreatedAt)
            .all(self.read_conn())
            .await?;
        Self::convert_contents(rows)
    }

    async fn list_content(&self) -> Result<Vec<GeneratedContent>> {
        let rows = GeneratedContentEntity::find()
            .order_by_desc(GeneratedContentColumn::CreatedAt)
            .all(self.read_conn())
            .await?;
        Self::convert_contents(rows)
    }

    // ========================================================================
    // Job Operations
    // ========================================================================

    async fn create_job(&self, job: PipelineJob) -> Result<PipelineJob> {
        let model = PipelineJobActiveModel::from_job(&job)?;
        PipelineJobEntity::insert(model).exec(self.write_conn()).await?;
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>> {
        PipelineJobEntity::find_by_id(id)
            .one(self.read_conn())
            .await?
            .map(PipelineJob::try_from)
            .transpose()
    }

    async fn jobs_in_state(&self, state: JobState) -> Result<Vec<PipelineJob>> {
        PipelineJobEntity::find()
            .filter(PipelineJobColumn::State.eq(state.to_string()))
            .order_by_asc(PipelineJobColumn::CreatedAt)
            .order_by_asc(PipelineJobColumn::Id)
            .all(self.read_conn())
            .await?
            .into_iter()
            .map(PipelineJob::try_from)
            .collect()
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: JobState,
        to: JobState,
        detail: Option<String>,
    ) -> Result<PipelineJob> {
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                job_id: id.to_string(),
                expected: from.to_string(),
                requested: to.to_string(),
            });
        }

        let mut update = PipelineJobEntity::update_many()
            .col_expr(PipelineJobColumn::State, Expr::value(to.to_string()));
        if to == JobState::Running {
            update = update.col_expr(
                PipelineJobColumn::StartedAt,
                Expr::cust("COALESCE(started_at, NOW())"),
            );
        }
        if to.is_terminal() {
            update = update.col_expr(PipelineJobColumn::CompletedAt, Expr::cust("NOW()"));
        }
        if let Some(detail) = detail {
            update = update.col_expr(PipelineJobColumn::ErrorDetail, Expr::value(detail));
        }

        // Compare-and-set on the current state
        let result = update
            .filter(PipelineJobColumn::Id.eq(id))
            .filter(PipelineJobColumn::State.eq(from.to_string()))
            .exec(self.write_conn())
            .await?;

        let job = self.load_job(id).await?;
        if result.rows_affected == 0 {
            return Err(AppError::InvalidTransition {
                job_id: id.to_string(),
                expected: from.to_string(),
                requested: format!("{} (current {})", to, job.state),
            });
        }
        Ok(job)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<PipelineJob> {
        PipelineJobEntity::update_many()
            .col_expr(PipelineJobColumn::CancelRequested, Expr::value(true))
            .filter(PipelineJobColumn::Id.eq(id))
            .filter(PipelineJobColumn::State.is_in([
                JobState::Pending.to_string(),
                JobState::Running.to_string(),
            ]))
            .exec(self.write_conn())
            .await?;

        self.load_job(id).await
    }

    async fn save_units(&self, units: &[StageUnit]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }

        let models = units
            .iter()
            .map(StageUnitActiveModel::from_unit)
            .collect::<Result<Vec<_>>>()?;

        StageUnitEntity::insert_many(models)
            .on_conflict(
                OnConflict::column(StageUnitColumn::Id)
                    .update_columns([
                        StageUnitColumn::Inputs,
                        StageUnitColumn::State,
                        StageUnitColumn::Fingerprint,
                        StageUnitColumn::ContentId,
                        StageUnitColumn::Cached,
                        StageUnitColumn::Attempts,
                        StageUnitColumn::SpentInputTokens,
                        StageUnitColumn::SpentOutputTokens,
                        StageUnitColumn::Warning,
                        StageUnitColumn::ErrorKind,
                        StageUnitColumn::ErrorMessage,
                        StageUnitColumn::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.write_conn())
            .await?;

        Ok(())
    }

    async fn list_units(&self, job_id: Uuid) -> Result<Vec<StageUnit>> {
        let rows = StageUnitEntity::find()
            .filter(StageUnitColumn::JobId.eq(job_id))
            .order_by_asc(StageUnitColumn::CreatedAt)
            .order_by_asc(StageUnitColumn::Id)
            .all(self.read_conn())
            .await?;

        let mut units = rows
            .into_iter()
            .map(StageUnit::try_from)
            .collect::<Result<Vec<_>>>()?;
        units.sort_by_key(|u| (u.stage.stage, u.created_at, u.id));
        Ok(units)
    }
}
