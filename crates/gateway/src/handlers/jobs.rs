//! Job creation, status and cancellation handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use filingforge_common::{
    errors::{AppError, Result},
    types::{DependencyPolicy, JobScope, JobStatus, PipelineJob, StageProgress, UnitFailure},
};

/// Request to run the pipeline over a scope
#[derive(Debug, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[validate(length(min = 1, max = 100))]
    pub companies: Vec<String>,

    /// Empty means every document type
    #[serde(default)]
    #[validate(length(max = 50))]
    pub document_types: Vec<String>,

    #[validate(range(min = 1900, max = 2200))]
    pub period_from: Option<i32>,

    #[validate(range(min = 1900, max = 2200))]
    pub period_to: Option<i32>,

    /// Produce one brief for all companies under this name
    #[validate(length(min = 1, max = 200))]
    pub group: Option<String>,

    /// Overrides the configured failed-dependency policy
    pub dependency_policy: Option<DependencyPolicy>,
}

impl CreateJobRequest {
    fn into_scope(self) -> (JobScope, Option<DependencyPolicy>) {
        (
            JobScope {
                companies: self.companies,
                document_types: self.document_types,
                period_from: self.period_from,
                period_to: self.period_to,
                group: self.group,
            },
            self.dependency_policy,
        )
    }
}

/// Response after creating or cancelling a job
#[derive(Serialize)]
pub struct JobAcceptedResponse {
    pub job_id: Uuid,
    pub state: String,
    pub cancel_requested: bool,
    pub poll_url: String,
}

impl From<&PipelineJob> for JobAcceptedResponse {
    fn from(job: &PipelineJob) -> Self {
        Self {
            job_id: job.id,
            state: job.state.to_string(),
            cancel_requested: job.cancel_requested,
            poll_url: format!("/v1/jobs/{}", job.id),
        }
    }
}

/// Job status response
#[derive(Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub state: String,
    pub scope: JobScope,
    pub dependency_policy: DependencyPolicy,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub stages: Vec<StageProgress>,
    pub failures: Vec<UnitFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub created_at: String,
}

impl From<JobStatus> for JobResponse {
    fn from(status: JobStatus) -> Self {
        let job = status.job;
        Self {
            job_id: job.id,
            state: job.state.to_string(),
            scope: job.scope,
            dependency_policy: job.policy,
            cancel_requested: job.cancel_requested,
            error_detail: job.error_detail,
            stages: status.stages,
            failures: status.failures,
            started_at: job.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: job.completed_at.map(|dt| dt.to_rfc3339()),
            created_at: job.created_at.to_rfc3339(),
        }
    }
}

/// Create a job and start it in the background
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobAcceptedResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let (scope, policy) = request.into_scope();
    let job = state.orchestrator.create_job(scope, policy).await?;

    let orchestrator = state.orchestrator.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        if let Err(e) = orchestrator.run_job(job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "Job run failed");
        }
    });

    tracing::info!(job_id = %job.id, scope = %job.scope, "Job accepted");

    Ok((StatusCode::ACCEPTED, Json(JobAcceptedResponse::from(&job))))
}

/// Get job status with per-stage progress
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>> {
    let status = state.orchestrator.status(job_id).await?;
    Ok(Json(status.into()))
}

/// Request cancellation of a job
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobAcceptedResponse>)> {
    let job = state.orchestrator.cancel_job(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAcceptedResponse::from(&job))))
}
