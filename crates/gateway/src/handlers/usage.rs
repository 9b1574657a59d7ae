//! Token usage handlers

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::AppState;
use filingforge_common::errors::Result;
use filingforge_pipeline::UsageReport;

/// Usage charged to one job
pub async fn job_usage(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<UsageReport>> {
    let report = UsageReport::for_job(state.store.as_ref(), job_id).await?;
    Ok(Json(report))
}

/// Usage across every stored row
pub async fn total_usage(State(state): State<AppState>) -> Result<Json<UsageReport>> {
    let report = UsageReport::by_stage(state.store.as_ref()).await?;
    Ok(Json(report))
}
