//! Generated content read handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use filingforge_common::{
    errors::{AppError, Result},
    types::{GeneratedContent, InputRef, Stage, TokenUsage},
};
use filingforge_pipeline::ProvenanceGraph;

/// Filters for company content listings
#[derive(Debug, Deserialize, Validate)]
pub struct CompanyContentQuery {
    #[validate(length(min = 1, max = 100))]
    pub document_type: Option<String>,

    /// `document_summary`, `period_aggregate` or `brief`
    pub stage: Option<String>,
}

/// A generated content row as served to readers
#[derive(Serialize)]
pub struct ContentResponse {
    pub id: Uuid,
    pub fingerprint: String,
    pub stage: String,
    pub company_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    pub period_refs: Vec<String>,
    pub inputs: Vec<InputRef>,
    pub model_config_id: String,
    pub system_prompt_id: String,
    pub user_prompt_id: String,
    pub summary: String,
    pub text: String,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_state: Option<String>,
    pub created_at: String,
}

impl From<GeneratedContent> for ContentResponse {
    fn from(content: GeneratedContent) -> Self {
        Self {
            id: content.id,
            fingerprint: content.fingerprint.to_string(),
            stage: content.stage.to_string(),
            company_ref: content.company_ref,
            document_type: content.document_type,
            period_refs: content.period_refs,
            inputs: content.inputs,
            model_config_id: content.model_config_id,
            system_prompt_id: content.system_prompt_id,
            user_prompt_id: content.user_prompt_id,
            summary: content.summary,
            text: content.text,
            usage: content.usage,
            warning: content.warning,
            error_state: content.error_state,
            created_at: content.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct ContentListResponse {
    pub count: usize,
    pub items: Vec<ContentResponse>,
}

impl ContentListResponse {
    fn from_rows(rows: Vec<GeneratedContent>) -> Self {
        let items: Vec<ContentResponse> = rows.into_iter().map(Into::into).collect();
        Self {
            count: items.len(),
            items,
        }
    }
}

/// Get one generated content row
pub async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContentResponse>> {
    let content = state
        .store
        .get_content(id)
        .await?
        .ok_or_else(|| AppError::ContentNotFound { id: id.to_string() })?;

    Ok(Json(content.into()))
}

/// List content for a company, newest first
pub async fn list_company_content(
    State(state): State<AppState>,
    Path(company): Path<String>,
    Query(query): Query<CompanyContentQuery>,
) -> Result<Json<ContentListResponse>> {
    query.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;
    let stage: Option<Stage> = query.stage.as_deref().map(str::parse::<Stage>).transpose()?;

    let mut rows = state
        .store
        .list_content_by_company(&company, query.document_type.as_deref())
        .await?;
    if let Some(stage) = stage {
        rows.retain(|c| c.stage.stage == stage);
    }

    tracing::debug!(company = %company, count = rows.len(), "Listed company content");
    Ok(Json(ContentListResponse::from_rows(rows)))
}

/// List content generated directly from one document
pub async fn list_document_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContentListResponse>> {
    if state.store.get_document(id).await?.is_none() {
        return Err(AppError::DocumentNotFound { id: id.to_string() });
    }

    let rows = state.store.list_content_by_document(id).await?;
    Ok(Json(ContentListResponse::from_rows(rows)))
}

#[derive(Serialize)]
pub struct ProvenanceNode {
    pub id: Uuid,
    /// `document` or the content's stage identifier
    pub kind: String,
    pub company_ref: String,
    pub period_refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
}

#[derive(Serialize)]
pub struct ProvenanceEdgeResponse {
    pub consumer: Uuid,
    pub input: Uuid,
}

#[derive(Serialize)]
pub struct ProvenanceResponse {
    pub root: Uuid,
    /// Inputs first, root last
    pub nodes: Vec<ProvenanceNode>,
    pub edges: Vec<ProvenanceEdgeResponse>,
}

/// Lineage of one content row down to its source documents
pub async fn get_provenance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProvenanceResponse>> {
    let graph = ProvenanceGraph::load(state.store.as_ref(), id).await?;
    let order = graph.topological_order()?;

    let mut nodes = Vec::with_capacity(order.len());
    for node_id in order {
        if let Some(doc) = graph.documents().find(|d| d.id == node_id) {
            nodes.push(ProvenanceNode {
                id: doc.id,
                kind: "document".to_string(),
                company_ref: doc.company_ref.clone(),
                period_refs: vec![doc.period_ref.clone()],
                document_type: Some(doc.document_type.clone()),
            });
        } else if let Some(content) = graph.contents().find(|c| c.id == node_id) {
            nodes.push(ProvenanceNode {
                id: content.id,
                kind: content.stage.to_string(),
                company_ref: content.company_ref.clone(),
                period_refs: content.period_refs.clone(),
                document_type: content.document_type.clone(),
            });
        }
    }

    let edges = graph
        .edges()
        .iter()
        .map(|e| ProvenanceEdgeResponse {
            consumer: e.consumer,
            input: e.input.id(),
        })
        .collect();

    Ok(Json(ProvenanceResponse {
        root: graph.root,
        nodes,
        edges,
    }))
}
