//! Sales Pipeline Handlers
//!
//! Create pipeline records, move leads between stages and read history and
//! funnel metrics.

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use chrono::NaiveDate;
use funnel_shared::{HistoryEntry, PipelineMetrics, PipelineRecord, Stage};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::pipeline::{RegistryConfig, StageMove, Transition};
use crate::{AppState, ApiResult};

// ==================== Requests ====================

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CreatePipelineRequest {
    #[validate(length(min = 1, max = 200))]
    pub assigned_owner: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MoveStageRequest {
    pub to_stage: Stage,
    #[validate(length(min = 1, max = 200, message = "actor is required"))]
    pub actor: String,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(min = 1, max = 500))]
    pub loss_reason: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub approved_by: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdatePipelineRequest {
    #[validate(length(min = 1, max = 200))]
    pub assigned_owner: Option<String>,
    pub expected_close_date: Option<NaiveDate>,
}

// ==================== Routes ====================

pub fn pipeline_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/registry", get(get_registry))
        .route("/:lead_id", get(get_record).post(create_record).patch(update_record))
        .route("/:lead_id/move", post(move_stage))
        .route("/:lead_id/history", get(get_history))
        .route("/:lead_id/next-stages", get(get_next_stages))
        .route("/:lead_id/activity", post(record_activity))
}

// ==================== Handlers ====================

async fn create_record(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    body: Option<Json<CreatePipelineRequest>>,
) -> ApiResult<(StatusCode, Json<PipelineRecord>)> {
    let Json(request) = body.unwrap_or_default();
    request.validate()?;

    let (record, inserted) = state.pipeline.create_if_missing(lead_id, request.assigned_owner).await?;
    let status = if inserted { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(record)))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<PipelineRecord>> {
    Ok(Json(state.pipeline.get(lead_id).await?))
}

async fn update_record(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    Json(request): Json<UpdatePipelineRequest>,
) -> ApiResult<Json<PipelineRecord>> {
    request.validate()?;

    let mut record = state.pipeline.get(lead_id).await?;
    if let Some(owner) = request.assigned_owner {
        record = state.pipeline.assign_owner(lead_id, Some(owner)).await?;
    }
    if let Some(date) = request.expected_close_date {
        record = state.pipeline.set_expected_close_date(lead_id, Some(date)).await?;
    }

    Ok(Json(record))
}

async fn move_stage(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
    Json(request): Json<MoveStageRequest>,
) -> ApiResult<Json<PipelineRecord>> {
    request.validate()?;

    let mut stage_move = StageMove::manual(lead_id, request.to_stage, &request.actor);
    if let Some(notes) = &request.notes {
        stage_move = stage_move.with_notes(notes);
    }
    if let Some(reason) = &request.loss_reason {
        stage_move = stage_move.with_loss_reason(reason);
    }
    if let Some(approver) = &request.approved_by {
        stage_move = stage_move.approved_by(approver);
    }

    Ok(Json(state.pipeline.move_to_stage(stage_move).await?))
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    // 404 for unknown leads rather than an empty ledger
    state.pipeline.get(lead_id).await?;
    Ok(Json(state.pipeline.get_history(lead_id).await?))
}

/// Edges the lead may take from its current stage.
async fn get_next_stages(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Transition>>> {
    let record = state.pipeline.get(lead_id).await?;
    let next = state
        .pipeline
        .registry()
        .transitions_from(record.current_stage)
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(next))
}

async fn record_activity(
    State(state): State<Arc<AppState>>,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<PipelineRecord>> {
    Ok(Json(state.pipeline.touch_activity(lead_id).await?))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> ApiResult<Json<PipelineMetrics>> {
    Ok(Json(state.pipeline.metrics().await?))
}

async fn get_registry(State(state): State<Arc<AppState>>) -> Json<RegistryConfig> {
    Json(state.pipeline.registry().snapshot())
}
