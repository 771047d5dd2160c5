//! Background Job Handlers

use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{get, post},
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::AppError;
use crate::jobs::{JobError, JobExecutionLog, JobScheduler};
use crate::{AppState, ApiResult};

pub fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/logs", get(list_job_logs))
        .route("/rules", get(list_scheduled_rules))
        .route("/:name/run", post(run_job))
}

fn scheduler(state: &AppState) -> ApiResult<&Arc<JobScheduler>> {
    state
        .scheduler
        .as_ref()
        .ok_or_else(|| AppError::Conflict("Background jobs are not running".to_string()))
}

async fn list_job_logs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<JobExecutionLog>>> {
    let mut logs = scheduler(&state)?.get_execution_logs().await;
    logs.reverse();
    Ok(Json(logs))
}

/// Time-based rules that currently have a cron job.
async fn list_scheduled_rules(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Uuid>>> {
    Ok(Json(scheduler(&state)?.scheduled_rules().await))
}

async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobExecutionLog>> {
    match scheduler(&state)?.run_job_now(&name).await {
        Ok(log) => Ok(Json(log)),
        Err(JobError::ConfigError(message)) => Err(AppError::BadRequest(message)),
        Err(e) => Err(AppError::InternalError(e.to_string())),
    }
}
