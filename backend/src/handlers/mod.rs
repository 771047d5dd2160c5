use axum::{Router, extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub mod automation;
pub mod entities;
pub mod jobs;
pub mod pipeline;

pub use automation::automation_routes;
pub use entities::entity_routes;
pub use jobs::job_routes;
pub use pipeline::pipeline_routes;

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database = match &state.db_pool {
        Some(pool) => Some(crate::database::health_check(pool).await),
        None => None,
    };
    let healthy = database.as_ref().is_none_or(|db| db.reachable);

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": "funnel-api",
            "storage": if state.db_pool.is_some() { "postgres" } else { "memory" },
            "database": database,
            "automation": {
                "events_in_flight": state.publisher.in_flight(),
                "executions_outstanding": state.queue.outstanding().await,
                "entities_busy": state.queue.active_entities().await,
            },
        })),
    )
}

/// All API routes, without middleware layers.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api/v1/pipeline", pipeline_routes())
        .nest("/api/v1/automation", automation_routes())
        .nest("/api/v1/entities", entity_routes())
        .nest("/api/v1/jobs", job_routes())
        .with_state(state)
}
