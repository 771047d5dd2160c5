//! Entity Handlers
//!
//! Lead snapshots used by automation conditions. Changing a field on an
//! existing entity publishes a field update event.

use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::get,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::automation::TriggerEvent;
use crate::error::AppError;
use crate::services::{Entity, EntityDataAccess, EntityError, FollowUp};
use crate::{AppState, ApiResult};

pub fn entity_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_entity).put(upsert_entity))
        .route("/:id/follow-ups", get(list_follow_ups))
}

async fn get_entity(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Entity>> {
    match state.entities.get_entity(id).await {
        Ok(entity) => Ok(Json(entity)),
        Err(EntityError::NotFound(id)) => Err(AppError::NotFound(format!("Entity {}", id))),
        Err(e) => Err(AppError::InternalError(e.to_string())),
    }
}

async fn upsert_entity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(fields): Json<Entity>,
) -> ApiResult<Json<Entity>> {
    if fields.keys().any(|k| k.trim().is_empty()) {
        return Err(AppError::validation_single("fields", "field names must not be empty"));
    }

    let changes = state.entities.merge(id, fields).await;
    debug!("Entity {} updated, {} fields changed", id, changes.len());
    for change in changes {
        state
            .publisher
            .publish(TriggerEvent::field_updated(id, &change.field, change.old_value, change.new_value));
    }

    get_entity(State(state), Path(id)).await
}

async fn list_follow_ups(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Json<Vec<FollowUp>> {
    Json(state.entities.follow_ups_for(id).await)
}
