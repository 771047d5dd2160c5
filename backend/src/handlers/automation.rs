//! Automation Handlers
//!
//! Rule management, manual runs and the execution log.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use validator::Validate;

use crate::automation::{
    Action, AutomationExecution, AutomationRule, Condition, LogicalOperator, RuleSettings, Trigger,
};
use crate::store::ExecutionFilter;
use crate::{AppState, ApiResult};

const DEFAULT_EXECUTION_LIMIT: usize = 50;

// ==================== Requests ====================

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRuleRequest {
    #[validate(length(min = 1, max = 200, message = "name is required"))]
    pub name: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_logic: LogicalOperator,
    #[validate(length(min = 1, message = "at least one action is required"))]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub settings: RuleSettings,
}

impl CreateRuleRequest {
    fn into_rule(self) -> AutomationRule {
        let mut rule = AutomationRule::new(&self.name, self.trigger).with_priority(self.priority);
        rule.description = self.description;
        rule.is_active = self.is_active;
        rule.conditions = self.conditions;
        rule.condition_logic = self.condition_logic;
        rule.actions = self.actions;
        rule.settings = self.settings;
        rule
    }
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RunRuleRequest {
    pub entity_id: Uuid,
    #[validate(length(min = 1, max = 200, message = "requested_by is required"))]
    pub requested_by: String,
}

#[derive(Debug, Serialize)]
pub struct RunRuleResponse {
    pub execution_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExecutionQuery {
    pub rule_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    #[validate(range(min = 1, max = 500))]
    pub limit: Option<usize>,
}

// ==================== Routes ====================

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/:id", get(get_rule))
        .route("/rules/:id/active", put(set_rule_active))
        .route("/rules/:id/run", post(run_rule))
        .route("/executions", get(list_executions))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/cancel", post(cancel_execution))
}

// ==================== Handlers ====================

async fn sync_schedules(state: &AppState) {
    if let Some(scheduler) = &state.scheduler {
        if let Err(e) = scheduler.sync_rules().await {
            warn!("Failed to sync time-based rule schedules: {}", e);
        }
    }
}

async fn list_rules(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<AutomationRule>>> {
    let mut rules = state.engine.list_rules().await?;
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRuleRequest>,
) -> ApiResult<(StatusCode, Json<AutomationRule>)> {
    request.validate()?;

    let rule = state.engine.create_rule(request.into_rule()).await?;
    sync_schedules(&state).await;

    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<AutomationRule>> {
    Ok(Json(state.engine.get_rule(id).await?))
}

async fn set_rule_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetActiveRequest>,
) -> ApiResult<Json<AutomationRule>> {
    let rule = state.engine.set_active(id, request.is_active).await?;
    sync_schedules(&state).await;
    Ok(Json(rule))
}

async fn run_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<RunRuleRequest>,
) -> ApiResult<(StatusCode, Json<RunRuleResponse>)> {
    request.validate()?;

    let execution_ids = state
        .engine
        .run_manual(id, request.entity_id, &request.requested_by)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(RunRuleResponse { execution_ids })))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExecutionQuery>,
) -> ApiResult<Json<Vec<AutomationExecution>>> {
    query.validate()?;

    let filter = ExecutionFilter {
        rule_id: query.rule_id,
        entity_id: query.entity_id,
        limit: Some(query.limit.unwrap_or(DEFAULT_EXECUTION_LIMIT)),
    };
    Ok(Json(state.engine.list_executions(&filter).await?))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AutomationExecution>> {
    Ok(Json(state.engine.get_execution(id).await?))
}

async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AutomationExecution>> {
    Ok(Json(state.engine.cancel_execution(id).await?))
}
