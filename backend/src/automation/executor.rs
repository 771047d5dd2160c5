// Action Executor - Runs single actions with a timeout and bounded retries

use chrono::{TimeDelta, Utc};
use funnel_shared::TransitionKind;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use super::conditions::lookup;
use super::{
    Action, ActionError, ActionKind, ActionResult, ActionStatus, EventKind, EventPublisher, EventSource,
    TriggerEvent,
};
use crate::pipeline::{PipelineStateMachine, StageMove};
use crate::services::{DeliveryPayload, DeliveryService, EntityDataAccess, FollowUp};

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("template pattern is valid"));

/// What an action sees while it runs
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub rule_id: Uuid,
    pub entity_id: Uuid,
    pub event: TriggerEvent,
    /// Entity snapshot, pipeline record and event payload
    pub data: serde_json::Value,
    /// Kind recorded on stage moves made by this execution.
    pub transition_kind: TransitionKind,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, rule_id: Uuid, event: TriggerEvent, data: serde_json::Value) -> Self {
        let transition_kind = match event.kind {
            EventKind::TimeTick { .. } => TransitionKind::Scheduled,
            _ => TransitionKind::Automatic,
        };
        Self {
            execution_id,
            rule_id,
            entity_id: event.entity_id,
            event,
            data,
            transition_kind,
        }
    }

    fn actor(&self) -> String {
        format!("automation:{}", self.rule_id)
    }
}

/// Replace `{{path}}` placeholders with values from `data`. Unknown paths are left as written.
pub fn render(template: &str, data: &serde_json::Value) -> String {
    TEMPLATE
        .replace_all(template, |caps: &regex::Captures| match lookup(data, &caps[1]) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => caps[0].to_string(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

fn render_value(value: &serde_json::Value, data: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(render(s, data)),
        serde_json::Value::Array(items) => items.iter().map(|v| render_value(v, data)).collect(),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), render_value(v, data))).collect(),
        ),
        other => other.clone(),
    }
}

pub struct ActionExecutor {
    pipeline: Arc<PipelineStateMachine>,
    entities: Arc<dyn EntityDataAccess>,
    delivery: Arc<dyn DeliveryService>,
    publisher: EventPublisher,
    http: reqwest::Client,
    action_timeout: std::time::Duration,
}

impl ActionExecutor {
    pub fn new(
        pipeline: Arc<PipelineStateMachine>,
        entities: Arc<dyn EntityDataAccess>,
        delivery: Arc<dyn DeliveryService>,
        publisher: EventPublisher,
        action_timeout: std::time::Duration,
    ) -> Self {
        Self {
            pipeline,
            entities,
            delivery,
            publisher,
            http: reqwest::Client::new(),
            action_timeout,
        }
    }

    /// Run one action to a terminal result. Errors are captured in the
    /// result; retryable failures are retried `action.retry_count` times,
    /// waiting `action.retry_delay_ms` between attempts.
    pub async fn execute(&self, action: &Action, context: &ExecutionContext) -> ActionResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut retries = 0;

        info!("Executing action: {} ({})", action.name, action.action_type());

        let outcome = loop {
            let attempt = match tokio::time::timeout(self.action_timeout, self.dispatch(action, context)).await {
                Ok(result) => result,
                Err(_) => Err(ActionError::Timeout(self.action_timeout.as_secs())),
            };

            match attempt {
                Ok(output) => break Ok(output),
                Err(e) if e.is_retryable() && retries < action.retry_count => {
                    retries += 1;
                    warn!(
                        "Action {} failed: {}, retrying ({}/{})",
                        action.name, e, retries, action.retry_count
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(action.retry_delay_ms)).await;
                }
                Err(e) => break Err(e),
            }
        };

        let mut result = ActionResult::pending(action);
        result.started_at = Some(started_at);
        result.completed_at = Some(Utc::now());
        result.duration_ms = Some(start.elapsed().as_millis() as i64);
        result.retry_count = retries;

        match outcome {
            Ok(output) => {
                result.status = ActionStatus::Success;
                result.output = output;
            }
            Err(e) => {
                warn!("Action {} failed after {} retries: {}", action.name, retries, e);
                result.status = ActionStatus::Failed;
                result.error = Some(e.to_string());
            }
        }
        result
    }

    async fn dispatch(
        &self,
        action: &Action,
        context: &ExecutionContext,
    ) -> Result<Option<serde_json::Value>, ActionError> {
        match &action.kind {
            ActionKind::Notify { target, message, channel } => {
                let target = render(target, &context.data);
                if target.trim().is_empty() || target.contains("{{") {
                    return Err(ActionError::InvalidConfig(format!("unresolved notify target '{}'", target)));
                }
                let payload = DeliveryPayload {
                    message: render(message, &context.data),
                    channel: channel.clone(),
                    entity_id: context.entity_id,
                    rule_id: context.rule_id,
                };
                self.delivery
                    .send(&target, &payload)
                    .await
                    .map_err(|e| ActionError::Delivery(e.to_string()))?;
                Ok(Some(serde_json::json!({ "target": target, "message": payload.message })))
            }

            ActionKind::CreateFollowUp { title, due_in_days, assignee } => {
                let now = Utc::now();
                let due_at = TimeDelta::try_days(i64::from(*due_in_days))
                    .and_then(|delta| now.checked_add_signed(delta))
                    .ok_or_else(|| {
                        ActionError::InvalidConfig(format!("follow-up due in {} days is out of range", due_in_days))
                    })?;
                let follow_up = FollowUp {
                    id: Uuid::new_v4(),
                    entity_id: context.entity_id,
                    title: render(title, &context.data),
                    due_at,
                    assignee: assignee.as_ref().map(|a| render(a, &context.data)),
                    created_by_rule: Some(context.rule_id),
                    created_at: now,
                };
                let created = self
                    .entities
                    .create_follow_up(follow_up)
                    .await
                    .map_err(|e| ActionError::Entity(e.to_string()))?;
                Ok(Some(serde_json::json!({ "follow_up_id": created.id, "due_at": created.due_at })))
            }

            ActionKind::UpdateField { field, value } => {
                let value = render_value(value, &context.data);
                let old = self
                    .entities
                    .update_field(context.entity_id, field, value.clone())
                    .await
                    .map_err(|e| ActionError::Entity(e.to_string()))?;

                self.publisher.publish(
                    TriggerEvent::field_updated(context.entity_id, field, old.clone(), value.clone())
                        .with_chain(context.event.chain.next())
                        .with_source(EventSource::Automation(context.execution_id)),
                );
                Ok(Some(serde_json::json!({ "field": field, "old_value": old, "new_value": value })))
            }

            ActionKind::MoveStage { stage, notes, loss_reason } => {
                let mut request = StageMove::new(context.entity_id, *stage, &context.actor(), context.transition_kind)
                    .within_chain(context.event.chain);
                if let Some(notes) = notes {
                    request = request.with_notes(&render(notes, &context.data));
                }
                if let Some(reason) = loss_reason {
                    request = request.with_loss_reason(&render(reason, &context.data));
                }
                let record = self.pipeline.move_to_stage(request).await?;
                Ok(Some(serde_json::json!({
                    "stage": record.current_stage,
                    "probability_percent": record.probability_percent,
                })))
            }

            ActionKind::CallWebhook { url, method, headers, body } => {
                let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| ActionError::InvalidConfig(format!("invalid method '{}'", method)))?;
                let mut request = self.http.request(method, render(url, &context.data));
                for (name, value) in headers {
                    request = request.header(name.as_str(), render(value, &context.data));
                }
                if let Some(body) = body {
                    request = request.json(&render_value(body, &context.data));
                }

                let response = request.send().await?;
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(ActionError::WebhookStatus {
                        status: status.as_u16(),
                        body: text,
                    });
                }

                let body = serde_json::from_str::<serde_json::Value>(&text)
                    .unwrap_or(serde_json::Value::String(text));
                Ok(Some(serde_json::json!({ "status": status.as_u16(), "body": body })))
            }
        }
    }
}
