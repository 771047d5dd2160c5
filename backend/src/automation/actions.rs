// Automation Actions - Side-effecting steps a rule performs once its conditions pass

use chrono::{DateTime, Utc};
use funnel_shared::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Closed set of action kinds, used for reporting
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Notify,
    CreateFollowUp,
    UpdateField,
    MoveStage,
    CallWebhook,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::CreateFollowUp => "create_follow_up",
            Self::UpdateField => "update_field",
            Self::MoveStage => "move_stage",
            Self::CallWebhook => "call_webhook",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_method() -> String {
    "POST".to_string()
}

/// Typed configuration per action kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum ActionKind {
    /// Hand a message to the delivery capability.
    Notify {
        target: String,
        message: String,
        #[serde(default)]
        channel: Option<String>,
    },
    CreateFollowUp {
        title: String,
        due_in_days: u32,
        #[serde(default)]
        assignee: Option<String>,
    },
    UpdateField {
        field: String,
        value: serde_json::Value,
    },
    MoveStage {
        stage: Stage,
        #[serde(default)]
        notes: Option<String>,
        #[serde(default)]
        loss_reason: Option<String>,
    },
    CallWebhook {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
}

impl ActionKind {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Notify { .. } => ActionType::Notify,
            Self::CreateFollowUp { .. } => ActionType::CreateFollowUp,
            Self::UpdateField { .. } => ActionType::UpdateField,
            Self::MoveStage { .. } => ActionType::MoveStage,
            Self::CallWebhook { .. } => ActionType::CallWebhook,
        }
    }
}

pub const MAX_RETRY_COUNT: u32 = 10;

/// Ten years.
pub const MAX_FOLLOW_UP_DAYS: u32 = 3_650;

fn default_retry_delay_ms() -> u64 {
    1_000
}

/// An action to be executed by a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Falls back to the rule's `stop_on_error` setting when unset.
    #[serde(default)]
    pub continue_on_error: Option<bool>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Action {
    pub fn new(name: &str, kind: ActionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind,
            continue_on_error: None,
            retry_count: 0,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    pub fn action_type(&self) -> ActionType {
        self.kind.action_type()
    }

    pub fn with_retry(mut self, count: u32, delay_ms: u64) -> Self {
        self.retry_count = count;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = Some(value);
        self
    }

    /// Whether a failure of this action halts the remaining ones.
    pub fn halts_on_failure(&self, stop_on_error: bool) -> bool {
        !self.continue_on_error.unwrap_or(!stop_on_error)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("action name is empty".to_string());
        }
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(format!(
                "action '{}' retries {} times, the limit is {}",
                self.name, self.retry_count, MAX_RETRY_COUNT
            ));
        }

        match &self.kind {
            ActionKind::Notify { target, message, .. } => {
                if target.trim().is_empty() || message.trim().is_empty() {
                    return Err(format!("notify action '{}' needs a target and a message", self.name));
                }
            }
            ActionKind::CreateFollowUp { title, due_in_days, .. } => {
                if title.trim().is_empty() {
                    return Err(format!("follow-up action '{}' needs a title", self.name));
                }
                if *due_in_days == 0 {
                    return Err(format!("follow-up action '{}' must be due in the future", self.name));
                }
                if *due_in_days > MAX_FOLLOW_UP_DAYS {
                    return Err(format!(
                        "follow-up action '{}' is due in {} days, the limit is {}",
                        self.name, due_in_days, MAX_FOLLOW_UP_DAYS
                    ));
                }
            }
            ActionKind::UpdateField { field, .. } => {
                if field.trim().is_empty() {
                    return Err(format!("update action '{}' needs a field name", self.name));
                }
            }
            ActionKind::MoveStage { .. } => {}
            ActionKind::CallWebhook { url, method, .. } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(format!("webhook action '{}' needs an http(s) url, got '{}'", self.name, url));
                }
                if reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                    return Err(format!("webhook action '{}' has an invalid method '{}'", self.name, method));
                }
            }
        }

        Ok(())
    }
}

/// Common action presets
pub mod presets {
    use super::*;

    pub fn notify_owner(message: &str) -> Action {
        Action::new(
            "Notify owner",
            ActionKind::Notify {
                target: "{{assigned_owner}}".to_string(),
                message: message.to_string(),
                channel: None,
            },
        )
    }

    pub fn follow_up_in(days: u32, title: &str) -> Action {
        Action::new(
            "Schedule follow-up",
            ActionKind::CreateFollowUp {
                title: title.to_string(),
                due_in_days: days,
                assignee: None,
            },
        )
    }

    pub fn set_field(field: &str, value: serde_json::Value) -> Action {
        Action::new(
            &format!("Set {}", field),
            ActionKind::UpdateField {
                field: field.to_string(),
                value,
            },
        )
    }

    pub fn move_to(stage: Stage) -> Action {
        Action::new(
            &format!("Move to {}", stage),
            ActionKind::MoveStage {
                stage,
                notes: None,
                loss_reason: None,
            },
        )
    }

    pub fn post_webhook(url: &str, body: serde_json::Value) -> Action {
        Action::new(
            "Call webhook",
            ActionKind::CallWebhook {
                url: url.to_string(),
                method: default_method(),
                headers: HashMap::new(),
                body: Some(body),
            },
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Outcome of one action within an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub action_id: Uuid,
    pub action_name: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Retries actually attempted after the first try.
    pub retry_count: u32,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl ActionResult {
    pub fn pending(action: &Action) -> Self {
        Self {
            action_id: action.id,
            action_name: action.name.clone(),
            action_type: action.action_type(),
            status: ActionStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_count: 0,
            error: None,
            output: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("action timed out after {0} seconds")]
    Timeout(u64),
    #[error("invalid action configuration: {0}")]
    InvalidConfig(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("entity access failed: {0}")]
    Entity(String),
    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::PipelineError),
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook returned status {status}: {body}")]
    WebhookStatus { status: u16, body: String },
}

impl ActionError {
    /// Errors that repeat identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        use crate::pipeline::PipelineError;

        match self {
            Self::InvalidConfig(_) => false,
            Self::Pipeline(
                PipelineError::InvalidTransition { .. }
                | PipelineError::RecordNotFound(_)
                | PipelineError::ApprovalRequired { .. },
            ) => false,
            _ => true,
        }
    }
}
