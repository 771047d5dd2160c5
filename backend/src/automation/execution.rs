// Automation Executions - One run of one rule against one triggering event

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActionResult, ActionStatus, AutomationRule, TriggerEvent};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationExecution {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub entity_id: Uuid,
    pub triggered_by: TriggerEvent,
    pub triggered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub action_results: Vec<ActionResult>,
    pub total_actions: usize,
    pub successful_actions: usize,
    pub failed_actions: usize,
    pub skipped_actions: usize,
    pub logs: Vec<ExecutionLogEntry>,
}

impl AutomationExecution {
    pub fn new(rule: &AutomationRule, event: TriggerEvent) -> Self {
        let action_results: Vec<ActionResult> = rule.actions.iter().map(ActionResult::pending).collect();
        Self {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            entity_id: event.entity_id,
            triggered_at: Utc::now(),
            triggered_by: event,
            started_at: None,
            completed_at: None,
            status: ExecutionStatus::Pending,
            total_actions: action_results.len(),
            action_results,
            successful_actions: 0,
            failed_actions: 0,
            skipped_actions: 0,
            logs: Vec::new(),
        }
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.logs.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data,
        });
    }

    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.log(LogLevel::Info, format!("Execution started for rule '{}'", self.rule_name), None);
    }

    /// Stores the terminal result of the action at `index` and updates the counters.
    pub fn record_action(&mut self, index: usize, result: ActionResult) {
        let Some(slot) = self.action_results.get_mut(index) else {
            return;
        };
        if slot.status.is_terminal() {
            return;
        }

        match result.status {
            ActionStatus::Success => self.successful_actions += 1,
            ActionStatus::Failed => self.failed_actions += 1,
            ActionStatus::Skipped => self.skipped_actions += 1,
            ActionStatus::Pending | ActionStatus::Running => {}
        }
        *slot = result;
    }

    /// Marks every not-yet-finished action from `index` on as skipped.
    pub fn skip_remaining(&mut self, index: usize) {
        for slot in self.action_results.iter_mut().skip(index) {
            if !slot.status.is_terminal() {
                slot.status = ActionStatus::Skipped;
                self.skipped_actions += 1;
            }
        }
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        let level = if status == ExecutionStatus::Failed {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        self.log(
            level,
            format!("Execution {}", status.as_str()),
            Some(serde_json::json!({
                "successful": self.successful_actions,
                "failed": self.failed_actions,
                "skipped": self.skipped_actions,
            })),
        );
    }

    /// Only a pending execution can be cancelled.
    pub fn cancel(&mut self) -> bool {
        if self.status != ExecutionStatus::Pending {
            return false;
        }
        self.skip_remaining(0);
        self.finish(ExecutionStatus::Cancelled);
        true
    }

    /// Succeeded without any failed action.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.failed_actions == 0
    }
}
