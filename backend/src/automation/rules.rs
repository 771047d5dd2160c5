// Automation Rules - Rule definitions, settings and creation-time validation

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{Action, Condition, LogicalOperator, Trigger};

/// UTC hour window; `start_hour > end_hour` wraps past midnight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuleSettings {
    #[serde(default)]
    pub max_executions_per_entity: Option<u32>,
    #[serde(default)]
    pub max_executions_per_hour: Option<u32>,
    #[serde(default)]
    pub max_executions_per_day: Option<u32>,
    #[serde(default)]
    pub active_hours: Option<TimeWindow>,
    #[serde(default)]
    pub active_days: Option<Vec<Weekday>>,
    #[serde(default)]
    pub stop_on_error: bool,
}

impl RuleSettings {
    /// Whether the rule may run at `at` according to its time window.
    pub fn is_within_window(&self, at: DateTime<Utc>) -> bool {
        let hour_ok = self.active_hours.map(|w| w.contains(at)).unwrap_or(true);
        let day_ok = self
            .active_days
            .as_ref()
            .map(|days| days.contains(&at.weekday()))
            .unwrap_or(true);
        hour_ok && day_ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuleStats {
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl RuleStats {
    pub fn record(&mut self, success: bool, at: DateTime<Utc>) {
        self.execution_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        self.last_executed_at = Some(at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationRule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    pub is_active: bool,
    pub trigger: Trigger,
    pub conditions: Vec<Condition>,
    /// How condition groups combine.
    pub condition_logic: LogicalOperator,
    pub actions: Vec<Action>,
    pub settings: RuleSettings,
    pub stats: RuleStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid rule: {}", problems.join("; "))]
pub struct RuleValidationError {
    pub problems: Vec<String>,
}

impl AutomationRule {
    pub fn new(name: &str, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            priority: 0,
            is_active: true,
            trigger,
            conditions: Vec::new(),
            condition_logic: LogicalOperator::And,
            actions: Vec::new(),
            settings: RuleSettings::default(),
            stats: RuleStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_settings(mut self, settings: RuleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Collects every problem with the rule instead of stopping at the first.
    pub fn validate(&self) -> Result<(), RuleValidationError> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("rule name is empty".to_string());
        }
        if self.actions.is_empty() {
            problems.push("rule has no actions".to_string());
        }

        match &self.trigger {
            Trigger::FieldUpdate { field } if field.trim().is_empty() => {
                problems.push("field_update trigger needs a field".to_string());
            }
            Trigger::TimeBased { schedule, .. } => {
                let parts = schedule.split_whitespace().count();
                if !(6..=7).contains(&parts) {
                    problems.push(format!(
                        "schedule '{}' must be a cron expression with seconds (6 or 7 fields)",
                        schedule
                    ));
                }
            }
            Trigger::StageChange { from: Some(from), to: Some(to) } if from == to => {
                problems.push(format!("stage_change trigger from {} to itself never fires", from));
            }
            _ => {}
        }

        for condition in &self.conditions {
            if let Err(problem) = condition.validate() {
                problems.push(problem);
            }
        }

        let mut seen = std::collections::HashSet::new();
        for action in &self.actions {
            if !seen.insert(action.id) {
                problems.push(format!("action id {} is used twice", action.id));
            }
            if let Err(problem) = action.validate() {
                problems.push(problem);
            }
        }

        let s = &self.settings;
        for (label, limit) in [
            ("max_executions_per_entity", s.max_executions_per_entity),
            ("max_executions_per_hour", s.max_executions_per_hour),
            ("max_executions_per_day", s.max_executions_per_day),
        ] {
            if limit == Some(0) {
                problems.push(format!("{} of 0 disables the rule; deactivate it instead", label));
            }
        }
        if let (Some(hour), Some(day)) = (s.max_executions_per_hour, s.max_executions_per_day) {
            if hour > day {
                problems.push("hourly limit exceeds the daily limit".to_string());
            }
        }
        if let Some(window) = s.active_hours {
            if window.start_hour > 23 || window.end_hour > 24 || window.start_hour == window.end_hour {
                problems.push(format!(
                    "active hours {}..{} are not a valid window",
                    window.start_hour, window.end_hour
                ));
            }
        }
        if matches!(&s.active_days, Some(days) if days.is_empty()) {
            problems.push("active_days is empty; deactivate the rule instead".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RuleValidationError { problems })
        }
    }
}
