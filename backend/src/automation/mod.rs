// Automation Rule Engine
//
// Event-driven automation for the sales pipeline: triggers select rules,
// conditions gate them, actions run with bounded retries and every run is
// recorded as an execution.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod execution;
pub mod executor;
pub mod queue;
pub mod rules;
pub mod triggers;

pub use actions::{Action, ActionError, ActionKind, ActionResult, ActionStatus, ActionType};
pub use conditions::{Condition, ConditionError, ConditionOperator, ConditionValue, DynamicValue, LogicalOperator};
pub use engine::{AutomationEngine, AutomationError, AutomationResult, RuleRunner};
pub use execution::{AutomationExecution, ExecutionLogEntry, ExecutionStatus, LogLevel};
pub use executor::{ActionExecutor, ExecutionContext};
pub use queue::{ExecutionQueue, ExecutionRunner, QueueError, QueuedExecution};
pub use rules::{AutomationRule, RuleSettings, RuleStats, RuleValidationError, TimeWindow};
pub use triggers::{
    EventChain, EventKind, EventPublisher, EventSource, EventSubscriber, Trigger, TriggerEvent, TriggerType,
};
