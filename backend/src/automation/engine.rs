// Automation Engine - Matches events to rules and runs the resulting executions

use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conditions;
use super::queue::{ExecutionQueue, ExecutionRunner, QueueError, QueuedExecution};
use super::{
    ActionExecutor, ActionStatus, AutomationExecution, AutomationRule, EventSubscriber, ExecutionContext,
    ExecutionStatus, LogLevel, RuleValidationError, Trigger, TriggerEvent,
};
use crate::pipeline::PipelineStateMachine;
use crate::services::EntityDataAccess;
use crate::store::{ExecutionFilter, ExecutionStore, RuleStore, StoreError};

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error(transparent)]
    Validation(#[from] RuleValidationError),

    #[error("Rule {0} not found")]
    RuleNotFound(Uuid),

    #[error("Execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("Execution {id} is {status} and can no longer be cancelled")]
    NotCancellable { id: Uuid, status: &'static str },

    #[error("Rule {0} is not a manual rule")]
    NotManual(Uuid),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub type AutomationResult<T> = Result<T, AutomationError>;

pub struct AutomationEngine {
    rules: Arc<dyn RuleStore>,
    executions: Arc<dyn ExecutionStore>,
    active_rules: RwLock<Vec<Arc<AutomationRule>>>,
    queue: Arc<ExecutionQueue>,
    dispatch_lock: Mutex<()>,
    max_chain_depth: u32,
}

impl AutomationEngine {
    pub async fn new(
        rules: Arc<dyn RuleStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<ExecutionQueue>,
        max_chain_depth: u32,
    ) -> AutomationResult<Self> {
        let engine = Self {
            rules,
            executions,
            active_rules: RwLock::new(Vec::new()),
            queue,
            dispatch_lock: Mutex::new(()),
            max_chain_depth,
        };

        engine.reload_rules().await?;

        Ok(engine)
    }

    /// Refresh the cache of active rules, highest priority first.
    pub async fn reload_rules(&self) -> AutomationResult<()> {
        let mut active: Vec<Arc<AutomationRule>> = self
            .rules
            .list_rules()
            .await?
            .into_iter()
            .filter(|r| r.is_active)
            .map(Arc::new)
            .collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut cache = self.active_rules.write().await;
        *cache = active;

        info!("Loaded {} active automation rules", cache.len());
        Ok(())
    }

    pub async fn create_rule(&self, mut rule: AutomationRule) -> AutomationResult<AutomationRule> {
        rule.validate()?;

        let now = Utc::now();
        rule.created_at = now;
        rule.updated_at = now;
        rule.stats = Default::default();

        self.rules.save_rule(&rule).await?;
        self.reload_rules().await?;

        info!("Created automation rule '{}' ({})", rule.name, rule.id);
        Ok(rule)
    }

    pub async fn get_rule(&self, id: Uuid) -> AutomationResult<AutomationRule> {
        self.rules.get_rule(id).await?.ok_or(AutomationError::RuleNotFound(id))
    }

    pub async fn list_rules(&self) -> AutomationResult<Vec<AutomationRule>> {
        Ok(self.rules.list_rules().await?)
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> AutomationResult<AutomationRule> {
        let rule = self
            .rules
            .set_rule_active(id, active, Utc::now())
            .await?
            .ok_or(AutomationError::RuleNotFound(id))?;
        self.reload_rules().await?;
        Ok(rule)
    }

    /// Active time-based rules, for the job scheduler.
    pub async fn time_based_rules(&self) -> Vec<Arc<AutomationRule>> {
        self.active_rules
            .read()
            .await
            .iter()
            .filter(|r| matches!(r.trigger, Trigger::TimeBased { .. }))
            .cloned()
            .collect()
    }

    /// Fire a manual rule for one entity. Returns the created execution ids.
    pub async fn run_manual(&self, rule_id: Uuid, entity_id: Uuid, requested_by: &str) -> AutomationResult<Vec<Uuid>> {
        let rule = self.get_rule(rule_id).await?;
        if rule.trigger != Trigger::Manual {
            return Err(AutomationError::NotManual(rule_id));
        }
        self.process_event(&TriggerEvent::manual(rule_id, entity_id, requested_by))
            .await
    }

    /// Create and queue one execution per matching active rule.
    pub async fn process_event(&self, event: &TriggerEvent) -> AutomationResult<Vec<Uuid>> {
        if event.chain.depth > self.max_chain_depth {
            warn!(
                "Dropping {} event {} for entity {}: chain depth {} exceeds {}",
                event.trigger_type().as_str(),
                event.event_id,
                event.entity_id,
                event.chain.depth,
                self.max_chain_depth
            );
            return Ok(Vec::new());
        }

        let _dispatch = self.dispatch_lock.lock().await;
        let candidates: Vec<Arc<AutomationRule>> = self
            .active_rules
            .read()
            .await
            .iter()
            .filter(|rule| rule.trigger.matches(rule.id, event))
            .cloned()
            .collect();

        let now = Utc::now();
        let mut queued = Vec::new();
        for rule in candidates {
            if !rule.settings.is_within_window(now) {
                debug!("Rule '{}' is outside its active window, skipping", rule.name);
                continue;
            }
            if self.is_rate_limited(&rule, event.entity_id).await? {
                info!("Rule '{}' is rate limited for entity {}, skipping", rule.name, event.entity_id);
                continue;
            }

            let mut execution = AutomationExecution::new(&rule, event.clone());
            execution.log(
                LogLevel::Info,
                format!("Triggered by {} event", event.trigger_type().as_str()),
                Some(event.payload()),
            );
            self.executions.save_execution(&execution).await?;

            let job = QueuedExecution {
                execution_id: execution.id,
                entity_id: execution.entity_id,
                rule: rule.clone(),
                event: event.clone(),
            };
            if let Err(e) = self.queue.enqueue(job).await {
                execution.cancel();
                self.executions.save_execution(&execution).await?;
                return Err(e.into());
            }

            info!(
                "Queued execution {} of rule '{}' for entity {}",
                execution.id, rule.name, execution.entity_id
            );
            queued.push(execution.id);
        }

        Ok(queued)
    }

    async fn is_rate_limited(&self, rule: &AutomationRule, entity_id: Uuid) -> AutomationResult<bool> {
        let settings = &rule.settings;
        let now = Utc::now();

        let checks = [
            (settings.max_executions_per_entity, None),
            (settings.max_executions_per_hour, Some(now - Duration::hours(1))),
            (settings.max_executions_per_day, Some(now - Duration::days(1))),
        ];
        for (limit, since) in checks {
            let Some(limit) = limit else { continue };
            let count = self
                .executions
                .count_executions(rule.id, Some(entity_id), since)
                .await?;
            if count >= u64::from(limit) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Cancel an execution that no worker has picked up yet.
    pub async fn cancel_execution(&self, id: Uuid) -> AutomationResult<AutomationExecution> {
        let mut execution = self.get_execution(id).await?;
        if execution.status != ExecutionStatus::Pending || self.queue.cancel(id).await.is_none() {
            let current = self.get_execution(id).await?;
            return Err(AutomationError::NotCancellable {
                id,
                status: current.status.as_str(),
            });
        }

        execution.cancel();
        self.executions.save_execution(&execution).await?;
        info!("Cancelled execution {}", id);
        Ok(execution)
    }

    pub async fn get_execution(&self, id: Uuid) -> AutomationResult<AutomationExecution> {
        self.executions
            .get_execution(id)
            .await?
            .ok_or(AutomationError::ExecutionNotFound(id))
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> AutomationResult<Vec<AutomationExecution>> {
        Ok(self.executions.list_executions(filter).await?)
    }

    /// Feed published domain events into `process_event` until the stream ends.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut subscriber: EventSubscriber) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                if let Err(e) = engine.process_event(&event).await {
                    error!("Failed to dispatch event {}: {}", event.event_id, e);
                }
                subscriber.ack();
            }
            info!("Automation dispatcher stopped");
        })
    }
}

/// Runs queued executions: conditions first, then the actions in order
pub struct RuleRunner {
    executor: ActionExecutor,
    pipeline: Arc<PipelineStateMachine>,
    entities: Arc<dyn EntityDataAccess>,
    rules: Arc<dyn RuleStore>,
    executions: Arc<dyn ExecutionStore>,
}

impl RuleRunner {
    pub fn new(
        executor: ActionExecutor,
        pipeline: Arc<PipelineStateMachine>,
        entities: Arc<dyn EntityDataAccess>,
        rules: Arc<dyn RuleStore>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            executor,
            pipeline,
            entities,
            rules,
            executions,
        }
    }

    /// Entity fields at the top level, plus `entity`, `pipeline` and `event`.
    async fn build_context(&self, job: &QueuedExecution) -> serde_json::Value {
        let entity = match self.entities.get_entity(job.entity_id).await {
            Ok(entity) => entity,
            Err(e) => {
                warn!("No entity snapshot for {}: {}", job.entity_id, e);
                Default::default()
            }
        };
        let pipeline = self
            .pipeline
            .get(job.entity_id)
            .await
            .ok()
            .and_then(|record| serde_json::to_value(record).ok())
            .unwrap_or(serde_json::Value::Null);

        let mut data = entity.clone();
        data.insert("entity_id".into(), serde_json::json!(job.entity_id));
        data.insert("entity".into(), serde_json::Value::Object(entity));
        data.insert("pipeline".into(), pipeline);
        data.insert("event".into(), job.event.payload());
        serde_json::Value::Object(data)
    }

    async fn execute(&self, job: QueuedExecution, execution: &mut AutomationExecution) -> AutomationResult<()> {
        let rule = job.rule.clone();

        execution.start();
        self.executions.save_execution(execution).await?;

        let data = self.build_context(&job).await;
        let context = ExecutionContext::new(execution.id, rule.id, job.event.clone(), data);

        let passed = match conditions::evaluate(&rule.conditions, rule.condition_logic, &context.data) {
            Ok(passed) => passed,
            Err(e) => {
                warn!("Condition evaluation failed for rule '{}': {}", rule.name, e);
                execution.log(LogLevel::Warn, format!("Condition evaluation failed: {}", e), None);
                false
            }
        };

        if !passed {
            execution.skip_remaining(0);
            execution.log(LogLevel::Info, "Execution skipped, conditions not met", None);
            execution.finish(ExecutionStatus::Completed);
        } else {
            let mut halted = false;
            for (index, action) in rule.actions.iter().enumerate() {
                let result = self.executor.execute(action, &context).await;
                let failed = result.status == ActionStatus::Failed;

                let (level, outcome) = if failed {
                    (LogLevel::Error, "failed")
                } else {
                    (LogLevel::Info, "succeeded")
                };
                execution.log(
                    level,
                    format!("Action '{}' {} after {} retries", action.name, outcome, result.retry_count),
                    result.error.clone().map(serde_json::Value::String),
                );
                execution.record_action(index, result);

                if failed && action.halts_on_failure(rule.settings.stop_on_error) {
                    execution.skip_remaining(index + 1);
                    halted = true;
                    break;
                }
            }
            execution.finish(if halted {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            });
        }

        self.executions.save_execution(execution).await?;
        self.rules
            .record_outcome(rule.id, execution.is_success(), execution.completed_at.unwrap_or_else(Utc::now))
            .await?;

        info!(
            "Execution {} of rule '{}' {}: {} succeeded, {} failed, {} skipped",
            execution.id,
            rule.name,
            execution.status.as_str(),
            execution.successful_actions,
            execution.failed_actions,
            execution.skipped_actions
        );
        Ok(())
    }

    /// Store `execution` as failed unless a terminal result is already
    /// persisted. Used when a run could not be saved or did not finish.
    async fn fail_unfinished(&self, mut execution: AutomationExecution, reason: &str) {
        match self.executions.get_execution(execution.id).await {
            Ok(Some(stored)) if stored.status.is_terminal() => return,
            Ok(_) => {}
            Err(e) => warn!("Could not reload execution {}: {}", execution.id, e),
        }

        execution.skip_remaining(0);
        execution.log(LogLevel::Error, reason.to_string(), None);
        execution.finish(ExecutionStatus::Failed);
        if let Err(e) = self.executions.save_execution(&execution).await {
            error!("Execution {} is stuck as {}: {}", execution.id, execution.status.as_str(), e);
            return;
        }
        if let Err(e) = self
            .rules
            .record_outcome(execution.rule_id, false, execution.completed_at.unwrap_or_else(Utc::now))
            .await
        {
            error!("Failed to record outcome of execution {}: {}", execution.id, e);
        }
        warn!("Execution {} marked failed: {}", execution.id, reason);
    }
}

#[async_trait::async_trait]
impl ExecutionRunner for RuleRunner {
    async fn run(&self, job: QueuedExecution) {
        let execution_id = job.execution_id;
        let mut execution = match self.executions.get_execution(execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!("Execution {} vanished before it could run", execution_id);
                return;
            }
            Err(e) => {
                error!("Failed to load execution {}: {}", execution_id, e);
                return;
            }
        };
        if execution.status != ExecutionStatus::Pending {
            debug!("Execution {} is {}, not running it", execution_id, execution.status.as_str());
            return;
        }

        if let Err(e) = self.execute(job, &mut execution).await {
            error!("Execution {} failed to persist: {}", execution_id, e);
            self.fail_unfinished(execution, &format!("Execution could not be persisted: {}", e))
                .await;
        }
    }

    async fn abort(&self, execution_id: Uuid, reason: &str) {
        match self.executions.get_execution(execution_id).await {
            Ok(Some(execution)) => self.fail_unfinished(execution, reason).await,
            Ok(None) => warn!("Aborted execution {} is not stored", execution_id),
            Err(e) => error!("Failed to load aborted execution {}: {}", execution_id, e),
        }
    }
}
