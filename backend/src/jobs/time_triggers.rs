// Time Trigger Job - Fires a time-based rule against every open lead it targets

use funnel_shared::PipelineRecord;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{JobError, JobResult};
use crate::automation::{AutomationEngine, AutomationResult, AutomationRule, Trigger, TriggerEvent};
use crate::store::PipelineStore;

pub struct TimeTriggerJob {
    engine: Arc<AutomationEngine>,
    store: Arc<dyn PipelineStore>,
}

#[derive(Debug, Default)]
pub struct TickResult {
    pub entities: i32,
    pub executions_queued: i32,
    pub errors: Vec<String>,
}

impl TimeTriggerJob {
    pub fn new(engine: Arc<AutomationEngine>, store: Arc<dyn PipelineStore>) -> Self {
        Self { engine, store }
    }

    pub async fn run(&self, rule: &AutomationRule) -> JobResult<TickResult> {
        let Trigger::TimeBased { stage, .. } = &rule.trigger else {
            return Err(JobError::ConfigError(format!("Rule '{}' is not time based", rule.name)));
        };

        let records: Vec<PipelineRecord> = match stage {
            Some(stage) => self.store.find_in_stage(*stage).await,
            None => self.store.list_records().await,
        }
        .map_err(|e| JobError::Store(e.to_string()))?
        .into_iter()
        .filter(|r| !r.is_closed())
        .collect();

        let mut result = TickResult::default();
        for record in records {
            result.entities += 1;
            match self.fire(rule.id, record.lead_id).await {
                Ok(queued) => result.executions_queued += queued,
                Err(e) => {
                    warn!("Time trigger of rule '{}' failed for lead {}: {}", rule.name, record.lead_id, e);
                    result.errors.push(format!("{}: {}", record.lead_id, e));
                }
            }
        }

        info!(
            "Time trigger '{}' ticked {} leads, queued {} executions",
            rule.name, result.entities, result.executions_queued
        );
        Ok(result)
    }

    async fn fire(&self, rule_id: Uuid, lead_id: Uuid) -> AutomationResult<i32> {
        let queued = self
            .engine
            .process_event(&TriggerEvent::time_tick(rule_id, lead_id))
            .await?;
        Ok(queued.len() as i32)
    }
}
