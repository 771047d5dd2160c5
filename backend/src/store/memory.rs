//! In-memory store used when no database is configured, and by the tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnel_shared::{HistoryEntry, PipelineRecord, Stage};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[cfg(test)]
use crate::automation::ExecutionStatus;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ExecutionFilter, ExecutionStore, PipelineStore, RuleStore, StoreError, StoreResult};
use crate::automation::{AutomationExecution, AutomationRule};

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, PipelineRecord>,
    history: Vec<HistoryEntry>,
    rules: HashMap<Uuid, AutomationRule>,
    executions: HashMap<Uuid, AutomationExecution>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    #[cfg(test)]
    fail_commits: AtomicBool,
    #[cfg(test)]
    fail_running_saves: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `commit_transition` fail.
    #[cfg(test)]
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_commit(&self) -> StoreResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("injected commit failure".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_commit(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Make every following save of a running execution fail.
    #[cfg(test)]
    pub fn fail_running_saves(&self, fail: bool) {
        self.fail_running_saves.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_execution_save(&self, execution: &AutomationExecution) -> StoreResult<()> {
        if execution.status == ExecutionStatus::Running && self.fail_running_saves.load(Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("injected execution save failure".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_execution_save(&self, _execution: &AutomationExecution) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn find_record(&self, lead_id: Uuid) -> StoreResult<Option<PipelineRecord>> {
        Ok(self.inner.read().await.records.get(&lead_id).cloned())
    }

    async fn create_record(
        &self,
        record: PipelineRecord,
        entry: HistoryEntry,
    ) -> StoreResult<(PipelineRecord, bool)> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.records.get(&record.lead_id) {
            return Ok((existing.clone(), false));
        }

        inner.records.insert(record.lead_id, record.clone());
        inner.history.push(entry);
        Ok((record, true))
    }

    async fn commit_transition(&self, record: &PipelineRecord, entry: &HistoryEntry) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        self.check_commit()?;

        if !inner.records.contains_key(&record.lead_id) {
            return Err(StoreError::NotFound(format!("pipeline record for lead {}", record.lead_id)));
        }

        inner.records.insert(record.lead_id, record.clone());
        inner.history.push(entry.clone());
        Ok(())
    }

    async fn update_record(&self, record: &PipelineRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        match inner.records.get_mut(&record.lead_id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("pipeline record for lead {}", record.lead_id))),
        }
    }

    async fn find_in_stage(&self, stage: Stage) -> StoreResult<Vec<PipelineRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<PipelineRecord> = inner
            .records
            .values()
            .filter(|r| r.current_stage == stage)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.stage_entered_at);
        Ok(records)
    }

    async fn find_stale(&self, stage: Stage, entered_before: DateTime<Utc>) -> StoreResult<Vec<PipelineRecord>> {
        let mut records = self.find_in_stage(stage).await?;
        records.retain(|r| r.stage_entered_at < entered_before);
        Ok(records)
    }

    async fn list_records(&self) -> StoreResult<Vec<PipelineRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<PipelineRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn history(&self, lead_id: Uuid) -> StoreResult<Vec<HistoryEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .history
            .iter()
            .rev()
            .filter(|e| e.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn all_history(&self) -> StoreResult<Vec<HistoryEntry>> {
        Ok(self.inner.read().await.history.clone())
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn save_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        self.inner.write().await.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<Option<AutomationRule>> {
        Ok(self.inner.read().await.rules.get(&id).cloned())
    }

    async fn list_rules(&self) -> StoreResult<Vec<AutomationRule>> {
        let inner = self.inner.read().await;
        let mut rules: Vec<AutomationRule> = inner.rules.values().cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(rules)
    }

    async fn set_rule_active(
        &self,
        id: Uuid,
        active: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<AutomationRule>> {
        let mut inner = self.inner.write().await;
        Ok(inner.rules.get_mut(&id).map(|rule| {
            rule.is_active = active;
            rule.updated_at = at;
            rule.clone()
        }))
    }

    async fn record_outcome(&self, rule_id: Uuid, success: bool, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let rule = inner
            .rules
            .get_mut(&rule_id)
            .ok_or_else(|| StoreError::NotFound(format!("rule {}", rule_id)))?;
        rule.stats.record(success, at);
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn save_execution(&self, execution: &AutomationExecution) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        self.check_execution_save(execution)?;
        if let Some(existing) = inner.executions.get(&execution.id) {
            if existing.status.is_terminal() {
                return Err(StoreError::WriteFailed(format!(
                    "execution {} is already {}",
                    execution.id,
                    existing.status.as_str()
                )));
            }
        }
        inner.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<AutomationExecution>> {
        Ok(self.inner.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<AutomationExecution>> {
        let inner = self.inner.read().await;
        let mut executions: Vec<AutomationExecution> = inner
            .executions
            .values()
            .filter(|e| filter.rule_id.is_none_or(|id| e.rule_id == id))
            .filter(|e| filter.entity_id.is_none_or(|id| e.entity_id == id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }

    async fn count_executions(
        &self,
        rule_id: Uuid,
        entity_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<u64> {
        let inner = self.inner.read().await;
        let count = inner
            .executions
            .values()
            .filter(|e| e.rule_id == rule_id)
            .filter(|e| entity_id.is_none_or(|id| e.entity_id == id))
            .filter(|e| since.is_none_or(|t| e.triggered_at >= t))
            .count();
        Ok(count as u64)
    }

    async fn purge_executions(&self, completed_before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.executions.len();
        inner.executions.retain(|_, e| {
            !(e.status.is_terminal() && e.completed_at.is_some_and(|at| at < completed_before))
        });
        Ok((before - inner.executions.len()) as u64)
    }
}
