// Persistence ports for pipeline records, history, rules and executions

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnel_shared::{HistoryEntry, PipelineRecord, Stage};
use thiserror::Error;
use uuid::Uuid;

use crate::automation::{AutomationExecution, AutomationRule};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Write rejected: {0}")]
    WriteFailed(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pipeline records and their history ledger
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn find_record(&self, lead_id: Uuid) -> StoreResult<Option<PipelineRecord>>;

    /// Insert `record` together with `entry` unless the lead already has a
    /// record. Returns the stored record and whether it was inserted.
    async fn create_record(
        &self,
        record: PipelineRecord,
        entry: HistoryEntry,
    ) -> StoreResult<(PipelineRecord, bool)>;

    /// Atomically replace the record and append `entry`. Neither write is
    /// visible if the other fails.
    async fn commit_transition(&self, record: &PipelineRecord, entry: &HistoryEntry) -> StoreResult<()>;

    /// Update non-stage fields.
    async fn update_record(&self, record: &PipelineRecord) -> StoreResult<()>;

    async fn find_in_stage(&self, stage: Stage) -> StoreResult<Vec<PipelineRecord>>;

    /// Records in `stage` that entered it before `entered_before`.
    async fn find_stale(&self, stage: Stage, entered_before: DateTime<Utc>) -> StoreResult<Vec<PipelineRecord>>;

    async fn list_records(&self) -> StoreResult<Vec<PipelineRecord>>;

    /// Most-recent-first.
    async fn history(&self, lead_id: Uuid) -> StoreResult<Vec<HistoryEntry>>;

    /// Every entry in commit order.
    async fn all_history(&self) -> StoreResult<Vec<HistoryEntry>>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn save_rule(&self, rule: &AutomationRule) -> StoreResult<()>;

    async fn get_rule(&self, id: Uuid) -> StoreResult<Option<AutomationRule>>;

    async fn list_rules(&self) -> StoreResult<Vec<AutomationRule>>;

    /// Flip `is_active` without touching the rest of the rule. Returns the
    /// updated rule, or `None` if it does not exist.
    async fn set_rule_active(
        &self,
        id: Uuid,
        active: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<AutomationRule>>;

    /// Bump the rule's execution counters.
    async fn record_outcome(&self, rule_id: Uuid, success: bool, at: DateTime<Utc>) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub rule_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or update. A terminal execution can no longer be overwritten.
    async fn save_execution(&self, execution: &AutomationExecution) -> StoreResult<()>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<AutomationExecution>>;

    /// Newest first.
    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<AutomationExecution>>;

    /// Executions of `rule_id` triggered at or after `since`, optionally for one entity.
    async fn count_executions(
        &self,
        rule_id: Uuid,
        entity_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<u64>;

    /// Delete terminal executions completed before `completed_before`.
    async fn purge_executions(&self, completed_before: DateTime<Utc>) -> StoreResult<u64>;
}
