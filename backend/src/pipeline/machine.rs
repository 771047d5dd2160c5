// Pipeline State Machine - Owns one pipeline record per lead and applies registry-gated moves

use chrono::{NaiveDate, Utc};
use funnel_shared::{HistoryEntry, MILLIS_PER_DAY, PipelineMetrics, PipelineRecord, Stage, TransitionKind};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::metrics::pipeline_metrics;
use super::{RegistryError, StageRegistry};
use crate::automation::{EventChain, EventPublisher, EventSource, TriggerEvent};
use crate::store::{PipelineStore, StoreError};

/// Loss reason stored when a lead is lost without one.
pub const UNSPECIFIED_LOSS_REASON: &str = "unspecified";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transition from {from} to {to} is not allowed")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("No pipeline record for lead {0}")]
    RecordNotFound(Uuid),

    #[error("Transition from {from} to {to} requires approval")]
    ApprovalRequired { from: Stage, to: Stage },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// A request to move a lead to another stage
#[derive(Debug, Clone)]
pub struct StageMove {
    pub lead_id: Uuid,
    pub to_stage: Stage,
    pub actor: String,
    pub kind: TransitionKind,
    pub notes: Option<String>,
    pub loss_reason: Option<String>,
    pub approved_by: Option<String>,
    /// Reject the move unless the lead is still in this stage.
    pub expected_from: Option<Stage>,
    /// Chain of the event that caused this move, if any.
    pub chain: Option<EventChain>,
}

impl StageMove {
    pub fn new(lead_id: Uuid, to_stage: Stage, actor: &str, kind: TransitionKind) -> Self {
        Self {
            lead_id,
            to_stage,
            actor: actor.to_string(),
            kind,
            notes: None,
            loss_reason: None,
            approved_by: None,
            expected_from: None,
            chain: None,
        }
    }

    pub fn manual(lead_id: Uuid, to_stage: Stage, actor: &str) -> Self {
        Self::new(lead_id, to_stage, actor, TransitionKind::Manual)
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }

    pub fn with_loss_reason(mut self, reason: &str) -> Self {
        self.loss_reason = Some(reason.to_string());
        self
    }

    pub fn approved_by(mut self, approver: &str) -> Self {
        self.approved_by = Some(approver.to_string());
        self
    }

    pub fn expecting(mut self, stage: Stage) -> Self {
        self.expected_from = Some(stage);
        self
    }

    pub fn within_chain(mut self, chain: EventChain) -> Self {
        self.chain = Some(chain);
        self
    }
}

pub struct PipelineStateMachine {
    registry: Arc<StageRegistry>,
    store: Arc<dyn PipelineStore>,
    publisher: EventPublisher,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PipelineStateMachine {
    pub fn new(registry: Arc<StageRegistry>, store: Arc<dyn PipelineStore>, publisher: EventPublisher) -> Self {
        Self {
            registry,
            store,
            publisher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    async fn lead_lock(&self, lead_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(lead_id).or_default().clone()
    }

    /// Drop the lead's lock entry once no other caller holds or waits on it.
    async fn release_lead_lock(&self, lead_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(&lead_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&lead_id);
        }
    }

    /// Create the pipeline record for a lead. Returns the existing record if
    /// one is already present.
    pub async fn create(&self, lead_id: Uuid, owner: Option<String>) -> PipelineResult<PipelineRecord> {
        self.create_if_missing(lead_id, owner).await.map(|(record, _)| record)
    }

    /// Like `create`, also telling whether a new record was inserted.
    pub async fn create_if_missing(
        &self,
        lead_id: Uuid,
        owner: Option<String>,
    ) -> PipelineResult<(PipelineRecord, bool)> {
        let now = Utc::now();
        let record = PipelineRecord {
            id: Uuid::new_v4(),
            lead_id,
            current_stage: Stage::New,
            stage_entered_at: now,
            closed_at: None,
            won: None,
            loss_reason: None,
            probability_percent: self.registry.probability_for(Stage::New)?,
            expected_close_date: None,
            last_activity_at: now,
            assigned_owner: owner,
            created_at: now,
            updated_at: now,
        };
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            pipeline_id: record.id,
            lead_id,
            from_stage: None,
            to_stage: Stage::New,
            transition_kind: TransitionKind::Manual,
            duration_in_prior_stage_days: 0.0,
            actor: record.assigned_owner.clone().unwrap_or_else(|| "system".to_string()),
            notes: None,
            created_at: now,
        };

        let (record, inserted) = self.store.create_record(record, entry).await?;
        if inserted {
            info!("Created pipeline record {} for lead {}", record.id, lead_id);
            self.publisher.publish(TriggerEvent::entity_created(lead_id));
        } else {
            debug!("Pipeline record for lead {} already exists", lead_id);
        }

        Ok((record, inserted))
    }

    pub async fn get(&self, lead_id: Uuid) -> PipelineResult<PipelineRecord> {
        self.store
            .find_record(lead_id)
            .await?
            .ok_or(PipelineError::RecordNotFound(lead_id))
    }

    /// Apply a stage move. The record update and its history entry commit
    /// together; the StageChanged event is published only after the commit.
    pub async fn move_to_stage(&self, request: StageMove) -> PipelineResult<PipelineRecord> {
        let lead_id = request.lead_id;
        let lock = self.lead_lock(lead_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_move(request).await
        };
        self.release_lead_lock(lead_id, lock).await;
        result
    }

    async fn apply_move(&self, request: StageMove) -> PipelineResult<PipelineRecord> {
        let mut record = self.get(request.lead_id).await?;
        let from = record.current_stage;
        let to = request.to_stage;
        if request.expected_from.is_some_and(|expected| expected != from) {
            return Err(PipelineError::InvalidTransition { from, to });
        }

        let transition = match self.registry.get_transition(from, to) {
            Ok(t) if t.allowed => t,
            Ok(_) | Err(RegistryError::TransitionNotFound { .. }) => {
                return Err(PipelineError::InvalidTransition { from, to });
            }
            Err(e) => return Err(e.into()),
        };
        if transition.requires_approval && request.approved_by.is_none() {
            return Err(PipelineError::ApprovalRequired { from, to });
        }

        let probability = self.registry.probability_for(to)?;
        let now = Utc::now();
        let duration_days = (now - record.stage_entered_at).num_milliseconds() as f64 / MILLIS_PER_DAY;

        record.current_stage = to;
        record.stage_entered_at = now;
        record.probability_percent = probability;
        record.last_activity_at = now;
        record.updated_at = now;
        match to {
            Stage::Won => {
                record.closed_at = Some(now);
                record.won = Some(true);
                record.loss_reason = None;
            }
            Stage::Lost => {
                record.closed_at = Some(now);
                record.won = Some(false);
                record.loss_reason = Some(
                    request
                        .loss_reason
                        .clone()
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or_else(|| UNSPECIFIED_LOSS_REASON.to_string()),
                );
            }
            _ => {
                record.closed_at = None;
                record.won = None;
                record.loss_reason = None;
            }
        }

        let notes = match (&request.notes, &request.approved_by) {
            (Some(notes), Some(approver)) => Some(format!("{} (approved by {})", notes, approver)),
            (None, Some(approver)) => Some(format!("approved by {}", approver)),
            (notes, None) => notes.clone(),
        };
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            pipeline_id: record.id,
            lead_id: record.lead_id,
            from_stage: Some(from),
            to_stage: to,
            transition_kind: request.kind,
            duration_in_prior_stage_days: duration_days,
            actor: request.actor.clone(),
            notes,
            created_at: now,
        };

        self.store.commit_transition(&record, &entry).await?;

        info!(
            "Lead {} moved {} -> {} ({}) by {}",
            record.lead_id,
            from,
            to,
            request.kind.as_str(),
            request.actor
        );

        let chain = request.chain.map(|c| c.next()).unwrap_or_else(EventChain::root);
        let source = match request.kind {
            TransitionKind::Manual => EventSource::User(request.actor.clone()),
            TransitionKind::Automatic | TransitionKind::Scheduled => EventSource::System,
        };
        self.publisher.publish(
            TriggerEvent::stage_changed(record.lead_id, Some(from), to, request.kind, now)
                .with_chain(chain)
                .with_source(source),
        );

        Ok(record)
    }

    /// Most-recent-first.
    pub async fn get_history(&self, lead_id: Uuid) -> PipelineResult<Vec<HistoryEntry>> {
        Ok(self.store.history(lead_id).await?)
    }

    pub async fn assign_owner(&self, lead_id: Uuid, owner: Option<String>) -> PipelineResult<PipelineRecord> {
        self.update_fields(lead_id, |record| record.assigned_owner = owner).await
    }

    pub async fn set_expected_close_date(
        &self,
        lead_id: Uuid,
        date: Option<NaiveDate>,
    ) -> PipelineResult<PipelineRecord> {
        self.update_fields(lead_id, |record| record.expected_close_date = date).await
    }

    pub async fn touch_activity(&self, lead_id: Uuid) -> PipelineResult<PipelineRecord> {
        self.update_fields(lead_id, |_| {}).await
    }

    async fn update_fields<F>(&self, lead_id: Uuid, apply: F) -> PipelineResult<PipelineRecord>
    where
        F: FnOnce(&mut PipelineRecord),
    {
        let lock = self.lead_lock(lead_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.apply_fields(lead_id, apply).await
        };
        self.release_lead_lock(lead_id, lock).await;
        result
    }

    async fn apply_fields<F>(&self, lead_id: Uuid, apply: F) -> PipelineResult<PipelineRecord>
    where
        F: FnOnce(&mut PipelineRecord),
    {
        let mut record = self.get(lead_id).await?;
        apply(&mut record);
        let now = Utc::now();
        record.last_activity_at = now;
        record.updated_at = now;
        self.store.update_record(&record).await?;
        Ok(record)
    }

    pub async fn metrics(&self) -> PipelineResult<PipelineMetrics> {
        let records = self.store.list_records().await?;
        let history = self.store.all_history().await?;
        Ok(pipeline_metrics(&self.registry, &records, &history, Utc::now()))
    }
}
