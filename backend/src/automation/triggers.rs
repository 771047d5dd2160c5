// Automation Triggers - Domain events and the rule triggers that listen for them

use chrono::{DateTime, Utc};
use funnel_shared::{Stage, TransitionKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Event families a rule can listen for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    StageChange,
    FieldUpdate,
    TimeBased,
    EntityCreated,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageChange => "stage_change",
            Self::FieldUpdate => "field_update",
            Self::TimeBased => "time_based",
            Self::EntityCreated => "entity_created",
            Self::Manual => "manual",
        }
    }
}

/// A rule's trigger together with its trigger-specific predicate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    StageChange {
        #[serde(default)]
        from: Option<Stage>,
        #[serde(default)]
        to: Option<Stage>,
    },
    FieldUpdate {
        field: String,
    },
    /// Cron expression with a seconds field, e.g. `0 0 9 * * *`.
    TimeBased {
        schedule: String,
        #[serde(default)]
        stage: Option<Stage>,
    },
    EntityCreated,
    Manual,
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::StageChange { .. } => TriggerType::StageChange,
            Self::FieldUpdate { .. } => TriggerType::FieldUpdate,
            Self::TimeBased { .. } => TriggerType::TimeBased,
            Self::EntityCreated => TriggerType::EntityCreated,
            Self::Manual => TriggerType::Manual,
        }
    }

    /// Whether `event` fires the rule identified by `rule_id`.
    pub fn matches(&self, rule_id: Uuid, event: &TriggerEvent) -> bool {
        match (self, &event.kind) {
            (
                Self::StageChange { from, to },
                EventKind::StageChanged {
                    from_stage,
                    to_stage,
                    ..
                },
            ) => {
                let from_ok = match from {
                    Some(expected) => from_stage.as_ref() == Some(expected),
                    None => true,
                };
                let to_ok = to.map(|expected| expected == *to_stage).unwrap_or(true);
                from_ok && to_ok
            }
            (Self::FieldUpdate { field }, EventKind::FieldUpdated { field: changed, .. }) => {
                field == changed
            }
            (Self::TimeBased { .. }, EventKind::TimeTick { rule_id: target }) => *target == rule_id,
            (Self::EntityCreated, EventKind::EntityCreated) => true,
            (Self::Manual, EventKind::Manual { rule_id: target, .. }) => *target == rule_id,
            _ => false,
        }
    }
}

/// Tracks how an event descends from an earlier one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventChain {
    pub correlation_id: Uuid,
    pub depth: u32,
}

impl EventChain {
    pub fn root() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            depth: 0,
        }
    }

    /// Chain for an event produced while handling an event of this chain.
    pub fn next(&self) -> Self {
        Self {
            correlation_id: self.correlation_id,
            depth: self.depth + 1,
        }
    }
}

/// Source of the trigger event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", content = "id", rename_all = "snake_case")]
pub enum EventSource {
    System,
    User(String),
    Automation(Uuid),
    Scheduler,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StageChanged {
        from_stage: Option<Stage>,
        to_stage: Stage,
        transition_kind: TransitionKind,
    },
    FieldUpdated {
        field: String,
        old_value: Option<serde_json::Value>,
        new_value: serde_json::Value,
    },
    TimeTick {
        rule_id: Uuid,
    },
    EntityCreated,
    Manual {
        rule_id: Uuid,
        requested_by: String,
    },
}

/// A domain event that can initiate rule executions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerEvent {
    pub event_id: Uuid,
    pub entity_id: Uuid,
    pub kind: EventKind,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    pub chain: EventChain,
}

impl TriggerEvent {
    pub fn new(entity_id: Uuid, kind: EventKind, source: EventSource) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_id,
            kind,
            source,
            timestamp: Utc::now(),
            chain: EventChain::root(),
        }
    }

    pub fn stage_changed(
        lead_id: Uuid,
        from_stage: Option<Stage>,
        to_stage: Stage,
        transition_kind: TransitionKind,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::new(
            lead_id,
            EventKind::StageChanged {
                from_stage,
                to_stage,
                transition_kind,
            },
            EventSource::System,
        );
        event.timestamp = timestamp;
        event
    }

    pub fn entity_created(lead_id: Uuid) -> Self {
        Self::new(lead_id, EventKind::EntityCreated, EventSource::System)
    }

    pub fn field_updated(
        entity_id: Uuid,
        field: &str,
        old_value: Option<serde_json::Value>,
        new_value: serde_json::Value,
    ) -> Self {
        Self::new(
            entity_id,
            EventKind::FieldUpdated {
                field: field.to_string(),
                old_value,
                new_value,
            },
            EventSource::System,
        )
    }

    pub fn time_tick(rule_id: Uuid, entity_id: Uuid) -> Self {
        Self::new(entity_id, EventKind::TimeTick { rule_id }, EventSource::Scheduler)
    }

    pub fn manual(rule_id: Uuid, entity_id: Uuid, requested_by: &str) -> Self {
        Self::new(
            entity_id,
            EventKind::Manual {
                rule_id,
                requested_by: requested_by.to_string(),
            },
            EventSource::User(requested_by.to_string()),
        )
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self.kind {
            EventKind::StageChanged { .. } => TriggerType::StageChange,
            EventKind::FieldUpdated { .. } => TriggerType::FieldUpdate,
            EventKind::TimeTick { .. } => TriggerType::TimeBased,
            EventKind::EntityCreated => TriggerType::EntityCreated,
            EventKind::Manual { .. } => TriggerType::Manual,
        }
    }

    pub fn with_chain(mut self, chain: EventChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    /// JSON view used for condition contexts and templates.
    pub fn payload(&self) -> serde_json::Value {
        let mut payload = serde_json::to_value(&self.kind).unwrap_or(serde_json::Value::Null);
        if let Some(map) = payload.as_object_mut() {
            map.insert("event_id".into(), serde_json::json!(self.event_id));
            map.insert("entity_id".into(), serde_json::json!(self.entity_id));
            map.insert("timestamp".into(), serde_json::json!(self.timestamp.to_rfc3339()));
            map.insert("depth".into(), serde_json::json!(self.chain.depth));
        }
        payload
    }
}

/// Sending half of the domain event stream.
///
/// Counts events that have been published but not yet acknowledged by the
/// dispatcher, so callers can tell when the automation pipeline is quiet.
#[derive(Clone)]
pub struct EventPublisher {
    tx: Option<mpsc::UnboundedSender<TriggerEvent>>,
    in_flight: Arc<AtomicUsize>,
    published: Arc<AtomicU64>,
}

pub struct EventSubscriber {
    rx: mpsc::UnboundedReceiver<TriggerEvent>,
    in_flight: Arc<AtomicUsize>,
}

impl EventPublisher {
    pub fn channel() -> (Self, EventSubscriber) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx: Some(tx),
                in_flight: in_flight.clone(),
                published: Arc::new(AtomicU64::new(0)),
            },
            EventSubscriber { rx, in_flight },
        )
    }

    /// A publisher that drops every event.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn publish(&self, event: TriggerEvent) {
        let Some(tx) = &self.tx else {
            return;
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.published.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = tx.send(event) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("Dropping event {}: dispatcher has stopped", e.0.event_id);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total events ever published. Only grows.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl EventSubscriber {
    pub async fn recv(&mut self) -> Option<TriggerEvent> {
        self.rx.recv().await
    }

    /// Marks one received event as fully dispatched.
    pub fn ack(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
