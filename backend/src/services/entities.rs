//! Entity data access
//!
//! Lead data lives in the CRM. Automation reads entity snapshots for
//! conditions and writes single fields and follow-up tasks back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type Entity = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Entity {0} not found")]
    NotFound(Uuid),
    #[error("Invalid field '{0}'")]
    InvalidField(String),
    #[error("Entity backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub title: String,
    pub due_at: DateTime<Utc>,
    pub assignee: Option<String>,
    pub created_by_rule: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
}

#[async_trait]
pub trait EntityDataAccess: Send + Sync {
    async fn get_entity(&self, id: Uuid) -> Result<Entity, EntityError>;

    /// Set one top-level field, returning its previous value.
    async fn update_field(
        &self,
        id: Uuid,
        field: &str,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, EntityError>;

    async fn create_follow_up(&self, follow_up: FollowUp) -> Result<FollowUp, EntityError>;
}

/// Entity store kept in process memory
#[derive(Default)]
pub struct InMemoryEntities {
    entities: RwLock<HashMap<Uuid, Entity>>,
    follow_ups: RwLock<Vec<FollowUp>>,
}

impl InMemoryEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: Uuid, entity: Entity) {
        self.entities.write().await.insert(id, entity);
    }

    /// Merge `fields` into the entity, creating it if absent. Returns the
    /// fields whose value changed on an existing entity.
    pub async fn merge(&self, id: Uuid, fields: Entity) -> Vec<FieldChange> {
        let mut entities = self.entities.write().await;
        let existed = entities.contains_key(&id);
        let entity = entities.entry(id).or_default();

        let mut changes = Vec::new();
        for (field, value) in fields {
            let previous = entity.insert(field.clone(), value.clone());
            if existed && previous.as_ref() != Some(&value) {
                changes.push(FieldChange {
                    field,
                    old_value: previous,
                    new_value: value,
                });
            }
        }
        changes
    }

    pub async fn follow_ups_for(&self, entity_id: Uuid) -> Vec<FollowUp> {
        self.follow_ups
            .read()
            .await
            .iter()
            .filter(|f| f.entity_id == entity_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EntityDataAccess for InMemoryEntities {
    async fn get_entity(&self, id: Uuid) -> Result<Entity, EntityError> {
        self.entities
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EntityError::NotFound(id))
    }

    async fn update_field(
        &self,
        id: Uuid,
        field: &str,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, EntityError> {
        if field.trim().is_empty() {
            return Err(EntityError::InvalidField(field.to_string()));
        }
        let mut entities = self.entities.write().await;
        let entity = entities.get_mut(&id).ok_or(EntityError::NotFound(id))?;
        Ok(entity.insert(field.to_string(), value))
    }

    async fn create_follow_up(&self, follow_up: FollowUp) -> Result<FollowUp, EntityError> {
        if !self.entities.read().await.contains_key(&follow_up.entity_id) {
            return Err(EntityError::NotFound(follow_up.entity_id));
        }
        self.follow_ups.write().await.push(follow_up.clone());
        Ok(follow_up)
    }
}
