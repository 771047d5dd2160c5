use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

use super::fixtures::LeadFixture;
use crate::AppState;
use crate::Stores;
use crate::automation::AutomationExecution;
use crate::config::AutomationConfig;
use crate::handlers;
use crate::pipeline::StageRegistry;
use crate::services::{DeliveryError, DeliveryPayload, DeliveryService, InMemoryEntities};
use crate::store::{ExecutionFilter, InMemoryStore};

/// Delivery double that records every send and can be told to reject targets.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<(String, DeliveryPayload)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_for(&self, target: &str) {
        self.failing.lock().await.insert(target.to_string());
    }

    pub async fn sent(&self) -> Vec<(String, DeliveryPayload)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryService for RecordingDelivery {
    async fn send(&self, target: &str, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        if self.failing.lock().await.contains(target) {
            return Err(DeliveryError::Rejected(format!("{} is unreachable", target)));
        }
        self.sent.lock().await.push((target.to_string(), payload.clone()));
        Ok(())
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub entities: Arc<InMemoryEntities>,
    pub delivery: Arc<RecordingDelivery>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(AutomationConfig {
            workers: 4,
            max_chain_depth: 3,
            action_timeout_secs: 5,
        })
        .await
    }

    pub async fn with_config(config: AutomationConfig) -> Self {
        Self::with_stores(config, Stores::in_memory()).await
    }

    /// App backed by `store`, so a test can reach past the engine into it.
    pub async fn with_memory_store(store: Arc<InMemoryStore>) -> Self {
        let stores = Stores {
            pipeline: store.clone(),
            rules: store.clone(),
            executions: store,
        };
        Self::with_stores(
            AutomationConfig {
                workers: 2,
                max_chain_depth: 3,
                action_timeout_secs: 5,
            },
            stores,
        )
        .await
    }

    pub async fn with_stores(config: AutomationConfig, stores: Stores) -> Self {
        let entities = Arc::new(InMemoryEntities::new());
        let delivery = RecordingDelivery::new();
        let state = AppState::build(
            &config,
            StageRegistry::sales_default(),
            stores,
            entities.clone(),
            delivery.clone(),
        )
        .await
        .expect("Failed to build app state");

        Self {
            state: Arc::new(state),
            entities,
            delivery,
        }
    }

    pub fn router(&self) -> Router {
        handlers::api_router(self.state.clone())
    }

    /// Store the lead's CRM snapshot and open its pipeline record.
    pub async fn add_lead(&self, lead: &LeadFixture) {
        self.entities.insert(lead.id, lead.to_entity()).await;
        self.state
            .pipeline
            .create(lead.id, Some(lead.owner.clone()))
            .await
            .expect("Failed to create pipeline record");
    }

    /// Wait until every triggered execution has finished.
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.state.drain())
            .await
            .expect("automation did not settle");
    }

    pub async fn executions_for(&self, rule_id: Uuid) -> Vec<AutomationExecution> {
        self.state
            .engine
            .list_executions(&ExecutionFilter {
                rule_id: Some(rule_id),
                ..Default::default()
            })
            .await
            .expect("Failed to list executions")
    }
}

pub async fn send_json(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}
