//! Delivery capability
//!
//! Opaque outbound messaging used by notify actions. The concrete provider
//! sits behind a webhook; without one, deliveries are only logged.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Provider rejected delivery: {0}")]
    Rejected(String),
}

/// Message handed to the provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryPayload {
    pub message: String,
    pub channel: Option<String>,
    pub entity_id: uuid::Uuid,
    pub rule_id: uuid::Uuid,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn send(&self, target: &str, payload: &DeliveryPayload) -> Result<(), DeliveryError>;
}

/// Logs deliveries instead of sending them.
#[derive(Default)]
pub struct LogDelivery;

#[async_trait]
impl DeliveryService for LogDelivery {
    async fn send(&self, target: &str, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        info!(
            "Delivery to {} via {}: {}",
            target,
            payload.channel.as_deref().unwrap_or("default"),
            payload.message
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    target: &'a str,
    #[serde(flatten)]
    payload: &'a DeliveryPayload,
}

/// Posts each delivery as JSON to a provider webhook
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl DeliveryService for WebhookDelivery {
    async fn send(&self, target: &str, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookBody { target, payload })
            .send()
            .await
            .map_err(|e| DeliveryError::RequestFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected(format!("Status: {}, Body: {}", status, body)))
        }
    }
}
