// Collaborator services used by automation actions

pub mod delivery;
pub mod entities;

pub use delivery::{DeliveryError, DeliveryPayload, DeliveryService, LogDelivery, WebhookDelivery};
pub use entities::{Entity, EntityDataAccess, EntityError, FieldChange, FollowUp, InMemoryEntities};
