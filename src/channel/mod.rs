//! Event channel: the durable exchange/queue carrying "file created" events
//! from the ingestion service to the notification consumer.
//!
//! Delivery is at-most-once. A message leaves the queue the moment it is handed
//! to a subscriber, before any handler runs, and is never redelivered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config;
use crate::model::DeliveryEvent;

pub mod sqlite;

pub use sqlite::SqliteBroker;

pub const DEFAULT_EXCHANGE: &str = "user-uploaded-file";
pub const DEFAULT_QUEUE: &str = "user-uploaded-file-created-queue";
pub const DEFAULT_ROUTING_KEY: &str = "user-uploaded-file.event.created";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("broker database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("broker migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to open broker: {0:#}")]
    Open(anyhow::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message {delivery_tag} has a corrupt message id {message_id:?}: {source}")]
    CorruptMessageId {
        delivery_tag: i64,
        message_id: String,
        #[source]
        source: uuid::Error,
    },
    #[error("exchange {0} is not declared")]
    UnknownExchange(String),
    #[error("broker is closed")]
    Closed,
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Exchange, queue and the binding between them. Declared once before any
/// traffic flows; declaring again is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
        }
    }
}

impl From<&config::Broker> for Topology {
    fn from(cfg: &config::Broker) -> Self {
        Self {
            exchange: cfg.exchange.clone(),
            queue: cfg.queue.clone(),
            routing_key: cfg.routing_key.clone(),
        }
    }
}

/// A raw message handed to a subscriber. Already acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: i64,
    pub message_id: Uuid,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// Infinite stream of deliveries for one subscription. It ends only when the
/// broker is closed or dropped.
pub type Deliveries = BoxStream<'static, Delivery>;

#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Encode and enqueue one event. Returning `Ok` means the broker accepted
    /// the message; there is no confirmation that a consumer will see it.
    async fn publish(&self, event: &DeliveryEvent) -> Result<(), ChannelError>;

    /// Attach a subscriber to the queue with auto-acknowledgment.
    async fn subscribe(&self) -> Result<Deliveries, ChannelError>;
}
