use crate::domain::events::Event;
use crate::domain::records::{collections, BusinessKey, Fields, Record};
use crate::infrastructure::store::{DownstreamStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// One received webhook. Appended before processing and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub topic: String,
    pub payload: String,
    pub processed: bool,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn received(event: &Event) -> Self {
        Self {
            event_id: event.id,
            tenant_id: event.tenant_id.clone(),
            topic: event.topic.to_string(),
            payload: event.payload_text(),
            processed: false,
            error: None,
            received_at: event.received_at,
        }
    }
}

impl Record for AuditRecord {
    const COLLECTION: &'static str = collections::WEBHOOK_EVENTS;

    fn key(&self) -> BusinessKey {
        BusinessKey::new([self.event_id.to_string()])
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), StoreError>;

    async fn record_outcome(
        &self,
        event_id: Uuid,
        processed: bool,
        error: Option<String>,
    ) -> Result<(), StoreError>;
}

/// Audit log kept in the `webhook_events` collection of the downstream store.
pub struct StoreAuditLog {
    store: Arc<dyn DownstreamStore>,
}

impl StoreAuditLog {
    pub fn new(store: Arc<dyn DownstreamStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<(), StoreError> {
        // An event id that is already recorded keeps its first record.
        self.store
            .conditional_insert(AuditRecord::COLLECTION, &record.key(), record.to_fields()?)
            .await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        event_id: Uuid,
        processed: bool,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut fields = Fields::new();
        fields.insert("processed".to_string(), Value::Bool(processed));
        fields.insert(
            "error".to_string(),
            error.map(Value::String).unwrap_or(Value::Null),
        );
        fields.insert(
            "processed_at".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        self.store
            .upsert(
                collections::WEBHOOK_EVENTS,
                &BusinessKey::new([event_id.to_string()]),
                fields,
            )
            .await
    }
}
