use crate::application::backorder::BackorderCounter;
use crate::application::error::SyncError;
use crate::domain::events::Event;
use crate::domain::normalizer::{
    normalize_fulfillment, normalize_inventory_level, normalize_order, normalize_product,
    NormalizedOrder,
};
use crate::domain::records::{
    collections, order_key, tenant_key, Fields, Record,
};
use crate::infrastructure::retry::RetryPolicy;
use crate::infrastructure::store::{upsert_record, DownstreamStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Handles one topic family. Implementations must tolerate redelivery and
/// reordering: every write is an upsert by business key.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), SyncError>;
}

/// Upserts one record through the retrier.
pub async fn write_record<R: Record + Sync>(
    store: &dyn DownstreamStore,
    retry: &RetryPolicy,
    record: &R,
) -> Result<(), StoreError> {
    retry
        .run(R::COLLECTION, || upsert_record(store, record))
        .await
}

pub struct OrderHandler {
    store: Arc<dyn DownstreamStore>,
    retry: RetryPolicy,
    backorders: BackorderCounter,
}

impl OrderHandler {
    pub fn new(
        store: Arc<dyn DownstreamStore>,
        retry: RetryPolicy,
        backorders: BackorderCounter,
    ) -> Self {
        Self {
            store,
            retry,
            backorders,
        }
    }

    async fn persist(&self, normalized: &NormalizedOrder) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        write_record(store, &self.retry, &normalized.order).await?;
        for line in &normalized.line_items {
            write_record(store, &self.retry, line).await?;
        }
        for fulfillment in &normalized.fulfillments {
            write_record(store, &self.retry, fulfillment).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TopicHandler for OrderHandler {
    async fn handle(&self, event: &Event) -> Result<(), SyncError> {
        let payload = event.payload_json()?;
        let normalized = normalize_order(&event.tenant_id, &payload)?;
        let order_id = normalized.order.order_id.clone();

        let persisted = self.persist(&normalized).await;

        // Runs even when persistence failed; backorder accounting only reads
        // catalog and inventory state.
        let outcome = self
            .backorders
            .process_order_lines(&event.tenant_id, &order_id, &normalized.line_items)
            .await;
        debug!(order_id = %order_id, ?outcome, "Backorder pass finished");

        persisted?;
        info!(
            tenant_id = %event.tenant_id,
            order_id = %order_id,
            payment_status = ?normalized.order.payment_status,
            line_items = normalized.line_items.len(),
            "Order synced"
        );
        Ok(())
    }
}

pub struct InventoryLevelHandler {
    store: Arc<dyn DownstreamStore>,
    retry: RetryPolicy,
}

impl InventoryLevelHandler {
    pub fn new(store: Arc<dyn DownstreamStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl TopicHandler for InventoryLevelHandler {
    async fn handle(&self, event: &Event) -> Result<(), SyncError> {
        let payload = event.payload_json()?;
        let record = normalize_inventory_level(&event.tenant_id, &payload)?;

        // Inventory converges on the next level event, so a failed write is
        // not worth surfacing.
        match write_record(self.store.as_ref(), &self.retry, &record).await {
            Ok(()) => info!(
                tenant_id = %event.tenant_id,
                inventory_item_id = %record.inventory_item_id,
                location_id = %record.location_id,
                quantity = record.quantity,
                "Inventory level synced"
            ),
            Err(e) => error!(
                tenant_id = %event.tenant_id,
                inventory_item_id = %record.inventory_item_id,
                "Inventory sync failed, dropping update: {}",
                e
            ),
        }
        Ok(())
    }
}

pub struct FulfillmentHandler {
    store: Arc<dyn DownstreamStore>,
    retry: RetryPolicy,
}

impl FulfillmentHandler {
    pub fn new(store: Arc<dyn DownstreamStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl TopicHandler for FulfillmentHandler {
    async fn handle(&self, event: &Event) -> Result<(), SyncError> {
        let payload = event.payload_json()?;
        let record = normalize_fulfillment(&event.tenant_id, &payload)?;
        write_record(self.store.as_ref(), &self.retry, &record).await?;

        let key = order_key(&event.tenant_id, &record.order_id);
        let mut fields = Fields::new();
        fields.insert("tenant_id".to_string(), Value::from(event.tenant_id.as_str()));
        fields.insert("order_id".to_string(), Value::from(record.order_id.as_str()));
        fields.insert("fulfillment_status".to_string(), Value::from("fulfilled"));
        self.retry
            .run("order_fulfillment_status", || {
                self.store.upsert(collections::ORDERS, &key, fields.clone())
            })
            .await?;

        info!(
            tenant_id = %event.tenant_id,
            order_id = %record.order_id,
            fulfillment_id = %record.fulfillment_id,
            carrier = %record.carrier,
            "Fulfillment synced"
        );
        Ok(())
    }
}

pub struct ProductHandler {
    store: Arc<dyn DownstreamStore>,
    retry: RetryPolicy,
}

impl ProductHandler {
    pub fn new(store: Arc<dyn DownstreamStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl TopicHandler for ProductHandler {
    async fn handle(&self, event: &Event) -> Result<(), SyncError> {
        let payload = event.payload_json()?;
        let product = normalize_product(&event.tenant_id, &payload)?;
        for variant in &product.variants {
            write_record(self.store.as_ref(), &self.retry, variant).await?;
        }
        info!(
            tenant_id = %event.tenant_id,
            variants = product.variants.len(),
            "Product catalog synced"
        );
        Ok(())
    }
}

/// Marks the tenant inactive; the install flow owns everything else.
pub struct UninstallHandler {
    store: Arc<dyn DownstreamStore>,
    retry: RetryPolicy,
}

impl UninstallHandler {
    pub fn new(store: Arc<dyn DownstreamStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl TopicHandler for UninstallHandler {
    async fn handle(&self, event: &Event) -> Result<(), SyncError> {
        let key = tenant_key(&event.tenant_id);
        let mut fields = Fields::new();
        fields.insert("tenant_id".to_string(), Value::from(event.tenant_id.as_str()));
        fields.insert("is_active".to_string(), Value::Bool(false));
        fields.insert(
            "uninstalled_at".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
        self.retry
            .run("tenant_uninstall", || {
                self.store.upsert(collections::TENANTS, &key, fields.clone())
            })
            .await?;

        info!(tenant_id = %event.tenant_id, "Tenant marked inactive after uninstall");
        Ok(())
    }
}
