use crate::domain::records::{
    collections, line_item_key, order_key, variant_key, Fields, LineItemRecord,
};
use crate::infrastructure::lock::BackorderLock;
use crate::infrastructure::retry::RetryPolicy;
use crate::infrastructure::store::{DownstreamStore, StoreError};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackorderOutcome {
    /// Another delivery of the same order holds the lock.
    Skipped,
    Processed { incremented: usize },
}

/// Increments the shared per-variant `back_orders` counter for order lines
/// that cannot be served from stock.
#[derive(Clone)]
pub struct BackorderCounter {
    store: Arc<dyn DownstreamStore>,
    lock: BackorderLock,
    retry: RetryPolicy,
    ttl: Duration,
}

impl BackorderCounter {
    pub fn new(
        store: Arc<dyn DownstreamStore>,
        lock: BackorderLock,
        retry: RetryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            lock,
            retry,
            ttl,
        }
    }

    /// Never fails: lock and per-line errors are logged and skipped.
    pub async fn process_order_lines(
        &self,
        tenant_id: &str,
        order_id: &str,
        lines: &[LineItemRecord],
    ) -> BackorderOutcome {
        let lock_key = order_key(tenant_id, order_id);

        let result = self
            .lock
            .with_lock(&lock_key, self.ttl, || async {
                let mut incremented = 0;
                for line in lines {
                    match self.process_line(tenant_id, order_id, line).await {
                        Ok(true) => incremented += 1,
                        Ok(false) => {}
                        Err(e) => error!(
                            tenant_id,
                            order_id,
                            line_item_id = %line.line_item_id,
                            "Backorder update failed for line: {}",
                            e
                        ),
                    }
                }
                incremented
            })
            .await;

        match result {
            Ok(Some(incremented)) => {
                if incremented > 0 {
                    info!(tenant_id, order_id, incremented, "Backorders recorded");
                }
                BackorderOutcome::Processed { incremented }
            }
            Ok(None) => {
                info!(
                    tenant_id,
                    order_id, "Backorder lock held by another delivery, skipping"
                );
                BackorderOutcome::Skipped
            }
            Err(e) => {
                error!(tenant_id, order_id, "Could not take backorder lock: {}", e);
                BackorderOutcome::Skipped
            }
        }
    }

    /// Returns whether the variant's counter was incremented for `line`.
    async fn process_line(
        &self,
        tenant_id: &str,
        order_id: &str,
        line: &LineItemRecord,
    ) -> Result<bool, StoreError> {
        let Some(variant_id) = line.variant_id.as_deref() else {
            return Ok(false);
        };

        let ledger_key = line_item_key(tenant_id, order_id, &line.line_item_id);
        let counted = self
            .retry
            .run("backorder_ledger_get", || {
                self.store.get(collections::BACKORDER_LEDGER, &ledger_key)
            })
            .await?;
        if counted.is_some() {
            debug!(tenant_id, order_id, line_item_id = %line.line_item_id, "Line already counted");
            return Ok(false);
        }

        let variant_key = variant_key(tenant_id, variant_id);
        let Some(variant) = self
            .retry
            .run("variant_get", || {
                self.store.get(collections::VARIANTS, &variant_key)
            })
            .await?
        else {
            debug!(tenant_id, variant_id, "Unknown variant, skipping backorder check");
            return Ok(false);
        };

        let Some(inventory_item_id) = variant
            .get("inventory_item_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            debug!(tenant_id, variant_id, "Variant is not stock tracked");
            return Ok(false);
        };

        let available = self.available(tenant_id, &inventory_item_id).await?;
        if available >= 1 {
            return Ok(false);
        }

        let back_orders = self
            .retry
            .run("back_orders_increment", || {
                self.store
                    .increment(collections::VARIANTS, &variant_key, "back_orders", 1)
            })
            .await?;
        debug!(tenant_id, variant_id, back_orders, "Backorder counted");

        let mut entry = Fields::new();
        entry.insert("tenant_id".to_string(), Value::from(tenant_id));
        entry.insert("order_id".to_string(), Value::from(order_id));
        entry.insert(
            "line_item_id".to_string(),
            Value::from(line.line_item_id.as_str()),
        );
        entry.insert("variant_id".to_string(), Value::from(variant_id));
        entry.insert(
            "counted_at".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
        if let Err(e) = self
            .retry
            .run("backorder_ledger_put", || {
                self.store
                    .upsert(collections::BACKORDER_LEDGER, &ledger_key, entry.clone())
            })
            .await
        {
            warn!(
                tenant_id,
                order_id,
                line_item_id = %line.line_item_id,
                "Counter incremented but ledger write failed, a redelivery may count again: {}",
                e
            );
        }

        Ok(true)
    }

    /// Sum of `quantity` across every location of the inventory item.
    async fn available(&self, tenant_id: &str, inventory_item_id: &str) -> Result<i64, StoreError> {
        let mut filter = Fields::new();
        filter.insert("tenant_id".to_string(), Value::from(tenant_id));
        filter.insert(
            "inventory_item_id".to_string(),
            Value::from(inventory_item_id),
        );

        let levels = self
            .retry
            .run("inventory_query", || {
                self.store.query(collections::INVENTORY, &filter)
            })
            .await?;

        Ok(levels
            .iter()
            .filter_map(|doc| doc.fields.get("quantity").and_then(Value::as_i64))
            .sum())
    }
}
