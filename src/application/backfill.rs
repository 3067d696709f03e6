use crate::application::error::SyncError;
use crate::application::handlers::write_record;
use crate::domain::normalizer::{normalize_graphql_order, normalize_graphql_product};
use crate::domain::records::{
    collections, tenant_key, BackfillKind, Fields, Record, SyncPhase, Tenant, TenantSyncState,
};
use crate::infrastructure::retry::RetryPolicy;
use crate::infrastructure::store::{get_record, DownstreamStore, StoreError};
use crate::infrastructure::upstream::{page_stream, UpstreamPager};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(500);

/// Seeds the downstream store from upstream history, once per tenant and kind.
#[derive(Clone)]
pub struct BackfillWalker {
    store: Arc<dyn DownstreamStore>,
    pager: Arc<dyn UpstreamPager>,
    retry: RetryPolicy,
    page_delay: Duration,
}

impl BackfillWalker {
    pub fn new(
        store: Arc<dyn DownstreamStore>,
        pager: Arc<dyn UpstreamPager>,
        retry: RetryPolicy,
        page_delay: Duration,
    ) -> Self {
        Self {
            store,
            pager,
            retry,
            page_delay,
        }
    }

    pub async fn sync_state(&self, tenant_id: &str) -> Result<TenantSyncState, SyncError> {
        let state = get_record::<TenantSyncState>(
            self.store.as_ref(),
            collections::TENANT_SYNC_STATE,
            &tenant_key(tenant_id),
        )
        .await?;
        Ok(state.unwrap_or_else(|| TenantSyncState::new(tenant_id)))
    }

    pub async fn load_tenant(&self, tenant_id: &str) -> Result<Tenant, SyncError> {
        get_record::<Tenant>(
            self.store.as_ref(),
            collections::TENANTS,
            &tenant_key(tenant_id),
        )
        .await?
        .ok_or_else(|| SyncError::TenantNotFound(tenant_id.to_string()))
    }

    /// Runs every backfill kind for the tenant and returns the total number
    /// of records written.
    pub async fn backfill_all(&self, tenant_id: &str) -> Result<usize, SyncError> {
        let tenant = self.load_tenant(tenant_id).await?;
        let mut written = 0;
        for kind in BackfillKind::ALL {
            written += self.backfill(&tenant, kind).await?;
        }
        Ok(written)
    }

    /// Imports all upstream pages of `kind`. Returns 0 without touching the
    /// upstream when the tenant's flag is already set. A paging failure
    /// propagates and leaves the flag unset; rerunning is safe since every
    /// write is an upsert.
    pub async fn backfill(&self, tenant: &Tenant, kind: BackfillKind) -> Result<usize, SyncError> {
        let tenant_id = tenant.tenant_id.as_str();

        if self.sync_state(tenant_id).await?.is_backfilled(kind) {
            info!(tenant_id, kind = %kind, "Backfill already complete, skipping");
            return Ok(0);
        }
        if !tenant.is_active {
            return Err(SyncError::TenantInactive(tenant_id.to_string()));
        }

        info!(tenant_id, kind = %kind, "Starting backfill");
        self.mark(tenant_id, kind, SyncPhase::InProgress, false)
            .await?;

        let mut pages = page_stream(self.pager.clone(), tenant.clone(), kind, None);
        let mut written = 0;
        let mut page_number = 0;

        while let Some(page) = pages.next().await {
            let page = page?;
            page_number += 1;

            for item in &page.items {
                written += self.import(tenant_id, kind, item).await;
            }
            info!(
                tenant_id,
                kind = %kind,
                page = page_number,
                items = page.items.len(),
                written,
                "Backfill page imported"
            );

            if page.has_more {
                tokio::time::sleep(self.page_delay).await;
            }
        }

        self.mark(tenant_id, kind, SyncPhase::Complete, true).await?;
        info!(tenant_id, kind = %kind, written, "Backfill complete");
        Ok(written)
    }

    async fn mark(
        &self,
        tenant_id: &str,
        kind: BackfillKind,
        phase: SyncPhase,
        backfilled: bool,
    ) -> Result<(), StoreError> {
        let key = tenant_key(tenant_id);
        let mut fields = Fields::new();
        fields.insert("tenant_id".to_string(), Value::from(tenant_id));
        fields.insert(kind.flag_field().to_string(), Value::Bool(backfilled));
        fields.insert(kind.phase_field().to_string(), Value::from(phase.as_str()));
        self.retry
            .run("tenant_sync_state", || {
                self.store
                    .upsert(TenantSyncState::COLLECTION, &key, fields.clone())
            })
            .await
    }

    /// Writes every record derived from one upstream node. Returns how many
    /// writes succeeded; malformed nodes and failed writes are skipped.
    async fn import(&self, tenant_id: &str, kind: BackfillKind, node: &Value) -> usize {
        let store = self.store.as_ref();
        let mut outcomes = Vec::new();

        match kind {
            BackfillKind::Inventory => match normalize_graphql_product(tenant_id, node) {
                Ok(product) => {
                    for variant in &product.variants {
                        outcomes.push(write_record(store, &self.retry, variant).await);
                    }
                    for level in &product.inventory {
                        outcomes.push(write_record(store, &self.retry, level).await);
                    }
                }
                Err(e) => warn!(tenant_id, "Skipping malformed product node: {}", e),
            },
            BackfillKind::Fulfillments => match normalize_graphql_order(tenant_id, node) {
                Ok(order) => {
                    outcomes.push(write_record(store, &self.retry, &order.order).await);
                    for line in &order.line_items {
                        outcomes.push(write_record(store, &self.retry, line).await);
                    }
                    for fulfillment in &order.fulfillments {
                        outcomes.push(write_record(store, &self.retry, fulfillment).await);
                    }
                }
                Err(e) => warn!(tenant_id, "Skipping malformed order node: {}", e),
            },
        }

        outcomes
            .into_iter()
            .filter(|outcome| match outcome {
                Ok(()) => true,
                Err(e) => {
                    warn!(tenant_id, kind = %kind, "Skipping record after failed write: {}", e);
                    false
                }
            })
            .count()
    }
}
