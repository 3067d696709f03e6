use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Flat field map persisted per document.
pub type Fields = serde_json::Map<String, Value>;

/// Collection names used in the downstream store.
pub mod collections {
    pub const ORDERS: &str = "orders";
    pub const LINE_ITEMS: &str = "line_items";
    pub const INVENTORY: &str = "inventory";
    pub const FULFILLMENTS: &str = "fulfillments";
    pub const VARIANTS: &str = "variants";
    pub const BACKORDER_LOCKS: &str = "backorder_locks";
    pub const BACKORDER_LEDGER: &str = "backorder_ledger";
    pub const TENANT_SYNC_STATE: &str = "tenant_sync_state";
    pub const TENANTS: &str = "tenants";
    pub const WEBHOOK_EVENTS: &str = "webhook_events";
}

/// Natural key of a record, rendered as `:`-joined upstream identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessKey(String);

impl BusinessKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .map(|part| part.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self(joined)
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn order_key(tenant_id: &str, order_id: &str) -> BusinessKey {
    BusinessKey::new([tenant_id, order_id])
}

pub fn line_item_key(tenant_id: &str, order_id: &str, line_item_id: &str) -> BusinessKey {
    BusinessKey::new([tenant_id, order_id, line_item_id])
}

pub fn variant_key(tenant_id: &str, variant_id: &str) -> BusinessKey {
    BusinessKey::new([tenant_id, variant_id])
}

pub fn tenant_key(tenant_id: &str) -> BusinessKey {
    BusinessKey::new([tenant_id])
}

/// A canonical record that can be upserted by business key.
pub trait Record: Serialize {
    const COLLECTION: &'static str;

    fn key(&self) -> BusinessKey;

    fn to_fields(&self) -> Result<Fields, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => {
                let mut map = Fields::new();
                map.insert("value".to_string(), other);
                Ok(map)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    AwaitingPayment,
}

impl PaymentStatus {
    /// Collapses the upstream financial status into what SLA logic keys off.
    pub fn from_financial_status(financial_status: &str) -> Self {
        match financial_status.trim().to_ascii_lowercase().as_str() {
            "paid" | "partially_paid" | "authorized" => PaymentStatus::Paid,
            _ => PaymentStatus::AwaitingPayment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub tenant_id: String,
    pub order_id: String,
    pub order_number: String,
    pub financial_status: String,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: String,
    pub total_price: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    pub line_items_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Record for OrderRecord {
    const COLLECTION: &'static str = collections::ORDERS;

    fn key(&self) -> BusinessKey {
        order_key(&self.tenant_id, &self.order_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItemRecord {
    pub tenant_id: String,
    pub order_id: String,
    pub line_item_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub product_title: String,
    pub variant_title: String,
    pub sku: String,
    pub quantity: i64,
    pub price: String,
    pub total: String,
}

impl Record for LineItemRecord {
    const COLLECTION: &'static str = collections::LINE_ITEMS;

    fn key(&self) -> BusinessKey {
        line_item_key(&self.tenant_id, &self.order_id, &self.line_item_id)
    }
}

/// Absolute stock level of one inventory item at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub tenant_id: String,
    pub inventory_item_id: String,
    pub location_id: String,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Record for InventoryRecord {
    const COLLECTION: &'static str = collections::INVENTORY;

    fn key(&self) -> BusinessKey {
        BusinessKey::new([
            self.tenant_id.as_str(),
            self.inventory_item_id.as_str(),
            self.location_id.as_str(),
        ])
    }
}

pub const MANUAL_CARRIER: &str = "Manual";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfillmentRecord {
    pub tenant_id: String,
    pub order_id: String,
    pub fulfillment_id: String,
    pub carrier: String,
    pub tracking_number: Option<String>,
    pub tracking_url: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipped_at: Option<String>,
}

impl Record for FulfillmentRecord {
    const COLLECTION: &'static str = collections::FULFILLMENTS;

    fn key(&self) -> BusinessKey {
        BusinessKey::new([
            self.tenant_id.as_str(),
            self.order_id.as_str(),
            self.fulfillment_id.as_str(),
        ])
    }
}

/// Catalog view of a variant. The `back_orders` counter lives on the same
/// document but is only ever written by the backorder counter, so it is not
/// part of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub tenant_id: String,
    pub variant_id: String,
    pub product_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_item_id: Option<String>,
    pub product_title: String,
    pub variant_title: String,
    pub sku: String,
}

impl Record for VariantRecord {
    const COLLECTION: &'static str = collections::VARIANTS;

    fn key(&self) -> BusinessKey {
        variant_key(&self.tenant_id, &self.variant_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillKind {
    Inventory,
    Fulfillments,
}

impl BackfillKind {
    pub const ALL: [BackfillKind; 2] = [BackfillKind::Inventory, BackfillKind::Fulfillments];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillKind::Inventory => "inventory",
            BackfillKind::Fulfillments => "fulfillments",
        }
    }

    pub fn flag_field(&self) -> &'static str {
        match self {
            BackfillKind::Inventory => "inventory_backfilled",
            BackfillKind::Fulfillments => "fulfillments_backfilled",
        }
    }

    pub fn phase_field(&self) -> &'static str {
        match self {
            BackfillKind::Inventory => "inventory_phase",
            BackfillKind::Fulfillments => "fulfillments_phase",
        }
    }
}

impl fmt::Display for BackfillKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::NotStarted => "not_started",
            SyncPhase::InProgress => "in_progress",
            SyncPhase::Complete => "complete",
        }
    }
}

/// Per-tenant backfill bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSyncState {
    pub tenant_id: String,
    pub inventory_backfilled: bool,
    pub fulfillments_backfilled: bool,
    pub inventory_phase: SyncPhase,
    pub fulfillments_phase: SyncPhase,
}

impl TenantSyncState {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn is_backfilled(&self, kind: BackfillKind) -> bool {
        match kind {
            BackfillKind::Inventory => self.inventory_backfilled,
            BackfillKind::Fulfillments => self.fulfillments_backfilled,
        }
    }

    pub fn phase(&self, kind: BackfillKind) -> SyncPhase {
        match kind {
            BackfillKind::Inventory => self.inventory_phase,
            BackfillKind::Fulfillments => self.fulfillments_phase,
        }
    }
}

impl Record for TenantSyncState {
    const COLLECTION: &'static str = collections::TENANT_SYNC_STATE;

    fn key(&self) -> BusinessKey {
        tenant_key(&self.tenant_id)
    }
}

fn default_active() -> bool {
    true
}

/// Installed store. Written by the install flow; read here for backfill
/// credentials and shop-domain resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub shop_domain: String,
    pub access_token: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl Record for Tenant {
    const COLLECTION: &'static str = collections::TENANTS;

    fn key(&self) -> BusinessKey {
        tenant_key(&self.tenant_id)
    }
}
