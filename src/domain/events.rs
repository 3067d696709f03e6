use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Upstream webhook topics the pipeline knows how to route.
///
/// Anything the upstream adds later lands in `Unknown` and is acknowledged
/// without a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    OrdersCreate,
    OrdersUpdated,
    OrdersPaid,
    InventoryLevelsUpdate,
    FulfillmentsCreate,
    FulfillmentsUpdate,
    ProductsUpdate,
    AppUninstalled,
    Unknown(String),
}

impl Topic {
    /// Parses a topic header (`orders/create`) or webhook path suffix
    /// (`/webhooks/orders/create`).
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().trim_matches('/').to_ascii_lowercase();
        let topic = normalized
            .strip_prefix("webhooks/")
            .unwrap_or(normalized.as_str());

        match topic {
            "orders/create" => Topic::OrdersCreate,
            "orders/updated" | "orders/update" => Topic::OrdersUpdated,
            "orders/paid" => Topic::OrdersPaid,
            "inventory_levels/update" | "inventory/update" => Topic::InventoryLevelsUpdate,
            "fulfillments/create" | "fulfillment/create" => Topic::FulfillmentsCreate,
            "fulfillments/update" => Topic::FulfillmentsUpdate,
            "products/update" | "products/create" => Topic::ProductsUpdate,
            "app/uninstalled" | "app/uninstall" => Topic::AppUninstalled,
            _ => Topic::Unknown(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Topic::OrdersCreate => "orders/create",
            Topic::OrdersUpdated => "orders/updated",
            Topic::OrdersPaid => "orders/paid",
            Topic::InventoryLevelsUpdate => "inventory_levels/update",
            Topic::FulfillmentsCreate => "fulfillments/create",
            Topic::FulfillmentsUpdate => "fulfillments/update",
            Topic::ProductsUpdate => "products/update",
            Topic::AppUninstalled => "app/uninstalled",
            Topic::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn is_order(&self) -> bool {
        matches!(
            self,
            Topic::OrdersCreate | Topic::OrdersUpdated | Topic::OrdersPaid
        )
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An already-authenticated inbound webhook delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic: Topic,
    pub tenant_id: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: Topic, tenant_id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            tenant_id: tenant_id.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Lossy text view of the payload for the audit log.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
