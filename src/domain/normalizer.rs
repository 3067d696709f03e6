//! Pure mapping from raw upstream payloads to canonical records.
//!
//! Two payload shapes are accepted: the REST-style webhook bodies and the
//! GraphQL nodes returned by the paginated backfill queries. Optional fields
//! fall back to defaults; only the identifiers that make up a business key
//! are mandatory.

use crate::domain::records::{
    FulfillmentRecord, InventoryRecord, LineItemRecord, OrderRecord, PaymentStatus,
    VariantRecord, MANUAL_CARRIER,
};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOrder {
    pub order: OrderRecord,
    pub line_items: Vec<LineItemRecord>,
    pub fulfillments: Vec<FulfillmentRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedProduct {
    pub variants: Vec<VariantRecord>,
    pub inventory: Vec<InventoryRecord>,
}

/// Reduces `gid://shopify/Order/123` to `123`; plain ids pass through.
pub fn strip_gid(raw: &str) -> String {
    raw.rsplit('/').next().unwrap_or(raw).to_string()
}

fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn id(value: &Value, key: &str) -> Option<String> {
    text(value, key).map(|raw| strip_gid(&raw))
}

fn integer(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decimal(value: &Value, key: &str) -> Decimal {
    text(value, key)
        .and_then(|raw| Decimal::from_str(&raw).ok())
        .unwrap_or(Decimal::ZERO)
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// GraphQL connections wrap nodes in `{ edges: [{ node }] }`.
fn edges<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .map(|connection| array(connection, "edges"))
        .unwrap_or(&[])
        .iter()
        .filter_map(|edge| edge.get("node"))
}

fn shop_money<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key)?.get("shopMoney")
}

fn customer_name(customer: &Value) -> Option<String> {
    let first = text(customer, "first_name").unwrap_or_default();
    let last = text(customer, "last_name").unwrap_or_default();
    let full = format!("{} {}", first, last).trim().to_string();
    (!full.is_empty()).then_some(full)
}

fn line_total(price: Decimal, quantity: i64) -> String {
    (price * Decimal::from(quantity)).to_string()
}

/// Normalizes an `orders/*` webhook body.
pub fn normalize_order(tenant_id: &str, payload: &Value) -> Result<NormalizedOrder, NormalizeError> {
    let order_id = id(payload, "id").ok_or(NormalizeError::MissingField("id"))?;
    let customer = payload.get("customer").cloned().unwrap_or(Value::Null);

    let financial_status = text(payload, "financial_status").unwrap_or_else(|| "pending".into());
    let line_items: Vec<LineItemRecord> = array(payload, "line_items")
        .iter()
        .filter_map(|item| {
            let line_item_id = id(item, "id")?;
            let quantity = integer(item, "quantity").unwrap_or(1);
            let price = decimal(item, "price");
            Some(LineItemRecord {
                tenant_id: tenant_id.to_string(),
                order_id: order_id.clone(),
                line_item_id,
                variant_id: id(item, "variant_id"),
                product_title: text(item, "title").unwrap_or_default(),
                variant_title: text(item, "variant_title").unwrap_or_default(),
                sku: text(item, "sku").unwrap_or_default(),
                quantity,
                price: price.to_string(),
                total: line_total(price, quantity),
            })
        })
        .collect();

    let fulfillments = array(payload, "fulfillments")
        .iter()
        .filter_map(|fulfillment| fulfillment_from_rest(tenant_id, &order_id, fulfillment).ok())
        .collect();

    let order = OrderRecord {
        tenant_id: tenant_id.to_string(),
        order_id: order_id.clone(),
        order_number: text(payload, "name")
            .or_else(|| text(payload, "order_number"))
            .unwrap_or_default(),
        payment_status: PaymentStatus::from_financial_status(&financial_status),
        financial_status,
        fulfillment_status: text(payload, "fulfillment_status")
            .unwrap_or_else(|| "unfulfilled".into()),
        total_price: decimal(payload, "total_price").to_string(),
        currency: text(payload, "currency").unwrap_or_else(|| "USD".into()),
        customer_name: customer_name(&customer),
        customer_email: text(payload, "email").or_else(|| text(&customer, "email")),
        line_items_count: line_items.len(),
        created_at: text(payload, "created_at"),
        updated_at: text(payload, "updated_at"),
    };

    Ok(NormalizedOrder {
        order,
        line_items,
        fulfillments,
    })
}

fn fulfillment_from_rest(
    tenant_id: &str,
    order_id: &str,
    payload: &Value,
) -> Result<FulfillmentRecord, NormalizeError> {
    let fulfillment_id = id(payload, "id").ok_or(NormalizeError::MissingField("id"))?;
    let tracking_info = payload.get("tracking_info").cloned().unwrap_or(Value::Null);

    let tracking_number = text(payload, "tracking_number")
        .or_else(|| text(&tracking_info, "number"))
        .or_else(|| {
            array(payload, "tracking_numbers")
                .first()
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        });
    let carrier = text(payload, "tracking_company")
        .or_else(|| text(&tracking_info, "company"))
        .unwrap_or_else(|| MANUAL_CARRIER.to_string());
    let tracking_url = text(payload, "tracking_url")
        .or_else(|| text(&tracking_info, "url"))
        .or_else(|| {
            array(payload, "tracking_urls")
                .first()
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        });

    Ok(FulfillmentRecord {
        tenant_id: tenant_id.to_string(),
        order_id: order_id.to_string(),
        fulfillment_id,
        carrier,
        tracking_number,
        tracking_url,
        status: text(payload, "status").unwrap_or_else(|| "fulfilled".into()),
        shipped_at: text(payload, "updated_at").or_else(|| text(payload, "created_at")),
    })
}

/// Normalizes a `fulfillments/*` webhook body.
pub fn normalize_fulfillment(
    tenant_id: &str,
    payload: &Value,
) -> Result<FulfillmentRecord, NormalizeError> {
    let order_id = id(payload, "order_id").ok_or(NormalizeError::MissingField("order_id"))?;
    fulfillment_from_rest(tenant_id, &order_id, payload)
}

/// Normalizes an `inventory_levels/update` webhook body. The upstream sends
/// the absolute `available` quantity, not a delta.
pub fn normalize_inventory_level(
    tenant_id: &str,
    payload: &Value,
) -> Result<InventoryRecord, NormalizeError> {
    let inventory_item_id = id(payload, "inventory_item_id")
        .ok_or(NormalizeError::MissingField("inventory_item_id"))?;
    let location_id =
        id(payload, "location_id").ok_or(NormalizeError::MissingField("location_id"))?;

    Ok(InventoryRecord {
        tenant_id: tenant_id.to_string(),
        inventory_item_id,
        location_id,
        quantity: integer(payload, "available").unwrap_or(0),
        variant_id: None,
        product_id: None,
        product_title: None,
        variant_title: None,
        sku: None,
        barcode: None,
        updated_at: text(payload, "updated_at"),
    })
}

/// Normalizes a `products/*` webhook body. REST product payloads carry no
/// stock levels, so only the variant catalog is produced.
pub fn normalize_product(
    tenant_id: &str,
    payload: &Value,
) -> Result<NormalizedProduct, NormalizeError> {
    let product_id = id(payload, "id").ok_or(NormalizeError::MissingField("id"))?;
    let product_title = text(payload, "title").unwrap_or_default();

    let variants = array(payload, "variants")
        .iter()
        .filter_map(|variant| {
            Some(VariantRecord {
                tenant_id: tenant_id.to_string(),
                variant_id: id(variant, "id")?,
                product_id: product_id.clone(),
                inventory_item_id: id(variant, "inventory_item_id"),
                product_title: product_title.clone(),
                variant_title: text(variant, "title").unwrap_or_default(),
                sku: text(variant, "sku").unwrap_or_default(),
            })
        })
        .collect();

    Ok(NormalizedProduct {
        variants,
        inventory: Vec::new(),
    })
}

/// Normalizes one `products` node of the backfill query into the variant
/// catalog plus one inventory record per stocked location.
pub fn normalize_graphql_product(
    tenant_id: &str,
    node: &Value,
) -> Result<NormalizedProduct, NormalizeError> {
    let product_id = id(node, "id").ok_or(NormalizeError::MissingField("id"))?;
    let product_title = text(node, "title").unwrap_or_default();

    let mut variants = Vec::new();
    let mut inventory = Vec::new();

    for variant in edges(node, "variants") {
        let Some(variant_id) = id(variant, "id") else {
            continue;
        };
        let variant_title = text(variant, "title").unwrap_or_default();
        let sku = text(variant, "sku").unwrap_or_default();
        let inventory_item = variant.get("inventoryItem").cloned().unwrap_or(Value::Null);
        let inventory_item_id = id(&inventory_item, "id");

        variants.push(VariantRecord {
            tenant_id: tenant_id.to_string(),
            variant_id: variant_id.clone(),
            product_id: product_id.clone(),
            inventory_item_id: inventory_item_id.clone(),
            product_title: product_title.clone(),
            variant_title: variant_title.clone(),
            sku: sku.clone(),
        });

        let Some(inventory_item_id) = inventory_item_id else {
            continue;
        };
        for level in edges(&inventory_item, "inventoryLevels") {
            let Some(location_id) = level.get("location").and_then(|loc| id(loc, "id")) else {
                continue;
            };
            let quantity = array(level, "quantities")
                .iter()
                .find(|q| q.get("name").and_then(Value::as_str) == Some("available"))
                .and_then(|q| integer(q, "quantity"))
                .or_else(|| integer(level, "available"))
                .unwrap_or(0);

            inventory.push(InventoryRecord {
                tenant_id: tenant_id.to_string(),
                inventory_item_id: inventory_item_id.clone(),
                location_id,
                quantity,
                variant_id: Some(variant_id.clone()),
                product_id: Some(product_id.clone()),
                product_title: Some(product_title.clone()),
                variant_title: Some(variant_title.clone()),
                sku: Some(sku.clone()),
                barcode: text(variant, "barcode"),
                updated_at: None,
            });
        }
    }

    Ok(NormalizedProduct { variants, inventory })
}

/// Normalizes one `orders` node of the backfill query.
pub fn normalize_graphql_order(
    tenant_id: &str,
    node: &Value,
) -> Result<NormalizedOrder, NormalizeError> {
    let order_id = id(node, "id").ok_or(NormalizeError::MissingField("id"))?;

    let financial_status = text(node, "displayFinancialStatus")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "pending".into());
    let total = shop_money(node, "totalPriceSet").cloned().unwrap_or(Value::Null);

    let line_items: Vec<LineItemRecord> = edges(node, "lineItems")
        .filter_map(|item| {
            let line_item_id = id(item, "id")?;
            let quantity = integer(item, "quantity").unwrap_or(1);
            let price = shop_money(item, "originalUnitPriceSet")
                .map(|money| decimal(money, "amount"))
                .unwrap_or(Decimal::ZERO);
            Some(LineItemRecord {
                tenant_id: tenant_id.to_string(),
                order_id: order_id.clone(),
                line_item_id,
                variant_id: item.get("variant").and_then(|variant| id(variant, "id")),
                product_title: text(item, "title").unwrap_or_default(),
                variant_title: text(item, "variantTitle").unwrap_or_default(),
                sku: text(item, "sku").unwrap_or_default(),
                quantity,
                price: price.to_string(),
                total: line_total(price, quantity),
            })
        })
        .collect();

    let fulfillments = array(node, "fulfillments")
        .iter()
        .filter_map(|fulfillment| {
            let fulfillment_id = id(fulfillment, "id")?;
            let tracking = array(fulfillment, "trackingInfo")
                .first()
                .cloned()
                .unwrap_or(Value::Null);
            Some(FulfillmentRecord {
                tenant_id: tenant_id.to_string(),
                order_id: order_id.clone(),
                fulfillment_id,
                carrier: text(&tracking, "company").unwrap_or_else(|| MANUAL_CARRIER.to_string()),
                tracking_number: text(&tracking, "number"),
                tracking_url: text(&tracking, "url"),
                status: text(fulfillment, "status")
                    .map(|s| s.to_ascii_lowercase())
                    .unwrap_or_else(|| "fulfilled".into()),
                shipped_at: text(fulfillment, "createdAt"),
            })
        })
        .collect();

    let order = OrderRecord {
        tenant_id: tenant_id.to_string(),
        order_id: order_id.clone(),
        order_number: text(node, "name").unwrap_or_default(),
        payment_status: PaymentStatus::from_financial_status(&financial_status),
        financial_status,
        fulfillment_status: text(node, "displayFulfillmentStatus")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_else(|| "unfulfilled".into()),
        total_price: decimal(&total, "amount").to_string(),
        currency: text(&total, "currencyCode").unwrap_or_else(|| "USD".into()),
        customer_name: None,
        customer_email: text(node, "email"),
        line_items_count: line_items.len(),
        created_at: text(node, "createdAt"),
        updated_at: None,
    };

    Ok(NormalizedOrder {
        order,
        line_items,
        fulfillments,
    })
}
