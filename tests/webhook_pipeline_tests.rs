use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use storefront_sync::{
    application::Ack,
    domain::{
        collections, order_key, variant_key, BackfillKind, BusinessKey, Event, Fields,
        InventoryRecord, Tenant, Topic, VariantRecord,
    },
    infrastructure::{
        config::AppConfig,
        init::build_state,
        store::{upsert_record, Document, DownstreamStore, MemoryStore, StoreError},
        upstream::{Page, UpstreamError, UpstreamPager},
    },
    web::{create_router, signature::sign, AppState},
};
use tower::ServiceExt;

struct EmptyPager;

#[async_trait]
impl UpstreamPager for EmptyPager {
    async fn fetch_page(
        &self,
        _tenant: &Tenant,
        _kind: BackfillKind,
        _cursor: Option<String>,
    ) -> Result<Page, UpstreamError> {
        Ok(Page {
            items: Vec::new(),
            next_cursor: None,
            has_more: false,
        })
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        retry_base_delay_ms: 1,
        backfill_page_delay_ms: 0,
        ..Default::default()
    }
}

fn pipeline(store: Arc<dyn DownstreamStore>, config: &AppConfig) -> AppState {
    build_state(config, store, Arc::new(EmptyPager))
}

async fn seed_catalog(store: &dyn DownstreamStore, available: i64) {
    upsert_record(
        store,
        &VariantRecord {
            tenant_id: "t1".into(),
            variant_id: "555".into(),
            product_id: "9".into(),
            inventory_item_id: Some("42".into()),
            product_title: "Blue T-Shirt".into(),
            variant_title: "Medium".into(),
            sku: "BTS-M-001".into(),
        },
    )
    .await
    .unwrap();
    upsert_record(
        store,
        &InventoryRecord {
            tenant_id: "t1".into(),
            inventory_item_id: "42".into(),
            location_id: "7".into(),
            quantity: available,
            variant_id: Some("555".into()),
            product_id: Some("9".into()),
            product_title: None,
            variant_title: None,
            sku: None,
            barcode: None,
            updated_at: None,
        },
    )
    .await
    .unwrap();
}

fn order_payload() -> Value {
    json!({
        "id": 1001,
        "name": "#1001",
        "email": "customer@example.com",
        "financial_status": "partially_paid",
        "fulfillment_status": null,
        "total_price": "69.97",
        "currency": "USD",
        "customer": { "first_name": "John", "last_name": "Doe" },
        "line_items": [
            { "id": 111, "variant_id": 555, "title": "Blue T-Shirt", "quantity": 2, "price": "29.99" },
            { "id": 222, "title": "Gift wrap", "quantity": 1, "price": "9.99" }
        ]
    })
}

fn order_event(payload: &Value) -> Event {
    Event::new(Topic::OrdersCreate, "t1", payload.to_string().into_bytes())
}

async fn back_orders(store: &dyn DownstreamStore) -> Option<i64> {
    store
        .get(collections::VARIANTS, &variant_key("t1", "555"))
        .await
        .unwrap()
        .and_then(|fields| fields.get("back_orders").and_then(Value::as_i64))
}

async fn audit_entries(store: &dyn DownstreamStore, topic: &str) -> Vec<Document> {
    let mut filter = Fields::new();
    filter.insert("topic".to_string(), Value::from(topic));
    store
        .query(collections::WEBHOOK_EVENTS, &filter)
        .await
        .unwrap()
}

#[tokio::test]
async fn repeated_order_delivery_converges_to_one_row_per_entity() {
    let store = Arc::new(MemoryStore::new());
    let state = pipeline(store.clone(), &test_config());
    let payload = order_payload();

    state.acking.dispatch(order_event(&payload)).await;
    let after_first = store
        .get(collections::ORDERS, &order_key("t1", "1001"))
        .await
        .unwrap();

    for _ in 0..3 {
        state.acking.dispatch(order_event(&payload)).await;
    }

    assert_eq!(store.len(collections::ORDERS), 1);
    assert_eq!(store.len(collections::LINE_ITEMS), 2);
    let after_repeats = store
        .get(collections::ORDERS, &order_key("t1", "1001"))
        .await
        .unwrap();
    assert_eq!(after_first, after_repeats);

    let line = store
        .get(
            collections::LINE_ITEMS,
            &BusinessKey::new(["t1", "1001", "111"]),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.get("total"), Some(&json!("59.98")));
}

#[tokio::test]
async fn partially_paid_order_without_stock_counts_one_backorder_across_redeliveries() {
    let store = Arc::new(MemoryStore::new());
    seed_catalog(store.as_ref(), 0).await;
    let state = pipeline(store.clone(), &test_config());

    state.acking.dispatch(order_event(&order_payload())).await;
    state.acking.dispatch(order_event(&order_payload())).await;

    let order = store
        .get(collections::ORDERS, &order_key("t1", "1001"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.get("payment_status"), Some(&json!("paid")));
    assert_eq!(order.get("fulfillment_status"), Some(&json!("unfulfilled")));
    assert_eq!(back_orders(store.as_ref()).await, Some(1));
    assert_eq!(store.len(collections::BACKORDER_LOCKS), 0);
}

/// Yields to the scheduler before every store call, so concurrent callers
/// interleave the way they would against a networked backend.
struct YieldingStore {
    inner: MemoryStore,
}

#[async_trait]
impl DownstreamStore for YieldingStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner.upsert(collection, key, fields).await
    }

    async fn get(&self, collection: &str, key: &BusinessKey) -> Result<Option<Fields>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.get(collection, key).await
    }

    async fn conditional_insert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.inner.conditional_insert(collection, key, fields).await
    }

    async fn delete(&self, collection: &str, key: &BusinessKey) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.inner.delete(collection, key).await
    }

    async fn delete_if(
        &self,
        collection: &str,
        key: &BusinessKey,
        expected: &Fields,
    ) -> Result<bool, StoreError> {
        tokio::task::yield_now().await;
        self.inner.delete_if(collection, key, expected).await
    }

    async fn increment(
        &self,
        collection: &str,
        key: &BusinessKey,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        tokio::task::yield_now().await;
        self.inner.increment(collection, key, field, delta).await
    }

    async fn query(&self, collection: &str, filter: &Fields) -> Result<Vec<Document>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.query(collection, filter).await
    }
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_count_one_backorder() {
    let store = Arc::new(YieldingStore {
        inner: MemoryStore::new(),
    });
    seed_catalog(store.as_ref(), 0).await;
    let state = pipeline(store.clone(), &test_config());

    let (a, b) = tokio::join!(
        state.acking.dispatch(order_event(&order_payload())),
        state.acking.dispatch(order_event(&order_payload()))
    );

    assert_eq!((a, b), (Ack::Received, Ack::Received));
    assert_eq!(back_orders(store.as_ref()).await, Some(1));
    assert_eq!(store.inner.len(collections::ORDERS), 1);
    assert_eq!(store.inner.len(collections::BACKORDER_LEDGER), 1);
    assert_eq!(store.inner.len(collections::BACKORDER_LOCKS), 0);
    assert_eq!(audit_entries(store.as_ref(), "orders/create").await.len(), 2);
}

#[tokio::test]
async fn different_orders_for_one_variant_each_count_when_interleaved() {
    let store = Arc::new(YieldingStore {
        inner: MemoryStore::new(),
    });
    seed_catalog(store.as_ref(), 0).await;
    let state = pipeline(store.clone(), &test_config());
    let mut second = order_payload();
    second["id"] = json!(1002);
    second["name"] = json!("#1002");

    tokio::join!(
        state.acking.dispatch(order_event(&order_payload())),
        state.acking.dispatch(order_event(&second))
    );

    assert_eq!(back_orders(store.as_ref()).await, Some(2));
    assert_eq!(store.inner.len(collections::ORDERS), 2);
}

#[tokio::test]
async fn stocked_variant_is_not_backordered() {
    let store = Arc::new(MemoryStore::new());
    seed_catalog(store.as_ref(), 4).await;
    let state = pipeline(store.clone(), &test_config());

    state.acking.dispatch(order_event(&order_payload())).await;

    assert_eq!(back_orders(store.as_ref()).await, None);
}

#[tokio::test]
async fn unknown_topic_is_acknowledged_without_side_effects() {
    let store = Arc::new(MemoryStore::new());
    let state = pipeline(store.clone(), &test_config());

    let ack = state
        .acking
        .dispatch(Event::new(
            Topic::parse("carts/create"),
            "t1",
            order_payload().to_string().into_bytes(),
        ))
        .await;

    assert_eq!(ack, Ack::Received);
    assert_eq!(store.len(collections::ORDERS), 0);
    let audited = audit_entries(store.as_ref(), "carts/create").await;
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].fields.get("processed"), Some(&json!(false)));
    assert_eq!(
        audited[0].fields.get("error"),
        Some(&json!("unknown topic: carts/create"))
    );
}

#[tokio::test]
async fn manual_fulfillment_without_tracking_is_kept() {
    let store = Arc::new(MemoryStore::new());
    let state = pipeline(store.clone(), &test_config());
    let payload = json!({ "id": 9001, "order_id": 1001, "status": "success" });

    state
        .acking
        .dispatch(Event::new(
            Topic::FulfillmentsCreate,
            "t1",
            payload.to_string().into_bytes(),
        ))
        .await;

    let fulfillment = store
        .get(
            collections::FULFILLMENTS,
            &BusinessKey::new(["t1", "1001", "9001"]),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fulfillment.get("carrier"), Some(&json!("Manual")));
    assert_eq!(fulfillment.get("tracking_number"), Some(&Value::Null));

    let audited = audit_entries(store.as_ref(), "fulfillments/create").await;
    assert_eq!(audited[0].fields.get("processed"), Some(&json!(true)));
}

#[tokio::test]
async fn failing_handler_is_acknowledged_and_audited() {
    let store = Arc::new(MemoryStore::new());
    let state = pipeline(store.clone(), &test_config());

    let ack = state
        .acking
        .dispatch(Event::new(
            Topic::OrdersCreate,
            "t1",
            br##"{"name":"#1002"}"##.to_vec(),
        ))
        .await;

    assert_eq!(ack, Ack::Received);
    let audited = audit_entries(store.as_ref(), "orders/create").await;
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].fields.get("processed"), Some(&json!(false)));
    let error = audited[0].fields.get("error").and_then(Value::as_str).unwrap();
    assert!(error.contains("`id`"), "{}", error);
}

/// Rejects every write to the audit collection.
struct BrokenAuditStore {
    inner: MemoryStore,
}

impl BrokenAuditStore {
    fn check(collection: &str) -> Result<(), StoreError> {
        if collection == collections::WEBHOOK_EVENTS {
            Err(StoreError::Unavailable("audit table offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DownstreamStore for BrokenAuditStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<(), StoreError> {
        Self::check(collection)?;
        self.inner.upsert(collection, key, fields).await
    }

    async fn get(&self, collection: &str, key: &BusinessKey) -> Result<Option<Fields>, StoreError> {
        self.inner.get(collection, key).await
    }

    async fn conditional_insert(
        &self,
        collection: &str,
        key: &BusinessKey,
        fields: Fields,
    ) -> Result<bool, StoreError> {
        Self::check(collection)?;
        self.inner.conditional_insert(collection, key, fields).await
    }

    async fn delete(&self, collection: &str, key: &BusinessKey) -> Result<(), StoreError> {
        self.inner.delete(collection, key).await
    }

    async fn delete_if(
        &self,
        collection: &str,
        key: &BusinessKey,
        expected: &Fields,
    ) -> Result<bool, StoreError> {
        self.inner.delete_if(collection, key, expected).await
    }

    async fn increment(
        &self,
        collection: &str,
        key: &BusinessKey,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        self.inner.increment(collection, key, field, delta).await
    }

    async fn query(&self, collection: &str, filter: &Fields) -> Result<Vec<Document>, StoreError> {
        self.inner.query(collection, filter).await
    }
}

#[tokio::test]
async fn audit_outage_does_not_block_processing() {
    let store = Arc::new(BrokenAuditStore {
        inner: MemoryStore::new(),
    });
    let state = pipeline(store.clone(), &test_config());

    let ack = state.acking.dispatch(order_event(&order_payload())).await;

    assert_eq!(ack, Ack::Received);
    assert_eq!(store.inner.len(collections::ORDERS), 1);
    assert_eq!(store.inner.len(collections::WEBHOOK_EVENTS), 0);
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn signed_request(uri: &str, body: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-shopify-shop-domain", "demo.myshopify.com")
        .header("x-shopify-hmac-sha256", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn signed_webhook_is_routed_to_the_resolved_tenant() {
    let store = Arc::new(MemoryStore::new());
    upsert_record(
        store.as_ref(),
        &Tenant {
            tenant_id: "t1".into(),
            shop_domain: "demo.myshopify.com".into(),
            access_token: "token".into(),
            is_active: true,
        },
    )
    .await
    .unwrap();
    let config = AppConfig {
        webhook_secret: Some("shh".into()),
        ..test_config()
    };
    let app = create_router(pipeline(store.clone(), &config));

    let body = order_payload().to_string();
    let response = app
        .oneshot(signed_request(
            "/webhooks/orders/create",
            &body,
            &sign(body.as_bytes(), "shh"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "message": "Received" }));
    assert!(store
        .get(collections::ORDERS, &order_key("t1", "1001"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn bad_signature_is_acknowledged_but_not_processed() {
    let store = Arc::new(MemoryStore::new());
    let config = AppConfig {
        webhook_secret: Some("shh".into()),
        ..test_config()
    };
    let app = create_router(pipeline(store.clone(), &config));

    let body = order_payload().to_string();
    let response = app
        .oneshot(signed_request(
            "/webhooks/orders/create",
            &body,
            &sign(body.as_bytes(), "wrong"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(store.is_empty());
}

fn inventory_update_from(shop_domain: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks")
        .header("x-shopify-topic", "inventory_levels/update")
        .header("x-shopify-shop-domain", shop_domain)
        .body(Body::from(
            json!({ "inventory_item_id": 42, "location_id": 7, "available": 3 }).to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn topic_header_routes_to_the_tenant_of_the_shop_domain() {
    let store = Arc::new(MemoryStore::new());
    upsert_record(
        store.as_ref(),
        &Tenant {
            tenant_id: "t2".into(),
            shop_domain: "other.myshopify.com".into(),
            access_token: "token".into(),
            is_active: true,
        },
    )
    .await
    .unwrap();
    let app = create_router(pipeline(store.clone(), &test_config()));

    let response = app
        .oneshot(inventory_update_from("other.myshopify.com"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let level = store
        .get(collections::INVENTORY, &BusinessKey::new(["t2", "42", "7"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(level.get("quantity"), Some(&json!(3)));
}

#[tokio::test]
async fn unknown_shop_domain_is_audited_but_not_processed() {
    let store = Arc::new(MemoryStore::new());
    let app = create_router(pipeline(store.clone(), &test_config()));

    let response = app
        .oneshot(inventory_update_from("other.myshopify.com"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "message": "Received" }));
    assert_eq!(store.len(collections::INVENTORY), 0);
    let audited = audit_entries(store.as_ref(), "inventory_levels/update").await;
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].fields.get("processed"), Some(&json!(false)));
    assert_eq!(
        audited[0].fields.get("error"),
        Some(&json!("tenant not found: other.myshopify.com"))
    );
}

#[tokio::test]
async fn backfill_for_unknown_tenant_is_not_found() {
    let store = Arc::new(MemoryStore::new());
    let app = create_router(pipeline(store, &test_config()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/tenants/missing/backfill")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sync_state_defaults_to_not_started() {
    let store = Arc::new(MemoryStore::new());
    let app = create_router(pipeline(store, &test_config()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/tenants/t1/sync-state")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let state = body_json(response).await;
    assert_eq!(state["inventory_backfilled"], json!(false));
    assert_eq!(state["fulfillments_phase"], json!("not_started"));
}
