use crate::application::{AlwaysAck, BackfillWalker, SyncError};
use crate::domain::events::{Event, Topic};
use crate::domain::records::{collections, Fields, TenantSyncState};
use crate::infrastructure::store::{DownstreamStore, StoreError};
use crate::web::signature::verify_webhook_hmac;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const TOPIC_HEADER: &str = "x-shopify-topic";
pub const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";
pub const HMAC_HEADER: &str = "x-shopify-hmac-sha256";

#[derive(Clone)]
pub struct AppState {
    pub acking: AlwaysAck,
    pub walker: BackfillWalker,
    pub store: Arc<dyn DownstreamStore>,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn received() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "message": "Received" })))
}

/// Maps a shop domain to the id of the tenant installed on it.
async fn resolve_tenant(
    store: &dyn DownstreamStore,
    shop_domain: &str,
) -> Result<Option<String>, StoreError> {
    let mut filter = Fields::new();
    filter.insert("shop_domain".to_string(), Value::from(shop_domain));

    let tenants = store.query(collections::TENANTS, &filter).await?;
    Ok(tenants
        .iter()
        .find_map(|doc| doc.fields.get("tenant_id").and_then(Value::as_str))
        .map(str::to_string))
}

async fn accept_webhook(
    state: &AppState,
    path_topic: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let shop_domain = header(headers, SHOP_DOMAIN_HEADER).unwrap_or("unknown");

    if let Some(secret) = state.webhook_secret.as_deref() {
        let verified = header(headers, HMAC_HEADER)
            .map(|signature| verify_webhook_hmac(&body, signature, secret))
            .unwrap_or(false);
        if !verified {
            warn!(shop_domain, "Rejected webhook with invalid signature");
            return received();
        }
    }

    let topic = header(headers, TOPIC_HEADER)
        .or(path_topic)
        .map(Topic::parse)
        .unwrap_or_else(|| Topic::Unknown(String::new()));
    let tenant_id = match resolve_tenant(state.store.as_ref(), shop_domain).await {
        Ok(Some(tenant_id)) => tenant_id,
        Ok(None) => {
            let event = Event::new(topic, shop_domain, body.to_vec());
            let reason = format!("tenant not found: {}", shop_domain);
            state.acking.acknowledge_unrouted(event, reason).await;
            return received();
        }
        Err(e) => {
            let event = Event::new(topic, shop_domain, body.to_vec());
            let reason = format!("tenant lookup failed for {}: {}", shop_domain, e);
            state.acking.acknowledge_unrouted(event, reason).await;
            return received();
        }
    };

    let event = Event::new(topic, tenant_id, body.to_vec());
    info!(
        event_id = %event.id,
        topic = %event.topic,
        tenant_id = %event.tenant_id,
        shop_domain,
        "Webhook received"
    );
    state.acking.dispatch(event).await;
    received()
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    accept_webhook(&state, None, &headers, body).await
}

pub async fn receive_webhook_at(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    accept_webhook(&state, Some(&topic), &headers, body).await
}

fn error_status(e: &SyncError) -> StatusCode {
    match e {
        SyncError::TenantNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::TenantInactive(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn trigger_backfill(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let tenant = state.walker.load_tenant(&tenant_id).await.map_err(|e| {
        (
            error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;
    if !tenant.is_active {
        let e = SyncError::TenantInactive(tenant_id);
        return Err((
            error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        ));
    }

    let walker = state.walker.clone();
    let spawned_id = tenant_id.clone();
    tokio::spawn(async move {
        match walker.backfill_all(&spawned_id).await {
            Ok(written) => info!(tenant_id = %spawned_id, written, "Backfill finished"),
            Err(e) => error!(tenant_id = %spawned_id, "Backfill failed: {}", e),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Backfill started", "tenant_id": tenant_id })),
    ))
}

pub async fn get_sync_state(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantSyncState>, (StatusCode, Json<ErrorResponse>)> {
    state
        .walker
        .sync_state(&tenant_id)
        .await
        .map(Json)
        .map_err(|e| {
            (
                error_status(&e),
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}
