use crate::web::handlers::*;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks", post(receive_webhook))
        .route("/webhooks/{*topic}", post(receive_webhook_at))
        .route("/tenants/{tenant_id}/backfill", post(trigger_backfill))
        .route("/tenants/{tenant_id}/sync-state", get(get_sync_state))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
