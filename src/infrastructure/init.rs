use crate::application::{AlwaysAck, BackfillWalker, BackorderCounter, Dispatcher};
use crate::infrastructure::audit::StoreAuditLog;
use crate::infrastructure::config::{AppConfig, StoreBackend};
use crate::infrastructure::lock::{BackorderLock, LockSweeper};
use crate::infrastructure::postgres_store::{PostgresStore, PostgresStoreConfig};
use crate::infrastructure::redis_store::RedisStore;
use crate::infrastructure::shutdown::{Shutdown, ShutdownManager};
use crate::infrastructure::store::{DownstreamStore, MemoryStore};
use crate::infrastructure::upstream::{ShopifyGraphqlPager, UpstreamPager};
use crate::web::AppState;
use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

pub struct ServiceContext {
    pub state: AppState,
    pub shutdown: ShutdownManager,
    sweeper_handle: tokio::task::JoinHandle<()>,
}

impl ServiceContext {
    pub async fn shutdown(self) {
        info!("Starting graceful shutdown of services...");

        if let Err(e) = self.shutdown.shutdown().await {
            error!("Failed to signal shutdown: {}", e);
        }
        if let Err(e) = self.sweeper_handle.await {
            error!("Error during lock sweeper shutdown: {}", e);
        }

        info!("Service shutdown complete");
    }
}

pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn DownstreamStore>> {
    let store: Arc<dyn DownstreamStore> = match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory document store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            info!("Using Postgres document store");
            let pg_config = PostgresStoreConfig {
                database_url: config.database_url.clone(),
                max_connections: config.database_pool_size,
                ..Default::default()
            };
            Arc::new(PostgresStore::connect(&pg_config).await?)
        }
        StoreBackend::Redis => {
            info!("Using Redis document store");
            Arc::new(RedisStore::connect(&config.redis_url, config.redis_namespace.clone()).await?)
        }
    };
    Ok(store)
}

/// Wires the pipeline on top of an already connected store.
pub fn build_state(
    config: &AppConfig,
    store: Arc<dyn DownstreamStore>,
    pager: Arc<dyn UpstreamPager>,
) -> AppState {
    let retry = config.retry_policy();
    let lock = BackorderLock::new(store.clone());
    let backorders = BackorderCounter::new(store.clone(), lock, retry.clone(), config.lock_ttl());

    let dispatcher = Dispatcher::with_default_handlers(store.clone(), retry.clone(), backorders);
    let audit = Arc::new(StoreAuditLog::new(store.clone()));
    let walker = BackfillWalker::new(
        store.clone(),
        pager,
        retry,
        config.backfill_page_delay(),
    );

    AppState {
        acking: AlwaysAck::new(dispatcher, audit),
        walker,
        store,
        webhook_secret: config.webhook_secret.clone(),
    }
}

pub async fn init_all_services(config: &AppConfig) -> Result<ServiceContext> {
    let store = connect_store(config).await?;
    let pager: Arc<dyn UpstreamPager> = Arc::new(ShopifyGraphqlPager::new(
        config.shopify_api_version.clone(),
        config.backfill_page_size,
    )?);
    let state = build_state(config, store.clone(), pager);

    let shutdown = ShutdownManager::new();
    let sweeper = LockSweeper::new(
        BackorderLock::new(store),
        config.lock_sweep_interval(),
        shutdown.subscribe(),
    );
    let sweeper_handle = tokio::spawn(sweeper.run());

    if state.webhook_secret.is_none() {
        info!("SHOPIFY_WEBHOOK_SECRET is not set, webhook signatures will not be verified");
    }
    info!("All services initialized");

    Ok(ServiceContext {
        state,
        shutdown,
        sweeper_handle,
    })
}
