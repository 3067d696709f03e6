use std::net::SocketAddr;
use storefront_sync::infrastructure::{
    config::AppConfig,
    init::init_all_services,
    logging::{init_logging, LoggingConfig},
    shutdown::{wait_for_shutdown, Shutdown},
};
use storefront_sync::web::create_router;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = AppConfig::from_env();

    let _log_guards = init_logging(Some(LoggingConfig::new(
        &config.log_dir,
        &config.log_level,
        config.log_json,
    )))
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Starting storefront-sync with {:?} store backend",
        config.store_backend
    );

    let context = init_all_services(&config).await?;
    let app = create_router(context.state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    let shutdown = context.shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Received ctrl-c, shutting down");
        if let Err(e) = shutdown.shutdown().await {
            error!("Failed to signal shutdown: {}", e);
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(context.shutdown.subscribe()))
        .await?;

    context.shutdown().await;
    Ok(())
}
