use std::sync::Arc;

use anyhow::Result;
use chunkyard::{
    CatalogNotifier, MemoryCatalog, MemoryObjectStore, ObjectStoreGateway, S3Config, S3ObjectStore,
    SessionSweeper, UploadConfig, UploadCoordinator, WebhookCatalog,
};
use chunkyard_axum::UploadApp;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

async fn object_store() -> Result<Arc<dyn ObjectStoreGateway>> {
    if std::env::var("CHUNKYARD_S3_BUCKET").is_err() {
        warn!("CHUNKYARD_S3_BUCKET not set, storing uploads in memory");
        return Ok(Arc::new(MemoryObjectStore::new()));
    }
    let config = S3Config::from_env()?;
    info!(bucket = %config.bucket, region = %config.region, "using S3 object store");
    Ok(Arc::new(S3ObjectStore::new(config).await?))
}

fn catalog() -> Arc<dyn CatalogNotifier> {
    match std::env::var("CHUNKYARD_CATALOG_URL") {
        Ok(url) => {
            info!(endpoint = %url, "registering uploads with catalog webhook");
            let mut catalog = WebhookCatalog::new(url);
            if let Ok(token) = std::env::var("CHUNKYARD_CATALOG_TOKEN") {
                catalog = catalog.with_bearer_token(token);
            }
            Arc::new(catalog)
        }
        Err(_) => {
            warn!("CHUNKYARD_CATALOG_URL not set, catalog records are kept in memory");
            Arc::new(MemoryCatalog::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = UploadConfig::from_env();
    info!(staging_root = %config.staging_root.display(), "staging chunks on disk");
    let coordinator = Arc::new(UploadCoordinator::open(config, object_store().await?, catalog()).await?);

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(SessionSweeper::new(Arc::clone(&coordinator)).start(shutdown.clone()));

    let addr = std::env::var("CHUNKYARD_HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:3030".to_string());
    let signal = shutdown.clone();
    UploadApp::new(coordinator)
        .listen_with_shutdown(addr, async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c, running until killed");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    sweeper.await?;
    Ok(())
}
