use std::future::Future;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use chunkyard::UploadCoordinator;
use tokio::net::{TcpListener, ToSocketAddrs};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::{routes, UploadState};

/// Room for multipart boundaries and text fields around a chunk body
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct UploadApp {
    pub coordinator: Arc<UploadCoordinator>,
    pub router: Router<()>,
}

impl UploadApp {
    pub fn new(coordinator: Arc<UploadCoordinator>) -> Self {
        let router = router(Arc::clone(&coordinator));
        Self { coordinator, router }
    }

    /// Mount extra routes next to the upload endpoints
    pub fn use_router(mut self, path: &str, router: Router<()>) -> Self {
        self.router = self.router.nest(path, router);
        self
    }

    pub async fn listen<A>(self, addr: A) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
    {
        self.listen_with_shutdown(addr, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, letting in-flight requests finish
    pub async fn listen_with_shutdown<A, F>(self, addr: A, shutdown: F) -> anyhow::Result<()>
    where
        A: ToSocketAddrs,
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "chunkyard listening");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Build the upload router with request ids and tracing applied
pub fn router(coordinator: Arc<UploadCoordinator>) -> Router<()> {
    let body_limit = usize::try_from(coordinator.config().max_chunk_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/uploads/init", post(routes::init))
        .route("/uploads/chunk", post(routes::chunk))
        .route("/uploads/complete", post(routes::complete))
        .route("/uploads/register", post(routes::register))
        .route("/uploads/{session_id}", get(routes::status).delete(routes::abandon))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(UploadState::new(coordinator))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
