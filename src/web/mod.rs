//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Poller;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub poller: Poller,
    /// Cancelled on shutdown; batch polls run under a child token.
    pub shutdown: CancellationToken,
}

/// Web server for netpoll.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        poller: Poller,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                poller,
                shutdown,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Registry
            .route(
                "/devices",
                get(handlers::handle_list_devices).post(handlers::handle_create_device),
            )
            .route(
                "/devices/{id}",
                get(handlers::handle_get_device)
                    .put(handlers::handle_update_device)
                    .delete(handlers::handle_delete_device),
            )
            .route("/devices/{id}/history", get(handlers::handle_poll_history))
            // Polling
            .route("/devices/poll", post(handlers::handle_poll_all))
            .route("/devices/{id}/poll", post(handlers::handle_poll_device))
            // Connectivity checks
            .route("/devices/ping", post(handlers::handle_ping))
            .route(
                "/devices/{id}/test-connection",
                post(handlers::handle_test_connection),
            )
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown token is cancelled.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = self.state.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}
