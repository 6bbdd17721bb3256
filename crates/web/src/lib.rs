//! branchbase web server and REST API.
//!
//! Provides an Axum-based HTTP server with:
//! - One REST route per engine action (branches, merge, rollback, version)
//! - A generic `POST /api/dispatch` endpoint taking `{action, params}`
//! - Health endpoint
//!
//! Errors are returned as structured JSON carrying conflicts and rollback
//! blockers so a client can render per-entity detail.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use branchbase_core::config::AppConfig;
use branchbase_core::engine::Engine;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: AppConfig,
}

/// The web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: AppConfig, engine: Arc<Engine>) -> Self {
        Self {
            state: Arc::new(AppState { engine, config }),
        }
    }

    /// Build the router with all API routes and middleware.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static(api::AUTHOR_HEADER),
            ]);

        Router::new()
            .merge(api::status::routes())
            .merge(api::branches::routes())
            .merge(api::rollback::routes())
            .merge(api::version::routes())
            .merge(api::dispatch::routes())
            .layer(DefaultBodyLimit::max(self.state.config.web.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Start the web server and serve until `shutdown` resolves.
    pub async fn start(
        self,
        listen_addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = listen_addr.parse()?;
        let app = self.router();

        info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
