//! HTTP server
//!
//! Axum server exposing the admin API under /api and the portal surface as
//! the fallback, with graceful shutdown on Ctrl+C / SIGTERM.

use crate::api::handlers::{self, AppState};
use crate::core::config::ServerConfig;
use crate::core::Config;
use crate::runtime::PluginRuntime;
use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// HTTP API Server
pub struct ApiServer {
    router: Router,
    config: ServerConfig,
}

impl ApiServer {
    pub fn new(config: &Config, runtime: Arc<PluginRuntime>) -> Self {
        Self {
            router: Self::build_router(runtime),
            config: config.server.clone(),
        }
    }

    fn build_router(runtime: Arc<PluginRuntime>) -> Router {
        let state = AppState { runtime };

        let api_router = Router::new()
            .route("/health", get(health_check))
            .route(
                "/api/plugins",
                get(handlers::list_plugins).post(handlers::register_plugin),
            )
            .route("/api/plugins/cycles", get(handlers::list_cycles))
            .route(
                "/api/plugins/:name",
                get(handlers::get_plugin).delete(handlers::unregister_plugin),
            )
            .route("/api/plugins/:name/reload", post(handlers::reload_plugin))
            .route("/api/routes", get(handlers::list_routes))
            .route("/api/services", get(handlers::list_services))
            .route("/api/fragments", get(handlers::list_fragments));

        api_router
            .fallback(handlers::portal_fallback)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
    }

    /// Start the HTTP server and listen for requests.
    ///
    /// Blocks until the server is shut down gracefully.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket_addr: SocketAddr = addr.parse()?;

        let listener = tokio::net::TcpListener::bind(socket_addr).await?;
        info!(addr = %socket_addr, "HTTP server listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    pub fn router(&self) -> &Router {
        &self.router
    }
}

/// Health check endpoint handler
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Initiating graceful shutdown...");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await;
        let value = response.0;

        assert_eq!(value["status"], "ok");
        assert!(value["version"].is_string());
        assert!(value["timestamp"].is_number());
    }
}
