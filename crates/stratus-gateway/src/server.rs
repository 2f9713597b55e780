//! HTTP server wiring

use axum::middleware::from_fn_with_state;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use stratus_common::{Error, Result};

use crate::coordinator::Coordinator;
use crate::handlers;
use crate::middleware;

/// HTTP server wrapper around the coordinator
pub struct Server {
    coordinator: Arc<Coordinator>,
}

impl Server {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Serve until shutdown is signalled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let app = self.create_app();

        info!("starting server on {bind_addr}");
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Configuration(format!("cannot bind {bind_addr}: {e}")))?;

        let coordinator = self.coordinator.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                coordinator.shutdown().await;
            })
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))?;

        Ok(())
    }

    fn create_app(&self) -> Router {
        let timeout =
            Duration::from_millis(self.coordinator.config().budget.total_ms.max(1000) * 2);
        handlers::create_router(self.coordinator.clone()).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(TimeoutLayer::new(timeout))
                .layer(from_fn_with_state(
                    self.coordinator.clone(),
                    middleware::correlation_middleware,
                ))
                .layer(from_fn_with_state(
                    self.coordinator.clone(),
                    middleware::metrics_middleware,
                )),
        )
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
