//! Stratus gateway: the coordinator façade and its HTTP surface
//!
//! This crate ties the traffic primitives together: the [`Coordinator`]
//! runs every request through correlation, rate limiting, routing and
//! breaker-protected dispatch, while the server exposes the read-only
//! observability surface, the health aggregate and the token-gated admin
//! operations.

pub mod coordinator;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod server;

pub use coordinator::{
    init_gateway, Coordinator, CoordinatorDeps, Downstream, DownstreamResponse, TargetKind,
    TrafficOutcome, TrafficRequest,
};
pub use health::HealthAggregator;
pub use server::Server;

use std::sync::Arc;
use stratus_common::Result;

/// Start serving on `bind_addr` with an initialized coordinator
pub async fn start_server(coordinator: Arc<Coordinator>, bind_addr: &str) -> Result<()> {
    Server::new(coordinator).run(bind_addr).await
}
