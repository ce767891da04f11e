//! HTTP API for the dashboard.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::Result;
use crate::nowcast::Nowcaster;

mod routes;

pub use routes::ApiError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub nowcaster: Arc<Nowcaster>,
}

impl AppState {
    pub fn new(nowcaster: Arc<Nowcaster>) -> Self {
        Self { nowcaster }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/models", get(routes::models))
        .route("/api/forecast", get(routes::forecast))
        .route("/api/forecast.csv", get(routes::forecast_csv))
        .route("/api/history", get(routes::history))
        .route("/api/conditions", get(routes::conditions))
        .route("/api/station", get(routes::station))
        .route("/api/refresh", post(routes::refresh))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Binds `addr` and serves until the process is stopped.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "aq_nowcast v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}
