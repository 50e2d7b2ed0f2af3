//! API Routes
//!
//! - `/api/images` - Gallery previews with temporary links
//! - `/api/final` - Final delivery listing, `/api/final/zip` bulk download
//! - `/api/select` - Selection submission
//! - `/api/debug` - Folder counts and the recent status log
//! - `/api/health` - Health check

pub mod debug;
pub mod finals;
pub mod health;
pub mod images;
pub mod selections;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::apply_cors;
use crate::models::AppState;

pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let router = Router::new()
        .merge(images::router(state.clone()))
        .merge(finals::router(state.clone()))
        .merge(selections::router(state.clone()))
        .merge(debug::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http());

    apply_cors(router)
}
