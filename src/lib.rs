// Photo Select - client photo selection service backed by Dropbox

pub mod config;
pub mod imaging;
pub mod link_cache;
pub mod middleware;
pub mod models;
pub mod optimizer;
pub mod queue;
pub mod retention;
pub mod routes;
pub mod selections;
pub mod storage;
pub mod types;
pub mod utils;

pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
