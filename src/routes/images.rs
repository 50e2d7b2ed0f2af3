use axum::{extract::State, routing::get, Json, Router};

use crate::models::{AppState, ImageRecord};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/images", get(list_images))
        .with_state(state)
}

async fn list_images(State(state): State<AppState>) -> AppResult<Json<Vec<ImageRecord>>> {
    let images = state.link_cache.gallery().await.map_err(|e| {
        state.status_log.warn(format!("API Images Error: {}", e));
        AppError::from(e)
    })?;

    Ok(Json(images.as_ref().clone()))
}
