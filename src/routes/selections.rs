use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use tracing::info;

use crate::models::{AppState, SelectionRequest, SelectionResponse};
use crate::types::{AppError, AppResult};

const MISSING_FIELDS: &str = "User name and selections are required";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/select", post(submit_selection))
        .with_state(state)
}

async fn submit_selection(
    State(state): State<AppState>,
    payload: Result<Json<SelectionRequest>, JsonRejection>,
) -> AppResult<Json<SelectionResponse>> {
    let Json(request) = payload.map_err(|e| {
        info!("Rejected selection body: {}", e);
        AppError::InvalidRequest(MISSING_FIELDS.to_string())
    })?;

    let (Some(user_name), Some(images)) = (request.user_name, request.selected_images) else {
        return Err(AppError::InvalidRequest(MISSING_FIELDS.to_string()));
    };

    let receipt = state
        .selections
        .submit(&user_name, images)
        .await
        .inspect_err(|e| {
            if !matches!(e, AppError::InvalidRequest(_)) {
                state
                    .status_log
                    .warn(format!("Failed to save selection for {}: {}", user_name, e));
            }
        })?;

    Ok(Json(SelectionResponse {
        message: "Saved to Dropbox".to_string(),
        file_name: receipt.file_name,
    }))
}
