use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::models::{AppState, DebugResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/debug", get(debug_info))
        .with_state(state)
}

/// Entry counts include folders, matching what the provider lists
async fn debug_info(State(state): State<AppState>) -> Response {
    let folders = &state.config.folders;
    let counts = tokio::try_join!(
        state.gateway.list_folder(&folders.source),
        state.gateway.list_folder(&folders.web),
    );

    match counts {
        Ok((source, web)) => Json(DebugResponse {
            status: "ok".to_string(),
            source_count: source.len(),
            web_count: web.len(),
            logs: state.status_log.snapshot(),
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": e.to_string(),
                "logs": state.status_log.snapshot(),
            })),
        )
            .into_response(),
    }
}
