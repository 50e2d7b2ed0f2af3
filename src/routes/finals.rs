use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::models::{AppState, FinalImageRecord, ZipQuery, ZipVariant};
use crate::queue::{Job, OptimizeTarget};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/final", get(list_finals))
        .route("/api/final/zip", get(download_zip))
        .with_state(state)
}

/// Also kicks off a background pass so newly delivered files get previews
async fn list_finals(State(state): State<AppState>) -> AppResult<Json<Vec<FinalImageRecord>>> {
    state.jobs.dispatch(Job::Optimize(OptimizeTarget::Final));

    let finals = state.link_cache.finals().await.map_err(|e| {
        state.status_log.warn(format!("API Final Error: {}", e));
        AppError::from(e)
    })?;

    Ok(Json(finals.as_ref().clone()))
}

async fn download_zip(State(state): State<AppState>, Query(query): Query<ZipQuery>) -> Response {
    let variant = query.variant;
    let folder = match variant {
        ZipVariant::Original => &state.config.folders.finals,
        ZipVariant::Mobile => &state.config.folders.finals_web,
    };

    if state.gateway.get_metadata(folder).await.is_err() {
        return (StatusCode::NOT_FOUND, "Target folder not found").into_response();
    }

    state
        .status_log
        .info(format!("Starting ZIP download for {}...", variant.as_str()));

    match state.gateway.download_zip(folder).await {
        Ok(stream) => {
            state
                .status_log
                .info(format!("ZIP download started for {}", variant.as_str()));
            let disposition = format!("attachment; filename=\"photos_{}.zip\"", variant.as_str());
            (
                [
                    (header::CONTENT_TYPE, "application/zip".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Err(e) if e.is_not_found() => {
            (StatusCode::NOT_FOUND, "Target folder not found").into_response()
        }
        Err(e) => {
            state.status_log.warn(format!("ZIP API Error: {}", e));
            (StatusCode::INTERNAL_SERVER_ERROR, "ZIP generation failed").into_response()
        }
    }
}
