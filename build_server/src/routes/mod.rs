//! Build engine HTTP routes.

pub mod api;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::io::ReaderStream;

use crate::models::job::{JobId, Platform};
use crate::services::scheduler::{Scheduler, SubmitError};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
}

/// Build the engine's Axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/builds", get(list_builds).post(submit_build))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/cancel", post(cancel_build))
        .route(
            "/api/builds/{id}/artifacts/{platform}",
            get(download_artifact),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "queued": state.scheduler.queue_len(),
        "running": state.scheduler.running_len(),
    }))
}

// ── Build API ──

async fn submit_build(
    State(state): State<AppState>,
    payload: Result<Json<api::SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<api::SubmitResponse>), StatusCode> {
    let Json(req) = payload.map_err(|e| {
        tracing::warn!("Rejected build submission: {e}");
        StatusCode::BAD_REQUEST
    })?;

    state
        .scheduler
        .submit(req.into())
        .await
        .map(|job| {
            (
                StatusCode::CREATED,
                Json(api::SubmitResponse {
                    id: job.id,
                    status: job.status,
                }),
            )
        })
        .map_err(|e| match e {
            SubmitError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Store(e) => {
                tracing::error!("Submit build error: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
}

#[derive(serde::Deserialize)]
pub struct ListBuildsQuery {
    pub limit: Option<usize>,
}

async fn list_builds(
    State(state): State<AppState>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<api::BuildJson>>, StatusCode> {
    state
        .scheduler
        .executor()
        .store()
        .list_jobs(query.limit.unwrap_or(20).min(200))
        .await
        .map(|jobs| Json(jobs.into_iter().map(api::BuildJson::from).collect()))
        .map_err(|e| {
            tracing::error!("List builds error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Json<api::BuildJson>, StatusCode> {
    match state.scheduler.executor().store().get_job(id).await {
        Ok(Some(job)) => Ok(Json(job.into())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %id, "Get build error: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Json<api::CancelResponse> {
    Json(api::CancelResponse {
        cancelled: state.scheduler.cancel(id).await,
    })
}

async fn download_artifact(
    State(state): State<AppState>,
    Path((id, platform)): Path<(JobId, Platform)>,
) -> Result<Response, StatusCode> {
    let executor = state.scheduler.executor();
    let job = executor
        .store()
        .get_job(id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if !job.status.is_terminal() {
        return Err(StatusCode::CONFLICT);
    }
    if !job.artifacts.contains_key(&platform) {
        return Err(StatusCode::NOT_FOUND);
    }

    let artifact = executor
        .artifacts()
        .resolve(id, platform)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %id, platform = %platform, "Resolve artifact error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let file = tokio::fs::File::open(&artifact.path).await.map_err(|e| {
        tracing::error!(job_id = %id, path = %artifact.path.display(), "Open artifact error: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let size = file.metadata().await.map(|m| m.len()).map_err(|e| {
        tracing::error!(job_id = %id, path = %artifact.path.display(), "Stat artifact error: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok((
        [
            (header::CONTENT_TYPE, api::content_type(&artifact.file_name).to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.file_name),
            ),
        ],
        body,
    )
        .into_response())
}
