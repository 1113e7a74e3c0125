//! Preview, manual publish and artifact verification.

use crate::dtos::{DecodeRequest, DecodeResponse, PublishScheduledResponse};
use crate::services::codec;
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use service_core::error::AppError;
use validator::Validate;

/// Plaintext that the next publish would commit.
pub async fn preview(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let artifacts = state.coordinator.pipeline().render(Utc::now()).await?;
    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        artifacts.plaintext,
    ))
}

/// Arms the debounce window; the publish itself happens on the driver task.
pub async fn publish(
    State(state): State<AppState>,
) -> (StatusCode, Json<PublishScheduledResponse>) {
    state.coordinator.trigger("Manual publish requested").await;
    (
        StatusCode::ACCEPTED,
        Json(PublishScheduledResponse {
            status: "scheduled",
        }),
    )
}

/// Checks an encoded artifact against the configured key.
pub async fn decode(
    State(state): State<AppState>,
    Json(payload): Json<DecodeRequest>,
) -> Result<Json<DecodeResponse>, AppError> {
    payload.validate()?;

    let key = state
        .coordinator
        .pipeline()
        .keys
        .resolve(payload.community_id.as_deref())
        .map_err(|e| AppError::ConfigError(e.into()))?;
    let content = codec::decode(&payload.encoded, key).map_err(|e| {
        tracing::warn!(error = %e, "Rejected encoded artifact");
        AppError::BadRequest(e.into())
    })?;

    let lines = content.lines().count();
    Ok(Json(DecodeResponse { content, lines }))
}
