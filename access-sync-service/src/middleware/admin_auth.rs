//! Bearer-token guard for the admin and ingestion routes.

use crate::startup::AppState;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use subtle::ConstantTimeEq;

/// Rejects requests without `Authorization: Bearer <ADMIN_API_TOKEN>`.
/// Open when no token is configured.
pub async fn require_admin_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.admin.api_token.as_ref() else {
        return Ok(next.run(req).await);
    };

    let provided = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing bearer token")))?;

    let matches: bool = provided
        .as_bytes()
        .ct_eq(expected.expose_secret().as_bytes())
        .into();
    if !matches {
        tracing::warn!(path = %req.uri().path(), "Rejected request with invalid admin token");
        return Err(AppError::Unauthorized(anyhow::anyhow!("Invalid bearer token")));
    }

    Ok(next.run(req).await)
}
