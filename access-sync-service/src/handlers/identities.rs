//! Linked-account lifecycle and manual grants.

use crate::dtos::{AccountResponse, AccountStateRequest, GrantRequest, PolicyOutcomeResponse};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use validator::Validate;

/// Lifecycle transition reported by the verification flow.
pub async fn set_account_state(
    State(state): State<AppState>,
    Path((identity_id, account_id)): Path<(String, String)>,
    Json(payload): Json<AccountStateRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    let identity = state
        .policy
        .set_account_state(&identity_id, &account_id, payload.state)
        .await?;

    // Only identities already on the list change the published content.
    if state.policy.is_authorized(&identity_id).await? {
        state
            .coordinator
            .trigger(format!(
                "{} linked account {} is now {}",
                identity.label(),
                account_id,
                payload.state
            ))
            .await;
    }

    let account = identity
        .accounts
        .into_iter()
        .find(|a| a.account_id == account_id)
        .ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Linked account {} vanished", account_id))
        })?;

    Ok(Json(AccountResponse {
        identity_id,
        account_id: account.account_id,
        state: account.state,
        username: account.username,
    }))
}

pub async fn create_grant(
    State(state): State<AppState>,
    Path(identity_id): Path<String>,
    Json(payload): Json<GrantRequest>,
) -> Result<(StatusCode, Json<PolicyOutcomeResponse>), AppError> {
    payload.validate()?;

    if payload.expires_utc.is_some_and(|expires| expires <= Utc::now()) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "expires_utc must be in the future"
        )));
    }

    let outcome = state
        .policy
        .grant(&identity_id, &payload.role_id, payload.expires_utc)
        .await?;
    state.coordinator.record(&outcome).await;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

pub async fn revoke_grant(
    State(state): State<AppState>,
    Path((identity_id, role_id)): Path<(String, String)>,
) -> Result<Json<PolicyOutcomeResponse>, AppError> {
    let outcome = state.policy.revoke(&identity_id, &role_id).await?;
    state.coordinator.record(&outcome).await;
    Ok(Json(outcome.into()))
}
