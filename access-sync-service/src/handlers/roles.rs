//! Role-mapping administration.

use crate::dtos::{CreateRoleRequest, RoleResponse};
use crate::models::PermissionRole;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

pub async fn list_roles(
    State(state): State<AppState>,
    Path(community_id): Path<String>,
) -> Result<Json<Vec<RoleResponse>>, AppError> {
    let roles = state.store.roles_for_community(&community_id).await?;
    Ok(Json(roles.into_iter().map(RoleResponse::from).collect()))
}

pub async fn create_role(
    State(state): State<AppState>,
    Path(community_id): Path<String>,
    Json(payload): Json<CreateRoleRequest>,
) -> Result<(StatusCode, Json<RoleResponse>), AppError> {
    payload.validate()?;

    if let Some(platform_role_id) = &payload.platform_role_id {
        let taken = state
            .store
            .roles_for_community(&community_id)
            .await?
            .into_iter()
            .any(|role| role.platform_role_id.as_ref() == Some(platform_role_id));
        if taken {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Platform role {} is already mapped in community {}",
                platform_role_id,
                community_id
            )));
        }
    }

    let role = PermissionRole::new(
        community_id,
        payload.name,
        payload.platform_role_id,
        payload.permissions.into_iter().map(|p| p.trim().to_string()),
    );
    state.store.save_role(&role).await?;

    tracing::info!(
        role_id = %role.id,
        community_id = %role.community_id,
        name = %role.name,
        "Created permission role"
    );
    Ok((StatusCode::CREATED, Json(role.into())))
}

/// Deletes the role and every grant on it; a publish follows if anyone lost access.
pub async fn delete_role(
    State(state): State<AppState>,
    Path((community_id, role_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let role = state
        .store
        .get_role(&role_id)
        .await?
        .filter(|role| role.community_id == community_id)
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Permission role {} not found", role_id))
        })?;

    let affected = state.policy.delete_role(&role.id).await?;
    if !affected.is_empty() {
        state
            .coordinator
            .trigger(format!(
                "Role {} was deleted, updating {} members",
                role.name,
                affected.len()
            ))
            .await;
    }
    Ok(StatusCode::NO_CONTENT)
}
