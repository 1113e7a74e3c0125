//! Membership events from the community platform.

use crate::dtos::{MemberQuery, MemberUpdateRequest, PolicyOutcomeResponse};
use crate::models::{MemberSnapshot, MembershipEvent};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;
use validator::Validate;

/// Current platform roles of a member; applies the diff immediately.
pub async fn update_member(
    State(state): State<AppState>,
    Path((community_id, identity_id)): Path<(String, String)>,
    Json(payload): Json<MemberUpdateRequest>,
) -> Result<Json<PolicyOutcomeResponse>, AppError> {
    payload.validate()?;

    let event = MembershipEvent::Updated(MemberSnapshot {
        identity_id,
        community_id,
        platform_role_ids: payload.platform_role_ids.into_iter().collect(),
        display_name: payload.display_name,
    });
    let outcome = state.coordinator.handle_event(&event).await?;
    Ok(Json(outcome.into()))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Path((community_id, identity_id)): Path<(String, String)>,
    Query(query): Query<MemberQuery>,
) -> Result<Json<PolicyOutcomeResponse>, AppError> {
    let event = MembershipEvent::Left {
        identity_id,
        community_id,
        display_name: query.display_name,
    };
    let outcome = state.coordinator.handle_event(&event).await?;
    Ok(Json(outcome.into()))
}

pub async fn ban_member(
    State(state): State<AppState>,
    Path((community_id, identity_id)): Path<(String, String)>,
    Query(query): Query<MemberQuery>,
) -> Result<Json<PolicyOutcomeResponse>, AppError> {
    let event = MembershipEvent::Banned {
        identity_id,
        community_id,
        display_name: query.display_name,
    };
    let outcome = state.coordinator.handle_event(&event).await?;
    Ok(Json(outcome.into()))
}
