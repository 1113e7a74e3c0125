use crate::models::{AccountState, PermissionRole};
use crate::services::content::RESERVED;
use crate::services::policy::{OutcomeKind, PolicyOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

fn validate_permissions(permissions: &Vec<String>) -> Result<(), ValidationError> {
    for permission in permissions {
        if permission.trim().is_empty() || permission.contains(RESERVED) {
            let mut error = ValidationError::new("invalid_permission");
            error.message = Some(format!("Invalid permission token '{}'", permission).into());
            return Err(error);
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
pub struct MemberUpdateRequest {
    #[validate(length(max = 250))]
    pub platform_role_ids: Vec<String>,
    #[validate(length(min = 1, max = 100))]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemberQuery {
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PolicyOutcomeResponse {
    pub identity_id: String,
    pub outcome: &'static str,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub roles: Vec<String>,
    pub summary: String,
}

impl From<PolicyOutcome> for PolicyOutcomeResponse {
    fn from(outcome: PolicyOutcome) -> Self {
        Self {
            identity_id: outcome.identity_id,
            outcome: match outcome.kind {
                OutcomeKind::Added => "added",
                OutcomeKind::Updated => "updated",
                OutcomeKind::Removed => "removed",
            },
            added: outcome.diff.add.into_iter().collect(),
            removed: outcome.diff.remove.into_iter().collect(),
            roles: outcome.roles_after,
            summary: outcome.summary,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(min = 1, max = 64))]
    pub platform_role_id: Option<String>,
    #[validate(length(min = 1), custom(function = "validate_permissions"))]
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub id: String,
    pub community_id: String,
    pub name: String,
    pub platform_role_id: Option<String>,
    pub permissions: Vec<String>,
    pub created_utc: DateTime<Utc>,
}

impl From<PermissionRole> for RoleResponse {
    fn from(role: PermissionRole) -> Self {
        Self {
            id: role.id,
            community_id: role.community_id,
            name: role.name,
            platform_role_id: role.platform_role_id,
            permissions: role.permissions.into_iter().collect(),
            created_utc: role.created_utc,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountStateRequest {
    pub state: AccountState,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub identity_id: String,
    pub account_id: String,
    pub state: AccountState,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GrantRequest {
    #[validate(length(min = 1))]
    pub role_id: String,
    pub expires_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DecodeRequest {
    #[validate(length(min = 1))]
    pub encoded: String,
    pub community_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecodeResponse {
    pub content: String,
    pub lines: usize,
}

#[derive(Debug, Serialize)]
pub struct PublishScheduledResponse {
    pub status: &'static str,
}
