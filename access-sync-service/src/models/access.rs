use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named bundle of permission tokens, scoped to one community.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRole {
    #[serde(rename = "_id")]
    pub id: String,
    pub community_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_role_id: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    pub created_utc: DateTime<Utc>,
}

impl PermissionRole {
    pub fn new(
        community_id: impl Into<String>,
        name: impl Into<String>,
        platform_role_id: Option<String>,
        permissions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            community_id: community_id.into(),
            name: name.into(),
            platform_role_id,
            permissions: permissions.into_iter().collect(),
            created_utc: Utc::now(),
        }
    }
}

/// `platform role id -> permission role` row of a community's mapping table.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleMapping {
    pub platform_role_id: String,
    pub role: PermissionRole,
}

impl RoleMapping {
    /// Mapping rows for every role bound to a platform role.
    pub fn from_roles(roles: &[PermissionRole]) -> Vec<RoleMapping> {
        roles
            .iter()
            .filter_map(|role| {
                role.platform_role_id.as_ref().map(|platform_role_id| RoleMapping {
                    platform_role_id: platform_role_id.clone(),
                    role: role.clone(),
                })
            })
            .collect()
    }
}

/// What the membership-event source knows about a member right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub identity_id: String,
    pub community_id: String,
    pub platform_role_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    Updated(MemberSnapshot),
    Left {
        identity_id: String,
        community_id: String,
        display_name: Option<String>,
    },
    Banned {
        identity_id: String,
        community_id: String,
        display_name: Option<String>,
    },
}

impl MembershipEvent {
    pub fn identity_id(&self) -> &str {
        match self {
            MembershipEvent::Updated(snapshot) => &snapshot.identity_id,
            MembershipEvent::Left { identity_id, .. }
            | MembershipEvent::Banned { identity_id, .. } => identity_id,
        }
    }

    pub fn community_id(&self) -> &str {
        match self {
            MembershipEvent::Updated(snapshot) => &snapshot.community_id,
            MembershipEvent::Left { community_id, .. }
            | MembershipEvent::Banned { community_id, .. } => community_id,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            MembershipEvent::Updated(snapshot) => snapshot.display_name.as_deref(),
            MembershipEvent::Left { display_name, .. }
            | MembershipEvent::Banned { display_name, .. } => display_name.as_deref(),
        }
    }

    /// Leave and ban revoke everything in the community.
    pub fn forces_revocation(&self) -> bool {
        !matches!(self, MembershipEvent::Updated(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MembershipEvent::Updated(_) => "updated",
            MembershipEvent::Left { .. } => "left",
            MembershipEvent::Banned { .. } => "banned",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grant {
    pub role_id: String,
    pub granted_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_utc: Option<DateTime<Utc>>,
}

impl Grant {
    pub fn new(role_id: impl Into<String>, expires_utc: Option<DateTime<Utc>>) -> Self {
        Self {
            role_id: role_id.into(),
            granted_utc: Utc::now(),
            expires_utc,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc.map_or(true, |expires| expires > now)
    }
}

/// Exists for every identity holding at least one grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthorizationRecord {
    #[serde(rename = "_id")]
    pub identity_id: String,
    #[serde(default)]
    pub grants: Vec<Grant>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl AuthorizationRecord {
    pub fn new(identity_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            identity_id: identity_id.into(),
            grants: Vec::new(),
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn active_role_ids(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        self.grants
            .iter()
            .filter(|g| g.is_active(now))
            .map(|g| g.role_id.clone())
            .collect()
    }

    pub fn has_active_grant(&self, now: DateTime<Utc>) -> bool {
        self.grants.iter().any(|g| g.is_active(now))
    }

    /// Replaces any grant on the same role.
    pub fn put_grant(&mut self, grant: Grant) {
        self.grants.retain(|g| g.role_id != grant.role_id);
        self.grants.push(grant);
        self.updated_utc = Utc::now();
    }

    pub fn remove_grant(&mut self, role_id: &str) -> bool {
        let before = self.grants.len();
        self.grants.retain(|g| g.role_id != role_id);
        let removed = self.grants.len() != before;
        if removed {
            self.updated_utc = Utc::now();
        }
        removed
    }
}
