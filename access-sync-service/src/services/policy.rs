//! Access policy: which permission roles a member should hold, and the diff
//! that brings the store in line with it.

use super::store::AccessStore;
use crate::models::{
    AccountState, AuthorizationRecord, Grant, Identity, MembershipEvent, PermissionRole,
    RoleMapping,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use service_core::error::AppError;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Role ids to add and remove, by permission role identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantDiff {
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

impl GrantDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutcomeKind {
    Added,
    Updated,
    Removed,
}

impl OutcomeKind {
    fn verb(self) -> &'static str {
        match self {
            OutcomeKind::Added => "added",
            OutcomeKind::Updated => "updated",
            OutcomeKind::Removed => "removed",
        }
    }
}

/// Post-diff state of one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub identity_id: String,
    pub kind: OutcomeKind,
    pub diff: GrantDiff,
    /// Names of the roles still active after the diff, sorted.
    pub roles_after: Vec<String>,
    pub summary: String,
}

impl PolicyOutcome {
    pub fn changed(&self) -> bool {
        !self.diff.is_empty()
    }
}

/// Role ids of every mapping whose platform role the member holds.
pub fn expected_roles(
    mappings: &[RoleMapping],
    member_role_ids: &BTreeSet<String>,
) -> BTreeSet<String> {
    mappings
        .iter()
        .filter(|m| member_role_ids.contains(&m.platform_role_id))
        .map(|m| m.role.id.clone())
        .collect()
}

/// Deduplicated union of the permissions of every matching mapping.
pub fn expected_permissions(
    mappings: &[RoleMapping],
    member_role_ids: &BTreeSet<String>,
) -> BTreeSet<String> {
    mappings
        .iter()
        .filter(|m| member_role_ids.contains(&m.platform_role_id))
        .flat_map(|m| m.role.permissions.iter().cloned())
        .collect()
}

/// Compares the expected roles with the current grants restricted to `scope`.
/// An expected role whose grant has expired counts as absent.
pub fn diff_grants(
    expected: &BTreeSet<String>,
    current: &[Grant],
    scope: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> GrantDiff {
    let active: BTreeSet<&String> = current
        .iter()
        .filter(|g| g.is_active(now))
        .map(|g| &g.role_id)
        .collect();

    let add = expected
        .iter()
        .filter(|role_id| !active.contains(role_id))
        .cloned()
        .collect();

    let remove = current
        .iter()
        .map(|g| &g.role_id)
        .filter(|role_id| scope.contains(*role_id) && !expected.contains(*role_id))
        .cloned()
        .collect();

    GrantDiff { add, remove }
}

pub fn summarize(label: &str, kind: OutcomeKind, roles_after: &[String]) -> String {
    let roles = if roles_after.is_empty() {
        "none".to_string()
    } else {
        roles_after.join(", ")
    };
    format!("{} was {} with the roles {}", label, kind.verb(), roles)
}

pub struct AccessPolicyEngine {
    store: Arc<dyn AccessStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AccessPolicyEngine {
    pub fn new(store: Arc<dyn AccessStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, identity_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drops the identity's lock entry unless another task still holds it.
    fn release_lock(&self, identity_id: &str) {
        self.locks
            .remove_if(identity_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    /// Diffs and applies one membership event. Events for the same identity
    /// are serialized.
    pub async fn apply(&self, event: &MembershipEvent) -> Result<PolicyOutcome, AppError> {
        let identity_id = event.identity_id();
        let lock = self.lock_for(identity_id);
        let guard = lock.lock().await;

        metrics::counter!("policy_events_total", "kind" => event.kind()).increment(1);
        let now = Utc::now();
        let roles = self.store.roles_for_community(event.community_id()).await?;

        let (scope, expected): (BTreeSet<String>, BTreeSet<String>) = match event {
            MembershipEvent::Updated(snapshot) => {
                self.remember_identity(identity_id, snapshot.display_name.as_deref())
                    .await?;
                let mappings = RoleMapping::from_roles(&roles);
                let scope = mappings.iter().map(|m| m.role.id.clone()).collect();
                (scope, expected_roles(&mappings, &snapshot.platform_role_ids))
            }
            MembershipEvent::Left { .. } | MembershipEvent::Banned { .. } => {
                (roles.iter().map(|r| r.id.clone()).collect(), BTreeSet::new())
            }
        };

        let existing = self.store.get_record(identity_id).await?;
        let had_active = existing.as_ref().is_some_and(|r| r.has_active_grant(now));
        let mut record = existing.unwrap_or_else(|| AuthorizationRecord::new(identity_id));

        let diff = diff_grants(&expected, &record.grants, &scope, now);
        self.persist(&mut record, &diff, now).await?;

        let label = self.label(identity_id, event.display_name()).await?;
        let outcome = self.outcome(&record, diff, had_active, &label, now).await?;

        tracing::info!(
            identity_id = %identity_id,
            community_id = %event.community_id(),
            event = event.kind(),
            added = outcome.diff.add.len(),
            removed = outcome.diff.remove.len(),
            "Applied membership event"
        );

        drop(guard);
        drop(lock);
        if event.forces_revocation() {
            self.release_lock(identity_id);
        }
        Ok(outcome)
    }

    /// Manual, optionally time-limited grant.
    pub async fn grant(
        &self,
        identity_id: &str,
        role_id: &str,
        expires_utc: Option<DateTime<Utc>>,
    ) -> Result<PolicyOutcome, AppError> {
        let role = self.store.get_role(role_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Permission role {} not found", role_id))
        })?;

        let lock = self.lock_for(identity_id);
        let _guard = lock.lock().await;

        metrics::counter!("policy_events_total", "kind" => "grant").increment(1);
        let now = Utc::now();
        let existing = self.store.get_record(identity_id).await?;
        let had_active = existing.as_ref().is_some_and(|r| r.has_active_grant(now));
        let mut record = existing.unwrap_or_else(|| AuthorizationRecord::new(identity_id));

        record.put_grant(Grant::new(&role.id, expires_utc));
        self.store.save_record(&record).await?;

        let diff = GrantDiff {
            add: BTreeSet::from([role.id.clone()]),
            remove: BTreeSet::new(),
        };
        let label = self.label(identity_id, None).await?;
        let outcome = self.outcome(&record, diff, had_active, &label, now).await?;

        tracing::info!(
            identity_id = %identity_id,
            role = %role.name,
            expires_utc = ?expires_utc,
            "Granted permission role"
        );
        Ok(outcome)
    }

    pub async fn revoke(
        &self,
        identity_id: &str,
        role_id: &str,
    ) -> Result<PolicyOutcome, AppError> {
        let lock = self.lock_for(identity_id);
        let _guard = lock.lock().await;

        metrics::counter!("policy_events_total", "kind" => "revoke").increment(1);
        let now = Utc::now();
        let mut record = self
            .store
            .get_record(identity_id)
            .await?
            .filter(|r| r.grants.iter().any(|g| g.role_id == role_id))
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Identity {} holds no grant on role {}",
                    identity_id,
                    role_id
                ))
            })?;
        let had_active = record.has_active_grant(now);

        let diff = GrantDiff {
            add: BTreeSet::new(),
            remove: BTreeSet::from([role_id.to_string()]),
        };
        self.persist(&mut record, &diff, now).await?;

        let label = self.label(identity_id, None).await?;
        let outcome = self.outcome(&record, diff, had_active, &label, now).await?;
        tracing::info!(identity_id = %identity_id, role_id = %role_id, "Revoked permission role");
        Ok(outcome)
    }

    /// Moves a linked account to `state`, creating the identity on first
    /// sighting. Verification itself happens elsewhere.
    pub async fn set_account_state(
        &self,
        identity_id: &str,
        account_id: &str,
        state: AccountState,
    ) -> Result<Identity, AppError> {
        let lock = self.lock_for(identity_id);
        let _guard = lock.lock().await;

        let mut identity = self
            .store
            .get_identity(identity_id)
            .await?
            .unwrap_or_else(|| Identity::new(identity_id));
        identity.upsert_account(account_id, state);
        self.store.save_identity(&identity).await?;

        tracing::info!(
            identity_id = %identity_id,
            account_id = %account_id,
            state = %state,
            "Linked account state changed"
        );
        Ok(identity)
    }

    /// True when the identity currently holds at least one active grant.
    pub async fn is_authorized(&self, identity_id: &str) -> Result<bool, AppError> {
        Ok(self
            .store
            .get_record(identity_id)
            .await?
            .is_some_and(|record| record.has_active_grant(Utc::now())))
    }

    /// Deletes a role and every grant on it. Returns the affected identities.
    pub async fn delete_role(&self, role_id: &str) -> Result<Vec<String>, AppError> {
        if !self.store.delete_role(role_id).await? {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Permission role {} not found",
                role_id
            )));
        }

        let mut affected = Vec::new();
        for record in self.store.list_records().await? {
            if !record.grants.iter().any(|g| g.role_id == role_id) {
                continue;
            }
            let lock = self.lock_for(&record.identity_id);
            let _guard = lock.lock().await;

            // Re-read under the lock; the listing may be stale.
            let Some(mut record) = self.store.get_record(&record.identity_id).await? else {
                continue;
            };
            let diff = GrantDiff {
                add: BTreeSet::new(),
                remove: BTreeSet::from([role_id.to_string()]),
            };
            self.persist(&mut record, &diff, Utc::now()).await?;
            affected.push(record.identity_id);
        }

        tracing::info!(role_id = %role_id, affected = affected.len(), "Deleted permission role");
        Ok(affected)
    }

    async fn persist(
        &self,
        record: &mut AuthorizationRecord,
        diff: &GrantDiff,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if diff.is_empty() {
            return Ok(());
        }

        for role_id in &diff.remove {
            record.remove_grant(role_id);
        }
        for role_id in &diff.add {
            let mut grant = Grant::new(role_id.as_str(), None);
            grant.granted_utc = now;
            record.put_grant(grant);
        }

        if record.grants.is_empty() {
            self.store.delete_record(&record.identity_id).await
        } else {
            self.store.save_record(record).await
        }
    }

    async fn outcome(
        &self,
        record: &AuthorizationRecord,
        diff: GrantDiff,
        had_active: bool,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<PolicyOutcome, AppError> {
        let active = record.active_role_ids(now);
        let mut roles_after: Vec<String> = self
            .store
            .list_roles()
            .await?
            .into_iter()
            .filter(|role: &PermissionRole| active.contains(&role.id))
            .map(|role| role.name)
            .collect();
        roles_after.sort();

        let kind = match (had_active, roles_after.is_empty()) {
            (_, true) => OutcomeKind::Removed,
            (false, false) => OutcomeKind::Added,
            (true, false) => OutcomeKind::Updated,
        };

        Ok(PolicyOutcome {
            identity_id: record.identity_id.clone(),
            kind,
            summary: summarize(label, kind, &roles_after),
            diff,
            roles_after,
        })
    }

    async fn remember_identity(
        &self,
        identity_id: &str,
        display_name: Option<&str>,
    ) -> Result<(), AppError> {
        let name = display_name.map(str::to_string);
        match self.store.get_identity(identity_id).await? {
            None => {
                let mut identity = Identity::new(identity_id);
                identity.display_name = name;
                self.store.save_identity(&identity).await
            }
            Some(mut identity) if name.is_some() && identity.display_name != name => {
                identity.display_name = name;
                self.store.save_identity(&identity).await
            }
            Some(_) => Ok(()),
        }
    }

    async fn label(&self, identity_id: &str, hint: Option<&str>) -> Result<String, AppError> {
        if let Some(name) = hint {
            return Ok(name.to_string());
        }
        Ok(self
            .store
            .get_identity(identity_id)
            .await?
            .map(|identity| identity.label().to_string())
            .unwrap_or_else(|| identity_id.to_string()))
    }
}
