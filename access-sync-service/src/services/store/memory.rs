use super::AccessStore;
use crate::models::{AuthorizationRecord, Identity, PermissionRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    identities: BTreeMap<String, Identity>,
    roles: BTreeMap<String, PermissionRole>,
    records: BTreeMap<String, AuthorizationRecord>,
}

/// Process-local store for development and tests. Contents are lost on
/// restart.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>, AppError> {
        Ok(self.tables.read().await.identities.get(identity_id).cloned())
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), AppError> {
        self.tables
            .write()
            .await
            .identities
            .insert(identity.id.clone(), identity.clone());
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, AppError> {
        Ok(self.tables.read().await.identities.values().cloned().collect())
    }

    async fn set_username(
        &self,
        account_id: &str,
        username: &str,
        refreshed_utc: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        let account = tables
            .identities
            .values_mut()
            .flat_map(|identity| identity.accounts.iter_mut())
            .find(|account| account.account_id == account_id);

        match account {
            Some(account) => {
                account.username = Some(username.to_string());
                account.username_refreshed_utc = Some(refreshed_utc);
                Ok(())
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Linked account {} not found",
                account_id
            ))),
        }
    }

    async fn get_role(&self, role_id: &str) -> Result<Option<PermissionRole>, AppError> {
        Ok(self.tables.read().await.roles.get(role_id).cloned())
    }

    async fn save_role(&self, role: &PermissionRole) -> Result<(), AppError> {
        self.tables
            .write()
            .await
            .roles
            .insert(role.id.clone(), role.clone());
        Ok(())
    }

    async fn delete_role(&self, role_id: &str) -> Result<bool, AppError> {
        Ok(self.tables.write().await.roles.remove(role_id).is_some())
    }

    async fn roles_for_community(
        &self,
        community_id: &str,
    ) -> Result<Vec<PermissionRole>, AppError> {
        Ok(self
            .tables
            .read()
            .await
            .roles
            .values()
            .filter(|role| role.community_id == community_id)
            .cloned()
            .collect())
    }

    async fn list_roles(&self) -> Result<Vec<PermissionRole>, AppError> {
        Ok(self.tables.read().await.roles.values().cloned().collect())
    }

    async fn get_record(
        &self,
        identity_id: &str,
    ) -> Result<Option<AuthorizationRecord>, AppError> {
        Ok(self.tables.read().await.records.get(identity_id).cloned())
    }

    async fn save_record(&self, record: &AuthorizationRecord) -> Result<(), AppError> {
        self.tables
            .write()
            .await
            .records
            .insert(record.identity_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_record(&self, identity_id: &str) -> Result<(), AppError> {
        self.tables.write().await.records.remove(identity_id);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<AuthorizationRecord>, AppError> {
        Ok(self.tables.read().await.records.values().cloned().collect())
    }
}
