//! Persistence seam for identities, permission roles and authorization
//! records. The store is always the source of truth; published artifacts are
//! projections of it.

pub mod memory;
pub mod mongo;

use crate::models::{AuthorizationRecord, Identity, PermissionRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

pub use memory::InMemoryStore;
pub use mongo::MongoStore;

#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    async fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>, AppError>;
    async fn save_identity(&self, identity: &Identity) -> Result<(), AppError>;
    async fn list_identities(&self) -> Result<Vec<Identity>, AppError>;
    /// Persists a refreshed username on whichever identity owns the account.
    async fn set_username(
        &self,
        account_id: &str,
        username: &str,
        refreshed_utc: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn get_role(&self, role_id: &str) -> Result<Option<PermissionRole>, AppError>;
    async fn save_role(&self, role: &PermissionRole) -> Result<(), AppError>;
    async fn delete_role(&self, role_id: &str) -> Result<bool, AppError>;
    async fn roles_for_community(&self, community_id: &str)
        -> Result<Vec<PermissionRole>, AppError>;
    async fn list_roles(&self) -> Result<Vec<PermissionRole>, AppError>;

    async fn get_record(&self, identity_id: &str)
        -> Result<Option<AuthorizationRecord>, AppError>;
    async fn save_record(&self, record: &AuthorizationRecord) -> Result<(), AppError>;
    async fn delete_record(&self, identity_id: &str) -> Result<(), AppError>;
    async fn list_records(&self) -> Result<Vec<AuthorizationRecord>, AppError>;
}
