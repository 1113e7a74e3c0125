use super::AccessStore;
use crate::models::{AuthorizationRecord, Identity, PermissionRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson},
    options::{FindOptions, IndexOptions, ReplaceOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to MongoDB");
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for access-sync-service");

        let community_index = IndexModel::builder()
            .keys(doc! { "community_id": 1, "platform_role_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("community_platform_role_idx".to_string())
                    .build(),
            )
            .build();
        self.roles()
            .create_index(community_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create community index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        let account_index = IndexModel::builder()
            .keys(doc! { "accounts.account_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("linked_account_idx".to_string())
                    .sparse(true)
                    .build(),
            )
            .build();
        self.identities()
            .create_index(account_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create linked account index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        tracing::info!("MongoDB indexes created");
        Ok(())
    }

    pub fn identities(&self) -> Collection<Identity> {
        self.db.collection("identities")
    }

    pub fn roles(&self) -> Collection<PermissionRole> {
        self.db.collection("permission_roles")
    }

    pub fn records(&self) -> Collection<AuthorizationRecord> {
        self.db.collection("authorization_records")
    }

    fn upsert() -> ReplaceOptions {
        ReplaceOptions::builder().upsert(true).build()
    }

    fn by_id() -> FindOptions {
        FindOptions::builder().sort(doc! { "_id": 1 }).build()
    }
}

#[async_trait]
impl AccessStore for MongoStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    async fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>, AppError> {
        Ok(self
            .identities()
            .find_one(doc! { "_id": identity_id }, None)
            .await?)
    }

    async fn save_identity(&self, identity: &Identity) -> Result<(), AppError> {
        self.identities()
            .replace_one(doc! { "_id": &identity.id }, identity, Self::upsert())
            .await?;
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, AppError> {
        let cursor = self.identities().find(doc! {}, Self::by_id()).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn set_username(
        &self,
        account_id: &str,
        username: &str,
        refreshed_utc: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let refreshed = to_bson(&refreshed_utc).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to serialize timestamp: {}", e))
        })?;

        let result = self
            .identities()
            .update_one(
                doc! { "accounts.account_id": account_id },
                doc! { "$set": {
                    "accounts.$.username": username,
                    "accounts.$.username_refreshed_utc": refreshed,
                } },
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Linked account {} not found",
                account_id
            )));
        }
        Ok(())
    }

    async fn get_role(&self, role_id: &str) -> Result<Option<PermissionRole>, AppError> {
        Ok(self.roles().find_one(doc! { "_id": role_id }, None).await?)
    }

    async fn save_role(&self, role: &PermissionRole) -> Result<(), AppError> {
        self.roles()
            .replace_one(doc! { "_id": &role.id }, role, Self::upsert())
            .await?;
        Ok(())
    }

    async fn delete_role(&self, role_id: &str) -> Result<bool, AppError> {
        let result = self.roles().delete_one(doc! { "_id": role_id }, None).await?;
        Ok(result.deleted_count > 0)
    }

    async fn roles_for_community(
        &self,
        community_id: &str,
    ) -> Result<Vec<PermissionRole>, AppError> {
        let cursor = self
            .roles()
            .find(doc! { "community_id": community_id }, Self::by_id())
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_roles(&self) -> Result<Vec<PermissionRole>, AppError> {
        let cursor = self.roles().find(doc! {}, Self::by_id()).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn get_record(
        &self,
        identity_id: &str,
    ) -> Result<Option<AuthorizationRecord>, AppError> {
        Ok(self
            .records()
            .find_one(doc! { "_id": identity_id }, None)
            .await?)
    }

    async fn save_record(&self, record: &AuthorizationRecord) -> Result<(), AppError> {
        self.records()
            .replace_one(doc! { "_id": &record.identity_id }, record, Self::upsert())
            .await?;
        Ok(())
    }

    async fn delete_record(&self, identity_id: &str) -> Result<(), AppError> {
        self.records()
            .delete_one(doc! { "_id": identity_id }, None)
            .await?;
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<AuthorizationRecord>, AppError> {
        let cursor = self.records().find(doc! {}, Self::by_id()).await?;
        Ok(cursor.try_collect().await?)
    }
}
