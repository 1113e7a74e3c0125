#![allow(dead_code)]

use access_sync_service::config::{AccessSyncConfig, CodecConfig, PublishConfig};
use access_sync_service::models::{AccountState, MemberSnapshot, MembershipEvent, PermissionRole};
use access_sync_service::services::{
    AccessStore, ArtifactPublisher, InMemoryStore, MockPublisher, MockUserLookup, UserLookup,
};
use access_sync_service::AppState;
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_COMMUNITY_ID: &str = "community-1";
pub const TEST_CODEC_KEY: &str = "KEY";
pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

pub fn test_config(debounce: Duration) -> AccessSyncConfig {
    let mut config = AccessSyncConfig::default();
    config.codec = CodecConfig {
        default_key: Some(Secret::new(TEST_CODEC_KEY.to_string())),
        ..CodecConfig::default()
    };
    config.publish = PublishConfig {
        debounce,
        ..PublishConfig::default()
    };
    config.admin.api_token = Some(Secret::new(TEST_ADMIN_TOKEN.to_string()));
    config
}

/// In-process wiring over the in-memory store and mock collaborators.
pub struct TestContext {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub publisher: Arc<MockPublisher>,
    pub lookup: Arc<MockUserLookup>,
}

impl TestContext {
    pub fn new(debounce: Duration) -> Self {
        Self::with_publisher(debounce, MockPublisher::new())
    }

    pub fn with_publisher(debounce: Duration, publisher: MockPublisher) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(publisher);
        let lookup = Arc::new(MockUserLookup::new());

        let state = AppState::assemble(
            test_config(debounce),
            store.clone() as Arc<dyn AccessStore>,
            lookup.clone() as Arc<dyn UserLookup>,
            publisher.clone() as Arc<dyn ArtifactPublisher>,
        );

        Self {
            state,
            store,
            publisher,
            lookup,
        }
    }

    /// Creates a role bound to `platform_role_id` in the test community.
    pub async fn seed_role(
        &self,
        name: &str,
        platform_role_id: &str,
        permissions: &[&str],
    ) -> PermissionRole {
        let role = PermissionRole::new(
            TEST_COMMUNITY_ID,
            name,
            Some(platform_role_id.to_string()),
            permissions.iter().map(|p| p.to_string()),
        );
        self.store
            .save_role(&role)
            .await
            .expect("Failed to save role");
        role
    }

    /// Links a MAIN account whose source-API username is `username`.
    pub async fn seed_account(&self, identity_id: &str, account_id: &str, username: &str) {
        self.lookup.set_name(account_id, username);
        self.state
            .policy
            .set_account_state(identity_id, account_id, AccountState::Main)
            .await
            .expect("Failed to link account");
    }

    pub fn member_update(
        identity_id: &str,
        name: &str,
        platform_roles: &[&str],
    ) -> MembershipEvent {
        MembershipEvent::Updated(MemberSnapshot {
            identity_id: identity_id.to_string(),
            community_id: TEST_COMMUNITY_ID.to_string(),
            platform_role_ids: platform_roles.iter().map(|r| r.to_string()).collect(),
            display_name: Some(name.to_string()),
        })
    }

    /// Plaintext file of the most recent publish.
    pub fn last_plaintext(&self) -> Option<String> {
        self.publisher
            .published()
            .last()
            .and_then(|request| request.files.first())
            .map(|file| file.content.clone())
    }
}
