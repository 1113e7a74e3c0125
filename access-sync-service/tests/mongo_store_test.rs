use access_sync_service::models::{
    AccountState, AuthorizationRecord, Grant, Identity, PermissionRole,
};
use access_sync_service::services::{AccessStore, MongoStore};
use chrono::Utc;

async fn connect() -> (MongoStore, String) {
    let uri = std::env::var("TEST_MONGODB_URI")
        .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let db_name = format!("access_sync_test_{}", uuid::Uuid::new_v4());
    let store = MongoStore::connect(&uri, &db_name)
        .await
        .expect("Failed to connect to MongoDB");
    store
        .initialize_indexes()
        .await
        .expect("Failed to create indexes");
    (store, db_name)
}

#[tokio::test]
#[ignore = "Requires MongoDB (set TEST_MONGODB_URI)"]
async fn persists_identities_roles_and_records() {
    let (store, _db_name) = connect().await;
    store.health_check().await.unwrap();

    let mut identity = Identity::new("u1");
    identity.display_name = Some("Alice".to_string());
    identity.upsert_account("101", AccountState::Main);
    store.save_identity(&identity).await.unwrap();

    store.set_username("101", "alice", Utc::now()).await.unwrap();
    let loaded = store.get_identity("u1").await.unwrap().unwrap();
    assert_eq!(loaded.accounts[0].username.as_deref(), Some("alice"));

    let role = PermissionRole::new(
        "community-1",
        "Staff",
        Some("r-staff".to_string()),
        ["staff".to_string()],
    );
    store.save_role(&role).await.unwrap();
    assert_eq!(
        store.roles_for_community("community-1").await.unwrap(),
        vec![role.clone()]
    );

    let mut record = AuthorizationRecord::new("u1");
    record.put_grant(Grant::new(&role.id, None));
    store.save_record(&record).await.unwrap();
    assert_eq!(store.list_records().await.unwrap().len(), 1);

    assert!(store.delete_role(&role.id).await.unwrap());
    assert!(!store.delete_role(&role.id).await.unwrap());

    store.delete_record("u1").await.unwrap();
    assert!(store.get_record("u1").await.unwrap().is_none());
}
