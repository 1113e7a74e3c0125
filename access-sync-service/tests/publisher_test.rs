use access_sync_service::config::{CommitIdentity, GitHubConfig, SigningConfig};
use access_sync_service::services::publisher::{
    ArtifactPublisher, GitDataPublisher, PublishError, PublishFile, PublishRequest,
};
use ed25519_dalek::SigningKey;
use pkcs8::{EncodePrivateKey, LineEnding};
use secrecy::Secret;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REPO: &str = "/repos/acme/access";

fn github_config(server: &MockServer, signing: SigningConfig) -> GitHubConfig {
    GitHubConfig {
        api_url: server.uri(),
        token: Secret::new("gh-test-token".to_string()),
        owner: "acme".to_string(),
        repo: "access".to_string(),
        branch: "main".to_string(),
        plaintext_path: "whitelist.txt".to_string(),
        encoded_path: "whitelist.encoded.txt".to_string(),
        max_conflict_retries: 2,
        request_timeout: Duration::from_secs(5),
        signing,
    }
}

fn unsigned_publisher(server: &MockServer) -> GitDataPublisher {
    GitDataPublisher::new(github_config(server, SigningConfig::default())).unwrap()
}

fn request() -> PublishRequest {
    PublishRequest {
        message: "Alice was added with the roles Staff".to_string(),
        files: vec![
            PublishFile {
                path: "whitelist.txt".to_string(),
                content: "alice,staff".to_string(),
            },
            PublishFile {
                path: "whitelist.encoded.txt".to_string(),
                content: "ZW5jb2RlZA==".to_string(),
            },
        ],
    }
}

/// Mounts every read/create step of the Git data sequence.
async fn mount_git_data(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("{}/git/ref/heads/main", REPO)))
        .and(header("authorization", "Bearer gh-test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ref": "refs/heads/main",
            "object": { "sha": "head-sha", "type": "commit" }
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{}/git/commits/head-sha", REPO)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sha": "head-sha",
            "tree": { "sha": "base-tree-sha" }
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{}/git/blobs", REPO)))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sha": "blob-sha" })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{}/git/trees", REPO)))
        .and(body_partial_json(json!({ "base_tree": "base-tree-sha" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sha": "tree-sha" })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{}/git/commits", REPO)))
        .and(body_partial_json(json!({
            "tree": "tree-sha",
            "parents": ["head-sha"]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "sha": "commit-sha" })))
        .mount(server)
        .await;
}

async fn commit_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == format!("{}/git/commits", REPO))
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

#[tokio::test]
async fn publishes_both_files_in_one_commit() {
    let server = MockServer::start().await;
    mount_git_data(&server).await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/git/refs/heads/main", REPO)))
        .and(body_partial_json(json!({ "sha": "commit-sha", "force": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let publisher = unsigned_publisher(&server);
    let receipt = publisher.publish(&request()).await.unwrap();

    assert_eq!(receipt.commit_sha, "commit-sha");
    assert!(!receipt.signed);

    let commits = commit_bodies(&server).await;
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0]["message"], "Alice was added with the roles Staff");
    assert!(commits[0].get("signature").is_none());

    let trees: Vec<Value> = server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == format!("{}/git/trees", REPO))
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    let entries = trees[0]["tree"].as_array().unwrap();
    let paths: Vec<&str> = entries.iter().map(|e| e["path"].as_str().unwrap()).collect();
    assert_eq!(paths, vec!["whitelist.txt", "whitelist.encoded.txt"]);
    assert!(entries.iter().all(|e| e["mode"] == "100644"));
}

#[tokio::test]
async fn rejected_fast_forward_restarts_from_branch_head() {
    let server = MockServer::start().await;
    mount_git_data(&server).await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/git/refs/heads/main", REPO)))
        .respond_with(ResponseTemplate::new(422).set_body_string("Update is not a fast forward"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/git/refs/heads/main", REPO)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let publisher = unsigned_publisher(&server);
    let receipt = publisher.publish(&request()).await.unwrap();

    assert_eq!(receipt.commit_sha, "commit-sha");
    assert_eq!(commit_bodies(&server).await.len(), 2);
}

#[tokio::test]
async fn persistent_conflicts_give_up() {
    let server = MockServer::start().await;
    mount_git_data(&server).await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/git/refs/heads/main", REPO)))
        .respond_with(ResponseTemplate::new(409))
        .expect(3)
        .mount(&server)
        .await;

    let publisher = unsigned_publisher(&server);
    let err = publisher.publish(&request()).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::ConflictRetriesExhausted { attempts: 3 }
    ));
}

#[tokio::test]
async fn api_errors_abort_without_updating_the_branch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/git/ref/heads/main", REPO)))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let publisher = unsigned_publisher(&server);
    let err = publisher.publish(&request()).await.unwrap_err();

    match err {
        PublishError::Api { status, body, .. } => {
            assert_eq!(status, 401);
            assert_eq!(body, "Bad credentials");
        }
        other => panic!("Expected Api error, got {:?}", other),
    }
}

#[tokio::test]
async fn signed_commits_carry_an_ssh_signature() {
    let server = MockServer::start().await;
    mount_git_data(&server).await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/git/refs/heads/main", REPO)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let pem = SigningKey::from_bytes(&[9u8; 32])
        .to_pkcs8_pem(LineEnding::LF)
        .unwrap();
    let signing = SigningConfig {
        enabled: true,
        author: Some(CommitIdentity {
            name: "Access Bot".to_string(),
            email: "bot@example.com".to_string(),
        }),
        private_key: Some(Secret::new(pem.to_string())),
        passphrase: None,
    };

    let publisher = GitDataPublisher::new(github_config(&server, signing)).unwrap();
    let receipt = publisher.publish(&request()).await.unwrap();
    assert!(receipt.signed);

    let commits = commit_bodies(&server).await;
    let signature = commits[0]["signature"].as_str().unwrap();
    assert!(signature.starts_with("-----BEGIN SSH SIGNATURE-----\n"));
    assert!(signature.trim_end().ends_with("-----END SSH SIGNATURE-----"));
    assert_eq!(commits[0]["author"]["name"], "Access Bot");
    assert_eq!(commits[0]["author"], commits[0]["committer"]);
}

#[tokio::test]
async fn broken_signing_key_falls_back_to_unsigned() {
    let server = MockServer::start().await;
    mount_git_data(&server).await;
    Mock::given(method("PATCH"))
        .and(path(format!("{}/git/refs/heads/main", REPO)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let signing = SigningConfig {
        enabled: true,
        author: Some(CommitIdentity {
            name: "Access Bot".to_string(),
            email: "bot@example.com".to_string(),
        }),
        private_key: Some(Secret::new("not a key".to_string())),
        passphrase: None,
    };

    let publisher = GitDataPublisher::new(github_config(&server, signing)).unwrap();
    let receipt = publisher.publish(&request()).await.unwrap();

    assert!(!receipt.signed);
    assert!(commit_bodies(&server).await[0].get("signature").is_none());
}
