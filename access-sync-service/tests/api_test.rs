mod common;

use access_sync_service::services::codec;
use access_sync_service::startup::build_router;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use common::{TestContext, TEST_ADMIN_TOKEN, TEST_CODEC_KEY, TEST_COMMUNITY_ID};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::time::Duration;
use tower::util::ServiceExt;

const WINDOW: Duration = Duration::from_secs(60);

fn admin_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_ADMIN_TOKEN));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn roles_uri() -> String {
    format!("/v1/communities/{}/roles", TEST_COMMUNITY_ID)
}

fn member_uri(identity_id: &str) -> String {
    format!(
        "/v1/communities/{}/members/{}",
        TEST_COMMUNITY_ID, identity_id
    )
}

#[tokio::test]
async fn health_is_public() {
    let ctx = TestContext::new(WINDOW);
    let router = build_router(ctx.state.clone());

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "access-sync-service");
}

#[tokio::test]
async fn admin_routes_require_bearer_token() {
    let ctx = TestContext::new(WINDOW);
    let router = build_router(ctx.state.clone());

    let missing = Request::builder()
        .uri("/v1/whitelist")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, missing).await.0, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/v1/whitelist")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, wrong).await.0, StatusCode::UNAUTHORIZED);

    let ok = admin_request(Method::GET, "/v1/whitelist", None);
    assert_eq!(send(&router, ok).await.0, StatusCode::OK);
}

#[tokio::test]
async fn role_administration() {
    let ctx = TestContext::new(WINDOW);
    let router = build_router(ctx.state.clone());

    let (status, role) = send_json(
        &router,
        admin_request(
            Method::POST,
            &roles_uri(),
            Some(json!({
                "name": "Staff",
                "platform_role_id": "r-staff",
                "permissions": ["staff", "vip"]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(role["name"], "Staff");
    assert_eq!(role["permissions"], json!(["staff", "vip"]));

    // One permission role per platform role.
    let (status, _) = send_json(
        &router,
        admin_request(
            Method::POST,
            &roles_uri(),
            Some(json!({
                "name": "Staff again",
                "platform_role_id": "r-staff",
                "permissions": ["staff"]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send_json(
        &router,
        admin_request(
            Method::POST,
            &roles_uri(),
            Some(json!({
                "name": "Broken",
                "permissions": ["a:b"]
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, roles) =
        send_json(&router, admin_request(Method::GET, &roles_uri(), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(roles.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn member_update_grants_mapped_roles_and_shows_in_preview() {
    let ctx = TestContext::new(WINDOW);
    ctx.seed_role("Staff", "r-staff", &["staff"]).await;
    ctx.seed_account("u1", "101", "alice").await;
    let router = build_router(ctx.state.clone());

    let (status, outcome) = send_json(
        &router,
        admin_request(
            Method::PUT,
            &member_uri("u1"),
            Some(json!({
                "platform_role_ids": ["r-staff", "r-unmapped"],
                "display_name": "Alice"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "added");
    assert_eq!(outcome["roles"], json!(["Staff"]));
    assert_eq!(outcome["summary"], "Alice was added with the roles Staff");

    let (status, body) = send(&router, admin_request(Method::GET, "/v1/whitelist", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap(), "alice,staff");

    let (status, outcome) = send_json(
        &router,
        admin_request(
            Method::POST,
            &format!("/v1/communities/{}/bans/u1", TEST_COMMUNITY_ID),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "removed");

    let (_, body) = send(&router, admin_request(Method::GET, "/v1/whitelist", None)).await;
    assert!(body.is_empty());
}

#[tokio::test]
async fn accounts_in_verification_are_hidden() {
    let ctx = TestContext::new(WINDOW);
    let role = ctx.seed_role("Staff", "r-staff", &["staff"]).await;
    ctx.seed_account("u1", "101", "alice").await;
    let router = build_router(ctx.state.clone());

    let (status, _) = send_json(
        &router,
        admin_request(
            Method::POST,
            "/v1/identities/u1/grants",
            Some(json!({ "role_id": role.id })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, account) = send_json(
        &router,
        admin_request(
            Method::PUT,
            "/v1/identities/u1/accounts/202",
            Some(json!({ "state": "IN_VERIFICATION" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(account["state"], "IN_VERIFICATION");

    let (_, body) = send(&router, admin_request(Method::GET, "/v1/whitelist", None)).await;
    assert_eq!(String::from_utf8(body).unwrap(), "alice,staff");

    ctx.lookup.set_name("202", "alice_alt");
    send_json(
        &router,
        admin_request(
            Method::PUT,
            "/v1/identities/u1/accounts/202",
            Some(json!({ "state": "ALT" })),
        ),
    )
    .await;

    let (_, body) = send(&router, admin_request(Method::GET, "/v1/whitelist", None)).await;
    assert_eq!(
        String::from_utf8(body).unwrap(),
        "alice,staff\nalice_alt,staff"
    );
}

#[tokio::test]
async fn manual_grants_validate_input() {
    let ctx = TestContext::new(WINDOW);
    let role = ctx.seed_role("Staff", "r-staff", &["staff"]).await;
    let router = build_router(ctx.state.clone());

    let (status, _) = send_json(
        &router,
        admin_request(
            Method::POST,
            "/v1/identities/u1/grants",
            Some(json!({ "role_id": role.id, "expires_utc": "2000-01-01T00:00:00Z" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send_json(
        &router,
        admin_request(
            Method::POST,
            "/v1/identities/u1/grants",
            Some(json!({ "role_id": "missing-role" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        &router,
        admin_request(
            Method::DELETE,
            &format!("/v1/identities/u1/grants/{}", role.id),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_a_role_revokes_its_grants() {
    let ctx = TestContext::new(WINDOW);
    let role = ctx.seed_role("Staff", "r-staff", &["staff"]).await;
    ctx.seed_account("u1", "101", "alice").await;
    ctx.state
        .coordinator
        .handle_event(&TestContext::member_update("u1", "Alice", &["r-staff"]))
        .await
        .unwrap();
    let router = build_router(ctx.state.clone());

    let (status, _) = send(
        &router,
        admin_request(
            Method::DELETE,
            &format!("{}/{}", roles_uri(), role.id),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!ctx.state.policy.is_authorized("u1").await.unwrap());

    let (_, body) = send(&router, admin_request(Method::GET, "/v1/whitelist", None)).await;
    assert!(body.is_empty());

    let (status, _) = send(
        &router,
        admin_request(
            Method::DELETE,
            &format!("{}/{}", roles_uri(), role.id),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn decode_verifies_published_artifacts() {
    let ctx = TestContext::new(WINDOW);
    let router = build_router(ctx.state.clone());
    let encoded = codec::encode("alice,staff:mod", TEST_CODEC_KEY).unwrap();

    let (status, decoded) = send_json(
        &router,
        admin_request(
            Method::POST,
            "/v1/whitelist/decode",
            Some(json!({ "encoded": encoded })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decoded["content"], "alice,staff:mod");
    assert_eq!(decoded["lines"], 1);

    let (status, _) = send_json(
        &router,
        admin_request(
            Method::POST,
            "/v1/whitelist/decode",
            Some(json!({ "encoded": "not base64!" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manual_publish_is_scheduled() {
    let ctx = TestContext::new(Duration::from_millis(50));
    ctx.seed_role("Staff", "r-staff", &["staff"]).await;
    ctx.seed_account("u1", "101", "alice").await;
    ctx.state
        .policy
        .apply(&TestContext::member_update("u1", "Alice", &["r-staff"]))
        .await
        .unwrap();
    let router = build_router(ctx.state.clone());

    let (status, body) = send_json(
        &router,
        admin_request(Method::POST, "/v1/whitelist/publish", None),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "scheduled");

    for _ in 0..50 {
        if ctx.publisher.publish_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let published = ctx.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message, "Manual publish requested");
    assert_eq!(published[0].files[0].content, "alice,staff");
    assert_eq!(
        codec::decode(&published[0].files[1].content, TEST_CODEC_KEY).unwrap(),
        "alice,staff"
    );
}
