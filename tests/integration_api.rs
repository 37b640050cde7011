//! Integration tests for the REST client
//!
//! Drives `ApiClient` against a wiremock server: bearer handling, the
//! public allowlist and single-flight refresh on 401.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use storefront_realtime::api::{AuthApi, LoginRequest};
use storefront_realtime::config::ApiSettings;
use storefront_realtime::{
    ApiClient, Error, MemoryTokenStore, RefreshFailure, StatusBus, StatusEvent, TokenStore,
};

use common::{jwt_expiring_in, within};

fn client_for(server: &MockServer, tokens: Arc<dyn TokenStore>) -> ApiClient {
    let settings = ApiSettings {
        base_url: format!("{}/api", server.uri()),
        ..Default::default()
    };
    ApiClient::new(&settings, tokens).unwrap()
}

fn unauthorized() -> ResponseTemplate {
    ResponseTemplate::new(401).set_body_json(json!({ "message": "Token expired" }))
}

// ─────────────────────────────────────────────────────────────────
// Bearer handling
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_protected_request_carries_bearer() {
    let server = MockServer::start().await;
    let token = jwt_expiring_in(3600);

    Mock::given(method("GET"))
        .and(path("/api/cart"))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryTokenStore::with_token(token)));
    let cart: Value = client.get_json("/cart").await.unwrap();

    assert_eq!(cart, json!({ "items": [] }));
}

#[tokio::test]
async fn test_public_request_never_carries_bearer() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "p-1" }])))
        .mount(&server)
        .await;

    let client = client_for(
        &server,
        Arc::new(MemoryTokenStore::with_token(jwt_expiring_in(3600))),
    );
    let products: Value = client.get_json("/products").await.unwrap();
    assert_eq!(products[0]["id"], "p-1");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_public_unauthorized_does_not_refresh() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/products/42"))
        .respond_with(unauthorized())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryTokenStore::new()));
    let result = client.get_json::<Value>("/products/42").await;

    assert!(matches!(result, Err(Error::Http { status: 401, .. })));
}

#[tokio::test]
async fn test_error_body_message_surfaces() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/coupons/apply"))
        .and(body_json(json!({ "code": "SPRING" })))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "message": "Coupon expired" })),
        )
        .mount(&server)
        .await;

    let client = client_for(
        &server,
        Arc::new(MemoryTokenStore::with_token(jwt_expiring_in(3600))),
    );
    let err = client
        .post_json::<_, Value>("/coupons/apply", &json!({ "code": "SPRING" }))
        .await
        .unwrap_err();

    match err {
        Error::Http { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "Coupon expired");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────
// Refresh on 401
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_unauthorized_requests_share_one_refresh() {
    let server = MockServer::start().await;
    let stale = jwt_expiring_in(-10);
    let fresh = jwt_expiring_in(900);

    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .and(header("authorization", format!("Bearer {}", fresh).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "orders": [] })))
        .with_priority(1)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(unauthorized())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": fresh }))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_token(stale));
    let client = client_for(&server, tokens.clone());

    let (a, b, c) = tokio::join!(
        client.get_json::<Value>("/orders"),
        client.get_json::<Value>("/orders"),
        client.get_json::<Value>("/orders"),
    );

    for result in [a, b, c] {
        assert_eq!(result.unwrap(), json!({ "orders": [] }));
    }
    assert_eq!(tokens.access_token().as_deref(), Some(fresh.as_str()));
    assert!(tokens.was_logged_in());
}

#[tokio::test]
async fn test_refresh_failure_reaches_every_queued_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(unauthorized())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(
        &server,
        Arc::new(MemoryTokenStore::with_token(jwt_expiring_in(-10))),
    );

    let (a, b, c) = tokio::join!(
        client.get_json::<Value>("/orders"),
        client.get_json::<Value>("/orders"),
        client.get_json::<Value>("/orders"),
    );

    for result in [a, b, c] {
        assert!(matches!(
            result,
            Err(Error::RefreshFailed(RefreshFailure::Rejected { status: 401 }))
        ));
    }
}

#[tokio::test]
async fn test_failed_refresh_clears_session_and_is_not_repeated() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(unauthorized())
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_token(jwt_expiring_in(-10)));
    tokens.set_was_logged_in(true);
    let bus = StatusBus::new();
    let mut status = bus.subscribe();
    let client = client_for(&server, tokens.clone()).with_status_bus(bus);

    let first = client.get_json::<Value>("/orders").await;
    assert!(matches!(
        first,
        Err(Error::RefreshFailed(RefreshFailure::Rejected { status: 401 }))
    ));
    assert!(tokens.access_token().is_none());
    assert!(!tokens.was_logged_in());
    assert_eq!(
        within("session expired", status.recv()).await.unwrap(),
        StatusEvent::SessionExpired {
            reason: RefreshFailure::Rejected { status: 401 }.to_string()
        }
    );

    // Nothing left to refresh: the 401 surfaces as is
    let second = client.get_json::<Value>("/orders").await;
    assert!(matches!(second, Err(Error::Http { status: 401, .. })));

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[2].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_refresh_rejects_undecodable_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accessToken": "opaque" })))
        .mount(&server)
        .await;

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    let client = client_for(&server, tokens.clone());

    let result = client.refresh_access_token().await;

    assert!(matches!(
        result,
        Err(Error::RefreshFailed(RefreshFailure::MalformedToken))
    ));
    assert!(tokens.access_token().is_none());
}

#[tokio::test]
async fn test_refresh_accepts_nested_token_shape() {
    let server = MockServer::start().await;
    let fresh = jwt_expiring_in(900);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": { "accessToken": fresh } })),
        )
        .mount(&server)
        .await;

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    let client = client_for(&server, tokens.clone());

    assert_eq!(client.refresh_access_token().await.unwrap(), fresh);
    assert_eq!(tokens.access_token(), Some(fresh));
}

// ─────────────────────────────────────────────────────────────────
// Auth endpoints
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_login_returns_session() {
    let server = MockServer::start().await;
    let token = jwt_expiring_in(900);

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({ "email": "ada@example.com", "password": "hunter2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": token,
            "user": { "id": "user-1", "email": "ada@example.com" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryTokenStore::new()));
    let session = client
        .login(&LoginRequest {
            email: "ada@example.com".to_string(),
            password: "hunter2".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(session.access_token, token);
    assert_eq!(session.user.unwrap()["email"], "ada@example.com");

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_login_bad_credentials() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "Invalid credentials" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryTokenStore::new()));
    let err = client
        .login(&LoginRequest {
            email: "ada@example.com".to_string(),
            password: "wrong".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AuthenticationFailed { ref message } if message == "Invalid credentials"));
}

#[tokio::test]
async fn test_current_user_unwraps_user_field() {
    let server = MockServer::start().await;
    let token = jwt_expiring_in(900);

    Mock::given(method("GET"))
        .and(path("/api/auth/me"))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": { "id": "user-1", "role": "admin" }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryTokenStore::with_token(token)));
    let user = client.current_user().await.unwrap();

    assert_eq!(user, json!({ "id": "user-1", "role": "admin" }));
}
