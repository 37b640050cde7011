//! Integration tests for the real-time connection
//!
//! Runs the connection manager over the real WebSocket transport against a
//! local mock server: handshake → authenticate → events → reconnect.

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message as WsMessage};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use storefront_realtime::api::{AuthApi, LoginRequest};
use storefront_realtime::config::{ApiSettings, RealtimeSettings, SessionSettings};
use storefront_realtime::protocol::AuthErrorCode;
use storefront_realtime::realtime::{WebSocketTransport, REASON_SERVER};
use storefront_realtime::{
    ApiClient, ConnectionManager, Error, LogoutReason, MemoryTokenStore, SessionState, StatusBus,
    StatusEvent, TokenCoordinator, TokenStore,
};

use common::{eventually, jwt_expiring_in, within};

#[derive(Debug, Clone)]
enum ServerCommand {
    Push(Value),
    DropAll,
}

/// What the server has seen and decided, shared with every connection task
#[derive(Clone, Default)]
struct ServerState {
    handshakes: Arc<Mutex<Vec<Option<String>>>>,
    cookies: Arc<Mutex<Vec<Option<String>>>>,
    received: Arc<Mutex<Vec<Value>>>,
    accepted: Arc<Mutex<HashSet<String>>>,
    revoked: Arc<Mutex<HashSet<String>>>,
}

/// Mock real-time server: accepts tokens it has been told about and
/// rejects everything else as expired
struct MockRealtimeServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
    state: ServerState,
    commands: broadcast::Sender<ServerCommand>,
}

impl MockRealtimeServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (commands, _) = broadcast::channel(16);

        let server = Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            state: ServerState::default(),
            commands,
        };

        let state = server.state.clone();
        let commands = server.commands.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        if let Ok((stream, _)) = accept_result {
                            tokio::spawn(serve(stream, state.clone(), commands.subscribe()));
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        server
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/realtime", self.addr)
    }

    fn accept_token(&self, token: &str) {
        self.state.accepted.lock().insert(token.to_string());
    }

    /// Refuse handshakes presenting `token` with HTTP 401
    fn revoke_token(&self, token: &str) {
        self.state.accepted.lock().remove(token);
        self.state.revoked.lock().insert(token.to_string());
    }

    /// `Authorization` header of every handshake, in order
    fn handshakes(&self) -> Vec<Option<String>> {
        self.state.handshakes.lock().clone()
    }

    /// `Cookie` header of every handshake, in order
    fn handshake_cookies(&self) -> Vec<Option<String>> {
        self.state.cookies.lock().clone()
    }

    fn received(&self) -> Vec<Value> {
        self.state.received.lock().clone()
    }

    fn auth_tokens(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter(|f| f["event"] == "auth:authenticate")
            .filter_map(|f| f["data"]["token"].as_str().map(str::to_string))
            .collect()
    }

    fn push(&self, event: &str, data: Value) {
        let _ = self
            .commands
            .send(ServerCommand::Push(json!({ "event": event, "data": data })));
    }

    fn drop_connections(&self) {
        let _ = self.commands.send(ServerCommand::DropAll);
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn serve(
    stream: TcpStream,
    state: ServerState,
    mut commands: broadcast::Receiver<ServerCommand>,
) {
    let header = |req: &Request, name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let handshake_state = state.clone();
    let record_handshake = move |req: &Request, resp: Response| {
        let auth = header(req, "authorization");
        handshake_state.cookies.lock().push(header(req, "cookie"));
        handshake_state.handshakes.lock().push(auth.clone());

        let bearer = auth.as_deref().and_then(|a| a.strip_prefix("Bearer "));
        if bearer.map_or(false, |t| handshake_state.revoked.lock().contains(t)) {
            let mut rejection = ErrorResponse::new(Some("jwt revoked".to_string()));
            *rejection.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(rejection);
        }
        Ok(resp)
    };

    let Ok(ws_stream) = accept_hdr_async(stream, record_handshake).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    state.received.lock().push(frame.clone());

                    if frame["event"] == "auth:authenticate" {
                        let token = frame["data"]["token"].as_str().unwrap_or_default();
                        let reply = if state.accepted.lock().contains(token) {
                            json!({ "event": "auth:success", "data": { "userId": "user-1" } })
                        } else {
                            json!({
                                "event": "auth:error",
                                "data": { "code": "TOKEN_EXPIRED", "message": "jwt expired" }
                            })
                        };
                        if write.send(WsMessage::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(ServerCommand::Push(frame)) => {
                    let _ = write.send(WsMessage::Text(frame.to_string())).await;
                }
                Ok(ServerCommand::DropAll) => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn settings(url: &str) -> RealtimeSettings {
    RealtimeSettings {
        url: url.to_string(),
        max_reconnect_attempts: 3,
        reconnect_delay_ms: 50,
        reconnect_delay_max_ms: 100,
        connect_timeout_ms: 2_000,
        initialize_timeout_ms: 3_000,
        ..Default::default()
    }
}

fn manager(url: &str, tokens: Arc<dyn TokenStore>) -> ConnectionManager {
    ConnectionManager::with_websocket(settings(url), tokens, StatusBus::new())
}

fn api_client(server: &MockServer, tokens: Arc<dyn TokenStore>) -> ApiClient {
    let settings = ApiSettings {
        base_url: format!("{}/api", server.uri()),
        ..Default::default()
    };
    ApiClient::new(&settings, tokens).unwrap()
}

async fn next_status(
    rx: &mut broadcast::Receiver<StatusEvent>,
    what: &str,
    matches: impl Fn(&StatusEvent) -> bool,
) -> StatusEvent {
    within(what, async {
        loop {
            let event = rx.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
}

// ─────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_initialize_presents_bearer_and_authenticates() {
    let server = MockRealtimeServer::start().await;
    let token = jwt_expiring_in(3600);
    server.accept_token(&token);

    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::with_token(token.clone())));
    let mut status = manager.subscribe_status();

    manager.initialize(None).await.unwrap();

    assert!(manager.is_connected());
    assert!(manager.status().socket_id.is_some());
    assert_eq!(server.handshakes(), vec![Some(format!("Bearer {}", token))]);

    next_status(&mut status, "authenticated", |e| *e == StatusEvent::Authenticated).await;
    assert!(manager.is_authenticated());
    assert_eq!(server.auth_tokens(), vec![token]);

    manager.cleanup();
}

#[tokio::test]
async fn test_anonymous_handshake_has_no_bearer() {
    let server = MockRealtimeServer::start().await;
    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::new()));

    manager.initialize(None).await.unwrap();

    assert_eq!(server.handshakes(), vec![None]);
    assert!(!manager.is_authenticated());
    assert!(server.auth_tokens().is_empty());

    manager.cleanup();
}

#[tokio::test]
async fn test_concurrent_initialize_opens_one_connection() {
    let server = MockRealtimeServer::start().await;
    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::new()));

    let (a, b) = tokio::join!(manager.initialize(None), manager.initialize(None));
    assert!(a.is_ok());
    assert!(b.is_ok());

    manager.initialize(None).await.unwrap();
    assert_eq!(server.handshakes().len(), 1);

    manager.cleanup();
}

#[tokio::test]
async fn test_initialize_fails_when_server_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let manager = manager(&format!("ws://{}/realtime", addr), Arc::new(MemoryTokenStore::new()));
    let mut status = manager.subscribe_status();

    let result = manager.initialize(None).await;
    assert!(matches!(result, Err(Error::ConnectionFailed { .. })));

    let failed = next_status(&mut status, "connection failure", |e| {
        matches!(e, StatusEvent::ConnectionFailed { .. })
    })
    .await;
    assert_eq!(failed, StatusEvent::ConnectionFailed { attempts: 3 });
    assert!(!manager.is_connected());
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_listener_registered_before_connect_receives_events() {
    let server = MockRealtimeServer::start().await;
    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::new()));

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        manager.on("order:updated", move |data| seen.lock().push(data.clone()));
    }
    assert!(manager.status().has_pending_listeners);

    manager.initialize(None).await.unwrap();
    assert!(!manager.status().has_pending_listeners);

    server.push("order:updated", json!({ "orderId": "o-1", "status": "shipped" }));

    eventually("order event", || seen.lock().len() == 1).await;
    assert_eq!(seen.lock()[0]["status"], "shipped");

    manager.cleanup();
}

#[tokio::test]
async fn test_off_stops_delivery() {
    let server = MockRealtimeServer::start().await;
    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::new()));
    manager.initialize(None).await.unwrap();

    let hits = Arc::new(Mutex::new(0u32));
    let kept = Arc::new(Mutex::new(0u32));
    let subscription = {
        let hits = hits.clone();
        manager.on("cart:updated", move |_| *hits.lock() += 1)
    };
    {
        let kept = kept.clone();
        manager.on("cart:updated", move |_| *kept.lock() += 1);
    }

    assert!(manager.off(&subscription));
    server.push("cart:updated", json!({ "items": 2 }));

    eventually("remaining listener", || *kept.lock() == 1).await;
    assert_eq!(*hits.lock(), 0);

    manager.cleanup();
}

#[tokio::test]
async fn test_emit_reaches_server() {
    let server = MockRealtimeServer::start().await;
    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::new()));

    assert!(!manager.emit("wishlist:sync", json!({})));

    manager.initialize(None).await.unwrap();
    assert!(manager.emit("wishlist:sync", json!({ "productIds": ["p-1"] })));

    eventually("emitted frame", || {
        server
            .received()
            .iter()
            .any(|f| f["event"] == "wishlist:sync" && f["data"]["productIds"][0] == "p-1")
    })
    .await;

    manager.cleanup();
}

#[tokio::test]
async fn test_rejected_token_publishes_auth_error() {
    let server = MockRealtimeServer::start().await;
    let manager = manager(
        &server.ws_url(),
        Arc::new(MemoryTokenStore::with_token(jwt_expiring_in(-60))),
    );
    let mut status = manager.subscribe_status();

    manager.initialize(None).await.unwrap();

    let event = next_status(&mut status, "auth error", |e| {
        matches!(e, StatusEvent::AuthError { .. })
    })
    .await;
    assert_eq!(
        event,
        StatusEvent::AuthError {
            code: AuthErrorCode::TokenExpired,
            message: Some("jwt expired".to_string()),
        }
    );
    assert!(manager.is_connected());
    assert!(!manager.is_authenticated());

    manager.cleanup();
}

// ─────────────────────────────────────────────────────────────────
// Reconnection
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_reauthenticates_and_keeps_listeners() {
    let server = MockRealtimeServer::start().await;
    let token = jwt_expiring_in(3600);
    server.accept_token(&token);

    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::with_token(token.clone())));
    let mut status = manager.subscribe_status();

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        manager.on("notification:new", move |data| seen.lock().push(data.clone()));
    }

    manager.initialize(None).await.unwrap();
    next_status(&mut status, "first auth", |e| *e == StatusEvent::Authenticated).await;
    let first_socket = manager.status().socket_id;

    server.drop_connections();

    let dropped = next_status(&mut status, "disconnect", |e| {
        matches!(e, StatusEvent::Disconnected { .. })
    })
    .await;
    assert_eq!(
        dropped,
        StatusEvent::Disconnected {
            reason: REASON_SERVER.to_string()
        }
    );

    next_status(&mut status, "reconnect", |e| *e == StatusEvent::Connected).await;
    next_status(&mut status, "re-auth", |e| *e == StatusEvent::Authenticated).await;

    assert!(manager.is_authenticated());
    assert_ne!(manager.status().socket_id, first_socket);
    assert_eq!(server.handshakes().len(), 2);
    assert_eq!(server.auth_tokens(), vec![token.clone(), token]);

    server.push("notification:new", json!({ "title": "Back in stock" }));
    eventually("event after reconnect", || seen.lock().len() == 1).await;

    manager.cleanup();
}

#[tokio::test]
async fn test_reconnect_presents_refreshed_token() {
    let server = MockRealtimeServer::start().await;
    let stale = jwt_expiring_in(3600);
    let fresh = jwt_expiring_in(7200);
    server.accept_token(&stale);
    server.accept_token(&fresh);

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_token(stale.clone()));
    let manager = manager(&server.ws_url(), tokens.clone());
    let mut status = manager.subscribe_status();

    manager.initialize(None).await.unwrap();
    next_status(&mut status, "first auth", |e| *e == StatusEvent::Authenticated).await;

    // Refreshed while connected; the server now refuses the old token outright
    tokens.set_access_token(&fresh);
    server.revoke_token(&stale);
    server.drop_connections();

    next_status(&mut status, "reconnect", |e| *e == StatusEvent::Connected).await;
    next_status(&mut status, "re-auth", |e| *e == StatusEvent::Authenticated).await;

    assert_eq!(
        server.handshakes(),
        vec![
            Some(format!("Bearer {}", stale)),
            Some(format!("Bearer {}", fresh)),
        ]
    );
    assert_eq!(server.auth_tokens().last(), Some(&fresh));

    manager.cleanup();
}

#[tokio::test]
async fn test_disconnect_stops_reconnecting() {
    let server = MockRealtimeServer::start().await;
    let manager = manager(&server.ws_url(), Arc::new(MemoryTokenStore::new()));

    manager.initialize(None).await.unwrap();
    manager.disconnect();
    assert!(!manager.is_connected());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.handshakes().len(), 1);
    assert!(!manager.is_connected());

    manager.connect(None).unwrap();
    manager
        .wait_for_connection(Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(server.handshakes().len(), 2);

    manager.cleanup();
}

// ─────────────────────────────────────────────────────────────────
// Token lifecycle over the wire
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_expired_token_is_refreshed_and_connection_reauthenticated() {
    let server = MockRealtimeServer::start().await;
    let api_server = MockServer::start().await;

    let stale = jwt_expiring_in(3600);
    let fresh = jwt_expiring_in(7200);
    server.accept_token(&fresh);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accessToken": fresh })))
        .expect(1)
        .mount(&api_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/auth/me"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "user": { "id": "user-1" } })),
        )
        .mount(&api_server)
        .await;

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_token(stale));
    let api: Arc<dyn AuthApi> = Arc::new(api_client(&api_server, tokens.clone()));

    let manager = manager(&server.ws_url(), tokens.clone());
    let coordinator = TokenCoordinator::new(manager.clone(), api, &SessionSettings::default());
    coordinator.start();

    let state = coordinator.bootstrap().await;
    assert!(state.is_authenticated());

    manager.initialize(None).await.unwrap();

    eventually("re-authentication", || manager.is_authenticated()).await;
    assert_eq!(tokens.access_token().as_deref(), Some(fresh.as_str()));
    assert_eq!(server.auth_tokens().last(), Some(&fresh));
    assert!(coordinator.state().is_authenticated());

    coordinator.shutdown();
    manager.cleanup();
}

#[tokio::test]
async fn test_rest_refresh_failure_ends_session() {
    let server = MockRealtimeServer::start().await;
    let api_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/auth/me"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "user": { "id": "user-1" } })),
        )
        .mount(&api_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&api_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&api_server)
        .await;

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::with_token(jwt_expiring_in(3600)));
    let manager = manager(&server.ws_url(), tokens.clone());
    let api = Arc::new(api_client(&api_server, tokens.clone()).with_status_bus(manager.bus().clone()));
    let coordinator = TokenCoordinator::new(manager.clone(), api.clone(), &SessionSettings::default());
    coordinator.start();

    assert!(coordinator.bootstrap().await.is_authenticated());

    let result = api.get_json::<Value>("/orders").await;
    assert!(matches!(result, Err(Error::RefreshFailed(_))));

    eventually("session end", || !coordinator.state().is_authenticated()).await;
    assert!(matches!(
        coordinator.state(),
        SessionState::Anonymous {
            reason: Some(LogoutReason::RefreshFailed(_))
        }
    ));
    assert!(coordinator.next_refresh_in().is_none());
    assert!(tokens.access_token().is_none());
    assert!(!tokens.was_logged_in());

    // Later requests surface the 401 instead of refreshing again
    let again = api.get_json::<Value>("/orders").await;
    assert!(matches!(again, Err(Error::Http { status: 401, .. })));

    coordinator.shutdown();
    manager.cleanup();
}

// ─────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_credentialed_handshake_carries_api_cookies() {
    let server = MockRealtimeServer::start().await;
    let api_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "refresh_token=r1; Path=/; HttpOnly")
                .set_body_json(json!({ "accessToken": jwt_expiring_in(900) })),
        )
        .mount(&api_server)
        .await;

    let tokens: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    let api = api_client(&api_server, tokens.clone());
    api.login(&LoginRequest {
        email: "ada@example.com".to_string(),
        password: "hunter2".to_string(),
    })
    .await
    .unwrap();

    let credentialed = ConnectionManager::new(
        settings(&server.ws_url()),
        Arc::new(WebSocketTransport::new().with_cookie_jar(api.cookie_jar())),
        tokens.clone(),
        StatusBus::new(),
    );
    credentialed.initialize(None).await.unwrap();
    credentialed.cleanup();

    let anonymous = ConnectionManager::new(
        RealtimeSettings {
            with_credentials: false,
            ..settings(&server.ws_url())
        },
        Arc::new(WebSocketTransport::new().with_cookie_jar(api.cookie_jar())),
        tokens,
        StatusBus::new(),
    );
    anonymous.initialize(None).await.unwrap();
    anonymous.cleanup();

    assert_eq!(
        server.handshake_cookies(),
        vec![Some("refresh_token=r1".to_string()), None]
    );
}
