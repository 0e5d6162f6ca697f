//! HTTP fallback tests against a running server.

use courier_sync::identity::TokenVerifier;
use courier_sync::server::{ChatServer, ServerConfig};
use courier_sync::storage::{ChatStore, StoreConfig, User};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use uuid::Uuid;

struct Api {
    _dir: TempDir,
    http: Client,
    base: String,
    verifier: Arc<TokenVerifier>,
    alice: User,
    bob: User,
    carol: User,
}

impl Api {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn token(&self, user: &User) -> String {
        self.verifier.issue(user.id)
    }

    async fn send(&self, from: &User, to: &User, content: &str) -> Value {
        let response = self
            .http
            .post(self.url("/api/chat/messages"))
            .bearer_auth(self.token(from))
            .json(&json!({ "toUserId": to.id, "content": content }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }
}

async fn start() -> Api {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ChatStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let verifier = Arc::new(TokenVerifier::new("fallback-secret", store.clone()));
    let alice = store.create_user("Alice").unwrap();
    let bob = store.create_user("Bob").unwrap();
    let carol = store.create_user("Carol").unwrap();

    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", http_listener.local_addr().unwrap());

    let server = ChatServer::new(ServerConfig::default(), store, verifier.clone());
    tokio::spawn(async move {
        let _ = server.serve(ws_listener, http_listener).await;
    });

    Api {
        _dir: dir,
        http: Client::new(),
        base,
        verifier,
        alice,
        bob,
        carol,
    }
}

#[tokio::test]
async fn test_health() {
    let api = start().await;
    let body: Value = api.http.get(api.url("/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_requests_without_credentials_are_unauthorized() {
    let api = start().await;

    let response = api.http.get(api.url("/api/users/me")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert!(body["message"].is_string());

    let response = api
        .http
        .post(api.url("/api/chat/messages"))
        .bearer_auth("forged.token")
        .json(&json!({ "toUserId": api.bob.id, "content": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_me_accepts_every_credential_source() {
    let api = start().await;
    let token = api.token(&api.alice);

    let by_header: Value = api
        .http
        .get(api.url("/api/users/me"))
        .header("x-auth-token", &token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_header["displayName"], "Alice");

    let by_query = api
        .http
        .get(api.url(&format!("/api/users/me?token={token}")))
        .send()
        .await
        .unwrap();
    assert_eq!(by_query.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_open_conversation_errors() {
    let api = start().await;
    let token = api.token(&api.alice);

    let response = api
        .http
        .post(api.url("/api/chat/conversations/with"))
        .bearer_auth(&token)
        .json(&json!({ "userId": api.alice.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = api
        .http
        .post(api.url("/api/chat/conversations/with"))
        .bearer_auth(&token)
        .json(&json!({ "userId": Uuid::new_v4() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = api
        .http
        .post(api.url("/api/chat/conversations/with"))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_open_conversation_is_idempotent() {
    let api = start().await;
    let open = |who: &User, peer: &User| {
        api.http
            .post(api.url("/api/chat/conversations/with"))
            .bearer_auth(api.token(who))
            .json(&json!({ "userId": peer.id }))
            .send()
    };

    let first: Value = open(&api.alice, &api.bob).await.unwrap().json().await.unwrap();
    let second: Value = open(&api.bob, &api.alice).await.unwrap().json().await.unwrap();
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["participants"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_send_validation() {
    let api = start().await;

    let response = api
        .http
        .post(api.url("/api/chat/messages"))
        .bearer_auth(api.token(&api.alice))
        .json(&json!({ "toUserId": api.bob.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = api
        .http
        .post(api.url("/api/chat/messages"))
        .bearer_auth(api.token(&api.alice))
        .json(&json!({ "toUserId": api.bob.id, "content": "<p></p>" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_orders_by_latest_activity() {
    let api = start().await;

    api.send(&api.alice, &api.bob, "one").await;
    api.send(&api.alice, &api.carol, "two").await;
    let last = api.send(&api.bob, &api.alice, "three").await;

    let list: Value = api
        .http
        .get(api.url("/api/chat/conversations"))
        .bearer_auth(api.token(&api.alice))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], last["conversationId"]);
    assert_eq!(list[0]["lastMessage"]["content"], "three");
    assert_eq!(list[1]["lastMessage"]["content"], "two");
}

#[tokio::test]
async fn test_page_and_mark_read() {
    let api = start().await;
    let mut conversation_id = Value::Null;
    for content in ["a", "b", "c"] {
        conversation_id = api.send(&api.alice, &api.bob, content).await["conversationId"].clone();
    }
    let conversation_id = conversation_id.as_str().unwrap().to_string();

    let page: Value = api
        .http
        .get(api.url(&format!("/api/chat/conversations/{conversation_id}/messages?limit=2")))
        .bearer_auth(api.token(&api.bob))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let contents: Vec<&str> = page
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, ["b", "c"]);

    let zero = api
        .http
        .get(api.url(&format!("/api/chat/conversations/{conversation_id}/messages?limit=0")))
        .bearer_auth(api.token(&api.bob))
        .send()
        .await
        .unwrap();
    assert_eq!(zero.status(), StatusCode::BAD_REQUEST);

    let outsider = api
        .http
        .get(api.url(&format!("/api/chat/conversations/{conversation_id}/messages")))
        .bearer_auth(api.token(&api.carol))
        .send()
        .await
        .unwrap();
    assert_eq!(outsider.status(), StatusCode::NOT_FOUND);

    let receipt: Value = api
        .http
        .post(api.url(&format!("/api/chat/conversations/{conversation_id}/read")))
        .bearer_auth(api.token(&api.bob))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(receipt, json!({ "success": true, "updated": 3 }));

    let bad_id = api
        .http
        .post(api.url("/api/chat/conversations/not-a-uuid/read"))
        .bearer_auth(api.token(&api.bob))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);
}
