//! HTTP routes for the fallback surface (axum).
//!
//! | Method | Path                                       | Result                       |
//! |--------|--------------------------------------------|------------------------------|
//! | GET    | `/health`                                  | `{status}`                   |
//! | GET    | `/api/users/me`                            | own profile                  |
//! | GET    | `/api/chat/conversations`                  | conversation views           |
//! | POST   | `/api/chat/conversations/with`             | resolve-or-create `{userId}` |
//! | GET    | `/api/chat/conversations/{id}/messages`    | page `?before=&limit=`       |
//! | POST   | `/api/chat/conversations/{id}/read`        | `{success, updated}`         |
//! | POST   | `/api/chat/messages`                       | 201 `{conversationId, message}` |
//!
//! Errors are `{"message": …}` with 401/400/404/500.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ChatError;
use crate::fallback::FallbackApi;
use crate::identity::Credentials;
use crate::protocol::SendMessageRequest;
use crate::service::{ConversationView, ReadReceipt, SendReceipt};
use crate::storage::{Message, User};

type ApiState = State<Arc<FallbackApi>>;

pub fn router(api: Arc<FallbackApi>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/users/me", get(me))
        .route("/api/chat/conversations", get(list_conversations))
        .route("/api/chat/conversations/with", post(open_conversation))
        .route("/api/chat/conversations/{id}/messages", get(page_messages))
        .route("/api/chat/conversations/{id}/read", post(mark_read))
        .route("/api/chat/messages", post(send_message))
        .with_state(api)
}

impl<S: Send + Sync> FromRequestParts<S> for Credentials {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Credentials::from_headers(&parts.headers, parts.uri.query()))
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        if let ChatError::Persistence(detail) = &self {
            log::error!("Request failed: {detail}");
        }
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "message": self.public_message() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenConversationBody {
    #[serde(default)]
    user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    before: Option<DateTime<Utc>>,
    #[serde(default)]
    limit: Option<usize>,
}

fn conversation_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, ChatError> {
    path.map(|Path(id)| id)
        .map_err(|_| ChatError::validation("Invalid conversation id"))
}

fn body<T>(json: Result<Json<T>, JsonRejection>) -> Result<T, ChatError> {
    json.map(|Json(value)| value)
        .map_err(|e| ChatError::validation(e.body_text()))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn me(State(api): ApiState, credentials: Credentials) -> Result<Json<User>, ChatError> {
    let who = api.authenticate(&credentials)?;
    api.me(&who).map(Json)
}

async fn list_conversations(
    State(api): ApiState,
    credentials: Credentials,
) -> Result<Json<Vec<ConversationView>>, ChatError> {
    let who = api.authenticate(&credentials)?;
    api.list_conversations(&who).map(Json)
}

async fn open_conversation(
    State(api): ApiState,
    credentials: Credentials,
    payload: Result<Json<OpenConversationBody>, JsonRejection>,
) -> Result<Json<ConversationView>, ChatError> {
    // Credentials are checked before the body so a bad token is a 401.
    let who = api.authenticate(&credentials)?;
    let payload = body(payload)?;
    api.open_conversation(&who, payload.user_id).map(Json)
}

async fn page_messages(
    State(api): ApiState,
    credentials: Credentials,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let who = api.authenticate(&credentials)?;
    let id = conversation_id(path)?;
    let Query(query) = query.map_err(|e| ChatError::validation(e.body_text()))?;
    api.page_messages(&who, id, query.before, query.limit)
        .map(Json)
}

async fn mark_read(
    State(api): ApiState,
    credentials: Credentials,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ReadReceipt>, ChatError> {
    let who = api.authenticate(&credentials)?;
    let id = conversation_id(path)?;
    api.mark_conversation_read(&who, id).map(Json)
}

async fn send_message(
    State(api): ApiState,
    credentials: Credentials,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SendReceipt>), ChatError> {
    let who = api.authenticate(&credentials)?;
    let request = body(payload)?;
    let receipt = api.send_message(&who, request)?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{AuthError, Identity, IdentityVerifier, TokenVerifier};
    use crate::service::ChatService;
    use crate::storage::test_support::shared_store;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_error_response_status() {
        let response = ChatError::not_found("Conversation not found").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ChatError::Persistence("disk".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_page_query_parses_rfc3339() {
        let query = parse_query("before=2024-01-02T03:04:05Z&limit=5");
        assert_eq!(query.limit, Some(5));
        assert_eq!(
            query.before.map(|b| b.to_rfc3339()),
            Some("2024-01-02T03:04:05+00:00".to_string())
        );
    }

    struct CountingVerifier {
        inner: TokenVerifier,
        calls: AtomicUsize,
    }

    impl IdentityVerifier for CountingVerifier {
        fn verify(&self, token: &str) -> Result<Identity, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.verify(token)
        }
    }

    #[tokio::test]
    async fn test_request_verifies_token_once() {
        let (_dir, store) = shared_store();
        let alice = store.create_user("Alice").unwrap();
        let verifier = Arc::new(CountingVerifier {
            inner: TokenVerifier::new("test-secret", store.clone()),
            calls: AtomicUsize::new(0),
        });
        let token = verifier.inner.issue(alice.id);
        let api = Arc::new(FallbackApi::new(
            verifier.clone(),
            Arc::new(ChatService::new(store)),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(api)).await });

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/api/users/me"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/api/chat/conversations"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    }

    fn parse_query(q: &str) -> PageQuery {
        let uri: axum::http::Uri = format!("http://localhost/?{q}").parse().unwrap();
        Query::<PageQuery>::try_from_uri(&uri).unwrap().0
    }
}
