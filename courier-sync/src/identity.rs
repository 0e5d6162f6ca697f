//! Bearer credentials and identity verification.
//!
//! A credential can arrive from three places. They are checked in a fixed
//! priority order, and the first non-empty one wins:
//!
//! 1. the `X-Auth-Token` header (the handshake auth field)
//! 2. the `token` query parameter
//! 3. the `Authorization: Bearer …` header
//!
//! Tokens issued by [`TokenVerifier`] have the shape
//! `base64url(claims).base64url(hmac_sha256(claims))` with claims
//! `{"sub": <user id>, "exp": <unix seconds>}`.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{ChatStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the handshake auth field.
pub const AUTH_FIELD_HEADER: &str = "x-auth-token";

/// Query parameter carrying a token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Lifetime of tokens issued by [`TokenVerifier::issue`].
pub const DEFAULT_TOKEN_TTL_DAYS: i64 = 7;

/// The authenticated owner of a connection or request.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
}

/// Authentication errors.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No credential in any of the accepted places
    MissingToken,
    /// Token is not `payload.signature` or the payload does not parse
    MalformedToken,
    /// Signature does not match
    BadSignature,
    /// Token is past its expiry
    Expired,
    /// Token subject does not exist in the user directory
    UnknownUser(Uuid),
    /// The directory lookup itself failed
    Store(StoreError),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "Missing token"),
            AuthError::MalformedToken => write!(f, "Malformed token"),
            AuthError::BadSignature => write!(f, "Invalid token"),
            AuthError::Expired => write!(f, "Token expired"),
            AuthError::UnknownUser(_) => write!(f, "User not found"),
            AuthError::Store(e) => write!(f, "Directory lookup failed: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Verifies a bearer token and resolves its owner.
///
/// Synchronous so it can run inside the WebSocket handshake callback,
/// before the upgrade completes.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Raw credential candidates pulled from a request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub auth_field: Option<String>,
    pub query_token: Option<String>,
    pub authorization: Option<String>,
}

impl Credentials {
    /// Collect candidates from request headers and the raw query string.
    pub fn from_headers(headers: &HeaderMap, query: Option<&str>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let query_token = query.and_then(|q| {
            form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == TOKEN_QUERY_PARAM)
                .map(|(_, value)| value.into_owned())
        });

        Self {
            auth_field: header(AUTH_FIELD_HEADER),
            query_token,
            authorization: header("authorization"),
        }
    }

    /// The winning token, honoring the source priority.
    pub fn token(&self) -> Option<&str> {
        let bearer = self.authorization.as_deref().map(|value| {
            let value = value.trim();
            match value.get(..7) {
                Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
                _ => value,
            }
        });

        [self.auth_field.as_deref(), self.query_token.as_deref(), bearer]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|token| !token.is_empty())
    }

    /// Verify with `verifier`, failing when no source carries a token.
    pub fn authenticate(&self, verifier: &dyn IdentityVerifier) -> Result<Identity, AuthError> {
        let token = self.token().ok_or(AuthError::MissingToken)?;
        verifier.verify(token)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: i64,
}

/// HMAC-signed tokens checked against the user directory.
pub struct TokenVerifier {
    key: Vec<u8>,
    store: Arc<ChatStore>,
    ttl: Duration,
}

impl TokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>, store: Arc<ChatStore>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            store,
            ttl: Duration::days(DEFAULT_TOKEN_TTL_DAYS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a token for `user_id`.
    pub fn issue(&self, user_id: Uuid) -> String {
        let claims = Claims {
            sub: user_id,
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        // Claims hold a uuid and an integer; serializing cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()));
        format!("{payload}.{signature}")
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC: any key size")
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn claims(&self, token: &str) -> Result<Claims, AuthError> {
        let (payload, signature) = token.split_once('.').ok_or(AuthError::MalformedToken)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::MalformedToken)?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::MalformedToken)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::MalformedToken)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

impl IdentityVerifier for TokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.claims(token)?;
        match self.store.load_user(claims.sub) {
            Ok(user) => Ok(Identity {
                user_id: user.id,
                display_name: user.display_name,
            }),
            Err(StoreError::NotFound(id)) => Err(AuthError::UnknownUser(id)),
            Err(e) => Err(AuthError::Store(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::shared_store;
    use axum::http::HeaderValue;

    fn creds(auth: Option<&str>, query: Option<&str>, header: Option<&str>) -> Credentials {
        Credentials {
            auth_field: auth.map(String::from),
            query_token: query.map(String::from),
            authorization: header.map(String::from),
        }
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(creds(Some("a"), Some("q"), Some("Bearer h")).token(), Some("a"));
        assert_eq!(creds(None, Some("q"), Some("Bearer h")).token(), Some("q"));
        assert_eq!(creds(None, None, Some("Bearer h")).token(), Some("h"));
        assert_eq!(creds(None, None, None).token(), None);
    }

    #[test]
    fn test_empty_sources_are_skipped() {
        assert_eq!(creds(Some(""), Some("  "), Some("bearer h")).token(), Some("h"));
        assert_eq!(creds(None, None, Some("Bearer ")).token(), None);
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer from-header"));
        let c = Credentials::from_headers(&headers, Some("x=1&token=from%20query"));
        assert_eq!(c.query_token.as_deref(), Some("from query"));
        assert_eq!(c.token(), Some("from query"));

        headers.insert("x-auth-token", HeaderValue::from_static("from-field"));
        let c = Credentials::from_headers(&headers, Some("token=q"));
        assert_eq!(c.token(), Some("from-field"));
    }

    #[test]
    fn test_issue_and_verify() {
        let (_dir, store) = shared_store();
        let user = store.create_user("Alice").unwrap();
        let verifier = TokenVerifier::new("secret", store);

        let token = verifier.issue(user.id);
        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.display_name, "Alice");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (_dir, store) = shared_store();
        let user = store.create_user("Alice").unwrap();
        let issuer = TokenVerifier::new("one", store.clone());
        let verifier = TokenVerifier::new("two", store);

        let token = issuer.issue(user.id);
        assert!(matches!(verifier.verify(&token), Err(AuthError::BadSignature)));
    }

    #[test]
    fn test_expired_and_malformed() {
        let (_dir, store) = shared_store();
        let user = store.create_user("Alice").unwrap();
        let verifier = TokenVerifier::new("secret", store).with_ttl(Duration::seconds(-5));

        let token = verifier.issue(user.id);
        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
        assert!(matches!(verifier.verify("garbage"), Err(AuthError::MalformedToken)));
    }

    #[test]
    fn test_unknown_user_rejected() {
        let (_dir, store) = shared_store();
        let verifier = TokenVerifier::new("secret", store);
        let token = verifier.issue(Uuid::new_v4());
        assert!(matches!(verifier.verify(&token), Err(AuthError::UnknownUser(_))));
    }

    #[test]
    fn test_authenticate_missing() {
        let (_dir, store) = shared_store();
        let verifier = TokenVerifier::new("secret", store);
        assert!(matches!(
            Credentials::default().authenticate(&verifier),
            Err(AuthError::MissingToken)
        ));
    }
}
