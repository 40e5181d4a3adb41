//! Identity extraction for the WebSocket upgrade endpoint.
//!
//! The crate does not issue or verify tokens itself. Implement
//! [`TokenValidator`] on your router state to plug in whatever identity layer
//! the application uses (JWT, sessions, an auth service, ...), then use
//! [`WsAuth`] to require a user or [`MaybeWsAuth`] to allow anonymous
//! connections.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use async_trait::async_trait;
//! # use axum::{response::{IntoResponse, Response}, routing::get, Router};
//! # use storefront_realtime::auth::{MaybeWsAuth, TokenValidator};
//! #[derive(Clone)]
//! struct AppState;
//!
//! #[async_trait]
//! impl TokenValidator for AppState {
//!     type User = u64;
//!     type Error = std::io::Error;
//!
//!     async fn validate_token(&self, token: &str) -> Result<u64, Self::Error> {
//!         token
//!             .strip_prefix("user-")
//!             .and_then(|id| id.parse().ok())
//!             .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad token"))
//!     }
//! }
//!
//! async fn whoami(MaybeWsAuth(user): MaybeWsAuth<u64>) -> Response {
//!     format!("{:?}", user).into_response()
//! }
//!
//! let app: Router = Router::new().route("/whoami", get(whoami)).with_state(AppState);
//! ```

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

/// Resolves a bearer token to a user.
#[async_trait]
pub trait TokenValidator {
    /// The user type returned on success, typically a user id.
    type User: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error>;
}

/// Requires an authenticated user; rejects with `401 Unauthorized` otherwise.
#[derive(Debug)]
pub struct WsAuth<U>(pub U)
where
    U: Send + Sync + 'static;

/// Resolves a user when a token is present.
///
/// No token yields `None` (an anonymous client). A token that fails
/// validation is still rejected with `401 Unauthorized`.
#[derive(Debug)]
pub struct MaybeWsAuth<U>(pub Option<U>)
where
    U: Send + Sync + 'static;

#[derive(Deserialize)]
struct WebSocketAuthQuery {
    token: String,
}

impl<S, U> FromRequestParts<S> for WsAuth<U>
where
    S: TokenValidator<User = U> + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, <Self as FromRequestParts<S>>::Rejection>> + Send {
        Box::pin(async move {
            match authenticate(parts, state).await? {
                Some(user) => Ok(WsAuth(user)),
                None => Err(StatusCode::UNAUTHORIZED.into_response()),
            }
        })
    }
}

impl<S, U> FromRequestParts<S> for MaybeWsAuth<U>
where
    S: TokenValidator<User = U> + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, <Self as FromRequestParts<S>>::Rejection>> + Send {
        Box::pin(async move { authenticate(parts, state).await.map(MaybeWsAuth) })
    }
}

/// `Ok(None)` when no token was supplied, `Err` when one was supplied but
/// did not validate.
async fn authenticate<S>(parts: &mut Parts, state: &S) -> Result<Option<S::User>, Response>
where
    S: TokenValidator + Send + Sync + 'static,
{
    let token = match get_token_from_headers(&parts.headers) {
        Some(token) => Some(token),
        None => Query::<WebSocketAuthQuery>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|Query(q)| q.token),
    };

    let Some(token) = token else {
        return Ok(None);
    };

    match state.validate_token(&token).await {
        Ok(user) => Ok(Some(user)),
        Err(e) => {
            debug!("Rejected WebSocket token: {}", e);
            Err(StatusCode::UNAUTHORIZED.into_response())
        }
    }
}

/// Extracts a bearer token from the Authorization header.
fn get_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(get_token_from_headers(&headers), Some("abc.def".to_string()));
    }

    #[test]
    fn test_non_bearer_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(get_token_from_headers(&headers), None);

        headers.insert("Authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(get_token_from_headers(&headers), None);
    }
}
