//! Bearer token authentication middleware.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

/// Shared auth state injected via axum middleware state.
#[derive(Clone)]
pub struct AuthState {
    token: Arc<SecretString>,
}

impl AuthState {
    pub fn new(token: SecretString) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    fn accepts(&self, presented: &str) -> bool {
        bool::from(
            presented
                .as_bytes()
                .ct_eq(self.token.expose_secret().as_bytes()),
        )
    }
}

/// Reject requests without `Authorization: Bearer <token>`.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
        && auth.accepts(token)
    {
        return next.run(request).await;
    }

    tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated request");
    (StatusCode::UNAUTHORIZED, "Invalid or missing auth token").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_only_exact_token() {
        let state = AuthState::new(SecretString::from("test-token"));
        assert!(state.accepts("test-token"));
        assert!(!state.accepts("test-token2"));
        assert!(!state.accepts("test"));
        assert!(!state.accepts(""));
    }

    #[test]
    fn test_auth_state_clone_shares_token() {
        let state = AuthState::new(SecretString::from("abc"));
        let cloned = state.clone();
        assert!(Arc::ptr_eq(&state.token, &cloned.token));
    }
}
