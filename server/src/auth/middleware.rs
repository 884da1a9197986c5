//! Authentication middleware.
//!
//! Subscribers and pushers present a shared token, either as a Bearer
//! `Authorization` header or as a `token` query parameter on the stream
//! endpoint. Without a configured `AUTH_TOKEN` every request is accepted.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};

use crate::error::AppError;
use crate::AppState;

/// Why a presented token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing auth token")]
    Missing,

    #[error("invalid authorization header format")]
    Malformed,

    #[error("invalid auth token")]
    Invalid,
}

/// The Bearer token of a request, if any.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    match headers.get(AUTHORIZATION) {
        None => Ok(None),
        Some(value) => {
            let header = value.to_str().map_err(|_| AuthError::Malformed)?;
            match header.strip_prefix("Bearer ") {
                Some(token) if !token.is_empty() => Ok(Some(token)),
                _ => Err(AuthError::Malformed),
            }
        }
    }
}

/// Compare a presented token against the configured one.
pub fn check_token(expected: Option<&str>, presented: Option<&str>) -> Result<(), AuthError> {
    match (expected, presented) {
        (None, _) => Ok(()),
        (Some(_), None) => Err(AuthError::Missing),
        (Some(expected), Some(presented)) if expected == presented => Ok(()),
        (Some(_), Some(_)) => Err(AuthError::Invalid),
    }
}

/// Authenticated caller extracted from request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The bearer token, or "anonymous" when auth is disabled
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        check_token(state.config.auth_token.as_deref(), token)?;

        Ok(AuthUser {
            token: token.unwrap_or("anonymous").to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), Ok(None));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Ok(Some("abc")));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), Err(AuthError::Malformed));
    }

    #[test]
    fn token_check() {
        assert_eq!(check_token(None, None), Ok(()));
        assert_eq!(check_token(Some("k"), Some("k")), Ok(()));
        assert_eq!(check_token(Some("k"), None), Err(AuthError::Missing));
        assert_eq!(check_token(Some("k"), Some("x")), Err(AuthError::Invalid));
    }
}
