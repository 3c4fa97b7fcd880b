//! Bearer token extraction.
//!
//! When `AUTH_SECRET` is configured, requests must carry it as a bearer
//! token. Without a secret every request is accepted as anonymous.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::AppState;

/// Authenticated caller extracted from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// Presented the configured secret
    Token,
    /// No secret is configured
    Anonymous,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        authorize(header, state.config.auth_secret.as_deref())
    }
}

fn authorize(
    header: Option<&str>,
    secret: Option<&str>,
) -> Result<AuthUser, (StatusCode, &'static str)> {
    let secret = match secret {
        Some(secret) => secret,
        None => return Ok(AuthUser::Anonymous),
    };

    match header {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) if token == secret => Ok(AuthUser::Token),
            Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid bearer token")),
            None => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            )),
        },
        None => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
    }
}
