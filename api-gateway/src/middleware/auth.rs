// ==============================================================================
// middleware/auth.rs - Forwarded Identity Extraction
// ==============================================================================
// Description: Extract the caller's user id from the auth proxy header
// Author: Matt Barham
// Created: 2026-10-17
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================
//
// Authentication happens upstream. The proxy sets X-User-Id on every request
// it lets through; a missing or non-numeric header is rejected with 401.
//
// ==============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::models::ErrorResponse;

pub const USER_ID_HEADER: &str = "X-User-Id";

/// Authenticated user id extracted from the forwarded identity header
///
/// # Example
/// ```rust,ignore
/// async fn my_handler(AuthUser(user_id): AuthUser) -> impl IntoResponse {
///     format!("Hello, user {}!", user_id)
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub i64);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|id| *id > 0);

        match user_id {
            Some(user_id) => Ok(AuthUser(user_id)),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Missing or invalid X-User-Id header")),
            )
                .into_response()),
        }
    }
}
