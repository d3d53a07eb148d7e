//! API authentication middleware.
//!
//! `API_KEY` is read once at startup and cached as a SHA-256 digest in
//! `AppState`. When set, every `/api/*` request must carry
//! `Authorization: Bearer <key>`; when unset the server warns once at
//! startup and runs open (dev mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::api::respond::ApiError;
use crate::state::AppState;

pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let expected_hash = match &state.api_key_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    // Hash to a fixed length, then compare in constant time.
    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            "auth_failure",
            "invalid or missing API key",
        )
        .into_response();
    }

    next.run(req).await
}
