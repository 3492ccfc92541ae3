use crate::models::ApiError;
use crate::session::SessionCache;
use crate::supabase::{Backend, SupabaseError};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{convert::Infallible, sync::Arc};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AuthState {
    pub sessions: SessionCache,
    pub backend: Arc<dyn Backend>,
}

impl AuthState {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            sessions: SessionCache::from_env(),
            backend,
        }
    }
}

/// Resolves the bearer token to a [`crate::session::SessionContext`] and
/// attaches it to the request.
pub async fn require_session(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(token) = extract_bearer(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_token",
            "Provide Authorization: Bearer <access token>",
        ));
    };

    match state.sessions.acquire(state.backend.as_ref(), &token).await {
        Ok(session) => {
            debug!(target = "wayover.api", user_id = %session.user_id, "session_attached");
            request.extensions_mut().insert(session);
            Ok(next.run(request).await)
        }
        Err(SupabaseError::Unauthorized) => Ok(unauthorized_response(
            "invalid_token",
            "Session not recognized",
        )),
        Err(err) => {
            warn!(target = "wayover.api", error = %err, "session_lookup_failed");
            Ok(unauthorized_response("session_unavailable", &err.to_string()))
        }
    }
}

fn extract_bearer(headers: &http::HeaderMap) -> Option<String> {
    let raw = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim_start().split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string()).filter(|token| !token.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
