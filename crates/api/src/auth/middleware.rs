//! Authentication middleware
//!
//! A request is authenticated by the session cookie, or by
//! `Authorization: Bearer <token>` carrying the same session token.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::CookieJar;
use studio_shared::UserRole;
use uuid::Uuid;

use crate::auth::sessions::{SessionManager, SessionUser};
use crate::error::ApiError;

/// What the auth middleware needs from application state
#[derive(Clone)]
pub struct AuthState {
    pub sessions: SessionManager,
    pub cookie_name: String,
}

/// Authenticated caller, inserted as a request extension
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: UserRole,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    /// Gate for admin handlers
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.user_id, "Non-admin attempted admin action");
            Err(ApiError::Forbidden)
        }
    }
}

impl From<SessionUser> for AuthUser {
    fn from(session: SessionUser) -> Self {
        Self {
            role: session.role(),
            user_id: session.user_id,
            session_id: session.session_id,
            email: session.email,
            name: session.name,
        }
    }
}

/// Session token from the cookie, falling back to a bearer header
pub fn extract_token(jar: &CookieJar, headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(cookie) = jar.get(cookie_name) {
        let value = cookie.value().trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn resolve(state: &AuthState, headers: &HeaderMap) -> Result<Option<AuthUser>, ApiError> {
    let jar = CookieJar::from_headers(headers);
    let Some(token) = extract_token(&jar, headers, &state.cookie_name) else {
        return Ok(None);
    };

    let session = state.sessions.lookup(&token).await?;
    Ok(session.map(AuthUser::from))
}

/// Reject requests without a valid session
pub async fn require_auth(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let resolved = resolve(&state, request.headers()).await;
    match resolved {
        Ok(Some(user)) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Ok(None) => ApiError::Unauthorized.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Attach `Option<AuthUser>` without rejecting anonymous callers
pub async fn optional_auth(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let resolved = resolve(&state, request.headers()).await;
    let user = match resolved {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup failed, continuing anonymously");
            None
        }
    };
    request.extensions_mut().insert(user);
    next.run(request).await
}
