//! Authentication routes

use std::sync::OnceLock;

use axum::{
    extract::{Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use studio_shared::{RateLimitConfig, User, UserRole};
use time::Duration;
use uuid::Uuid;

use crate::{
    auth::{extract_token, hash_password, validate_password_strength, verify_password, AuthUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

use super::{enforce_rate_limit, extract_client_ip, extract_user_agent, normalize_email, optional_text, required_text};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: User,
    /// Same value as the cookie, for clients that send `Authorization: Bearer`
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: time::OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

// =============================================================================
// Helpers
// =============================================================================

/// Hash compared against when the email is unknown, so both paths cost an
/// Argon2 verification
fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| hash_password("studio-dummy-password-0").ok())
        .as_deref()
}

fn session_cookie(state: &AppState, token: String) -> Cookie<'static> {
    Cookie::build((state.config.session_cookie_name.clone(), token))
        .path("/")
        .http_only(true)
        .secure(state.config.secure_cookies)
        .same_site(SameSite::Lax)
        .max_age(state.sessions.ttl())
        .build()
}

fn removal_cookie(state: &AppState) -> Cookie<'static> {
    Cookie::build((state.config.session_cookie_name.clone(), ""))
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}

async fn open_session(
    state: &AppState,
    jar: CookieJar,
    headers: &HeaderMap,
    user: User,
) -> ApiResult<(CookieJar, Json<AuthResponse>)> {
    let ip = extract_client_ip(headers);
    let ua = extract_user_agent(headers);
    let token = state
        .sessions
        .create(user.id, ip.as_deref(), ua.as_deref())
        .await?;
    let expires_at = time::OffsetDateTime::now_utc() + state.sessions.ttl();

    Ok((
        jar.add(session_cookie(state, token.clone())),
        Json(AuthResponse {
            user,
            token,
            expires_at,
        }),
    ))
}

async fn load_user(state: &AppState, user_id: Uuid) -> ApiResult<User> {
    sqlx::query_as::<_, User>(
        "SELECT id, email, name, phone, password_hash, role, created_at, updated_at FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(ApiError::Unauthorized)
}

// =============================================================================
// Handlers
// =============================================================================

/// Register a customer account and sign it in
pub async fn register(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, CookieJar, Json<AuthResponse>)> {
    if !state.config.enable_signup {
        return Err(ApiError::ServiceUnavailable(
            "New registrations are currently closed".to_string(),
        ));
    }

    let email = normalize_email(&req.email)?;
    let name = required_text("Name", &req.name, 120)?;
    let phone = optional_text("Phone", req.phone.as_deref(), 32)?;
    validate_password_strength(&req.password).map_err(|e| ApiError::validation(e.to_string()))?;

    let password_hash = hash_password(&req.password).map_err(|e| ApiError::Internal(e.to_string()))?;

    // The configured owner email becomes admin, but only while no admin exists
    let is_bootstrap_admin = state.config.admin_email.as_deref() == Some(email.as_str())
        && !sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE role = 'admin')")
            .fetch_one(&state.pool)
            .await?;
    let role = if is_bootstrap_admin {
        UserRole::Admin
    } else {
        UserRole::Customer
    };

    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (email, name, phone, password_hash, role)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, email, name, phone, password_hash, role, created_at, updated_at
        "#,
    )
    .bind(&email)
    .bind(&name)
    .bind(&phone)
    .bind(&password_hash)
    .bind(role.as_str())
    .fetch_one(&state.pool)
    .await
    .map_err(|e| match ApiError::from(e) {
        ApiError::Conflict(_) => ApiError::EmailAlreadyExists,
        other => other,
    })?;

    tracing::info!(user_id = %user.id, role = %user.role, "User registered");

    let (jar, body) = open_session(&state, jar, &headers, user).await?;
    Ok((StatusCode::CREATED, jar, body))
}

/// Sign in with email and password
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<AuthResponse>)> {
    let email = req.email.trim().to_lowercase();
    let subject = extract_client_ip(&headers).unwrap_or_else(|| email.clone());
    enforce_rate_limit(&state, "login", &subject, RateLimitConfig::LOGIN).await?;

    let user = sqlx::query_as::<_, User>(
        "SELECT id, email, name, phone, password_hash, role, created_at, updated_at FROM users WHERE email = $1",
    )
    .bind(&email)
    .fetch_optional(&state.pool)
    .await?;

    let Some(user) = user else {
        if let Some(hash) = dummy_hash() {
            let _ = verify_password(&req.password, hash);
        }
        tracing::info!("Login failed: unknown email");
        return Err(ApiError::InvalidCredentials);
    };

    let valid = verify_password(&req.password, &user.password_hash).unwrap_or_else(|e| {
        tracing::error!(user_id = %user.id, error = %e, "Stored password hash is unreadable");
        false
    });
    if !valid {
        tracing::info!(user_id = %user.id, "Login failed: wrong password");
        return Err(ApiError::InvalidCredentials);
    }

    tracing::info!(user_id = %user.id, "User logged in");
    open_session(&state, jar, &headers, user).await
}

/// End the current session; succeeds even without one
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> ApiResult<(CookieJar, Json<MessageResponse>)> {
    if let Some(token) = extract_token(&jar, &headers, &state.config.session_cookie_name) {
        state.sessions.revoke(&token).await?;
    }

    Ok((
        jar.add(removal_cookie(&state)),
        Json(MessageResponse {
            message: "Logged out".to_string(),
        }),
    ))
}

/// Current user profile
pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<User>> {
    Ok(Json(load_user(&state, auth_user.user_id).await?))
}

/// Change password and sign out every other session
pub async fn change_password(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let user = load_user(&state, auth_user.user_id).await?;

    let valid = verify_password(&req.current_password, &user.password_hash)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !valid {
        return Err(ApiError::InvalidCredentials);
    }
    validate_password_strength(&req.new_password)
        .map_err(|e| ApiError::validation(e.to_string()))?;
    if req.new_password == req.current_password {
        return Err(ApiError::validation(
            "The new password must be different from the current one",
        ));
    }

    let password_hash =
        hash_password(&req.new_password).map_err(|e| ApiError::Internal(e.to_string()))?;
    sqlx::query("UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1")
        .bind(user.id)
        .bind(&password_hash)
        .execute(&state.pool)
        .await?;

    state
        .sessions
        .revoke_all(user.id, Some(auth_user.session_id))
        .await?;

    state.email.send_password_changed(&user.email, &user.name).await;

    tracing::info!(user_id = %user.id, "Password changed");

    Ok(Json(MessageResponse {
        message: "Password updated".to_string(),
    }))
}
