//! API routes

pub mod admin;
pub mod appointments;
pub mod auth;
pub mod billing;
pub mod chat;
pub mod health;
pub mod me;
pub mod public;

use axum::{
    http::{header, HeaderMap},
    middleware,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use studio_shared::RateLimitConfig;

use crate::{
    auth::{optional_auth, require_auth},
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Extract client IP address from request headers.
/// Checks common proxy headers in order of preference.
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cf-connecting-ip") // Cloudflare
        .or_else(|| headers.get("x-real-ip"))
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
}

/// Count one `action` for `subject`; a limiter outage lets the request through
pub(crate) async fn enforce_rate_limit(
    state: &AppState,
    action: &str,
    subject: &str,
    limit: RateLimitConfig,
) -> ApiResult<()> {
    match state.rate_limiter.check(action, subject, limit).await {
        Ok(result) if !result.allowed => {
            let retry_after = result.retry_after_seconds.unwrap_or(limit.window_seconds);
            tracing::warn!(
                action = action,
                subject = %subject,
                retry_after = retry_after,
                "Rate limit exceeded"
            );
            Err(ApiError::RateLimited(retry_after))
        }
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::debug!(error = %e, action = action, "Rate limit check failed, allowing request");
            Ok(())
        }
    }
}

/// `?limit=&offset=` for list endpoints
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 200)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// Trimmed, non-empty text of at most `max` characters
pub(crate) fn required_text(field: &str, value: &str, max: usize) -> ApiResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::validation(format!("{} is required", field)));
    }
    if value.chars().count() > max {
        return Err(ApiError::validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(value.to_string())
}

/// Trimmed optional text; blank becomes `None`
pub(crate) fn optional_text(field: &str, value: Option<&str>, max: usize) -> ApiResult<Option<String>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => required_text(field, v, max).map(Some),
        None => Ok(None),
    }
}

/// Minimal shape check; deliverability is the mail provider's problem
pub(crate) fn normalize_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_lowercase();
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'))
            .unwrap_or(false)
        && !email.contains(char::is_whitespace);
    if !valid {
        return Err(ApiError::validation("A valid email address is required"));
    }
    Ok(email)
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public API routes (no auth required) - under /api/v1
    let public_api_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/settings/public", get(public::public_settings))
        .route("/availability", get(public::availability))
        .route("/plans", get(public::list_plans))
        .route("/faqs", get(public::list_faqs))
        // Stripe webhook (signature verified in the handler)
        .route("/billing/webhook", post(billing::webhook));

    // Routes that work anonymously but know the user when signed in
    let optional_auth_routes = Router::new()
        .route("/questions", post(public::submit_question))
        .route("/chat/sessions", post(chat::create_session))
        .route(
            "/chat/sessions/:session_id/messages",
            get(chat::list_messages).post(chat::send_message),
        )
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            optional_auth,
        ));

    // Protected API routes (auth required) - under /api/v1
    let protected_api_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/auth/change-password", post(auth::change_password))
        .route("/coupons/validate", post(appointments::validate_coupon))
        .route(
            "/appointments",
            get(appointments::list_appointments).post(appointments::create_appointment),
        )
        .route("/appointments/:id", get(appointments::get_appointment))
        .route("/appointments/:id/cancel", post(appointments::cancel_appointment))
        .route("/payments", get(billing::list_payments))
        .route("/payments/checkout", post(billing::appointment_checkout))
        .route("/plans/:slug/checkout", post(billing::plan_checkout))
        .route("/me/plans", get(me::my_plans))
        .route("/me/coupons", get(me::my_coupons))
        .route("/me/questions", get(me::my_questions))
        .nest("/admin", admin::router())
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .merge(health_routes)
        .nest(
            "/api/v1",
            public_api_routes
                .merge(optional_auth_routes)
                .merge(protected_api_routes),
        )
        .with_state(state)
}
