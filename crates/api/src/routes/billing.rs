//! Payment routes: Stripe Checkout, payment history and the Stripe webhook

use axum::{
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use studio_billing::{CheckoutCustomer, CheckoutLink};
use studio_shared::Payment;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

use super::Pagination;

#[derive(Debug, Deserialize)]
pub struct AppointmentCheckoutRequest {
    pub appointment_id: Uuid,
}

fn customer(auth_user: &AuthUser) -> CheckoutCustomer {
    CheckoutCustomer {
        id: auth_user.user_id,
        email: auth_user.email.clone(),
    }
}

/// Start a Stripe Checkout session for a pending appointment
pub async fn appointment_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AppointmentCheckoutRequest>,
) -> ApiResult<Json<CheckoutLink>> {
    let link = state
        .billing
        .checkout()?
        .create_appointment_checkout(&customer(&auth_user), req.appointment_id)
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        appointment_id = %req.appointment_id,
        checkout_id = %link.checkout_id,
        "Appointment checkout created"
    );

    Ok(Json(link))
}

/// Start a Stripe Checkout session for a plan
pub async fn plan_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(slug): Path<String>,
) -> ApiResult<Json<CheckoutLink>> {
    let checkout = state.billing.checkout()?;
    let plan = state.billing.plans.get_by_slug(&slug).await?;
    let link = checkout
        .create_plan_checkout(&customer(&auth_user), &plan)
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        plan = %plan.slug,
        checkout_id = %link.checkout_id,
        "Plan checkout created"
    );

    Ok(Json(link))
}

/// The caller's payments, newest first
pub async fn list_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<Payment>>> {
    let payments = sqlx::query_as::<_, Payment>(&format!(
        r#"
        SELECT {} FROM payments
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
        Payment::COLUMNS
    ))
    .bind(auth_user.user_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(payments))
}

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let webhooks = state.billing.webhooks()?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::validation("Missing Stripe signature")
        })?;

    let event = webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Stripe webhook signature verification failed");
        ApiError::validation("Invalid webhook signature")
    })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}
