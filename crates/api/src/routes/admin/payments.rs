//! Admin payments: listing, refunds and cash payments

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use studio_shared::{Appointment, AppointmentStatus, Payment, PaymentStatus, SiteSettings};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    booking::{notify_customer, owner_contact, BookingNotice},
    error::{ApiError, ApiResult},
    routes::Pagination,
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct AdminPaymentsQuery {
    pub status: Option<String>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct AdminPayment {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub payment: Payment,
    pub customer_email: String,
}

#[derive(Debug, Deserialize)]
pub struct ManualPaymentRequest {
    pub appointment_id: Uuid,
    /// Defaults to the appointment total
    pub amount_cents: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ManualPaymentResponse {
    pub payment: Payment,
    pub appointment: Appointment,
}

pub async fn list_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<AdminPaymentsQuery>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<AdminPayment>>> {
    auth_user.require_admin()?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<PaymentStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;

    let payments = sqlx::query_as::<_, AdminPayment>(
        r#"
        SELECT p.*, u.email AS customer_email
        FROM payments p
        JOIN users u ON u.id = p.user_id
        WHERE ($1::text IS NULL OR p.status = $1)
          AND ($2::uuid IS NULL OR p.user_id = $2)
        ORDER BY p.created_at DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(query.user_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(payments))
}

/// Refund a paid payment; the appointment itself is left as it is
pub async fn refund_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Payment>> {
    auth_user.require_admin()?;

    let payment = state.billing.refunds.refund_payment(id).await?;
    tracing::info!(
        payment_id = %id,
        admin_id = %auth_user.user_id,
        amount_cents = payment.amount_cents,
        "Payment refunded"
    );
    Ok(Json(payment))
}

/// Record a payment taken at the studio and confirm the appointment
pub async fn record_manual_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ManualPaymentRequest>,
) -> ApiResult<(StatusCode, Json<ManualPaymentResponse>)> {
    auth_user.require_admin()?;

    let settings = SiteSettings::load(&state.pool).await?;
    let mut tx = state.pool.begin().await?;

    let appointment = sqlx::query_as::<_, Appointment>(&format!(
        "SELECT {} FROM appointments WHERE id = $1 FOR UPDATE",
        Appointment::COLUMNS
    ))
    .bind(req.appointment_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::not_found("Appointment"))?;

    let was_pending = appointment.status() == AppointmentStatus::Pending;
    if !appointment.status().is_active() {
        return Err(ApiError::validation(
            "Payments can only be recorded for pending or confirmed appointments",
        ));
    }

    let amount_cents = req.amount_cents.unwrap_or(appointment.total_cents);
    if amount_cents <= 0 {
        return Err(ApiError::validation("amount_cents must be positive"));
    }

    let payment = sqlx::query_as::<_, Payment>(&format!(
        r#"
        INSERT INTO payments
            (user_id, appointment_id, provider, amount_cents, currency, status, kind, paid_at)
        VALUES ($1, $2, 'manual', $3, $4, 'paid', 'appointment', NOW())
        RETURNING {}
        "#,
        Payment::COLUMNS
    ))
    .bind(appointment.user_id)
    .bind(appointment.id)
    .bind(amount_cents)
    .bind(&settings.currency)
    .fetch_one(&mut *tx)
    .await?;

    // An open online checkout for the same booking must not be paid twice
    sqlx::query(
        "UPDATE pending_checkouts SET status = 'expired' WHERE appointment_id = $1 AND status = 'pending'",
    )
    .bind(appointment.id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE payments SET status = 'failed' WHERE appointment_id = $1 AND status = 'pending'",
    )
    .bind(appointment.id)
    .execute(&mut *tx)
    .await?;

    let appointment = sqlx::query_as::<_, Appointment>(&format!(
        r#"
        UPDATE appointments SET status = 'confirmed', updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        Appointment::COLUMNS
    ))
    .bind(appointment.id)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        payment_id = %payment.id,
        appointment_id = %appointment.id,
        admin_id = %auth_user.user_id,
        amount_cents = amount_cents,
        "Manual payment recorded"
    );

    if was_pending {
        if let Some((email, name)) = owner_contact(&state.pool, &appointment).await? {
            notify_customer(
                &state.email,
                &settings,
                &appointment,
                &email,
                &name,
                BookingNotice::Confirmed,
            )
            .await;
        }
    }

    Ok((
        StatusCode::CREATED,
        Json(ManualPaymentResponse {
            payment,
            appointment,
        }),
    ))
}
