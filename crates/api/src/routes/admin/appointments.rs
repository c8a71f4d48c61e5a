//! Admin appointment management and blocked time

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use studio_shared::{
    Appointment, AppointmentStatus, BlockedTimeSlot, PaymentStatus, SiteSettings, TimeRange,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    booking::{cancel_appointment, notify_customer, owner_contact, BookingNotice},
    error::{ApiError, ApiResult},
    routes::{optional_text, Pagination},
    state::AppState,
};

use super::shared::{date_window, db_err};

const BLOCKED_COLUMNS: &str = "id, starts_at, ends_at, reason, created_by, created_at";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AdminAppointmentsQuery {
    pub status: Option<String>,
    /// Local date, inclusive
    pub from: Option<String>,
    /// Local date, inclusive
    pub to: Option<String>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct AdminAppointment {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub appointment: Appointment,
    pub customer_email: String,
    pub customer_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppointmentRequest {
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    /// Refund the paid Stripe or manual payment when cancelling
    #[serde(default)]
    pub refund: bool,
}

#[derive(Debug, Serialize)]
pub struct UpdateAppointmentResponse {
    pub appointment: Appointment,
    pub refunded_payment_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockedSlotsQuery {
    /// Include slots that already ended
    #[serde(default)]
    pub include_past: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateBlockedSlotRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub reason: Option<String>,
    /// Block even when active appointments overlap
    #[serde(default)]
    pub force: bool,
}

// =============================================================================
// Appointments
// =============================================================================

pub async fn list_appointments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<AdminAppointmentsQuery>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<AdminAppointment>>> {
    auth_user.require_admin()?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<AppointmentStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;
    let hours = SiteSettings::load(&state.pool).await?.studio_hours();
    let (from, to) = date_window(query.from.as_deref(), query.to.as_deref(), |d| {
        let day = hours.local_day(d);
        (day.start, day.end)
    })?;

    let rows = sqlx::query_as::<_, AdminAppointment>(
        r#"
        SELECT a.*, u.email AS customer_email, u.name AS customer_name
        FROM appointments a
        JOIN users u ON u.id = a.user_id
        WHERE ($1::text IS NULL OR a.status = $1)
          AND ($2::timestamptz IS NULL OR a.starts_at >= $2)
          AND ($3::timestamptz IS NULL OR a.starts_at < $3)
          AND ($4::uuid IS NULL OR a.user_id = $4)
        ORDER BY a.starts_at DESC
        LIMIT $5 OFFSET $6
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(from)
    .bind(to)
    .bind(query.user_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(rows))
}

/// Move an appointment through its lifecycle
///
/// Cancelling releases its coupon and can refund the paid payment; the
/// customer is emailed on confirm and cancel.
pub async fn update_appointment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateAppointmentRequest>,
) -> ApiResult<Json<UpdateAppointmentResponse>> {
    auth_user.require_admin()?;
    let reason = optional_text("Reason", req.reason.as_deref(), 500)?;

    let current = sqlx::query_as::<_, Appointment>(&format!(
        "SELECT {} FROM appointments WHERE id = $1",
        Appointment::COLUMNS
    ))
    .bind(id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Appointment"))?;

    let from = current.status();
    if !from.can_transition_to(req.status) {
        return Err(ApiError::validation(format!(
            "Cannot change an appointment from {} to {}",
            from.as_str(),
            req.status.as_str()
        )));
    }

    let mut refunded_payment_id = None;
    let updated = match req.status {
        AppointmentStatus::Cancelled => {
            let mut tx = state.pool.begin().await?;
            let cancelled = cancel_appointment(
                &mut *tx,
                id,
                reason.as_deref().unwrap_or("Cancelled by the studio"),
            )
            .await?
            .ok_or_else(|| ApiError::Conflict("Appointment is no longer active".to_string()))?;
            tx.commit().await?;

            if req.refund {
                let paid: Option<(Uuid,)> = sqlx::query_as(
                    "SELECT id FROM payments WHERE appointment_id = $1 AND status = $2 ORDER BY paid_at DESC LIMIT 1",
                )
                .bind(id)
                .bind(PaymentStatus::Paid.as_str())
                .fetch_optional(&state.pool)
                .await?;
                if let Some((payment_id,)) = paid {
                    state.billing.refunds.refund_payment(payment_id).await?;
                    refunded_payment_id = Some(payment_id);
                }
            }
            cancelled
        }
        next => sqlx::query_as::<_, Appointment>(&format!(
            r#"
            UPDATE appointments SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = $3
            RETURNING {}
            "#,
            Appointment::COLUMNS
        ))
        .bind(id)
        .bind(next.as_str())
        .bind(from.as_str())
        .fetch_optional(&state.pool)
        .await
        .map_err(db_err(id, "update_appointment_status"))?
        .ok_or_else(|| ApiError::Conflict("Appointment changed, reload and retry".to_string()))?,
    };

    tracing::info!(
        appointment_id = %id,
        admin_id = %auth_user.user_id,
        from = from.as_str(),
        to = req.status.as_str(),
        refunded = refunded_payment_id.is_some(),
        "Admin updated appointment"
    );

    let notice = match req.status {
        AppointmentStatus::Confirmed => Some(BookingNotice::Confirmed),
        AppointmentStatus::Cancelled => Some(BookingNotice::Cancelled(reason.as_deref())),
        _ => None,
    };
    if let Some(notice) = notice {
        let settings = SiteSettings::load(&state.pool).await?;
        if let Some((email, name)) = owner_contact(&state.pool, &updated).await? {
            notify_customer(&state.email, &settings, &updated, &email, &name, notice).await;
        }
    }

    Ok(Json(UpdateAppointmentResponse {
        appointment: updated,
        refunded_payment_id,
    }))
}

// =============================================================================
// Blocked time
// =============================================================================

pub async fn list_blocked_slots(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<BlockedSlotsQuery>,
) -> ApiResult<Json<Vec<BlockedTimeSlot>>> {
    auth_user.require_admin()?;

    let slots = sqlx::query_as::<_, BlockedTimeSlot>(&format!(
        "SELECT {} FROM blocked_time_slots WHERE $1 OR ends_at > NOW() ORDER BY starts_at",
        BLOCKED_COLUMNS
    ))
    .bind(query.include_past)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(slots))
}

/// Block studio time; refuses to cover active appointments unless forced
pub async fn create_blocked_slot(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateBlockedSlotRequest>,
) -> ApiResult<(StatusCode, Json<BlockedTimeSlot>)> {
    auth_user.require_admin()?;
    let range = TimeRange::new(req.starts_at, req.ends_at)?;
    let reason = optional_text("Reason", req.reason.as_deref(), 500)?;

    let (overlapping,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM appointments
        WHERE status IN ('pending', 'confirmed') AND starts_at < $2 AND ends_at > $1
        "#,
    )
    .bind(range.start)
    .bind(range.end)
    .fetch_one(&state.pool)
    .await?;

    if overlapping > 0 && !req.force {
        return Err(ApiError::Conflict(format!(
            "This period overlaps {} active appointment(s)",
            overlapping
        )));
    }

    let slot = sqlx::query_as::<_, BlockedTimeSlot>(&format!(
        r#"
        INSERT INTO blocked_time_slots (starts_at, ends_at, reason, created_by)
        VALUES ($1, $2, $3, $4)
        RETURNING {}
        "#,
        BLOCKED_COLUMNS
    ))
    .bind(range.start)
    .bind(range.end)
    .bind(&reason)
    .bind(auth_user.user_id)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        blocked_slot_id = %slot.id,
        admin_id = %auth_user.user_id,
        overlapping_appointments = overlapping,
        "Blocked time created"
    );

    Ok((StatusCode::CREATED, Json(slot)))
}

pub async fn delete_blocked_slot(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    auth_user.require_admin()?;

    let result = sqlx::query("DELETE FROM blocked_time_slots WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("Blocked slot"));
    }

    tracing::info!(blocked_slot_id = %id, admin_id = %auth_user.user_id, "Blocked time removed");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_request_defaults_to_no_refund() {
        let req: UpdateAppointmentRequest =
            serde_json::from_str(r#"{"status":"cancelled"}"#).unwrap();
        assert_eq!(req.status, AppointmentStatus::Cancelled);
        assert!(!req.refund);
        assert!(req.reason.is_none());
    }

    #[test]
    fn test_blocked_slot_request_force_flag() {
        let req: CreateBlockedSlotRequest = serde_json::from_str(
            r#"{"starts_at":"2025-06-02T12:00:00Z","ends_at":"2025-06-02T18:00:00Z","force":true}"#,
        )
        .unwrap();
        assert!(req.force);
        assert!(TimeRange::new(req.starts_at, req.ends_at).is_ok());
    }
}
