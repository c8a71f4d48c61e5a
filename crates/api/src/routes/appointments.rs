//! Customer booking routes

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use studio_billing::{CouponQuote, CouponService};
use studio_shared::{
    booking_subtotal, find_conflict, Appointment, AppointmentStatus, BlockedTimeSlot, Quote,
    ServiceKind, SiteSettings, TimeRange,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    booking::{cancel_appointment as cancel_active, notify_customer, BookingNotice},
    error::{ApiError, ApiResult},
    state::AppState,
};

use super::{optional_text, Pagination};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ValidateCouponRequest {
    pub code: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub subtotal_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub service: ServiceKind,
    pub notes: Option<String>,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub appointment: Appointment,
    /// False when the booking was free and is already confirmed
    pub requires_payment: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListAppointmentsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

// =============================================================================
// Helpers
// =============================================================================

fn requested_range(
    starts_at: Option<OffsetDateTime>,
    ends_at: Option<OffsetDateTime>,
) -> ApiResult<Option<TimeRange>> {
    match (starts_at, ends_at) {
        (Some(start), Some(end)) => Ok(Some(TimeRange::new(start, end)?)),
        (None, None) => Ok(None),
        _ => Err(ApiError::validation(
            "starts_at and ends_at must be given together",
        )),
    }
}

async fn load_own(state: &AppState, user_id: Uuid, id: Uuid) -> ApiResult<Appointment> {
    sqlx::query_as::<_, Appointment>(&format!(
        "SELECT {} FROM appointments WHERE id = $1 AND user_id = $2",
        Appointment::COLUMNS
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Appointment"))
}

/// Row values for a new booking
pub(crate) struct NewBooking {
    pub user_id: Uuid,
    pub range: TimeRange,
    pub service: ServiceKind,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
    pub quote: Quote,
    pub coupon_id: Option<Uuid>,
}

/// Insert a booking; the exclusion constraint rejects a concurrent overlap
/// with `SlotUnavailable`
pub(crate) async fn insert_appointment(
    conn: &mut PgConnection,
    booking: &NewBooking,
) -> ApiResult<Appointment> {
    let appointment = sqlx::query_as::<_, Appointment>(&format!(
        r#"
        INSERT INTO appointments
            (user_id, starts_at, ends_at, service, notes, status,
             subtotal_cents, discount_cents, total_cents, coupon_id, user_plan_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                (SELECT user_plan_id FROM coupons WHERE id = $10))
        RETURNING {}
        "#,
        Appointment::COLUMNS
    ))
    .bind(booking.user_id)
    .bind(booking.range.start)
    .bind(booking.range.end)
    .bind(booking.service.as_str())
    .bind(&booking.notes)
    .bind(booking.status.as_str())
    .bind(booking.quote.subtotal_cents)
    .bind(booking.quote.discount_cents)
    .bind(booking.quote.total_cents)
    .bind(booking.coupon_id)
    .fetch_one(conn)
    .await?;
    Ok(appointment)
}

// =============================================================================
// Handlers
// =============================================================================

/// Price a coupon against a booking window or a plain subtotal
pub async fn validate_coupon(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ValidateCouponRequest>,
) -> ApiResult<Json<CouponQuote>> {
    let subtotal_cents = match requested_range(req.starts_at, req.ends_at)? {
        Some(range) => {
            let settings = SiteSettings::load(&state.pool).await?;
            booking_subtotal(settings.hourly_rate_cents, range.duration_minutes())?
        }
        None => match req.subtotal_cents {
            Some(cents) if cents >= 0 => cents,
            Some(_) => return Err(ApiError::validation("subtotal_cents cannot be negative")),
            None => {
                return Err(ApiError::validation(
                    "Give a booking window or subtotal_cents",
                ))
            }
        },
    };

    let quote = state
        .billing
        .coupons
        .quote(&req.code, auth_user.user_id, subtotal_cents)
        .await?;
    Ok(Json(quote))
}

/// Book studio time
///
/// Free bookings are confirmed at once; anything with a balance stays
/// `pending` and holds the slot until paid or until the hold expires.
pub async fn create_appointment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateAppointmentRequest>,
) -> ApiResult<(StatusCode, Json<BookingResponse>)> {
    let notes = optional_text("Notes", req.notes.as_deref(), 2000)?;
    let range = TimeRange::new(req.starts_at, req.ends_at)?;

    let settings = SiteSettings::load(&state.pool).await?;
    let hours = settings.studio_hours();
    let now = OffsetDateTime::now_utc();
    hours.validate_booking(&range, now)?;

    let subtotal_cents = booking_subtotal(settings.hourly_rate_cents, range.duration_minutes())?;
    let coupon = match req.coupon_code.as_deref().map(str::trim) {
        Some(code) if !code.is_empty() => Some(
            state
                .billing
                .coupons
                .quote(code, auth_user.user_id, subtotal_cents)
                .await?,
        ),
        _ => None,
    };
    let quote = coupon
        .as_ref()
        .map(|c| c.quote)
        .unwrap_or_else(|| Quote::compute(subtotal_cents, None));
    let status = if quote.is_free() {
        AppointmentStatus::Confirmed
    } else {
        AppointmentStatus::Pending
    };

    let mut tx = state.pool.begin().await?;

    let blocked = sqlx::query_as::<_, BlockedTimeSlot>(
        r#"
        SELECT id, starts_at, ends_at, reason, created_by, created_at
        FROM blocked_time_slots
        WHERE starts_at < $2 AND ends_at > $1
        "#,
    )
    .bind(range.start)
    .bind(range.end)
    .fetch_all(&mut *tx)
    .await?;
    let blocked: Vec<TimeRange> = blocked.iter().map(BlockedTimeSlot::range).collect();
    if find_conflict(&range, &blocked).is_some() {
        return Err(ApiError::SlotUnavailable);
    }

    let overlapping: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM appointments
        WHERE status IN ('pending', 'confirmed')
          AND starts_at < $2 AND ends_at > $1
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(range.start)
    .bind(range.end)
    .fetch_optional(&mut *tx)
    .await?;
    if overlapping.is_some() {
        return Err(ApiError::SlotUnavailable);
    }

    let appointment = insert_appointment(
        &mut *tx,
        &NewBooking {
            user_id: auth_user.user_id,
            range,
            service: req.service,
            notes,
            status,
            quote,
            coupon_id: coupon.as_ref().map(|c| c.coupon_id),
        },
    )
    .await?;

    if let Some(coupon) = &coupon {
        CouponService::claim_for_appointment(&mut *tx, coupon.coupon_id, appointment.id).await?;
    }

    tx.commit().await?;

    tracing::info!(
        appointment_id = %appointment.id,
        user_id = %auth_user.user_id,
        status = %appointment.status,
        total_cents = appointment.total_cents,
        coupon = coupon.as_ref().map(|c| c.code.as_str()).unwrap_or(""),
        "Appointment created"
    );

    if status == AppointmentStatus::Confirmed {
        notify_customer(
            &state.email,
            &settings,
            &appointment,
            &auth_user.email,
            &auth_user.name,
            BookingNotice::Confirmed,
        )
        .await;
    }

    Ok((
        StatusCode::CREATED,
        Json(BookingResponse {
            requires_payment: status == AppointmentStatus::Pending,
            appointment,
        }),
    ))
}

/// The caller's appointments, newest first
pub async fn list_appointments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListAppointmentsQuery>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<Appointment>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<AppointmentStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;

    let appointments = sqlx::query_as::<_, Appointment>(&format!(
        r#"
        SELECT {} FROM appointments
        WHERE user_id = $1 AND ($2::text IS NULL OR status = $2)
        ORDER BY starts_at DESC
        LIMIT $3 OFFSET $4
        "#,
        Appointment::COLUMNS
    ))
    .bind(auth_user.user_id)
    .bind(status.map(|s| s.as_str()))
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(appointments))
}

pub async fn get_appointment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Appointment>> {
    Ok(Json(load_own(&state, auth_user.user_id, id).await?))
}

/// Cancel an own appointment within the notice window
///
/// Paid bookings are not refunded automatically; the studio handles those
/// from the admin payments screen.
pub async fn cancel_appointment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<Appointment>> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let reason = optional_text("Reason", req.reason.as_deref(), 500)?;

    let appointment = load_own(&state, auth_user.user_id, id).await?;
    if !appointment.status().is_active() {
        return Err(ApiError::validation(
            "Only pending or confirmed appointments can be cancelled",
        ));
    }

    let settings = SiteSettings::load(&state.pool).await?;
    if !settings
        .studio_hours()
        .can_cancel(appointment.starts_at, OffsetDateTime::now_utc())
    {
        return Err(ApiError::validation(format!(
            "Appointments can only be cancelled at least {} hours in advance",
            settings.cancellation_notice_hours
        )));
    }

    let mut tx = state.pool.begin().await?;
    let cancelled = cancel_active(
        &mut *tx,
        id,
        reason.as_deref().unwrap_or("Cancelled by customer"),
    )
    .await?
    .ok_or_else(|| ApiError::Conflict("Appointment is no longer active".to_string()))?;
    tx.commit().await?;

    if appointment.status() == AppointmentStatus::Confirmed && appointment.total_cents > 0 {
        tracing::info!(
            appointment_id = %id,
            "Paid appointment cancelled by customer; refund is handled manually"
        );
    }

    notify_customer(
        &state.email,
        &settings,
        &cancelled,
        &auth_user.email,
        &auth_user.name,
        BookingNotice::Cancelled(reason.as_deref()),
    )
    .await;

    Ok(Json(cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use axum::response::IntoResponse;
    use serial_test::serial;
    use time::{macros::datetime, Duration};

    #[test]
    fn test_requested_range_needs_both_ends() {
        let start = datetime!(2025-06-02 14:00 UTC);
        let end = datetime!(2025-06-02 16:00 UTC);

        assert!(requested_range(None, None).unwrap().is_none());
        assert_eq!(
            requested_range(Some(start), Some(end))
                .unwrap()
                .unwrap()
                .duration_minutes(),
            120
        );
        assert!(requested_range(Some(start), None).is_err());
        assert!(requested_range(Some(end), Some(start)).is_err());
    }

    #[test]
    fn test_create_request_parses_rfc3339() {
        let req: CreateAppointmentRequest = serde_json::from_str(
            r#"{"starts_at":"2025-06-02T14:00:00-03:00","ends_at":"2025-06-02T16:00:00-03:00","service":"recording"}"#,
        )
        .unwrap();
        assert_eq!(req.service, ServiceKind::Recording);
        assert_eq!(req.starts_at, datetime!(2025-06-02 17:00 UTC));
        assert!(req.coupon_code.is_none());
    }

    #[test]
    fn test_validate_request_optional_window() {
        let req: ValidateCouponRequest =
            serde_json::from_str(r#"{"code":"welcome10","subtotal_cents":15000}"#).unwrap();
        assert!(req.starts_at.is_none());
        assert_eq!(req.subtotal_cents, Some(15000));
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_overlapping_insert_is_a_conflict() {
        let pool = test_support::pool().await;
        let user_id = test_support::insert_user(&pool, "customer").await;
        let hours_ahead = 24 * 365 * 50 + spread_hours();
        let start = datetime!(2025-06-02 14:00 UTC) + Duration::hours(hours_ahead);
        let booking = |range| NewBooking {
            user_id,
            range,
            service: ServiceKind::Recording,
            notes: None,
            status: AppointmentStatus::Pending,
            quote: Quote::compute(10_000, None),
            coupon_id: None,
        };

        let mut first = pool.acquire().await.unwrap();
        let first_range = TimeRange::new(start, start + Duration::hours(2)).unwrap();
        insert_appointment(&mut first, &booking(first_range))
            .await
            .unwrap();

        // Skips the FOR UPDATE check, as a concurrent request racing past it would
        let mut second = pool.acquire().await.unwrap();
        let overlap = TimeRange::new(start + Duration::hours(1), start + Duration::hours(3)).unwrap();
        let err = insert_appointment(&mut second, &booking(overlap))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SlotUnavailable));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        // Back to back is fine
        let adjacent = TimeRange::new(start + Duration::hours(2), start + Duration::hours(3)).unwrap();
        insert_appointment(&mut second, &booking(adjacent))
            .await
            .unwrap();
    }

    fn spread_hours() -> i64 {
        (Uuid::new_v4().as_u128() % 100_000) as i64
    }
}
