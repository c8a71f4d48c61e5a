//! Appointment state changes shared by customer routes, admin routes and the
//! worker

use sqlx::PgConnection;
use studio_billing::CouponService;
use studio_shared::{Appointment, SiteSettings};
use uuid::Uuid;

use crate::email::{BookingDetails, StudioEmailService};
use crate::error::ApiResult;

/// Cancel an active appointment and undo what it holds
///
/// Releases its coupon, fails its pending payment and expires its open
/// checkouts. Returns `None` when the appointment was not active.
pub async fn cancel_appointment(
    conn: &mut PgConnection,
    appointment_id: Uuid,
    reason: &str,
) -> ApiResult<Option<Appointment>> {
    let cancelled = sqlx::query_as::<_, Appointment>(&format!(
        r#"
        UPDATE appointments
        SET status = 'cancelled', cancelled_at = NOW(), cancellation_reason = $2, updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'confirmed')
        RETURNING {}
        "#,
        Appointment::COLUMNS
    ))
    .bind(appointment_id)
    .bind(reason)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(appointment) = cancelled else {
        return Ok(None);
    };

    CouponService::release_for_appointment(&mut *conn, appointment_id).await?;

    sqlx::query(
        "UPDATE payments SET status = 'failed' WHERE appointment_id = $1 AND status = 'pending'",
    )
    .bind(appointment_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE pending_checkouts SET status = 'expired' WHERE appointment_id = $1 AND status = 'pending'",
    )
    .bind(appointment_id)
    .execute(&mut *conn)
    .await?;

    tracing::info!(
        appointment_id = %appointment_id,
        reason = %reason,
        "Appointment cancelled"
    );

    Ok(Some(appointment))
}

/// Which booking email to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingNotice<'a> {
    Confirmed,
    Cancelled(Option<&'a str>),
    Reminder,
}

/// Send a booking email for `appointment` to its owner; failures are logged
pub async fn notify_customer(
    email: &StudioEmailService,
    settings: &SiteSettings,
    appointment: &Appointment,
    to: &str,
    customer_name: &str,
    notice: BookingNotice<'_>,
) -> bool {
    let hours = settings.studio_hours();
    let starts_at = hours.format_local(appointment.starts_at);
    let total = (appointment.total_cents > 0).then(|| {
        format!(
            "{} {}",
            settings.currency.to_uppercase(),
            studio_shared::format_cents(appointment.total_cents)
        )
    });
    let service_label = appointment
        .service_kind()
        .map(|s| s.label())
        .unwrap_or("Studio session");

    let details = BookingDetails {
        customer_name,
        service_label,
        starts_at: &starts_at,
        duration_minutes: appointment.range().duration_minutes(),
        total: total.as_deref(),
    };

    match notice {
        BookingNotice::Confirmed => email.send_booking_confirmed(to, &details).await,
        BookingNotice::Cancelled(reason) => email.send_booking_cancelled(to, &details, reason).await,
        BookingNotice::Reminder => email.send_appointment_reminder(to, &details).await,
    }
}

/// Owner email and name for an appointment
pub async fn owner_contact(
    pool: &sqlx::PgPool,
    appointment: &Appointment,
) -> Result<Option<(String, String)>, sqlx::Error> {
    sqlx::query_as("SELECT email, name FROM users WHERE id = $1")
        .bind(appointment.user_id)
        .fetch_optional(pool)
        .await
}
