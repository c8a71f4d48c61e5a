//! Scheduled jobs
//!
//! Each job logs its own failures and returns; a failed run is retried on the
//! next tick.

use sqlx::PgPool;
use studio_api::booking::{cancel_appointment, notify_customer, owner_contact, BookingNotice};
use studio_api::StudioEmailService;
use studio_billing::PlanService;
use studio_shared::{Appointment, SiteSettings, HOLD_EXPIRED_REASON};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pending bookings whose checkout is still open are released this long
/// after their hold ends even without an expiry webhook
const ABANDONED_CHECKOUT_HOURS: i32 = 24;
const REMINDER_WINDOW_HOURS: i32 = 24;
const WEBHOOK_EVENT_RETENTION_DAYS: i32 = 90;
const BATCH_SIZE: i64 = 100;

pub struct JobContext {
    pub pool: PgPool,
    pub plans: PlanService,
    pub email: StudioEmailService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    ExpireHolds,
    SendReminders,
    ExpirePlans,
    Purge,
}

impl Schedule {
    pub const ALL: [Schedule; 4] = [
        Schedule::ExpireHolds,
        Schedule::SendReminders,
        Schedule::ExpirePlans,
        Schedule::Purge,
    ];

    /// Cron expression with a seconds field
    pub fn cron(&self) -> &'static str {
        match self {
            Self::ExpireHolds => "0 * * * * *",
            Self::SendReminders => "0 */15 * * * *",
            Self::ExpirePlans => "0 5 * * * *",
            Self::Purge => "0 30 3 * * *",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ExpireHolds => "expire_holds",
            Self::SendReminders => "send_reminders",
            Self::ExpirePlans => "expire_plans",
            Self::Purge => "purge",
        }
    }
}

pub async fn run(schedule: Schedule, ctx: &JobContext) {
    match schedule {
        Schedule::ExpireHolds => expire_holds(ctx).await,
        Schedule::SendReminders => send_reminders(ctx).await,
        Schedule::ExpirePlans => expire_plans(ctx).await,
        Schedule::Purge => purge(ctx).await,
    }
}

/// Pending appointments past their hold
///
/// While a checkout session is still open the slot stays held, since the
/// customer may be paying; the checkout expiry webhook closes it. After
/// [`ABANDONED_CHECKOUT_HOURS`] the hold is released regardless.
pub async fn expired_hold_ids(pool: &PgPool, hold_minutes: i32) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT a.id
        FROM appointments a
        WHERE a.status = 'pending'
          AND a.created_at < NOW() - make_interval(mins => $1)
          AND (
              NOT EXISTS (
                  SELECT 1 FROM pending_checkouts c
                  WHERE c.appointment_id = a.id AND c.status = 'pending'
              )
              OR a.created_at < NOW() - make_interval(mins => $1, hours => $2)
          )
        ORDER BY a.created_at
        LIMIT $3
        "#,
    )
    .bind(hold_minutes)
    .bind(ABANDONED_CHECKOUT_HOURS)
    .bind(BATCH_SIZE)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

async fn expire_holds(ctx: &JobContext) {
    let settings = match SiteSettings::load(&ctx.pool).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to load site settings");
            return;
        }
    };

    let ids = match expired_hold_ids(&ctx.pool, settings.hold_minutes).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Failed to fetch expired holds");
            return;
        }
    };
    if ids.is_empty() {
        return;
    }

    info!(count = ids.len(), "Releasing expired holds");

    for id in ids {
        match release_hold(&ctx.pool, id).await {
            Ok(Some(appointment)) => {
                if let Ok(Some((email, name))) = owner_contact(&ctx.pool, &appointment).await {
                    notify_customer(
                        &ctx.email,
                        &settings,
                        &appointment,
                        &email,
                        &name,
                        BookingNotice::Cancelled(Some("The payment window for this booking expired.")),
                    )
                    .await;
                }
            }
            Ok(None) => {}
            Err(e) => error!(appointment_id = %id, error = %e, "Failed to release hold"),
        }
    }
}

async fn release_hold(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<Appointment>> {
    let mut tx = pool.begin().await?;

    // Skip holds paid or cancelled since they were selected
    let status: Option<(String,)> =
        sqlx::query_as("SELECT status FROM appointments WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
    if !matches!(status, Some((ref s,)) if s == "pending") {
        return Ok(None);
    }

    let cancelled = cancel_appointment(&mut *tx, id, HOLD_EXPIRED_REASON).await?;
    tx.commit().await?;
    Ok(cancelled)
}

/// Confirmed appointments starting soon that have not been reminded
pub async fn due_reminders(pool: &PgPool) -> Result<Vec<Appointment>, sqlx::Error> {
    sqlx::query_as::<_, Appointment>(&format!(
        r#"
        SELECT {} FROM appointments
        WHERE status = 'confirmed'
          AND reminder_sent_at IS NULL
          AND starts_at > NOW()
          AND starts_at <= NOW() + make_interval(hours => $1)
        ORDER BY starts_at
        LIMIT $2
        "#,
        Appointment::COLUMNS
    ))
    .bind(REMINDER_WINDOW_HOURS)
    .bind(BATCH_SIZE)
    .fetch_all(pool)
    .await
}

/// Mark the reminder as sent; `false` when another run got there first
async fn claim_reminder(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let claimed = sqlx::query(
        "UPDATE appointments SET reminder_sent_at = NOW() WHERE id = $1 AND reminder_sent_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(claimed.rows_affected() == 1)
}

async fn send_reminders(ctx: &JobContext) {
    if !ctx.email.is_enabled() {
        return;
    }

    let appointments = match due_reminders(&ctx.pool).await {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "Failed to fetch due reminders");
            return;
        }
    };
    if appointments.is_empty() {
        return;
    }

    let settings = match SiteSettings::load(&ctx.pool).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to load site settings");
            return;
        }
    };

    let mut sent = 0usize;
    for appointment in &appointments {
        match claim_reminder(&ctx.pool, appointment.id).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                error!(appointment_id = %appointment.id, error = %e, "Failed to claim reminder");
                continue;
            }
        }

        let contact = match owner_contact(&ctx.pool, appointment).await {
            Ok(Some(contact)) => contact,
            Ok(None) => continue,
            Err(e) => {
                error!(appointment_id = %appointment.id, error = %e, "Failed to load appointment owner");
                continue;
            }
        };

        let delivered = notify_customer(
            &ctx.email,
            &settings,
            appointment,
            &contact.0,
            &contact.1,
            BookingNotice::Reminder,
        )
        .await;

        if delivered {
            sent += 1;
        } else {
            // Let the next run try again
            if let Err(e) = sqlx::query("UPDATE appointments SET reminder_sent_at = NULL WHERE id = $1")
                .bind(appointment.id)
                .execute(&ctx.pool)
                .await
            {
                warn!(appointment_id = %appointment.id, error = %e, "Failed to reset reminder flag");
            }
        }
    }

    info!(due = appointments.len(), sent = sent, "Reminders processed");
}

async fn expire_plans(ctx: &JobContext) {
    match ctx.plans.expire_due().await {
        Ok(0) => {}
        Ok(expired) => info!(expired = expired, "Expired user plans"),
        Err(e) => error!(error = %e, "Failed to expire user plans"),
    }
}

async fn purge(ctx: &JobContext) {
    match studio_api::auth::SessionManager::purge_expired(&ctx.pool).await {
        Ok(deleted) => info!(deleted = deleted, "Purged expired sessions"),
        Err(e) => error!(error = %e, "Failed to purge sessions"),
    }

    match sqlx::query(
        "DELETE FROM stripe_webhook_events WHERE created_at < NOW() - make_interval(days => $1)",
    )
    .bind(WEBHOOK_EVENT_RETENTION_DAYS)
    .execute(&ctx.pool)
    .await
    {
        Ok(result) => info!(deleted = result.rows_affected(), "Purged old webhook events"),
        Err(e) => error!(error = %e, "Failed to purge webhook events"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use time::{Duration, OffsetDateTime};
    use tokio_cron_scheduler::Job;

    #[tokio::test]
    async fn test_every_schedule_is_valid_cron() {
        for schedule in Schedule::ALL {
            let job = Job::new_async(schedule.cron(), |_id, _lock| Box::pin(async {}));
            assert!(job.is_ok(), "{} has an invalid cron expression", schedule.name());
        }
    }

    async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = studio_shared::create_pool(&url, 2).await.unwrap();
        studio_shared::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn insert_pending(pool: &PgPool, created_minutes_ago: i64) -> Uuid {
        let (user_id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO users (email, name, password_hash) VALUES ($1, 'Worker Test', 'x') RETURNING id",
        )
        .bind(format!("worker-{}@test.local", Uuid::new_v4()))
        .fetch_one(pool)
        .await
        .unwrap();

        let hours = i64::from(rand_offset());
        let starts_at = OffsetDateTime::now_utc() + Duration::hours(hours);
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO appointments
                (user_id, starts_at, ends_at, service, status, subtotal_cents, total_cents, created_at)
            VALUES ($1, $2, $3, 'recording', 'pending', 10000, 10000, NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(starts_at)
        .bind(starts_at + Duration::hours(1))
        .bind(i32::try_from(created_minutes_ago).unwrap())
        .fetch_one(pool)
        .await
        .unwrap();
        id
    }

    fn rand_offset() -> u32 {
        // Spread test appointments so they never overlap between runs
        (Uuid::new_v4().as_u128() % 400_000) as u32 + 10_000
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_expired_hold_without_checkout_is_selected() {
        let pool = pool().await;
        let fresh = insert_pending(&pool, 5).await;
        let stale = insert_pending(&pool, 45).await;

        let ids = expired_hold_ids(&pool, 30).await.unwrap();
        assert!(ids.contains(&stale));
        assert!(!ids.contains(&fresh));

        let released = release_hold(&pool, stale).await.unwrap().unwrap();
        assert_eq!(released.status, "cancelled");
        assert!(release_hold(&pool, stale).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_open_checkout_keeps_hold() {
        let pool = pool().await;
        let id = insert_pending(&pool, 45).await;
        sqlx::query(
            r#"
            INSERT INTO pending_checkouts (user_id, kind, appointment_id, amount_cents, status)
            SELECT user_id, 'appointment', id, total_cents, 'pending' FROM appointments WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

        let ids = expired_hold_ids(&pool, 30).await.unwrap();
        assert!(!ids.contains(&id));
    }
}
