//! Database fixtures for ignored integration tests
#![allow(clippy::expect_used)]

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Connect to `DATABASE_URL` and apply migrations
pub async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let pool = studio_shared::create_pool(&url, 2)
        .await
        .expect("Failed to create pool");
    studio_shared::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

pub async fn insert_user(pool: &PgPool) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO users (email, name, password_hash) VALUES ($1, 'Test', 'x') RETURNING id",
    )
    .bind(format!("{}@test.local", Uuid::new_v4()))
    .fetch_one(pool)
    .await
    .expect("insert user");
    id
}

/// Pending appointment far in the future at a random hour so tests never overlap
pub async fn insert_appointment(pool: &PgPool, user_id: Uuid, total_cents: i64) -> Uuid {
    let hours = i64::from(rand::random::<u32>() % 500_000) + 10_000;
    let starts_at = OffsetDateTime::now_utc() + Duration::hours(hours);
    insert_appointment_at(pool, user_id, starts_at, "pending", total_cents).await
}

/// One-hour appointment at a fixed start
pub async fn insert_appointment_at(
    pool: &PgPool,
    user_id: Uuid,
    starts_at: OffsetDateTime,
    status: &str,
    total_cents: i64,
) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO appointments
            (user_id, starts_at, ends_at, service, status, subtotal_cents, total_cents)
        VALUES ($1, $2, $3, 'recording', $4, $5, $5)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(starts_at)
    .bind(starts_at + Duration::hours(1))
    .bind(status)
    .bind(total_cents)
    .fetch_one(pool)
    .await
    .expect("insert appointment");
    id
}

/// Pending checkout for an appointment plus its pending payment row
///
/// Returns the checkout id and the session id it was created with.
pub async fn insert_appointment_checkout(
    pool: &PgPool,
    user_id: Uuid,
    appointment_id: Uuid,
    amount_cents: i64,
) -> (Uuid, String) {
    let session_id = format!("cs_test_{}", Uuid::new_v4().simple());
    let (checkout_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO pending_checkouts
            (user_id, kind, appointment_id, amount_cents, provider_session_id)
        VALUES ($1, 'appointment', $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(appointment_id)
    .bind(amount_cents)
    .bind(&session_id)
    .fetch_one(pool)
    .await
    .expect("insert checkout");

    sqlx::query(
        r#"
        INSERT INTO payments
            (user_id, appointment_id, provider, provider_reference, amount_cents, currency, kind)
        VALUES ($1, $2, 'stripe', $3, $4, 'brl', 'appointment')
        "#,
    )
    .bind(user_id)
    .bind(appointment_id)
    .bind(&session_id)
    .bind(amount_cents)
    .execute(pool)
    .await
    .expect("insert pending payment");

    (checkout_id, session_id)
}

/// Used percentage coupon attached to an appointment
pub async fn insert_claimed_coupon(pool: &PgPool, user_id: Uuid, appointment_id: Uuid) -> Uuid {
    let (coupon_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO coupons
            (code, discount_type, value, used, used_at, user_id, appointment_id)
        VALUES ($1, 'percentage', 10, true, NOW(), $2, $3)
        RETURNING id
        "#,
    )
    .bind(format!("TEST{}", Uuid::new_v4().simple()).to_uppercase())
    .bind(user_id)
    .bind(appointment_id)
    .fetch_one(pool)
    .await
    .expect("insert coupon");

    sqlx::query("UPDATE appointments SET coupon_id = $1 WHERE id = $2")
        .bind(coupon_id)
        .bind(appointment_id)
        .execute(pool)
        .await
        .expect("attach coupon");
    coupon_id
}

/// Monthly plan with an active Stripe subscription for `user_id`
///
/// Returns the subscription row id and its Stripe id.
pub async fn insert_subscription(
    pool: &PgPool,
    user_id: Uuid,
    coupon_count: i32,
) -> (Uuid, String) {
    let (plan_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO plans
            (slug, name, price_cents, billing, stripe_price_id, coupon_count, coupon_value, validity_days)
        VALUES ($1, 'Monthly pack', 30000, 'monthly', 'price_test', $2, 100, 30)
        RETURNING id
        "#,
    )
    .bind(format!("monthly-{}", Uuid::new_v4().simple()))
    .bind(coupon_count)
    .fetch_one(pool)
    .await
    .expect("insert monthly plan");

    let stripe_subscription_id = format!("sub_test_{}", Uuid::new_v4().simple());
    let (subscription_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO subscriptions (user_id, plan_id, stripe_subscription_id, status)
        VALUES ($1, $2, $3, 'active')
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(plan_id)
    .bind(&stripe_subscription_id)
    .fetch_one(pool)
    .await
    .expect("insert subscription");

    (subscription_id, stripe_subscription_id)
}

pub async fn insert_plan(pool: &PgPool, coupon_count: i32) -> studio_shared::Plan {
    sqlx::query_as::<_, studio_shared::Plan>(&format!(
        r#"
        INSERT INTO plans (slug, name, price_cents, billing, coupon_count, coupon_value, validity_days)
        VALUES ($1, 'Test pack', 40000, 'one_time', $2, 100, 30)
        RETURNING {}
        "#,
        studio_shared::Plan::COLUMNS
    ))
    .bind(format!("pack-{}", Uuid::new_v4().simple()))
    .bind(coupon_count)
    .fetch_one(pool)
    .await
    .expect("insert plan")
}
