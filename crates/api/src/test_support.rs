//! Database fixtures for ignored integration tests
#![allow(clippy::expect_used)]

use sqlx::PgPool;
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

pub async fn insert_user(pool: &PgPool, role: &str) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO users (email, name, password_hash, role) VALUES ($1, 'Test', 'x', $2) RETURNING id",
    )
    .bind(format!("{}@test.local", Uuid::new_v4()))
    .bind(role)
    .fetch_one(pool)
    .await
    .expect("insert user");
    id
}
