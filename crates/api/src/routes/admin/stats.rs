//! Dashboard counters

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;
use sqlx::FromRow;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize, FromRow)]
pub struct AdminStats {
    pub total_users: i64,
    pub upcoming_confirmed: i64,
    pub pending_appointments: i64,
    /// Payments still marked paid, last 30 days
    pub revenue_30d_cents: i64,
    pub open_questions: i64,
    pub open_chats: i64,
}

pub async fn get_stats(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<AdminStats>> {
    auth_user.require_admin()?;

    let stats = sqlx::query_as::<_, AdminStats>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM users) AS total_users,
            (SELECT COUNT(*) FROM appointments
                WHERE status = 'confirmed' AND starts_at > NOW()) AS upcoming_confirmed,
            (SELECT COUNT(*) FROM appointments WHERE status = 'pending') AS pending_appointments,
            (SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM payments
                WHERE status = 'paid' AND paid_at > NOW() - INTERVAL '30 days') AS revenue_30d_cents,
            (SELECT COUNT(*) FROM user_questions WHERE status = 'pending') AS open_questions,
            (SELECT COUNT(*) FROM chat_sessions WHERE status = 'open') AS open_chats
        "#,
    )
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(stats))
}
