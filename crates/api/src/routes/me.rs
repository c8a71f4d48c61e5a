//! The signed-in customer's plans, coupons and questions

use axum::{
    extract::{Extension, State},
    Json,
};
use studio_billing::UserPlanSummary;
use studio_shared::{CouponRecord, UserQuestion};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Plans with their coupon sets
pub async fn my_plans(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<UserPlanSummary>>> {
    Ok(Json(state.billing.plans.user_plans(auth_user.user_id).await?))
}

/// Coupons reserved for this account
pub async fn my_coupons(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<CouponRecord>>> {
    Ok(Json(
        state.billing.coupons.list_for_user(auth_user.user_id).await?,
    ))
}

pub async fn my_questions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<UserQuestion>>> {
    let questions = sqlx::query_as::<_, UserQuestion>(
        r#"
        SELECT id, user_id, name, email, question, answer, status, created_at, answered_at
        FROM user_questions
        WHERE user_id = $1 OR (user_id IS NULL AND email = $2)
        ORDER BY created_at DESC
        "#,
    )
    .bind(auth_user.user_id)
    .bind(&auth_user.email)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(questions))
}
