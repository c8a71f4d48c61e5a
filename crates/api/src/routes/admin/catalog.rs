//! Admin coupon and plan catalog

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use studio_billing::{CouponFilter, CouponUpdate, NewCoupon, NewPlan, PlanUpdate};
use studio_shared::{CouponRecord, Plan};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

// =============================================================================
// Coupons
// =============================================================================

pub async fn list_coupons(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(filter): Query<CouponFilter>,
) -> ApiResult<Json<Vec<CouponRecord>>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.coupons.list(&filter).await?))
}

pub async fn create_coupon(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<NewCoupon>,
) -> ApiResult<(StatusCode, Json<CouponRecord>)> {
    auth_user.require_admin()?;

    let coupon = state.billing.coupons.create(req).await?;
    tracing::info!(
        coupon_id = %coupon.id,
        code = %coupon.code,
        admin_id = %auth_user.user_id,
        "Coupon created"
    );
    Ok((StatusCode::CREATED, Json(coupon)))
}

pub async fn update_coupon(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<CouponUpdate>,
) -> ApiResult<Json<CouponRecord>> {
    auth_user.require_admin()?;

    let coupon = state.billing.coupons.update(id, req).await?;
    tracing::info!(coupon_id = %id, admin_id = %auth_user.user_id, "Coupon updated");
    Ok(Json(coupon))
}

/// Coupons are deactivated rather than deleted so past bookings keep their
/// reference
pub async fn deactivate_coupon(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CouponRecord>> {
    auth_user.require_admin()?;

    let coupon = state.billing.coupons.deactivate(id).await?;
    tracing::info!(coupon_id = %id, admin_id = %auth_user.user_id, "Coupon deactivated");
    Ok(Json(coupon))
}

// =============================================================================
// Plans
// =============================================================================

pub async fn list_plans(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Plan>>> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.plans.list_all().await?))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    auth_user.require_admin()?;

    let plan = state.billing.plans.create(req).await?;
    tracing::info!(
        plan_id = %plan.id,
        slug = %plan.slug,
        admin_id = %auth_user.user_id,
        "Plan created"
    );
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<PlanUpdate>,
) -> ApiResult<Json<Plan>> {
    auth_user.require_admin()?;

    let plan = state.billing.plans.update(id, req).await?;
    tracing::info!(plan_id = %id, admin_id = %auth_user.user_id, "Plan updated");
    Ok(Json(plan))
}
