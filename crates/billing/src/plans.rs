//! Plan catalog and customer plan lifecycle

use serde::{Deserialize, Serialize};
use sqlx::{Connection, FromRow, PgConnection, PgExecutor, PgPool};
use studio_shared::{CouponRecord, Discount, DiscountType, Plan, PlanBilling, UserPlan};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::coupons::CouponService;
use crate::error::{BillingError, BillingResult};

const MAX_PLAN_COUPONS: i32 = 100;

/// Admin request to create a plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i64,
    pub billing: PlanBilling,
    #[serde(default)]
    pub stripe_price_id: Option<String>,
    pub coupon_count: i32,
    pub coupon_discount_type: DiscountType,
    pub coupon_value: i64,
    pub validity_days: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Admin request to change a plan; billing mode and slug are fixed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub stripe_price_id: Option<String>,
    pub coupon_count: Option<i32>,
    pub coupon_discount_type: Option<DiscountType>,
    pub coupon_value: Option<i64>,
    pub validity_days: Option<i32>,
    pub is_active: Option<bool>,
}

/// Paid invoice a subscription renewal is recorded against
#[derive(Debug, Clone)]
pub struct RenewalInvoice {
    /// Provider invoice id, unique per renewal
    pub reference: String,
    pub payment_intent: Option<String>,
    /// Falls back to the plan price
    pub amount_cents: Option<i64>,
    pub currency: String,
}

/// A plan that was just activated for a customer
#[derive(Debug, Clone, Serialize)]
pub struct ActivatedPlan {
    pub user_plan: UserPlan,
    pub coupon_codes: Vec<String>,
}

/// A customer's plan with coupon usage
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserPlanOverview {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub plan_slug: String,
    pub plan_name: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub subscription_id: Option<Uuid>,
    pub coupons_total: i64,
    pub coupons_remaining: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPlanSummary {
    #[serde(flatten)]
    pub plan: UserPlanOverview,
    pub coupons: Vec<CouponRecord>,
}

fn validate_slug(slug: &str) -> BillingResult<()> {
    let ok = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(BillingError::InvalidInput(
            "Slug must be lowercase letters, digits and '-'".to_string(),
        ))
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_terms(
    name: &str,
    price_cents: i64,
    billing: PlanBilling,
    stripe_price_id: Option<&str>,
    coupon_count: i32,
    coupon_discount_type: DiscountType,
    coupon_value: i64,
    validity_days: i32,
) -> BillingResult<()> {
    if name.trim().is_empty() {
        return Err(BillingError::InvalidInput("Plan name is required".to_string()));
    }
    if price_cents <= 0 {
        return Err(BillingError::InvalidInput(
            "Plan price must be positive".to_string(),
        ));
    }
    if billing == PlanBilling::Monthly && stripe_price_id.map_or(true, |p| p.trim().is_empty()) {
        return Err(BillingError::InvalidInput(
            "Monthly plans need a Stripe price id".to_string(),
        ));
    }
    if !(0..=MAX_PLAN_COUPONS).contains(&coupon_count) {
        return Err(BillingError::InvalidInput(format!(
            "Coupon count must be between 0 and {}",
            MAX_PLAN_COUPONS
        )));
    }
    if validity_days <= 0 {
        return Err(BillingError::InvalidInput(
            "Validity must be at least one day".to_string(),
        ));
    }
    Discount::new(coupon_discount_type, coupon_value)?;
    Ok(())
}

/// Plan service
#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub async fn list_active(&self) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE is_active = true ORDER BY price_cents ASC",
            Plan::COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    pub async fn list_all(&self) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans ORDER BY is_active DESC, price_cents ASC",
            Plan::COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>(&format!("SELECT {} FROM plans WHERE id = $1", Plan::COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound("Plan not found".to_string()))
    }

    pub async fn get_by_slug(&self, slug: &str) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE slug = $1",
            Plan::COLUMNS
        ))
        .bind(slug.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound("Plan not found".to_string()))
    }

    pub async fn create(&self, input: NewPlan) -> BillingResult<Plan> {
        let slug = input.slug.trim().to_lowercase();
        validate_slug(&slug)?;
        validate_terms(
            &input.name,
            input.price_cents,
            input.billing,
            input.stripe_price_id.as_deref(),
            input.coupon_count,
            input.coupon_discount_type,
            input.coupon_value,
            input.validity_days,
        )?;

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            INSERT INTO plans
                (slug, name, description, price_cents, billing, stripe_price_id,
                 coupon_count, coupon_discount_type, coupon_value, validity_days, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            Plan::COLUMNS
        ))
        .bind(&slug)
        .bind(input.name.trim())
        .bind(input.description.as_deref())
        .bind(input.price_cents)
        .bind(input.billing.as_str())
        .bind(input.stripe_price_id.as_deref())
        .bind(input.coupon_count)
        .bind(input.coupon_discount_type.as_str())
        .bind(input.coupon_value)
        .bind(input.validity_days)
        .bind(input.is_active)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(plan_id = %plan.id, slug = %plan.slug, "Plan created");
        Ok(plan)
    }

    pub async fn update(&self, id: Uuid, changes: PlanUpdate) -> BillingResult<Plan> {
        let current = self.get(id).await?;
        let billing = current.billing();

        let name = changes.name.unwrap_or(current.name);
        let price_cents = changes.price_cents.unwrap_or(current.price_cents);
        let stripe_price_id = changes.stripe_price_id.or(current.stripe_price_id);
        let coupon_count = changes.coupon_count.unwrap_or(current.coupon_count);
        let coupon_discount_type = changes
            .coupon_discount_type
            .or_else(|| DiscountType::parse(&current.coupon_discount_type))
            .unwrap_or(DiscountType::Percentage);
        let coupon_value = changes.coupon_value.unwrap_or(current.coupon_value);
        let validity_days = changes.validity_days.unwrap_or(current.validity_days);

        validate_terms(
            &name,
            price_cents,
            billing,
            stripe_price_id.as_deref(),
            coupon_count,
            coupon_discount_type,
            coupon_value,
            validity_days,
        )?;

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            UPDATE plans
            SET name = $2, description = $3, price_cents = $4, stripe_price_id = $5,
                coupon_count = $6, coupon_discount_type = $7, coupon_value = $8,
                validity_days = $9, is_active = $10, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            Plan::COLUMNS
        ))
        .bind(id)
        .bind(name.trim())
        .bind(changes.description.or(current.description))
        .bind(price_cents)
        .bind(stripe_price_id)
        .bind(coupon_count)
        .bind(coupon_discount_type.as_str())
        .bind(coupon_value)
        .bind(validity_days)
        .bind(changes.is_active.unwrap_or(current.is_active))
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(plan_id = %plan.id, "Plan updated");
        Ok(plan)
    }

    // =========================================================================
    // Customer plans
    // =========================================================================

    /// Create an active user plan and its coupon set
    ///
    /// Coupon generation runs in a savepoint: if it fails the plan stays
    /// active and the failure is logged.
    pub async fn activate(
        conn: &mut PgConnection,
        user_id: Uuid,
        plan: &Plan,
        subscription_id: Option<Uuid>,
        expires_at: Option<OffsetDateTime>,
    ) -> BillingResult<ActivatedPlan> {
        let expires_at = expires_at.unwrap_or_else(|| {
            OffsetDateTime::now_utc() + Duration::days(i64::from(plan.validity_days))
        });

        let user_plan = sqlx::query_as::<_, UserPlan>(&format!(
            r#"
            INSERT INTO user_plans (user_id, plan_id, status, expires_at, subscription_id)
            VALUES ($1, $2, 'active', $3, $4)
            RETURNING {}
            "#,
            UserPlan::COLUMNS
        ))
        .bind(user_id)
        .bind(plan.id)
        .bind(expires_at)
        .bind(subscription_id)
        .fetch_one(&mut *conn)
        .await?;

        let coupon_codes =
            Self::generate_coupons_best_effort(conn, user_id, user_plan.id, plan, expires_at)
                .await?;

        tracing::info!(
            user_id = %user_id,
            user_plan_id = %user_plan.id,
            plan = %plan.slug,
            "Plan activated"
        );

        Ok(ActivatedPlan {
            user_plan,
            coupon_codes,
        })
    }

    async fn generate_coupons_best_effort(
        conn: &mut PgConnection,
        user_id: Uuid,
        user_plan_id: Uuid,
        plan: &Plan,
        expires_at: OffsetDateTime,
    ) -> BillingResult<Vec<String>> {
        let mut savepoint = conn.begin().await?;
        match CouponService::generate_plan_set(
            &mut savepoint,
            user_id,
            user_plan_id,
            plan,
            expires_at,
        )
        .await
        {
            Ok(codes) => {
                savepoint.commit().await?;
                Ok(codes)
            }
            Err(e) => {
                tracing::error!(
                    user_plan_id = %user_plan_id,
                    error = %e,
                    "Failed to generate plan coupons - plan stays active"
                );
                savepoint.rollback().await?;
                Ok(Vec::new())
            }
        }
    }

    /// Start a new billing period for a recurring subscription
    ///
    /// Extends the subscription's active user plan, or creates one if none is
    /// active, and issues a fresh coupon set. Returns `None` for unknown
    /// subscriptions.
    pub async fn renew_for_subscription(
        &self,
        stripe_subscription_id: &str,
        period_end: Option<OffsetDateTime>,
        invoice: &RenewalInvoice,
    ) -> BillingResult<Option<(Uuid, Plan, ActivatedPlan)>> {
        let subscription: Option<(Uuid, Uuid, Uuid)> = sqlx::query_as(
            "SELECT id, user_id, plan_id FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((subscription_id, user_id, plan_id)) = subscription else {
            tracing::warn!(
                subscription = %stripe_subscription_id,
                "Renewal for unknown subscription"
            );
            return Ok(None);
        };

        let plan = self.get(plan_id).await?;
        let expires_at = period_end.unwrap_or_else(|| {
            OffsetDateTime::now_utc() + Duration::days(i64::from(plan.validity_days))
        });

        let mut tx = self.pool.begin().await?;

        // One renewal per invoice: the payment row is the claim
        let payment_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO payments
                (user_id, provider, provider_reference, provider_payment_intent,
                 amount_cents, currency, status, kind, paid_at)
            VALUES ($1, 'stripe', $2, $3, $4, $5, 'paid', 'plan', NOW())
            ON CONFLICT (provider_reference) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(&invoice.reference)
        .bind(invoice.payment_intent.as_deref())
        .bind(invoice.amount_cents.unwrap_or(plan.price_cents))
        .bind(&invoice.currency)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((payment_id,)) = payment_id else {
            tracing::info!(
                subscription = %stripe_subscription_id,
                invoice = %invoice.reference,
                "Invoice already recorded, renewal skipped"
            );
            return Ok(None);
        };

        let extended = sqlx::query_as::<_, UserPlan>(&format!(
            r#"
            UPDATE user_plans
            SET expires_at = GREATEST(expires_at, $2)
            WHERE subscription_id = $1 AND status = 'active'
            RETURNING {}
            "#,
            UserPlan::COLUMNS
        ))
        .bind(subscription_id)
        .bind(expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        let activated = match extended {
            Some(user_plan) => {
                let coupon_codes = Self::generate_coupons_best_effort(
                    &mut tx,
                    user_id,
                    user_plan.id,
                    &plan,
                    user_plan.expires_at,
                )
                .await?;
                ActivatedPlan {
                    user_plan,
                    coupon_codes,
                }
            }
            None => {
                Self::activate(&mut tx, user_id, &plan, Some(subscription_id), Some(expires_at))
                    .await?
            }
        };

        sqlx::query("UPDATE payments SET user_plan_id = $2 WHERE id = $1")
            .bind(payment_id)
            .bind(activated.user_plan.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            subscription = %stripe_subscription_id,
            invoice = %invoice.reference,
            user_plan_id = %activated.user_plan.id,
            coupons = activated.coupon_codes.len(),
            "Subscription plan renewed"
        );

        Ok(Some((user_id, plan, activated)))
    }

    /// Cancel the active plans tied to a subscription; issued coupons stay valid
    pub async fn cancel_for_subscription<'e, E>(
        executor: E,
        subscription_id: Uuid,
    ) -> BillingResult<u64>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            "UPDATE user_plans SET status = 'cancelled' WHERE subscription_id = $1 AND status = 'active'",
        )
        .bind(subscription_id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    /// Expire plans past their end date and deactivate their unused coupons
    pub async fn expire_due(&self) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE user_plans SET status = 'expired'
            WHERE status = 'active' AND expires_at <= NOW()
            RETURNING id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        if expired.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let ids: Vec<Uuid> = expired.into_iter().map(|(id,)| id).collect();
        let coupons = sqlx::query(
            "UPDATE coupons SET is_active = false WHERE user_plan_id = ANY($1) AND used = false",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            plans = ids.len(),
            coupons = coupons.rows_affected(),
            "Expired user plans"
        );
        Ok(ids.len() as u64)
    }

    /// A customer's plans, newest first, with their coupons
    pub async fn user_plans(&self, user_id: Uuid) -> BillingResult<Vec<UserPlanSummary>> {
        let overviews = sqlx::query_as::<_, UserPlanOverview>(
            r#"
            SELECT up.id, up.plan_id, p.slug AS plan_slug, p.name AS plan_name, up.status,
                   up.starts_at, up.expires_at, up.subscription_id,
                   COUNT(c.id) AS coupons_total,
                   COUNT(c.id) FILTER (WHERE c.used = false AND c.is_active = true
                                         AND (c.expires_at IS NULL OR c.expires_at > NOW()))
                       AS coupons_remaining
            FROM user_plans up
            JOIN plans p ON p.id = up.plan_id
            LEFT JOIN coupons c ON c.user_plan_id = up.id
            WHERE up.user_id = $1
            GROUP BY up.id, p.slug, p.name
            ORDER BY up.created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = overviews.iter().map(|o| o.id).collect();
        let mut coupons = sqlx::query_as::<_, CouponRecord>(&format!(
            "SELECT {} FROM coupons WHERE user_plan_id = ANY($1) ORDER BY code",
            CouponRecord::COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(overviews
            .into_iter()
            .map(|plan| {
                let (mine, rest): (Vec<_>, Vec<_>) = coupons
                    .drain(..)
                    .partition(|c| c.user_plan_id == Some(plan.id));
                coupons = rest;
                UserPlanSummary {
                    plan,
                    coupons: mine,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use serial_test::serial;

    fn terms(billing: PlanBilling, price_id: Option<&str>) -> BillingResult<()> {
        validate_terms(
            "Pack",
            40_000,
            billing,
            price_id,
            4,
            DiscountType::Percentage,
            100,
            30,
        )
    }

    #[test]
    fn test_monthly_plan_requires_price_id() {
        assert!(terms(PlanBilling::Monthly, None).is_err());
        assert!(terms(PlanBilling::Monthly, Some("  ")).is_err());
        assert!(terms(PlanBilling::Monthly, Some("price_123")).is_ok());
        assert!(terms(PlanBilling::OneTime, None).is_ok());
    }

    #[test]
    fn test_plan_terms_reject_bad_values() {
        assert!(validate_terms("", 1, PlanBilling::OneTime, None, 1, DiscountType::Fixed, 1, 1).is_err());
        assert!(validate_terms("P", 0, PlanBilling::OneTime, None, 1, DiscountType::Fixed, 1, 1).is_err());
        assert!(validate_terms("P", 1, PlanBilling::OneTime, None, 101, DiscountType::Fixed, 1, 1).is_err());
        assert!(validate_terms("P", 1, PlanBilling::OneTime, None, 1, DiscountType::Percentage, 120, 1).is_err());
        assert!(validate_terms("P", 1, PlanBilling::OneTime, None, 1, DiscountType::Fixed, 1, 0).is_err());
    }

    #[test]
    fn test_slug_validation() {
        assert!(validate_slug("pack-4h").is_ok());
        assert!(validate_slug("Pack 4h").is_err());
        assert!(validate_slug("").is_err());
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_update_keeps_unchanged_fields() {
        let pool = test_support::pool().await;
        let plan = test_support::insert_plan(&pool, 3).await;

        let service = PlanService::new(pool.clone());
        let updated = service
            .update(
                plan.id,
                PlanUpdate {
                    price_cents: Some(45_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.price_cents, 45_000);
        assert_eq!(updated.name, plan.name);
        assert_eq!(updated.billing(), PlanBilling::OneTime);
        assert_eq!(updated.coupon_count, 3);
        assert_eq!(updated.validity_days, plan.validity_days);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_activate_generates_coupon_set() {
        let pool = test_support::pool().await;
        let user_id = test_support::insert_user(&pool).await;
        let plan = test_support::insert_plan(&pool, 3).await;

        let mut tx = pool.begin().await.unwrap();
        let activated = PlanService::activate(&mut tx, user_id, &plan, None, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(activated.coupon_codes.len(), 3);
        assert!(activated.coupon_codes.iter().all(|c| c.starts_with("PLAN-")));

        let summaries = PlanService::new(pool.clone()).user_plans(user_id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].plan.coupons_total, 3);
        assert_eq!(summaries[0].plan.coupons_remaining, 3);
        assert_eq!(summaries[0].coupons.len(), 3);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_expire_due_deactivates_unused_coupons() {
        let pool = test_support::pool().await;
        let user_id = test_support::insert_user(&pool).await;
        let plan = test_support::insert_plan(&pool, 2).await;

        let past = OffsetDateTime::now_utc() - Duration::minutes(1);
        let mut tx = pool.begin().await.unwrap();
        let activated = PlanService::activate(&mut tx, user_id, &plan, None, Some(past))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let service = PlanService::new(pool.clone());
        assert!(service.expire_due().await.unwrap() >= 1);

        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM coupons WHERE user_plan_id = $1 AND is_active = true",
        )
        .bind(activated.user_plan.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(active, 0);
    }
}
