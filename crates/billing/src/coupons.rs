//! Coupon validation, redemption and administration
//!
//! Every price quote that involves a coupon goes through [`CouponService::quote`].
//! Redemption is claimed with a conditional update so two bookings racing for
//! the same code cannot both succeed.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgExecutor, PgPool};
use studio_shared::{CouponRecord, CouponRejection, Discount, DiscountType, Plan, Quote};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Characters used in generated codes (no 0/O/1/I)
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GENERATED_CODE_LEN: usize = 8;
const MAX_CODE_LEN: usize = 32;

/// Canonical form of a user-entered code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Random code such as `PLAN-7KQ2M9XD`
pub fn generate_code(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..GENERATED_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", prefix, suffix)
}

fn validate_code(code: &str) -> BillingResult<()> {
    if code.is_empty() || code.len() > MAX_CODE_LEN {
        return Err(BillingError::InvalidInput(format!(
            "Coupon code must be 1 to {} characters",
            MAX_CODE_LEN
        )));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BillingError::InvalidInput(
            "Coupon code may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

/// Admin request to create a coupon
#[derive(Debug, Clone, Deserialize)]
pub struct NewCoupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub value: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub min_amount_cents: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Admin request to change a coupon; absent fields are left as they are
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CouponUpdate {
    pub discount_type: Option<DiscountType>,
    pub value: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub clear_expiry: bool,
    pub is_active: Option<bool>,
    pub min_amount_cents: Option<i64>,
    pub description: Option<String>,
}

/// Admin list filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CouponFilter {
    pub active: Option<bool>,
    pub used: Option<bool>,
    pub code_prefix: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Result of validating a code against an order
#[derive(Debug, Clone, Serialize)]
pub struct CouponQuote {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount: Discount,
    #[serde(flatten)]
    pub quote: Quote,
}

/// Coupon service
#[derive(Clone)]
pub struct CouponService {
    pool: PgPool,
}

impl CouponService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a coupon by code, ignoring case and surrounding whitespace
    pub async fn find_by_code(&self, code: &str) -> BillingResult<Option<CouponRecord>> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Ok(None);
        }
        let coupon = sqlx::query_as::<_, CouponRecord>(&format!(
            "SELECT {} FROM coupons WHERE code = $1",
            CouponRecord::COLUMNS
        ))
        .bind(&code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(coupon)
    }

    /// Validate `code` for `user_id` against `subtotal_cents` and price the order
    pub async fn quote(
        &self,
        code: &str,
        user_id: Uuid,
        subtotal_cents: i64,
    ) -> BillingResult<CouponQuote> {
        let coupon = self
            .find_by_code(code)
            .await?
            .ok_or_else(|| BillingError::NotFound("Coupon not found".to_string()))?;

        let discount =
            coupon.check_redeemable(user_id, subtotal_cents, OffsetDateTime::now_utc())?;

        Ok(CouponQuote {
            coupon_id: coupon.id,
            code: coupon.code,
            discount,
            quote: Quote::compute(subtotal_cents, Some(&discount)),
        })
    }

    /// Mark a coupon used by `appointment_id`
    ///
    /// Fails with `AlreadyUsed` when another redemption claimed it first.
    pub async fn claim_for_appointment(
        conn: &mut PgConnection,
        coupon_id: Uuid,
        appointment_id: Uuid,
    ) -> BillingResult<()> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE coupons
            SET used = true, used_at = NOW(), appointment_id = $2
            WHERE id = $1 AND used = false AND is_active = true
            RETURNING id
            "#,
        )
        .bind(coupon_id)
        .bind(appointment_id)
        .fetch_optional(conn)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                coupon_id = %coupon_id,
                appointment_id = %appointment_id,
                "Coupon claim lost"
            );
            return Err(BillingError::Coupon(CouponRejection::AlreadyUsed));
        }
        Ok(())
    }

    /// Return the coupon used by an appointment so it can be redeemed again
    pub async fn release_for_appointment<'e, E>(
        executor: E,
        appointment_id: Uuid,
    ) -> BillingResult<u64>
    where
        E: PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE coupons
            SET used = false, used_at = NULL, appointment_id = NULL
            WHERE appointment_id = $1 AND used = true
            "#,
        )
        .bind(appointment_id)
        .execute(executor)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(appointment_id = %appointment_id, "Released coupon");
        }
        Ok(result.rows_affected())
    }

    /// Create the owner-restricted coupons that come with a plan
    pub async fn generate_plan_set(
        conn: &mut PgConnection,
        user_id: Uuid,
        user_plan_id: Uuid,
        plan: &Plan,
        expires_at: OffsetDateTime,
    ) -> BillingResult<Vec<String>> {
        let kind = DiscountType::parse(&plan.coupon_discount_type).ok_or_else(|| {
            BillingError::Internal(format!(
                "Plan {} has invalid coupon discount type",
                plan.slug
            ))
        })?;
        Discount::new(kind, plan.coupon_value)?;

        let description = format!("{} plan", plan.name);
        let mut codes = Vec::with_capacity(plan.coupon_count.max(0) as usize);

        for _ in 0..plan.coupon_count {
            // Retry the rare collision with an existing code
            let mut inserted = None;
            for _ in 0..3 {
                let code = generate_code("PLAN");
                let row: Option<(String,)> = sqlx::query_as(
                    r#"
                    INSERT INTO coupons
                        (code, discount_type, value, expires_at, user_id, user_plan_id, description)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (code) DO NOTHING
                    RETURNING code
                    "#,
                )
                .bind(&code)
                .bind(kind.as_str())
                .bind(plan.coupon_value)
                .bind(expires_at)
                .bind(user_id)
                .bind(user_plan_id)
                .bind(&description)
                .fetch_optional(&mut *conn)
                .await?;

                if let Some((code,)) = row {
                    inserted = Some(code);
                    break;
                }
            }

            let code = inserted.ok_or_else(|| {
                BillingError::Internal("Could not generate a unique coupon code".to_string())
            })?;
            codes.push(code);
        }

        tracing::info!(
            user_id = %user_id,
            user_plan_id = %user_plan_id,
            plan = %plan.slug,
            count = codes.len(),
            "Generated plan coupons"
        );

        Ok(codes)
    }

    /// Unused coupons owned by a user
    pub async fn list_for_user(&self, user_id: Uuid) -> BillingResult<Vec<CouponRecord>> {
        let coupons = sqlx::query_as::<_, CouponRecord>(&format!(
            r#"
            SELECT {} FROM coupons
            WHERE user_id = $1
            ORDER BY used ASC, expires_at ASC NULLS LAST, created_at DESC
            "#,
            CouponRecord::COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(coupons)
    }

    // =========================================================================
    // Admin
    // =========================================================================

    pub async fn create(&self, input: NewCoupon) -> BillingResult<CouponRecord> {
        let code = normalize_code(&input.code);
        validate_code(&code)?;
        Discount::new(input.discount_type, input.value)?;
        if matches!(input.min_amount_cents, Some(min) if min < 0) {
            return Err(BillingError::InvalidInput(
                "Minimum amount cannot be negative".to_string(),
            ));
        }

        let coupon = sqlx::query_as::<_, CouponRecord>(&format!(
            r#"
            INSERT INTO coupons
                (code, discount_type, value, expires_at, user_id, min_amount_cents, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            CouponRecord::COLUMNS
        ))
        .bind(&code)
        .bind(input.discount_type.as_str())
        .bind(input.value)
        .bind(input.expires_at)
        .bind(input.user_id)
        .bind(input.min_amount_cents)
        .bind(input.description.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match BillingError::from(e) {
            BillingError::AlreadyExists(_) => {
                BillingError::AlreadyExists(format!("Coupon {} already exists", code))
            }
            other => other,
        })?;

        tracing::info!(coupon_id = %coupon.id, code = %coupon.code, "Coupon created");
        Ok(coupon)
    }

    pub async fn update(&self, id: Uuid, changes: CouponUpdate) -> BillingResult<CouponRecord> {
        let current = self.get(id).await?;

        let discount_type = changes
            .discount_type
            .or_else(|| DiscountType::parse(&current.discount_type))
            .ok_or_else(|| BillingError::InvalidInput("Invalid discount type".to_string()))?;
        let value = changes.value.unwrap_or(current.value);
        Discount::new(discount_type, value)?;

        let expires_at = if changes.clear_expiry {
            None
        } else {
            changes.expires_at.or(current.expires_at)
        };

        let coupon = sqlx::query_as::<_, CouponRecord>(&format!(
            r#"
            UPDATE coupons
            SET discount_type = $2, value = $3, expires_at = $4, is_active = $5,
                min_amount_cents = $6, description = $7
            WHERE id = $1
            RETURNING {}
            "#,
            CouponRecord::COLUMNS
        ))
        .bind(id)
        .bind(discount_type.as_str())
        .bind(value)
        .bind(expires_at)
        .bind(changes.is_active.unwrap_or(current.is_active))
        .bind(changes.min_amount_cents.or(current.min_amount_cents))
        .bind(changes.description.or(current.description))
        .fetch_one(&self.pool)
        .await?;

        Ok(coupon)
    }

    /// Coupons are never deleted; deactivation keeps redemption history intact
    pub async fn deactivate(&self, id: Uuid) -> BillingResult<CouponRecord> {
        let coupon = sqlx::query_as::<_, CouponRecord>(&format!(
            "UPDATE coupons SET is_active = false WHERE id = $1 RETURNING {}",
            CouponRecord::COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound("Coupon not found".to_string()))?;

        tracing::info!(coupon_id = %id, "Coupon deactivated");
        Ok(coupon)
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<CouponRecord> {
        sqlx::query_as::<_, CouponRecord>(&format!(
            "SELECT {} FROM coupons WHERE id = $1",
            CouponRecord::COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound("Coupon not found".to_string()))
    }

    pub async fn list(&self, filter: &CouponFilter) -> BillingResult<Vec<CouponRecord>> {
        let prefix = filter
            .code_prefix
            .as_deref()
            .map(|p| format!("{}%", normalize_code(p).replace('%', "").replace('_', "\\_")));

        let coupons = sqlx::query_as::<_, CouponRecord>(&format!(
            r#"
            SELECT {} FROM coupons
            WHERE ($1::boolean IS NULL OR is_active = $1)
              AND ($2::boolean IS NULL OR used = $2)
              AND ($3::text IS NULL OR code LIKE $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
            CouponRecord::COLUMNS
        ))
        .bind(filter.active)
        .bind(filter.used)
        .bind(prefix)
        .bind(filter.limit.unwrap_or(100).clamp(1, 500))
        .bind(filter.offset.unwrap_or(0).max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(coupons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use serial_test::serial;

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  studio10 "), "STUDIO10");
    }

    #[test]
    fn test_generated_code_shape() {
        let code = generate_code("PLAN");
        assert!(code.starts_with("PLAN-"));
        assert_eq!(code.len(), 5 + GENERATED_CODE_LEN);
        assert!(code[5..].bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_generated_codes_differ() {
        assert_ne!(generate_code("PLAN"), generate_code("PLAN"));
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code("SUMMER-2025").is_ok());
        assert!(validate_code("").is_err());
        assert!(validate_code("NO SPACES").is_err());
        assert!(validate_code(&"X".repeat(MAX_CODE_LEN + 1)).is_err());
    }

    #[test]
    fn test_coupon_update_deserializes_partial() {
        let update: CouponUpdate = serde_json::from_str(r#"{"is_active": false}"#).unwrap();
        assert_eq!(update.is_active, Some(false));
        assert!(update.value.is_none());
        assert!(!update.clear_expiry);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_claim_is_single_use() {
        let pool = test_support::pool().await;
        let service = CouponService::new(pool.clone());
        let code = format!("ONCE-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let coupon = service
            .create(NewCoupon {
                code: code.to_lowercase(),
                discount_type: DiscountType::Fixed,
                value: 1_000,
                expires_at: None,
                user_id: None,
                min_amount_cents: None,
                description: None,
            })
            .await
            .unwrap();
        assert_eq!(coupon.code, code);

        let user_id = test_support::insert_user(&pool).await;
        let first = test_support::insert_appointment(&pool, user_id, 12_000).await;
        let second = test_support::insert_appointment(&pool, user_id, 12_000).await;

        let mut conn = pool.acquire().await.unwrap();
        CouponService::claim_for_appointment(&mut conn, coupon.id, first)
            .await
            .unwrap();
        let lost = CouponService::claim_for_appointment(&mut conn, coupon.id, second).await;
        assert!(matches!(
            lost,
            Err(BillingError::Coupon(CouponRejection::AlreadyUsed))
        ));

        let released = CouponService::release_for_appointment(&pool, first)
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(!service.get(coupon.id).await.unwrap().used);
    }
}
