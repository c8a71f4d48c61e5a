//! Stripe Checkout sessions for appointments and plans
//!
//! Every session is preceded by a `pending_checkouts` row whose id travels in
//! the session metadata, so the webhook can reconcile the payment even when
//! the session id lookup fails.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData, CreateCheckoutSessionPaymentIntentData,
    CreateCheckoutSessionSubscriptionData,
};
use studio_shared::{
    Appointment, AppointmentStatus, PendingCheckout, Plan, PlanBilling, PurchaseKind, SiteSettings,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Stripe rejects session expiries closer than 30 minutes
const MIN_SESSION_MINUTES: i64 = 31;

/// The customer starting a checkout
#[derive(Debug, Clone)]
pub struct CheckoutCustomer {
    pub id: Uuid,
    pub email: String,
}

/// Where to send the customer to pay
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutLink {
    pub checkout_id: Uuid,
    pub session_id: String,
    pub url: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// Expiry for an appointment session: the end of the hold, but never
/// earlier than Stripe allows
fn session_expiry(
    appointment_created_at: OffsetDateTime,
    hold_minutes: i32,
    now: OffsetDateTime,
) -> BillingResult<OffsetDateTime> {
    let hold_ends = appointment_created_at + Duration::minutes(i64::from(hold_minutes));
    if hold_ends <= now {
        return Err(BillingError::InvalidInput(
            "The reservation hold for this appointment has expired".to_string(),
        ));
    }
    Ok(hold_ends.max(now + Duration::minutes(MIN_SESSION_MINUTES)))
}

fn checkout_metadata(
    checkout_id: Uuid,
    kind: PurchaseKind,
    user_id: Uuid,
    target: (&str, Uuid),
) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("checkout_id".to_string(), checkout_id.to_string());
    metadata.insert("kind".to_string(), kind.as_str().to_string());
    metadata.insert("user_id".to_string(), user_id.to_string());
    metadata.insert(target.0.to_string(), target.1.to_string());
    metadata
}

/// Checkout service for creating Stripe checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create a payment session for a pending appointment owned by `customer`
    pub async fn create_appointment_checkout(
        &self,
        customer: &CheckoutCustomer,
        appointment_id: Uuid,
    ) -> BillingResult<CheckoutLink> {
        let appointment = sqlx::query_as::<_, Appointment>(&format!(
            "SELECT {} FROM appointments WHERE id = $1 AND user_id = $2",
            Appointment::COLUMNS
        ))
        .bind(appointment_id)
        .bind(customer.id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound("Appointment not found".to_string()))?;

        if appointment.status() != AppointmentStatus::Pending {
            return Err(BillingError::InvalidInput(
                "Only pending appointments can be paid".to_string(),
            ));
        }
        if appointment.total_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "This appointment has nothing to pay".to_string(),
            ));
        }

        let settings = SiteSettings::load(&self.pool).await?;
        let now = OffsetDateTime::now_utc();
        let expires_at = session_expiry(appointment.created_at, settings.hold_minutes, now)?;

        let mut tx = self.pool.begin().await?;

        // Older sessions for the same appointment stop counting as the active one
        sqlx::query(
            r#"
            UPDATE pending_checkouts SET status = 'expired'
            WHERE appointment_id = $1 AND status = 'pending'
            "#,
        )
        .bind(appointment.id)
        .execute(&mut *tx)
        .await?;

        let metadata_json = serde_json::json!({
            "service": appointment.service,
            "starts_at": appointment.starts_at.unix_timestamp(),
        });
        let checkout = sqlx::query_as::<_, PendingCheckout>(&format!(
            r#"
            INSERT INTO pending_checkouts
                (user_id, kind, appointment_id, coupon_id, amount_cents, metadata)
            VALUES ($1, 'appointment', $2, $3, $4, $5)
            RETURNING {}
            "#,
            PendingCheckout::COLUMNS
        ))
        .bind(customer.id)
        .bind(appointment.id)
        .bind(appointment.coupon_id)
        .bind(appointment.total_cents)
        .bind(metadata_json)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let metadata = checkout_metadata(
            checkout.id,
            PurchaseKind::Appointment,
            customer.id,
            ("appointment_id", appointment.id),
        );

        let product_name = match appointment.service_kind() {
            Some(kind) => format!("{} - {}", settings.studio_name, kind.label()),
            None => format!("{} - Studio session", settings.studio_name),
        };
        let description = format!(
            "{} ({} min)",
            settings.studio_hours().format_local(appointment.starts_at),
            appointment.range().duration_minutes()
        );

        let line_item = CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: self.stripe.config().stripe_currency(),
                unit_amount: Some(appointment.total_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: product_name,
                    description: Some(description),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        };

        let success_url = self.stripe.config().success_url(PurchaseKind::Appointment.as_str());
        let cancel_url = self.stripe.config().cancel_url(PurchaseKind::Appointment.as_str());
        let checkout_id = checkout.id.to_string();

        let params = CreateCheckoutSession {
            mode: Some(CheckoutSessionMode::Payment),
            line_items: Some(vec![line_item]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            customer_email: Some(&customer.email),
            client_reference_id: Some(&checkout_id),
            expires_at: Some(expires_at.unix_timestamp()),
            metadata: Some(metadata.clone()),
            payment_intent_data: Some(CreateCheckoutSessionPaymentIntentData {
                metadata: Some(metadata),
                ..Default::default()
            }),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        let session_id = session.id.to_string();
        let url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE pending_checkouts SET provider_session_id = $2 WHERE id = $1")
            .bind(checkout.id)
            .bind(&session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, appointment_id, provider, provider_reference, amount_cents,
                 currency, status, kind)
            VALUES ($1, $2, 'stripe', $3, $4, $5, 'pending', 'appointment')
            "#,
        )
        .bind(customer.id)
        .bind(appointment.id)
        .bind(&session_id)
        .bind(appointment.total_cents)
        .bind(&self.stripe.config().currency)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %customer.id,
            appointment_id = %appointment.id,
            checkout_id = %checkout.id,
            session_id = %session_id,
            amount_cents = appointment.total_cents,
            "Created appointment checkout session"
        );

        Ok(CheckoutLink {
            checkout_id: checkout.id,
            session_id,
            url,
            expires_at: Some(expires_at),
        })
    }

    /// Create a session for buying `plan`
    ///
    /// One-time plans are charged inline; monthly plans start a Stripe
    /// subscription on the plan's configured price.
    pub async fn create_plan_checkout(
        &self,
        customer: &CheckoutCustomer,
        plan: &Plan,
    ) -> BillingResult<CheckoutLink> {
        if !plan.is_active {
            return Err(BillingError::InvalidInput(
                "This plan is not available".to_string(),
            ));
        }

        let billing = plan.billing();
        let price_id = match billing {
            PlanBilling::Monthly => Some(plan.stripe_price_id.clone().ok_or_else(|| {
                BillingError::Config(format!("Plan {} has no Stripe price", plan.slug))
            })?),
            PlanBilling::OneTime => None,
        };

        if billing == PlanBilling::Monthly {
            let (active,): (bool,) = sqlx::query_as(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM subscriptions
                    WHERE user_id = $1 AND plan_id = $2
                      AND status IN ('active', 'trialing', 'past_due')
                )
                "#,
            )
            .bind(customer.id)
            .bind(plan.id)
            .fetch_one(&self.pool)
            .await?;
            if active {
                return Err(BillingError::AlreadyExists(
                    "You already subscribe to this plan".to_string(),
                ));
            }
        }

        let checkout = sqlx::query_as::<_, PendingCheckout>(&format!(
            r#"
            INSERT INTO pending_checkouts (user_id, kind, plan_id, amount_cents, metadata)
            VALUES ($1, 'plan', $2, $3, $4)
            RETURNING {}
            "#,
            PendingCheckout::COLUMNS
        ))
        .bind(customer.id)
        .bind(plan.id)
        .bind(plan.price_cents)
        .bind(serde_json::json!({ "slug": plan.slug, "billing": billing.as_str() }))
        .fetch_one(&self.pool)
        .await?;

        let metadata = checkout_metadata(
            checkout.id,
            PurchaseKind::Plan,
            customer.id,
            ("plan_id", plan.id),
        );

        let line_item = match price_id {
            Some(price) => CreateCheckoutSessionLineItems {
                price: Some(price),
                quantity: Some(1),
                ..Default::default()
            },
            None => CreateCheckoutSessionLineItems {
                price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                    currency: self.stripe.config().stripe_currency(),
                    unit_amount: Some(plan.price_cents),
                    product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                        name: plan.name.clone(),
                        description: plan.description.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                quantity: Some(1),
                ..Default::default()
            },
        };

        let success_url = self.stripe.config().success_url(PurchaseKind::Plan.as_str());
        let cancel_url = self.stripe.config().cancel_url(PurchaseKind::Plan.as_str());
        let checkout_id = checkout.id.to_string();

        let mut params = CreateCheckoutSession {
            line_items: Some(vec![line_item]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            customer_email: Some(&customer.email),
            client_reference_id: Some(&checkout_id),
            metadata: Some(metadata.clone()),
            ..Default::default()
        };

        match billing {
            PlanBilling::Monthly => {
                params.mode = Some(CheckoutSessionMode::Subscription);
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(metadata),
                    ..Default::default()
                });
            }
            PlanBilling::OneTime => {
                params.mode = Some(CheckoutSessionMode::Payment);
                params.payment_intent_data = Some(CreateCheckoutSessionPaymentIntentData {
                    metadata: Some(metadata),
                    ..Default::default()
                });
            }
        }

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        let session_id = session.id.to_string();
        let url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::StripeApi("Checkout session has no URL".to_string()))?;

        sqlx::query("UPDATE pending_checkouts SET provider_session_id = $2 WHERE id = $1")
            .bind(checkout.id)
            .bind(&session_id)
            .execute(&self.pool)
            .await?;

        let expires_at = OffsetDateTime::from_unix_timestamp(session.expires_at).ok();

        tracing::info!(
            user_id = %customer.id,
            plan = %plan.slug,
            checkout_id = %checkout.id,
            session_id = %session_id,
            billing = billing.as_str(),
            "Created plan checkout session"
        );

        Ok(CheckoutLink {
            checkout_id: checkout.id,
            session_id,
            url,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    #[test]
    fn test_session_expiry_follows_hold() {
        let created = NOW - Duration::minutes(5);
        let expiry = session_expiry(created, 120, NOW).unwrap();
        assert_eq!(expiry, created + Duration::minutes(120));
    }

    #[test]
    fn test_session_expiry_respects_stripe_minimum() {
        let created = NOW - Duration::minutes(20);
        let expiry = session_expiry(created, 30, NOW).unwrap();
        assert_eq!(expiry, NOW + Duration::minutes(MIN_SESSION_MINUTES));
    }

    #[test]
    fn test_elapsed_hold_is_rejected() {
        let created = NOW - Duration::minutes(45);
        assert!(matches!(
            session_expiry(created, 30, NOW),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_checkout_metadata_keys() {
        let checkout_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let metadata = checkout_metadata(checkout_id, PurchaseKind::Plan, user_id, ("plan_id", plan_id));
        assert_eq!(metadata.get("checkout_id"), Some(&checkout_id.to_string()));
        assert_eq!(metadata.get("kind").map(String::as_str), Some("plan"));
        assert_eq!(metadata.get("user_id"), Some(&user_id.to_string()));
        assert_eq!(metadata.get("plan_id"), Some(&plan_id.to_string()));
    }
}
