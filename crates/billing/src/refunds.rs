//! Refunds for recorded payments

use sqlx::PgPool;
use stripe::{CreateRefund, PaymentIntentId, Refund};
use studio_shared::{Payment, PaymentStatus};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Refund service
///
/// Stripe payments are refunded through the API by payment intent; manual
/// (cash) payments are only marked as refunded.
#[derive(Clone)]
pub struct RefundService {
    stripe: Option<StripeClient>,
    pool: PgPool,
}

impl RefundService {
    pub fn new(stripe: Option<StripeClient>, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    pub async fn refund_payment(&self, payment_id: Uuid) -> BillingResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            Payment::COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound("Payment not found".to_string()))?;

        match payment.status() {
            Some(PaymentStatus::Paid) => {}
            Some(PaymentStatus::Refunded) => {
                return Err(BillingError::InvalidInput(
                    "Payment was already refunded".to_string(),
                ))
            }
            _ => {
                return Err(BillingError::InvalidInput(
                    "Only paid payments can be refunded".to_string(),
                ))
            }
        }

        if payment.provider == "stripe" {
            let stripe = self
                .stripe
                .as_ref()
                .ok_or_else(|| BillingError::Config("Stripe is not configured".to_string()))?;
            let intent = payment.provider_payment_intent.as_deref().ok_or_else(|| {
                BillingError::InvalidInput("Payment has no Stripe payment intent".to_string())
            })?;
            let intent = intent
                .parse::<PaymentIntentId>()
                .map_err(|e| BillingError::Internal(format!("Invalid payment intent: {}", e)))?;

            let mut params = CreateRefund::new();
            params.payment_intent = Some(intent);
            let refund = Refund::create(stripe.inner(), params).await?;

            tracing::info!(
                payment_id = %payment.id,
                refund_id = %refund.id,
                amount_cents = payment.amount_cents,
                "Stripe refund created"
            );
        }

        let refunded = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments SET status = 'refunded', refunded_at = NOW()
            WHERE id = $1 AND status = 'paid'
            RETURNING {}
            "#,
            Payment::COLUMNS
        ))
        .bind(payment.id)
        .fetch_optional(&self.pool)
        .await?;

        // charge.refunded may have marked it first
        match refunded {
            Some(payment) => Ok(payment),
            None => sqlx::query_as::<_, Payment>(&format!(
                "SELECT {} FROM payments WHERE id = $1",
                Payment::COLUMNS
            ))
            .bind(payment.id)
            .fetch_one(&self.pool)
            .await
            .map_err(BillingError::from),
        }
    }
}
