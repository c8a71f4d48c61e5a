//! Stripe webhook handling
//!
//! Verifies signatures, claims each event exactly once in
//! `stripe_webhook_events`, and reconciles checkouts, subscriptions and
//! refunds with local state.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::{Connection, PgConnection, PgPool};
use stripe::{
    CheckoutSession, CheckoutSessionMode, CheckoutSessionPaymentStatus, Event, EventObject,
    EventType, Invoice, InvoiceBillingReason, Subscription, Webhook,
};
use studio_shared::{
    format_cents, Appointment, PendingCheckout, Plan, PurchaseKind, SiteSettings,
    HOLD_EXPIRED_REASON,
};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::coupons::CouponService;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::plans::{ActivatedPlan, PlanService, RenewalInvoice};
use crate::refunds::RefundService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Events stuck in `processing` longer than this may be claimed again
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Check a `Stripe-Signature` header (`t=…,v1=…`) against the payload
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// What reconciliation needs from a Checkout Session
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionOutcome {
    pub session_id: String,
    /// Our checkout id from the session metadata or client reference
    pub checkout_id: Option<Uuid>,
    /// Funds captured; `false` while an async method is still settling
    pub paid: bool,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payment_intent: Option<String>,
    pub subscription_mode: bool,
    pub subscription: Option<String>,
    pub customer: Option<String>,
}

impl SessionOutcome {
    fn from_session(session: &CheckoutSession) -> Self {
        let checkout_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("checkout_id").cloned())
            .or_else(|| session.client_reference_id.clone())
            .and_then(|id| Uuid::parse_str(&id).ok());

        Self {
            session_id: session.id.to_string(),
            checkout_id,
            paid: session.payment_status != CheckoutSessionPaymentStatus::Unpaid,
            amount_total: session.amount_total,
            currency: session.currency.map(|c| c.to_string()),
            payment_intent: session.payment_intent.as_ref().map(|pi| pi.id().to_string()),
            subscription_mode: session.mode == CheckoutSessionMode::Subscription,
            subscription: session.subscription.as_ref().map(|s| s.id().to_string()),
            customer: session.customer.as_ref().map(|c| c.id().to_string()),
        }
    }

    fn currency_or(&self, fallback: &str) -> String {
        self.currency
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// Subscription fields mirrored into `subscriptions`
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionState {
    pub stripe_subscription_id: String,
    pub status: String,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionState {
    fn from_subscription(subscription: &Subscription) -> Self {
        Self {
            stripe_subscription_id: subscription.id.to_string(),
            status: subscription.status.as_str().to_string(),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }
}

/// Mark a checkout completed; `false` when another delivery got there first
async fn claim_checkout(conn: &mut PgConnection, checkout_id: Uuid) -> BillingResult<bool> {
    let claimed = sqlx::query(
        r#"
        UPDATE pending_checkouts SET status = 'completed', completed_at = NOW()
        WHERE id = $1 AND status <> 'completed'
        "#,
    )
    .bind(checkout_id)
    .execute(conn)
    .await?;
    Ok(claimed.rows_affected() == 1)
}

enum ConfirmOutcome {
    Confirmed(Appointment),
    AlreadyConfirmed,
    /// Cancelled by the customer or the studio, not by an expired hold
    Withdrawn,
    /// The hold expired and someone else booked the time
    SlotTaken,
}

/// Confirm a paid appointment in a savepoint so a lost slot keeps the payment
///
/// Only pending holds and holds cancelled for lack of payment are confirmed.
async fn confirm_paid_appointment(
    conn: &mut PgConnection,
    appointment_id: Uuid,
) -> BillingResult<ConfirmOutcome> {
    let mut savepoint = conn.begin().await?;
    let confirmed = sqlx::query_as::<_, Appointment>(&format!(
        r#"
        UPDATE appointments
        SET status = 'confirmed', cancelled_at = NULL, cancellation_reason = NULL,
            updated_at = NOW()
        WHERE id = $1
          AND (status = 'pending' OR (status = 'cancelled' AND cancellation_reason = $2))
        RETURNING {}
        "#,
        Appointment::COLUMNS
    ))
    .bind(appointment_id)
    .bind(HOLD_EXPIRED_REASON)
    .fetch_optional(&mut *savepoint)
    .await;

    match confirmed {
        Ok(Some(appointment)) => {
            savepoint.commit().await?;
            Ok(ConfirmOutcome::Confirmed(appointment))
        }
        Ok(None) => {
            let (status,): (String,) =
                sqlx::query_as("SELECT status FROM appointments WHERE id = $1")
                    .bind(appointment_id)
                    .fetch_one(&mut *savepoint)
                    .await?;
            savepoint.commit().await?;
            if status == "cancelled" {
                Ok(ConfirmOutcome::Withdrawn)
            } else {
                Ok(ConfirmOutcome::AlreadyConfirmed)
            }
        }
        Err(e) => {
            savepoint.rollback().await?;
            match BillingError::from(e) {
                BillingError::SlotUnavailable => Ok(ConfirmOutcome::SlotTaken),
                other => Err(other),
            }
        }
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    email: BillingEmailService,
    plans: PlanService,
    refunds: RefundService,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        let plans = PlanService::new(pool.clone());
        let refunds = RefundService::new(Some(stripe.clone()), pool.clone());
        Self {
            stripe,
            pool,
            email,
            plans,
            refunds,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Falls back to manual verification when the SDK cannot parse events
    /// from a newer API version.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature(
            payload,
            signature,
            webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookEventNotSupported(format!("Unparseable event: {}", e))
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );
        Ok(event)
    }

    /// Handle a verified Stripe event exactly once
    ///
    /// The event id is claimed with `INSERT … ON CONFLICT … RETURNING`. Events
    /// that failed, or that have been stuck in `processing`, can be claimed
    /// again when Stripe retries them.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        if !self.claim_event(&event_id, &event_type).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(event).await;
        self.record_event_result(&event_id, &result).await;

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event_id,
                event_type = %event_type,
                error = %e,
                "Webhook processing failed"
            );
        }

        result
    }

    /// `true` when this delivery owns the event
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - ($3 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn record_event_result(&self, event_id: &str, result: &BillingResult<()>) {
        let (processing_result, error_message) = match result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to record webhook processing result"
            );
        }
    }

    async fn process_event(&self, event: Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted
            | EventType::CheckoutSessionAsyncPaymentSucceeded => {
                let session = Self::extract_session(event)?;
                self.complete_checkout(SessionOutcome::from_session(&session))
                    .await
            }
            EventType::CheckoutSessionExpired | EventType::CheckoutSessionAsyncPaymentFailed => {
                let session = Self::extract_session(event)?;
                self.expire_checkout(SessionOutcome::from_session(&session))
                    .await
            }
            EventType::InvoicePaid => self.handle_invoice_paid(Self::extract_invoice(event)?).await,
            EventType::CustomerSubscriptionUpdated => {
                let subscription = Self::extract_subscription(event)?;
                self.sync_subscription(SubscriptionState::from_subscription(&subscription), false)
                    .await
            }
            EventType::CustomerSubscriptionDeleted => {
                let subscription = Self::extract_subscription(event)?;
                self.sync_subscription(SubscriptionState::from_subscription(&subscription), true)
                    .await
            }
            EventType::ChargeRefunded => self.handle_charge_refunded(event).await,
            other => {
                tracing::info!(event_type = %other, "Unhandled webhook event type");
                Ok(())
            }
        }
    }

    fn extract_session(event: Event) -> BillingResult<CheckoutSession> {
        match event.data.object {
            EventObject::CheckoutSession(session) => Ok(session),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected CheckoutSession".to_string(),
            )),
        }
    }

    fn extract_invoice(event: Event) -> BillingResult<Invoice> {
        match event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Invoice".to_string(),
            )),
        }
    }

    fn extract_subscription(event: Event) -> BillingResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    /// Find our checkout by session id, then by the id we put on the session
    async fn find_checkout(&self, outcome: &SessionOutcome) -> BillingResult<Option<PendingCheckout>> {
        let by_session = sqlx::query_as::<_, PendingCheckout>(&format!(
            "SELECT {} FROM pending_checkouts WHERE provider_session_id = $1",
            PendingCheckout::COLUMNS
        ))
        .bind(&outcome.session_id)
        .fetch_optional(&self.pool)
        .await?;
        if by_session.is_some() {
            return Ok(by_session);
        }

        let Some(checkout_id) = outcome.checkout_id else {
            return Ok(None);
        };

        let checkout = sqlx::query_as::<_, PendingCheckout>(&format!(
            "SELECT {} FROM pending_checkouts WHERE id = $1",
            PendingCheckout::COLUMNS
        ))
        .bind(checkout_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(checkout)
    }

    async fn customer_contact(&self, user_id: Uuid) -> BillingResult<Option<(String, String)>> {
        let contact: Option<(String, String)> =
            sqlx::query_as("SELECT email, name FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(contact)
    }

    async fn complete_checkout(&self, outcome: SessionOutcome) -> BillingResult<()> {
        let Some(checkout) = self.find_checkout(&outcome).await? else {
            tracing::warn!(session_id = %outcome.session_id, "Checkout completed for unknown session");
            return Ok(());
        };

        if checkout.status == "completed" {
            tracing::info!(checkout_id = %checkout.id, "Checkout already completed");
            return Ok(());
        }

        if !outcome.paid {
            // Async methods (e.g. boleto) settle later with a separate event
            tracing::info!(
                checkout_id = %checkout.id,
                session_id = %outcome.session_id,
                "Checkout completed, awaiting asynchronous payment"
            );
            return Ok(());
        }

        match checkout.kind.parse::<PurchaseKind>() {
            Ok(PurchaseKind::Appointment) => {
                self.complete_appointment_checkout(&checkout, &outcome).await
            }
            Ok(PurchaseKind::Plan) => self.complete_plan_checkout(&checkout, &outcome).await,
            Err(e) => Err(BillingError::Internal(e)),
        }
    }

    async fn complete_appointment_checkout(
        &self,
        checkout: &PendingCheckout,
        outcome: &SessionOutcome,
    ) -> BillingResult<()> {
        let appointment_id = checkout.appointment_id.ok_or_else(|| {
            BillingError::Internal(format!("Checkout {} has no appointment", checkout.id))
        })?;
        let session_id = &outcome.session_id;
        let amount = outcome.amount_total.unwrap_or(checkout.amount_cents);
        let currency = outcome.currency_or(&self.stripe.config().currency);

        let mut tx = self.pool.begin().await?;

        if !claim_checkout(&mut tx, checkout.id).await? {
            tracing::info!(checkout_id = %checkout.id, "Checkout already completed");
            return Ok(());
        }

        // Another checkout or a cash payment already settled this booking
        let (already_paid,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM payments
                WHERE appointment_id = $1 AND status = 'paid'
                  AND provider_reference IS DISTINCT FROM $2
            )
            "#,
        )
        .bind(appointment_id)
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE payments
            SET status = 'paid', paid_at = NOW(), provider_payment_intent = $2, amount_cents = $3
            WHERE provider_reference = $1 AND status IN ('pending', 'failed')
            RETURNING id
            "#,
        )
        .bind(session_id)
        .bind(&outcome.payment_intent)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let payment_id = match updated {
            Some((id,)) => Some(id),
            None => sqlx::query_as::<_, (Uuid,)>(
                r#"
                INSERT INTO payments
                    (user_id, appointment_id, provider, provider_reference, provider_payment_intent,
                     amount_cents, currency, status, kind, paid_at)
                VALUES ($1, $2, 'stripe', $3, $4, $5, $6, 'paid', 'appointment', NOW())
                ON CONFLICT (provider_reference) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(checkout.user_id)
            .bind(appointment_id)
            .bind(session_id)
            .bind(&outcome.payment_intent)
            .bind(amount)
            .bind(&currency)
            .fetch_optional(&mut *tx)
            .await?
            .map(|(id,)| id),
        };

        if already_paid {
            tx.commit().await?;
            tracing::error!(
                appointment_id = %appointment_id,
                session_id = %session_id,
                "Appointment was already paid, refunding duplicate payment"
            );
            self.refund_unusable_payment(payment_id).await;
            return Ok(());
        }

        let appointment = match confirm_paid_appointment(&mut tx, appointment_id).await? {
            ConfirmOutcome::Confirmed(appointment) => appointment,
            ConfirmOutcome::AlreadyConfirmed => {
                tx.commit().await?;
                tracing::info!(appointment_id = %appointment_id, "Appointment already confirmed");
                return Ok(());
            }
            ConfirmOutcome::Withdrawn => {
                tx.commit().await?;
                tracing::warn!(
                    appointment_id = %appointment_id,
                    session_id = %session_id,
                    "Payment for a cancelled appointment, refunding"
                );
                self.refund_unusable_payment(payment_id).await;
                return Ok(());
            }
            ConfirmOutcome::SlotTaken => {
                tx.commit().await?;
                tracing::error!(
                    appointment_id = %appointment_id,
                    session_id = %session_id,
                    "Paid appointment lost its slot after the hold expired, refunding"
                );
                self.refund_unusable_payment(payment_id).await;
                return Ok(());
            }
        };

        if let Some(coupon_id) = appointment.coupon_id {
            // Re-claim a coupon released when the hold expired; no-op otherwise
            sqlx::query(
                r#"
                UPDATE coupons SET used = true, used_at = NOW(), appointment_id = $2
                WHERE id = $1 AND used = false
                "#,
            )
            .bind(coupon_id)
            .bind(appointment.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            appointment_id = %appointment.id,
            checkout_id = %checkout.id,
            amount_cents = amount,
            "Appointment paid and confirmed"
        );

        if let Err(e) = self
            .notify_appointment_paid(checkout.user_id, &appointment, &currency, amount)
            .await
        {
            tracing::warn!(
                appointment_id = %appointment.id,
                error = %e,
                "Failed to send payment email"
            );
        }

        Ok(())
    }

    /// Give back a payment that cannot be applied to its booking
    async fn refund_unusable_payment(&self, payment_id: Option<Uuid>) {
        let Some(payment_id) = payment_id else {
            return;
        };
        match self.refunds.refund_payment(payment_id).await {
            Ok(payment) => tracing::info!(
                payment_id = %payment.id,
                amount_cents = payment.amount_cents,
                "Unusable payment refunded"
            ),
            Err(e) => tracing::error!(
                payment_id = %payment_id,
                error = %e,
                "Automatic refund failed - refund manually"
            ),
        }
    }

    async fn notify_appointment_paid(
        &self,
        user_id: Uuid,
        appointment: &Appointment,
        currency: &str,
        amount: i64,
    ) -> BillingResult<()> {
        let Some((email, name)) = self.customer_contact(user_id).await? else {
            return Ok(());
        };
        let settings = SiteSettings::load(&self.pool).await?;
        let label = appointment
            .service_kind()
            .map(|k| k.label())
            .unwrap_or("Studio session");
        let _ = self
            .email
            .send_appointment_paid(
                &email,
                &name,
                label,
                &settings.studio_hours().format_local(appointment.starts_at),
                &format!("{} {}", currency.to_uppercase(), format_cents(amount)),
            )
            .await;
        Ok(())
    }

    async fn complete_plan_checkout(
        &self,
        checkout: &PendingCheckout,
        outcome: &SessionOutcome,
    ) -> BillingResult<()> {
        let plan_id = checkout.plan_id.ok_or_else(|| {
            BillingError::Internal(format!("Checkout {} has no plan", checkout.id))
        })?;
        let plan = self.plans.get(plan_id).await?;
        let amount = outcome.amount_total.unwrap_or(checkout.amount_cents);
        let currency = outcome.currency_or(&self.stripe.config().currency);

        let mut tx = self.pool.begin().await?;

        if !claim_checkout(&mut tx, checkout.id).await? {
            tracing::info!(checkout_id = %checkout.id, "Checkout already completed");
            return Ok(());
        }

        let subscription_id = if outcome.subscription_mode {
            let stripe_subscription_id = outcome.subscription.as_deref().ok_or_else(|| {
                BillingError::Internal("Subscription checkout without subscription".to_string())
            })?;

            let (id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO subscriptions
                    (user_id, plan_id, stripe_subscription_id, stripe_customer_id, status)
                VALUES ($1, $2, $3, $4, 'active')
                ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                    stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id,
                                                  subscriptions.stripe_customer_id),
                    updated_at = NOW()
                RETURNING id
                "#,
            )
            .bind(checkout.user_id)
            .bind(plan.id)
            .bind(stripe_subscription_id)
            .bind(&outcome.customer)
            .fetch_one(&mut *tx)
            .await?;
            Some(id)
        } else {
            None
        };

        let activated =
            PlanService::activate(&mut tx, checkout.user_id, &plan, subscription_id, None).await?;

        sqlx::query(
            r#"
            INSERT INTO payments
                (user_id, user_plan_id, provider, provider_reference, provider_payment_intent,
                 amount_cents, currency, status, kind, paid_at)
            VALUES ($1, $2, 'stripe', $3, $4, $5, $6, 'paid', 'plan', NOW())
            ON CONFLICT (provider_reference) DO NOTHING
            "#,
        )
        .bind(checkout.user_id)
        .bind(activated.user_plan.id)
        .bind(&outcome.session_id)
        .bind(&outcome.payment_intent)
        .bind(amount)
        .bind(&currency)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            checkout_id = %checkout.id,
            user_plan_id = %activated.user_plan.id,
            coupons = activated.coupon_codes.len(),
            "Plan purchased and activated"
        );

        if let Err(e) = self
            .notify_plan_activated(checkout.user_id, &plan, &activated)
            .await
        {
            tracing::warn!(
                user_plan_id = %activated.user_plan.id,
                error = %e,
                "Failed to send plan email"
            );
        }

        Ok(())
    }

    async fn expire_checkout(&self, outcome: SessionOutcome) -> BillingResult<()> {
        let session_id = &outcome.session_id;

        let Some(checkout) = self.find_checkout(&outcome).await? else {
            tracing::info!(session_id = %session_id, "Expired session for unknown checkout");
            return Ok(());
        };
        if checkout.status != "pending" {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE pending_checkouts SET status = 'expired' WHERE id = $1 AND status = 'pending'")
            .bind(checkout.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE payments SET status = 'failed' WHERE provider_reference = $1 AND status = 'pending'",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        if let Some(appointment_id) = checkout.appointment_id {
            let (newer_checkout,): (bool,) = sqlx::query_as(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM pending_checkouts
                    WHERE appointment_id = $1 AND status = 'pending' AND id <> $2
                )
                "#,
            )
            .bind(appointment_id)
            .bind(checkout.id)
            .fetch_one(&mut *tx)
            .await?;

            if !newer_checkout {
                let cancelled = sqlx::query(
                    r#"
                    UPDATE appointments
                    SET status = 'cancelled', cancelled_at = NOW(),
                        cancellation_reason = $2, updated_at = NOW()
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(appointment_id)
                .bind(HOLD_EXPIRED_REASON)
                .execute(&mut *tx)
                .await?;

                if cancelled.rows_affected() > 0 {
                    CouponService::release_for_appointment(&mut *tx, appointment_id).await?;
                    tracing::info!(
                        appointment_id = %appointment_id,
                        "Appointment cancelled after checkout expired"
                    );
                }
            }
        }

        tx.commit().await?;

        tracing::info!(checkout_id = %checkout.id, session_id = %session_id, "Checkout expired");
        Ok(())
    }

    async fn handle_invoice_paid(&self, invoice: Invoice) -> BillingResult<()> {
        if invoice.billing_reason != Some(InvoiceBillingReason::SubscriptionCycle) {
            // The first invoice is reconciled through checkout.session.completed
            return Ok(());
        }

        let Some(stripe_subscription_id) = invoice.subscription.as_ref().map(|s| s.id().to_string())
        else {
            tracing::warn!(invoice_id = %invoice.id, "Cycle invoice without subscription");
            return Ok(());
        };

        let renewal = RenewalInvoice {
            reference: invoice.id.to_string(),
            payment_intent: invoice.payment_intent.as_ref().map(|pi| pi.id().to_string()),
            amount_cents: invoice.amount_paid,
            currency: invoice
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| self.stripe.config().currency.clone()),
        };

        self.renew_subscription(&stripe_subscription_id, &renewal).await
    }

    async fn renew_subscription(
        &self,
        stripe_subscription_id: &str,
        renewal: &RenewalInvoice,
    ) -> BillingResult<()> {
        let period_end: Option<(Option<OffsetDateTime>,)> = sqlx::query_as(
            "SELECT current_period_end FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        let now = OffsetDateTime::now_utc();
        let period_end = period_end
            .and_then(|(end,)| end)
            .filter(|end| *end > now);

        let Some((user_id, plan, activated)) = self
            .plans
            .renew_for_subscription(stripe_subscription_id, period_end, renewal)
            .await?
        else {
            return Ok(());
        };

        // The renewal is committed; a failed notification must not fail the event
        if let Err(e) = self.notify_plan_activated(user_id, &plan, &activated).await {
            tracing::warn!(
                user_id = %user_id,
                user_plan_id = %activated.user_plan.id,
                error = %e,
                "Failed to send renewal email"
            );
        }

        Ok(())
    }

    async fn notify_plan_activated(
        &self,
        user_id: Uuid,
        plan: &Plan,
        activated: &ActivatedPlan,
    ) -> BillingResult<()> {
        let Some((email, name)) = self.customer_contact(user_id).await? else {
            return Ok(());
        };
        let settings = SiteSettings::load(&self.pool).await?;
        let _ = self
            .email
            .send_plan_activated(
                &email,
                &name,
                &plan.name,
                &activated.coupon_codes,
                &settings
                    .studio_hours()
                    .format_local(activated.user_plan.expires_at),
            )
            .await;
        Ok(())
    }

    async fn sync_subscription(&self, state: SubscriptionState, deleted: bool) -> BillingResult<()> {
        let stripe_subscription_id = &state.stripe_subscription_id;

        let row: Option<(Uuid, Uuid, Uuid)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = $2, current_period_end = $3, cancel_at_period_end = $4, updated_at = NOW()
            WHERE stripe_subscription_id = $1
            RETURNING id, user_id, plan_id
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(&state.status)
        .bind(state.current_period_end)
        .bind(state.cancel_at_period_end)
        .fetch_optional(&self.pool)
        .await?;

        let Some((subscription_id, user_id, plan_id)) = row else {
            tracing::warn!(
                subscription = %stripe_subscription_id,
                "Subscription event for unknown subscription"
            );
            return Ok(());
        };

        tracing::info!(
            subscription = %stripe_subscription_id,
            status = %state.status,
            cancel_at_period_end = state.cancel_at_period_end,
            "Subscription synced"
        );

        if !deleted {
            return Ok(());
        }

        let cancelled = PlanService::cancel_for_subscription(&self.pool, subscription_id).await?;
        tracing::info!(
            subscription = %stripe_subscription_id,
            user_plans = cancelled,
            "Subscription deleted, user plans cancelled"
        );

        if let Some((email, name)) = self.customer_contact(user_id).await? {
            let plan = self.plans.get(plan_id).await?;
            let _ = self
                .email
                .send_subscription_cancelled(&email, &name, &plan.name)
                .await;
        }

        Ok(())
    }

    async fn handle_charge_refunded(&self, event: Event) -> BillingResult<()> {
        let charge = match event.data.object {
            EventObject::Charge(charge) => charge,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected Charge".to_string(),
                ))
            }
        };

        let Some(payment_intent) = charge.payment_intent.as_ref().map(|pi| pi.id().to_string())
        else {
            tracing::warn!(charge_id = %charge.id, "Refunded charge without payment intent");
            return Ok(());
        };

        if !charge.refunded {
            tracing::info!(
                charge_id = %charge.id,
                amount_refunded = charge.amount_refunded,
                "Partial refund, payment left as paid"
            );
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE payments SET status = 'refunded', refunded_at = NOW()
            WHERE provider_payment_intent = $1 AND status = 'paid'
            "#,
        )
        .bind(&payment_intent)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            charge_id = %charge.id,
            payments = result.rows_affected(),
            "Charge refunded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StripeConfig;
    use crate::email::EmailConfig;
    use crate::test_support;
    use serial_test::serial;
    use time::Duration;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"checkout.session.completed"}"#;

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let now = 1_750_000_000;
        let header = sign(PAYLOAD, now);
        assert!(verify_signature(PAYLOAD, &header, SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_any_matching_v1_is_accepted() {
        let now = 1_750_000_000;
        let header = format!("{},v1=deadbeef", sign(PAYLOAD, now));
        let rotated = header.replacen("v1=", "v1=00,v1=", 1);
        assert!(verify_signature(PAYLOAD, &rotated, SECRET, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_750_000_000;
        let header = sign(PAYLOAD, now);
        let result = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let signed_at = 1_750_000_000;
        let header = sign(PAYLOAD, signed_at);
        let result = verify_signature(
            PAYLOAD,
            &header,
            SECRET,
            signed_at + SIGNATURE_TOLERANCE_SECONDS + 1,
        );
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature(PAYLOAD, "v1=abc", SECRET, 0).is_err());
        assert!(verify_signature(PAYLOAD, "t=123", SECRET, 123).is_err());
        assert!(verify_signature(PAYLOAD, "", SECRET, 0).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_750_000_000;
        let header = sign(PAYLOAD, now);
        assert!(verify_signature(PAYLOAD, &header, "whsec_other", now).is_err());
    }

    fn handler(pool: PgPool) -> WebhookHandler {
        let stripe = StripeClient::new(StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: SECRET.to_string(),
            currency: "brl".to_string(),
            app_base_url: "http://localhost:3000".to_string(),
        });
        let email = BillingEmailService::new(EmailConfig {
            resend_api_key: String::new(),
            resend_api_url: "http://localhost:1".to_string(),
            email_from: "Studio <noreply@studio.local>".to_string(),
            app_name: "Studio".to_string(),
            support_email: "contato@studio.local".to_string(),
            dashboard_url: "http://localhost:3000".to_string(),
        });
        WebhookHandler::new(stripe, pool, email)
    }

    fn paid_session(session_id: &str, checkout_id: Uuid) -> SessionOutcome {
        SessionOutcome {
            session_id: session_id.to_string(),
            checkout_id: Some(checkout_id),
            paid: true,
            amount_total: Some(15_000),
            currency: Some("brl".to_string()),
            ..Default::default()
        }
    }

    async fn appointment_status(pool: &PgPool, id: Uuid) -> String {
        let (status,): (String,) = sqlx::query_as("SELECT status FROM appointments WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap();
        status
    }

    async fn paid_payments(pool: &PgPool, appointment_id: Uuid) -> i64 {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payments WHERE appointment_id = $1 AND status = 'paid'",
        )
        .bind(appointment_id)
        .fetch_one(pool)
        .await
        .unwrap();
        count
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_event_is_claimed_once_until_it_fails() {
        let pool = test_support::pool().await;
        let handler = handler(pool);
        let event_id = format!("evt_{}", Uuid::new_v4().simple());
        let event_type = "checkout.session.completed";

        assert!(handler.claim_event(&event_id, event_type).await.unwrap());
        assert!(!handler.claim_event(&event_id, event_type).await.unwrap());

        // A failed delivery may be retried
        handler
            .record_event_result(&event_id, &Err(BillingError::Internal("boom".to_string())))
            .await;
        assert!(handler.claim_event(&event_id, event_type).await.unwrap());

        handler.record_event_result(&event_id, &Ok(())).await;
        assert!(!handler.claim_event(&event_id, event_type).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_checkout_completion_confirms_once() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;
        let appointment_id = test_support::insert_appointment(&pool, user_id, 15_000).await;
        let (checkout_id, session_id) =
            test_support::insert_appointment_checkout(&pool, user_id, appointment_id, 15_000).await;

        handler
            .complete_checkout(paid_session(&session_id, checkout_id))
            .await
            .unwrap();
        assert_eq!(appointment_status(&pool, appointment_id).await, "confirmed");
        assert_eq!(paid_payments(&pool, appointment_id).await, 1);

        let (checkout_status,): (String,) =
            sqlx::query_as("SELECT status FROM pending_checkouts WHERE id = $1")
                .bind(checkout_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(checkout_status, "completed");

        // Redelivery, and a racing delivery that read the checkout before it completed
        handler
            .complete_checkout(paid_session(&session_id, checkout_id))
            .await
            .unwrap();
        let mut conn = pool.acquire().await.unwrap();
        assert!(!claim_checkout(&mut conn, checkout_id).await.unwrap());
        assert_eq!(paid_payments(&pool, appointment_id).await, 1);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_unpaid_completion_waits_for_async_payment() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;
        let appointment_id = test_support::insert_appointment(&pool, user_id, 15_000).await;
        let (checkout_id, session_id) =
            test_support::insert_appointment_checkout(&pool, user_id, appointment_id, 15_000).await;

        let outcome = SessionOutcome {
            paid: false,
            ..paid_session(&session_id, checkout_id)
        };
        handler.complete_checkout(outcome).await.unwrap();

        assert_eq!(appointment_status(&pool, appointment_id).await, "pending");
        assert_eq!(paid_payments(&pool, appointment_id).await, 0);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_second_payment_for_paid_booking_is_not_applied() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;
        let appointment_id = test_support::insert_appointment(&pool, user_id, 15_000).await;
        let (stale_id, stale_session) =
            test_support::insert_appointment_checkout(&pool, user_id, appointment_id, 15_000).await;
        let (fresh_id, fresh_session) =
            test_support::insert_appointment_checkout(&pool, user_id, appointment_id, 15_000).await;

        handler
            .complete_checkout(paid_session(&fresh_session, fresh_id))
            .await
            .unwrap();
        let (confirmed_at,): (OffsetDateTime,) =
            sqlx::query_as("SELECT updated_at FROM appointments WHERE id = $1")
                .bind(appointment_id)
                .fetch_one(&pool)
                .await
                .unwrap();

        // No payment intent, so the automatic refund fails and is only logged
        handler
            .complete_checkout(paid_session(&stale_session, stale_id))
            .await
            .unwrap();

        let (status, updated_at): (String, OffsetDateTime) =
            sqlx::query_as("SELECT status, updated_at FROM appointments WHERE id = $1")
                .bind(appointment_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "confirmed");
        assert_eq!(updated_at, confirmed_at);
        assert_eq!(paid_payments(&pool, appointment_id).await, 2);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_payment_after_slot_was_rebooked_keeps_other_booking() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;
        let other_user = test_support::insert_user(&pool).await;

        let hours = i64::from(rand::random::<u32>() % 500_000) + 10_000;
        let starts_at = OffsetDateTime::now_utc() + Duration::hours(hours);
        let lapsed =
            test_support::insert_appointment_at(&pool, user_id, starts_at, "cancelled", 15_000)
                .await;
        lapse_hold(&pool, lapsed).await;
        let rebooked =
            test_support::insert_appointment_at(&pool, other_user, starts_at, "confirmed", 15_000)
                .await;
        let (checkout_id, session_id) =
            test_support::insert_appointment_checkout(&pool, user_id, lapsed, 15_000).await;

        handler
            .complete_checkout(paid_session(&session_id, checkout_id))
            .await
            .unwrap();

        assert_eq!(appointment_status(&pool, lapsed).await, "cancelled");
        assert_eq!(appointment_status(&pool, rebooked).await, "confirmed");
        // The payment is kept on record for the refund
        assert_eq!(paid_payments(&pool, lapsed).await, 1);
    }

    async fn lapse_hold(pool: &PgPool, appointment_id: Uuid) {
        sqlx::query("UPDATE appointments SET cancellation_reason = $2 WHERE id = $1")
            .bind(appointment_id)
            .bind(HOLD_EXPIRED_REASON)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_late_payment_revives_only_lapsed_holds() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;

        let hours = i64::from(rand::random::<u32>() % 500_000) + 10_000;
        let starts_at = OffsetDateTime::now_utc() + Duration::hours(hours);
        let lapsed =
            test_support::insert_appointment_at(&pool, user_id, starts_at, "cancelled", 15_000)
                .await;
        lapse_hold(&pool, lapsed).await;
        let withdrawn = test_support::insert_appointment_at(
            &pool,
            user_id,
            starts_at + Duration::hours(2),
            "cancelled",
            15_000,
        )
        .await;

        for appointment_id in [lapsed, withdrawn] {
            let (checkout_id, session_id) =
                test_support::insert_appointment_checkout(&pool, user_id, appointment_id, 15_000)
                    .await;
            handler
                .complete_checkout(paid_session(&session_id, checkout_id))
                .await
                .unwrap();
        }

        assert_eq!(appointment_status(&pool, lapsed).await, "confirmed");
        assert_eq!(appointment_status(&pool, withdrawn).await, "cancelled");
        // Kept as paid until the refund goes through
        assert_eq!(paid_payments(&pool, withdrawn).await, 1);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_expired_checkout_cancels_hold_and_releases_coupon() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;
        let appointment_id = test_support::insert_appointment(&pool, user_id, 15_000).await;
        let coupon_id = test_support::insert_claimed_coupon(&pool, user_id, appointment_id).await;
        let (checkout_id, session_id) =
            test_support::insert_appointment_checkout(&pool, user_id, appointment_id, 15_000).await;

        handler
            .expire_checkout(SessionOutcome {
                session_id: session_id.clone(),
                checkout_id: Some(checkout_id),
                ..Default::default()
            })
            .await
            .unwrap();

        let (status, reason): (String, Option<String>) =
            sqlx::query_as("SELECT status, cancellation_reason FROM appointments WHERE id = $1")
                .bind(appointment_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "cancelled");
        assert_eq!(reason.as_deref(), Some(HOLD_EXPIRED_REASON));
        let (used, attached): (bool, Option<Uuid>) =
            sqlx::query_as("SELECT used, appointment_id FROM coupons WHERE id = $1")
                .bind(coupon_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(!used);
        assert!(attached.is_none());

        let (payment_status,): (String,) =
            sqlx::query_as("SELECT status FROM payments WHERE provider_reference = $1")
                .bind(&session_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(payment_status, "failed");
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_renewal_applies_once_per_invoice() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;
        let (subscription_id, stripe_subscription_id) =
            test_support::insert_subscription(&pool, user_id, 2).await;
        let invoice = RenewalInvoice {
            reference: format!("in_test_{}", Uuid::new_v4().simple()),
            payment_intent: None,
            amount_cents: Some(30_000),
            currency: "brl".to_string(),
        };

        handler
            .renew_subscription(&stripe_subscription_id, &invoice)
            .await
            .unwrap();
        handler
            .renew_subscription(&stripe_subscription_id, &invoice)
            .await
            .unwrap();

        let (plans, coupons, payments): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM user_plans WHERE subscription_id = $1),
                (SELECT COUNT(*) FROM coupons c JOIN user_plans up ON up.id = c.user_plan_id
                 WHERE up.subscription_id = $1),
                (SELECT COUNT(*) FROM payments WHERE user_id = $2)
            "#,
        )
        .bind(subscription_id)
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!((plans, coupons, payments), (1, 2, 1));

        let (linked,): (bool,) = sqlx::query_as(
            "SELECT user_plan_id IS NOT NULL FROM payments WHERE provider_reference = $1",
        )
        .bind(&invoice.reference)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(linked);
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_deleted_subscription_cancels_user_plan() {
        let pool = test_support::pool().await;
        let handler = handler(pool.clone());
        let user_id = test_support::insert_user(&pool).await;
        let (subscription_id, stripe_subscription_id) =
            test_support::insert_subscription(&pool, user_id, 1).await;
        let invoice = RenewalInvoice {
            reference: format!("in_test_{}", Uuid::new_v4().simple()),
            payment_intent: None,
            amount_cents: None,
            currency: "brl".to_string(),
        };
        handler
            .renew_subscription(&stripe_subscription_id, &invoice)
            .await
            .unwrap();

        handler
            .sync_subscription(
                SubscriptionState {
                    stripe_subscription_id: stripe_subscription_id.clone(),
                    status: "canceled".to_string(),
                    current_period_end: None,
                    cancel_at_period_end: false,
                },
                true,
            )
            .await
            .unwrap();

        let (plan_status, subscription_status): (String, String) = sqlx::query_as(
            r#"
            SELECT up.status, s.status
            FROM user_plans up JOIN subscriptions s ON s.id = up.subscription_id
            WHERE s.id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(plan_status, "cancelled");
        assert_eq!(subscription_status, "canceled");
    }
}
