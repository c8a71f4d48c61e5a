//! Studio Billing Integration
//!
//! Stripe Checkout for appointments and plans, webhook reconciliation,
//! coupons, plan lifecycle, refunds and billing emails.

pub mod checkout;
pub mod client;
pub mod coupons;
pub mod email;
pub mod error;
pub mod plans;
pub mod refunds;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod test_support;

pub use checkout::{CheckoutCustomer, CheckoutLink, CheckoutService};
pub use client::{StripeClient, StripeConfig};
pub use coupons::{CouponFilter, CouponQuote, CouponService, CouponUpdate, NewCoupon};
pub use email::{BillingEmailService, EmailConfig};
pub use error::{BillingError, BillingResult};
pub use plans::{ActivatedPlan, NewPlan, PlanService, PlanUpdate, RenewalInvoice, UserPlanSummary};
pub use refunds::RefundService;
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Stripe-backed parts, present only when Stripe is configured
#[derive(Clone)]
struct StripeServices {
    client: StripeClient,
    checkout: CheckoutService,
    webhooks: WebhookHandler,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub coupons: CouponService,
    pub plans: PlanService,
    pub refunds: RefundService,
    pub email: BillingEmailService,
    stripe: Option<StripeServices>,
}

impl BillingService {
    /// Create a billing service; without a Stripe client, checkout and
    /// webhooks report a configuration error while coupons and plans work
    pub fn new(pool: PgPool, stripe: Option<StripeClient>, email: BillingEmailService) -> Self {
        let stripe_services = stripe.as_ref().map(|client| StripeServices {
            client: client.clone(),
            checkout: CheckoutService::new(client.clone(), pool.clone()),
            webhooks: WebhookHandler::new(client.clone(), pool.clone(), email.clone()),
        });

        Self {
            coupons: CouponService::new(pool.clone()),
            plans: PlanService::new(pool.clone()),
            refunds: RefundService::new(stripe, pool),
            email,
            stripe: stripe_services,
        }
    }

    /// Build from environment variables; Stripe is optional
    pub fn from_env(pool: PgPool, stripe_enabled: bool) -> BillingResult<Self> {
        let stripe = if stripe_enabled {
            Some(StripeClient::from_env()?)
        } else {
            None
        };
        Ok(Self::new(pool, stripe, BillingEmailService::from_env()))
    }

    pub fn is_stripe_enabled(&self) -> bool {
        self.stripe.is_some()
    }

    pub fn stripe(&self) -> BillingResult<&StripeClient> {
        self.stripe_services().map(|s| &s.client)
    }

    pub fn checkout(&self) -> BillingResult<&CheckoutService> {
        self.stripe_services().map(|s| &s.checkout)
    }

    pub fn webhooks(&self) -> BillingResult<&WebhookHandler> {
        self.stripe_services().map(|s| &s.webhooks)
    }

    fn stripe_services(&self) -> BillingResult<&StripeServices> {
        self.stripe
            .as_ref()
            .ok_or_else(|| BillingError::Config("Online payments are not configured".to_string()))
    }
}
