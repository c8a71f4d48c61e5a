//! Stripe client configuration

use stripe::{Client, Currency};

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// ISO currency code used for inline prices (lowercase)
    pub currency: String,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            currency: std::env::var("STRIPE_CURRENCY")
                .unwrap_or_else(|_| "brl".to_string())
                .to_lowercase(),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Stripe currency for inline price data
    pub fn stripe_currency(&self) -> Currency {
        match self.currency.as_str() {
            "usd" => Currency::USD,
            "eur" => Currency::EUR,
            "gbp" => Currency::GBP,
            _ => Currency::BRL,
        }
    }

    /// Redirect after a successful appointment or plan checkout
    pub fn success_url(&self, kind: &str) -> String {
        format!(
            "{}/checkout/success?kind={}&session_id={{CHECKOUT_SESSION_ID}}",
            self.app_base_url.trim_end_matches('/'),
            kind
        )
    }

    /// Redirect when the customer abandons checkout
    pub fn cancel_url(&self, kind: &str) -> String {
        format!(
            "{}/checkout/cancel?kind={}",
            self.app_base_url.trim_end_matches('/'),
            kind
        )
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            currency: "brl".to_string(),
            app_base_url: "https://studio.example/".to_string(),
        }
    }

    #[test]
    fn test_redirect_urls() {
        let c = config();
        assert_eq!(
            c.success_url("plan"),
            "https://studio.example/checkout/success?kind=plan&session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            c.cancel_url("appointment"),
            "https://studio.example/checkout/cancel?kind=appointment"
        );
    }

    #[test]
    fn test_currency_mapping() {
        let mut c = config();
        assert_eq!(c.stripe_currency(), Currency::BRL);
        c.currency = "usd".to_string();
        assert_eq!(c.stripe_currency(), Currency::USD);
    }
}
