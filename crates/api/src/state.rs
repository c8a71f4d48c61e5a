//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use studio_billing::{BillingEmailService, BillingService, StripeClient, StripeConfig};
use studio_shared::RateLimiter;

use crate::auth::{AuthState, SessionManager};
use crate::chat::{ChatAssistant, LlmClient, LlmConfig};
use crate::config::Config;
use crate::email::StudioEmailService;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub sessions: SessionManager,
    pub email: StudioEmailService,
    pub billing: BillingService,
    pub rate_limiter: RateLimiter,
    pub assistant: ChatAssistant,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, rate_limiter: RateLimiter) -> anyhow::Result<Self> {
        let email_config = config.email_config();

        let stripe = if config.enable_billing {
            Some(StripeClient::new(StripeConfig {
                secret_key: config.stripe_secret_key.clone(),
                webhook_secret: config.stripe_webhook_secret.clone(),
                currency: config.stripe_currency.clone(),
                app_base_url: config.public_url.clone(),
            }))
        } else {
            tracing::warn!("Billing disabled: checkout and webhooks will answer 503");
            None
        };

        let billing = BillingService::new(
            pool.clone(),
            stripe,
            BillingEmailService::new(email_config.clone()),
        );

        let llm = LlmClient::new(LlmConfig {
            base_url: config.llm_base_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            timeout: Duration::from_secs(config.llm_timeout_secs.max(1)),
            enabled: config.enable_chat_llm,
        })?;

        Ok(Self {
            sessions: SessionManager::new(pool.clone(), config.session_ttl_days),
            email: StudioEmailService::new(email_config, config.admin_notification_email.clone()),
            assistant: ChatAssistant::new(llm),
            billing,
            rate_limiter,
            config: Arc::new(config),
            pool,
        })
    }

    /// State for the auth middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            sessions: self.sessions.clone(),
            cookie_name: self.config.session_cookie_name.clone(),
        }
    }
}
