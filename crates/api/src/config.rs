//! Application configuration

use std::env;

use studio_billing::EmailConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,
    pub cors_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,

    // Sessions
    pub session_ttl_days: i64,
    pub session_cookie_name: String,
    pub secure_cookies: bool,
    pub admin_email: Option<String>,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_currency: String,

    // Email
    pub resend_api_key: String,
    pub email_from: String,
    pub admin_notification_email: Option<String>,

    // Assistant
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,

    // Feature flags
    pub enable_signup: bool,
    pub enable_billing: bool,
    pub enable_chat_llm: bool,
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let public_url =
            env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let stripe_secret_key = env::var("STRIPE_SECRET_KEY").unwrap_or_default();
        let stripe_webhook_secret = env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
        let enable_billing = parse_or("ENABLE_BILLING", true);
        if enable_billing && (stripe_secret_key.is_empty() || stripe_webhook_secret.is_empty()) {
            return Err(ConfigError::Missing(
                "STRIPE_SECRET_KEY and STRIPE_WEBHOOK_SECRET (or set ENABLE_BILLING=false)",
            ));
        }

        let llm_api_key = env::var("LLM_API_KEY").unwrap_or_default();
        let enable_chat_llm = parse_or("ENABLE_CHAT_LLM", !llm_api_key.is_empty());

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| vec![public_url.clone()]),
            public_url,

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 20),

            // Redis
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            // Sessions
            session_ttl_days: parse_or("SESSION_TTL_DAYS", 30).clamp(1, 365),
            session_cookie_name: env::var("SESSION_COOKIE_NAME")
                .unwrap_or_else(|_| "studio_session".to_string()),
            secure_cookies: parse_or("SECURE_COOKIES", true),
            admin_email: non_empty("ADMIN_EMAIL").map(|e| e.to_lowercase()),

            // Stripe
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_currency: env::var("STRIPE_CURRENCY")
                .unwrap_or_else(|_| "brl".to_string())
                .to_lowercase(),

            // Email
            resend_api_key: env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Studio <noreply@localhost>".to_string()),
            admin_notification_email: non_empty("ADMIN_NOTIFICATION_EMAIL"),

            // Assistant
            llm_base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            llm_api_key,
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            llm_timeout_secs: parse_or("LLM_TIMEOUT_SECS", 20),

            // Feature flags
            enable_signup: parse_or("ENABLE_SIGNUP", true),
            enable_billing,
            enable_chat_llm,
        })
    }

    /// Resend settings, with the sender and links taken from this config
    pub fn email_config(&self) -> EmailConfig {
        let mut email = EmailConfig::from_env();
        email.resend_api_key = self.resend_api_key.clone();
        email.email_from = self.email_from.clone();
        email.dashboard_url = self.public_url.clone();
        email
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "ENABLE_BILLING",
        "STRIPE_SECRET_KEY",
        "STRIPE_WEBHOOK_SECRET",
        "LLM_API_KEY",
        "ENABLE_CHAT_LLM",
        "SESSION_TTL_DAYS",
        "ADMIN_EMAIL",
        "CORS_ORIGINS",
        "PUBLIC_URL",
    ];

    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    fn setup_minimal_config() {
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("ENABLE_BILLING", "false");
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        cleanup_config();
        env::set_var("ENABLE_BILLING", "false");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_defaults() {
        setup_minimal_config();
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.session_ttl_days, 30);
        assert_eq!(config.session_cookie_name, "studio_session");
        assert!(config.secure_cookies);
        assert!(config.enable_signup);
        assert!(!config.enable_billing);
        assert!(!config.enable_chat_llm);
        assert_eq!(config.cors_origins, vec!["http://localhost:3000".to_string()]);
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_billing_requires_stripe_keys() {
        setup_minimal_config();
        env::set_var("ENABLE_BILLING", "true");
        assert!(matches!(Config::from_env(), Err(ConfigError::Missing(_))));

        env::set_var("STRIPE_SECRET_KEY", "sk_test_1");
        env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_1");
        assert!(Config::from_env().unwrap().enable_billing);
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_llm_enabled_by_api_key() {
        setup_minimal_config();
        env::set_var("LLM_API_KEY", "sk-llm");
        assert!(Config::from_env().unwrap().enable_chat_llm);

        env::set_var("ENABLE_CHAT_LLM", "false");
        assert!(!Config::from_env().unwrap().enable_chat_llm);
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_parsing_and_normalization() {
        setup_minimal_config();
        env::set_var("SESSION_TTL_DAYS", "9999");
        env::set_var("ADMIN_EMAIL", " Owner@Studio.COM ");
        env::set_var("CORS_ORIGINS", "https://a.test, https://b.test,");
        let config = Config::from_env().unwrap();
        assert_eq!(config.session_ttl_days, 365);
        assert_eq!(config.admin_email.as_deref(), Some("owner@studio.com"));
        assert_eq!(config.cors_origins.len(), 2);
        cleanup_config();
    }
}
