//! Redis-backed fixed window rate limiting
//!
//! Callers treat `Err` as "allow": a Redis outage must not lock customers out
//! of booking or chat.

use redis::aio::ConnectionManager;
use serde::Serialize;

/// Limit for one kind of action
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window_seconds: u64,
}

impl RateLimitConfig {
    /// Login attempts per IP
    pub const LOGIN: Self = Self {
        max_requests: 10,
        window_seconds: 15 * 60,
    };
    /// Messages per chat session
    pub const CHAT_MESSAGE: Self = Self {
        max_requests: 20,
        window_seconds: 60,
    };
    /// Contact form questions per IP
    pub const QUESTION: Self = Self {
        max_requests: 5,
        window_seconds: 60 * 60,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    /// Evaluate a window counter after it was incremented to `count`
    pub fn from_count(count: u64, ttl_seconds: i64, config: RateLimitConfig) -> Self {
        if count <= config.max_requests {
            Self {
                allowed: true,
                remaining: config.max_requests - count,
                retry_after_seconds: None,
            }
        } else {
            let retry = if ttl_seconds > 0 {
                ttl_seconds as u64
            } else {
                config.window_seconds
            };
            Self {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(retry),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limiter unavailable")]
    Unavailable,
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Fixed window limiter keyed by action and subject
#[derive(Clone)]
pub struct RateLimiter {
    redis: Option<ConnectionManager>,
    prefix: String,
}

impl RateLimiter {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            redis,
            prefix: "studio:rl".to_string(),
        }
    }

    /// Connect to Redis; a failed connection yields a limiter that always errors
    pub async fn connect(redis_url: &str) -> Self {
        let manager = match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(manager) => Some(manager),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable, rate limiting disabled");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Invalid Redis URL, rate limiting disabled");
                None
            }
        };
        Self::new(manager)
    }

    fn key(&self, action: &str, subject: &str) -> String {
        format!("{}:{}:{}", self.prefix, action, subject)
    }

    /// Count one request for `subject` and report whether it is allowed
    pub async fn check(
        &self,
        action: &str,
        subject: &str,
        config: RateLimitConfig,
    ) -> Result<RateLimitResult, RateLimitError> {
        let mut conn = self.redis.clone().ok_or(RateLimitError::Unavailable)?;
        let key = self.key(action, subject);

        let (count, ttl): (u64, i64) = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .ttl(&key)
            .query_async(&mut conn)
            .await?;

        if ttl < 0 {
            // First hit in this window
            let _: () = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(config.window_seconds)
                .query_async(&mut conn)
                .await?;
        }

        Ok(RateLimitResult::from_count(count, ttl, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_limit() {
        let r = RateLimitResult::from_count(3, 500, RateLimitConfig::LOGIN);
        assert!(r.allowed);
        assert_eq!(r.remaining, 7);
        assert_eq!(r.retry_after_seconds, None);
    }

    #[test]
    fn test_over_limit_uses_ttl() {
        let r = RateLimitResult::from_count(11, 120, RateLimitConfig::LOGIN);
        assert!(!r.allowed);
        assert_eq!(r.retry_after_seconds, Some(120));
    }

    #[test]
    fn test_over_limit_without_ttl_uses_window() {
        let r = RateLimitResult::from_count(21, -1, RateLimitConfig::CHAT_MESSAGE);
        assert_eq!(r.retry_after_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_missing_redis_is_unavailable() {
        let limiter = RateLimiter::new(None);
        let result = limiter
            .check("login", "127.0.0.1", RateLimitConfig::LOGIN)
            .await;
        assert!(matches!(result, Err(RateLimitError::Unavailable)));
    }
}
