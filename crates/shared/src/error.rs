//! Error types for the studio platform

use thiserror::Error;

use crate::pricing::PricingError;
use crate::schedule::BookingRuleError;
use crate::types::CouponRejection;

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Booking rule violated: {0}")]
    Booking(#[from] BookingRuleError),

    #[error("Coupon rejected: {0}")]
    Coupon(#[from] CouponRejection),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
