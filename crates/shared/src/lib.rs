//! Studio Shared Types and Utilities
//!
//! This crate contains the domain types, pricing and scheduling rules, errors,
//! and database utilities shared by the API server, billing, and the worker.

pub mod db;
pub mod error;
pub mod pricing;
pub mod rate_limit;
pub mod schedule;
pub mod types;

pub use db::*;
pub use error::*;
pub use pricing::{booking_subtotal, format_cents, Discount, DiscountType, PricingError, Quote};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitResult, RateLimiter};
pub use schedule::{find_conflict, BookingRuleError, StudioHours, TimeRange};
pub use types::*;
