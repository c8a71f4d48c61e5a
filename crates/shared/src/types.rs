//! Common types used across the studio platform
//!
//! Status columns are stored as TEXT. Row structs keep the raw string (as it
//! comes out of Postgres) and expose typed accessors through the enums below.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::pricing::{Discount, DiscountType};
use crate::schedule::{StudioHours, TimeRange};

// =============================================================================
// Enums
// =============================================================================

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    Customer,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Admin => "admin",
        }
    }

    /// Parse a role from string (case insensitive), unknown roles are customers
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => Self::Admin,
            _ => Self::Customer,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// Kind of studio session being booked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Recording,
    Mixing,
    Mastering,
    Rehearsal,
    Podcast,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Mixing => "mixing",
            Self::Mastering => "mastering",
            Self::Rehearsal => "rehearsal",
            Self::Podcast => "podcast",
        }
    }

    /// Human readable label used in emails
    pub fn label(&self) -> &'static str {
        match self {
            Self::Recording => "Recording session",
            Self::Mixing => "Mixing session",
            Self::Mastering => "Mastering session",
            Self::Rehearsal => "Rehearsal",
            Self::Podcast => "Podcast recording",
        }
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "recording" => Ok(Self::Recording),
            "mixing" => Ok(Self::Mixing),
            "mastering" => Ok(Self::Mastering),
            "rehearsal" => Ok(Self::Rehearsal),
            "podcast" => Ok(Self::Podcast),
            _ => Err(format!("Invalid service: {}", s)),
        }
    }
}

/// Cancellation reason for a pending hold that was never paid; a late
/// payment may still confirm these
pub const HOLD_EXPIRED_REASON: &str = "Payment hold expired";

/// Appointment lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    /// Holding the slot until paid or expired
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// Whether the appointment still occupies its time range
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Allowed admin transitions
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Pending, Self::Cancelled)
                | (Self::Confirmed, Self::Cancelled)
                | (Self::Confirmed, Self::Completed)
        )
    }
}

impl std::str::FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid appointment status: {}", s)),
        }
    }
}

/// Payment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            _ => Err(format!("Invalid payment status: {}", s)),
        }
    }
}

/// What a payment or checkout is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseKind {
    Appointment,
    Plan,
}

impl PurchaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Appointment => "appointment",
            Self::Plan => "plan",
        }
    }
}

impl std::str::FromStr for PurchaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "appointment" => Ok(Self::Appointment),
            "plan" => Ok(Self::Plan),
            _ => Err(format!("Invalid purchase kind: {}", s)),
        }
    }
}

/// Plan billing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanBilling {
    OneTime,
    Monthly,
}

impl PlanBilling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "one_time",
            Self::Monthly => "monthly",
        }
    }
}

impl std::str::FromStr for PlanBilling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_time" => Ok(Self::OneTime),
            "monthly" => Ok(Self::Monthly),
            _ => Err(format!("Invalid plan billing: {}", s)),
        }
    }
}

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    Staff,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Staff => "staff",
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// User model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn role(&self) -> UserRole {
        UserRole::from_str_lossy(&self.role)
    }
}

/// Singleton studio configuration editable from the admin dashboard
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SiteSettings {
    pub studio_name: String,
    pub contact_email: String,
    pub contact_phone: Option<String>,
    pub hourly_rate_cents: i64,
    pub currency: String,
    pub utc_offset_minutes: i32,
    pub opening_minute: i32,
    pub closing_minute: i32,
    pub slot_minutes: i32,
    pub min_booking_minutes: i32,
    pub max_booking_minutes: i32,
    pub booking_horizon_days: i32,
    pub cancellation_notice_hours: i32,
    pub closed_weekdays: Vec<i32>,
    pub hold_minutes: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SiteSettings {
    pub const COLUMNS: &'static str = "studio_name, contact_email, contact_phone, hourly_rate_cents, \
        currency, utc_offset_minutes, opening_minute, closing_minute, slot_minutes, \
        min_booking_minutes, max_booking_minutes, booking_horizon_days, \
        cancellation_notice_hours, closed_weekdays, hold_minutes, updated_at";

    /// Load the singleton row
    pub async fn load(pool: &sqlx::PgPool) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, SiteSettings>(&format!(
            "SELECT {} FROM site_settings WHERE id = 1",
            Self::COLUMNS
        ))
        .fetch_one(pool)
        .await
    }

    /// Opening hours and booking rules derived from these settings
    pub fn studio_hours(&self) -> StudioHours {
        StudioHours::from_settings(self)
    }
}

/// Appointment row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Appointment {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub service: String,
    pub notes: Option<String>,
    pub status: String,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub total_cents: i64,
    pub coupon_id: Option<Uuid>,
    pub user_plan_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub reminder_sent_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Appointment {
    pub const COLUMNS: &'static str = "id, user_id, starts_at, ends_at, service, notes, status, \
        subtotal_cents, discount_cents, total_cents, coupon_id, user_plan_id, reminder_sent_at, \
        cancelled_at, cancellation_reason, created_at, updated_at";

    /// Unknown stored statuses are treated as cancelled so they never hold a slot
    pub fn status(&self) -> AppointmentStatus {
        self.status.parse().unwrap_or(AppointmentStatus::Cancelled)
    }

    pub fn service_kind(&self) -> Option<ServiceKind> {
        self.service.parse().ok()
    }

    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.starts_at,
            end: self.ends_at,
        }
    }
}

/// Coupon row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CouponRecord {
    pub id: Uuid,
    pub code: String,
    pub discount_type: String,
    pub value: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub used: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub used_at: Option<OffsetDateTime>,
    pub user_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub user_plan_id: Option<Uuid>,
    pub min_amount_cents: Option<i64>,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Why a coupon cannot be redeemed
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CouponRejection {
    #[error("coupon is inactive")]
    Inactive,
    #[error("coupon has expired")]
    Expired,
    #[error("coupon has already been used")]
    AlreadyUsed,
    #[error("coupon belongs to another customer")]
    NotOwner,
    #[error("order amount is below the coupon minimum")]
    BelowMinimum,
    #[error("coupon has an invalid discount")]
    Invalid,
}

impl CouponRejection {
    /// Message shown to customers
    pub fn message(&self) -> &'static str {
        match self {
            Self::Inactive | Self::Invalid => "This coupon is not valid.",
            Self::Expired => "This coupon has expired.",
            Self::AlreadyUsed => "This coupon has already been used.",
            Self::NotOwner => "This coupon is not available for your account.",
            Self::BelowMinimum => "The booking amount is below this coupon's minimum.",
        }
    }
}

impl CouponRecord {
    pub const COLUMNS: &'static str = "id, code, discount_type, value, expires_at, is_active, used, \
        used_at, user_id, appointment_id, user_plan_id, min_amount_cents, description, created_at";

    /// The discount this coupon carries, if the stored values are valid
    pub fn discount(&self) -> Option<Discount> {
        let kind = DiscountType::parse(&self.discount_type)?;
        Discount::new(kind, self.value).ok()
    }

    /// Check whether `user_id` may redeem this coupon against `subtotal_cents`
    pub fn check_redeemable(
        &self,
        user_id: Uuid,
        subtotal_cents: i64,
        now: OffsetDateTime,
    ) -> Result<Discount, CouponRejection> {
        if !self.is_active {
            return Err(CouponRejection::Inactive);
        }
        if matches!(self.expires_at, Some(expires_at) if expires_at <= now) {
            return Err(CouponRejection::Expired);
        }
        if self.used {
            return Err(CouponRejection::AlreadyUsed);
        }
        if matches!(self.user_id, Some(owner) if owner != user_id) {
            return Err(CouponRejection::NotOwner);
        }
        if matches!(self.min_amount_cents, Some(min) if subtotal_cents < min) {
            return Err(CouponRejection::BelowMinimum);
        }
        self.discount().ok_or(CouponRejection::Invalid)
    }
}

/// Plan catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub billing: String,
    #[serde(skip_serializing)]
    pub stripe_price_id: Option<String>,
    pub coupon_count: i32,
    pub coupon_discount_type: String,
    pub coupon_value: i64,
    pub validity_days: i32,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Plan {
    pub const COLUMNS: &'static str = "id, slug, name, description, price_cents, billing, \
        stripe_price_id, coupon_count, coupon_discount_type, coupon_value, validity_days, \
        is_active, created_at, updated_at";

    pub fn billing(&self) -> PlanBilling {
        self.billing.parse().unwrap_or(PlanBilling::OneTime)
    }
}

/// A plan owned by a customer
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserPlan {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub subscription_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UserPlan {
    pub const COLUMNS: &'static str =
        "id, user_id, plan_id, status, starts_at, expires_at, subscription_id, created_at";
}

/// Recurring plan subscription mirrored from Stripe
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Payment row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub user_plan_id: Option<Uuid>,
    pub provider: String,
    pub provider_reference: Option<String>,
    #[serde(skip_serializing)]
    pub provider_payment_intent: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub refunded_at: Option<OffsetDateTime>,
}

impl Payment {
    pub const COLUMNS: &'static str = "id, user_id, appointment_id, user_plan_id, provider, \
        provider_reference, provider_payment_intent, amount_cents, currency, status, kind, \
        created_at, paid_at, refunded_at";

    pub fn status(&self) -> Option<PaymentStatus> {
        self.status.parse().ok()
    }
}

/// Checkout waiting for the provider callback
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingCheckout {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub appointment_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub coupon_id: Option<Uuid>,
    pub amount_cents: i64,
    pub provider_session_id: Option<String>,
    pub status: String,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl PendingCheckout {
    pub const COLUMNS: &'static str = "id, user_id, kind, appointment_id, plan_id, coupon_id, \
        amount_cents, provider_session_id, status, metadata, created_at, completed_at";
}

/// Time an admin closed for bookings
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BlockedTimeSlot {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub reason: Option<String>,
    pub created_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl BlockedTimeSlot {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.starts_at,
            end: self.ends_at,
        }
    }
}

/// FAQ entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Faq {
    pub id: Uuid,
    pub question: String,
    pub answer: String,
    pub category: Option<String>,
    pub sort_order: i32,
    pub is_published: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Question submitted through the contact form
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserQuestion {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub email: String,
    pub question: String,
    pub answer: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub answered_at: Option<OffsetDateTime>,
}

/// Assistant chat conversation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Single chat message
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
