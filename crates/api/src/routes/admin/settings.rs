//! Studio settings

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Deserialize;
use studio_shared::SiteSettings;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::{normalize_email, optional_text, required_text},
    state::AppState,
};

const MINUTES_PER_DAY: i32 = 24 * 60;
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Full replacement of the settings row
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsUpdate {
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
    #[serde(default)]
    pub closed_weekdays: Vec<i32>,
    pub hold_minutes: i32,
}

/// Check the booking rules hang together
pub fn validate_settings(s: &SettingsUpdate) -> Result<(), String> {
    if s.hourly_rate_cents < 0 {
        return Err("hourly_rate_cents cannot be negative".into());
    }
    if s.currency.len() != 3 || !s.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err("currency must be a three-letter ISO code".into());
    }
    if s.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err("utc_offset_minutes is out of range".into());
    }
    if s.opening_minute < 0 || s.closing_minute > MINUTES_PER_DAY {
        return Err("Opening hours must fall within one day".into());
    }
    if s.opening_minute >= s.closing_minute {
        return Err("The studio must open before it closes".into());
    }
    if s.slot_minutes <= 0 || s.slot_minutes > MINUTES_PER_DAY {
        return Err("slot_minutes must be positive".into());
    }
    if s.min_booking_minutes <= 0 || s.min_booking_minutes > s.max_booking_minutes {
        return Err("min_booking_minutes must be positive and not above max_booking_minutes".into());
    }
    if s.min_booking_minutes % s.slot_minutes != 0 || s.max_booking_minutes % s.slot_minutes != 0 {
        return Err("Booking limits must be whole multiples of slot_minutes".into());
    }
    if s.max_booking_minutes > s.closing_minute - s.opening_minute {
        return Err("max_booking_minutes is longer than the opening hours".into());
    }
    if !(1..=365).contains(&s.booking_horizon_days) {
        return Err("booking_horizon_days must be between 1 and 365".into());
    }
    if s.cancellation_notice_hours < 0 {
        return Err("cancellation_notice_hours cannot be negative".into());
    }
    if !(5..=MINUTES_PER_DAY).contains(&s.hold_minutes) {
        return Err("hold_minutes must be between 5 and 1440".into());
    }
    if s.closed_weekdays.iter().any(|d| !(0..=6).contains(d)) {
        return Err("closed_weekdays must use 0 (Monday) to 6 (Sunday)".into());
    }
    if s.closed_weekdays.len() >= 7 && (0..=6).all(|d| s.closed_weekdays.contains(&d)) {
        return Err("The studio cannot be closed every day".into());
    }
    Ok(())
}

pub async fn get_settings(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SiteSettings>> {
    auth_user.require_admin()?;
    Ok(Json(SiteSettings::load(&state.pool).await?))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(mut req): Json<SettingsUpdate>,
) -> ApiResult<Json<SiteSettings>> {
    auth_user.require_admin()?;

    req.studio_name = required_text("Studio name", &req.studio_name, 120)?;
    req.contact_email = normalize_email(&req.contact_email)?;
    req.contact_phone = optional_text("Phone", req.contact_phone.as_deref(), 32)?;
    req.currency = req.currency.trim().to_lowercase();
    req.closed_weekdays.sort_unstable();
    req.closed_weekdays.dedup();
    validate_settings(&req).map_err(ApiError::Validation)?;

    let settings = sqlx::query_as::<_, SiteSettings>(&format!(
        r#"
        UPDATE site_settings SET
            studio_name = $1, contact_email = $2, contact_phone = $3,
            hourly_rate_cents = $4, currency = $5, utc_offset_minutes = $6,
            opening_minute = $7, closing_minute = $8, slot_minutes = $9,
            min_booking_minutes = $10, max_booking_minutes = $11,
            booking_horizon_days = $12, cancellation_notice_hours = $13,
            closed_weekdays = $14, hold_minutes = $15, updated_at = NOW()
        WHERE id = 1
        RETURNING {}
        "#,
        SiteSettings::COLUMNS
    ))
    .bind(&req.studio_name)
    .bind(&req.contact_email)
    .bind(&req.contact_phone)
    .bind(req.hourly_rate_cents)
    .bind(&req.currency)
    .bind(req.utc_offset_minutes)
    .bind(req.opening_minute)
    .bind(req.closing_minute)
    .bind(req.slot_minutes)
    .bind(req.min_booking_minutes)
    .bind(req.max_booking_minutes)
    .bind(req.booking_horizon_days)
    .bind(req.cancellation_notice_hours)
    .bind(&req.closed_weekdays)
    .bind(req.hold_minutes)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(admin_id = %auth_user.user_id, "Site settings updated");
    Ok(Json(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SettingsUpdate {
        SettingsUpdate {
            studio_name: "Casa do Som".into(),
            contact_email: "contato@casadosom.com".into(),
            contact_phone: None,
            hourly_rate_cents: 12_000,
            currency: "brl".into(),
            utc_offset_minutes: -180,
            opening_minute: 9 * 60,
            closing_minute: 22 * 60,
            slot_minutes: 30,
            min_booking_minutes: 60,
            max_booking_minutes: 480,
            booking_horizon_days: 60,
            cancellation_notice_hours: 24,
            closed_weekdays: vec![6],
            hold_minutes: 30,
        }
    }

    #[test]
    fn test_valid_settings_pass() {
        assert!(validate_settings(&valid()).is_ok());
    }

    #[test]
    fn test_opening_must_precede_closing() {
        let mut s = valid();
        s.closing_minute = s.opening_minute;
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn test_slot_must_divide_limits() {
        let mut s = valid();
        s.slot_minutes = 45;
        assert!(validate_settings(&s).is_err());

        s.slot_minutes = 60;
        assert!(validate_settings(&s).is_ok());
    }

    #[test]
    fn test_negative_rate_rejected() {
        let mut s = valid();
        s.hourly_rate_cents = -1;
        assert!(validate_settings(&s).is_err());

        s.hourly_rate_cents = 0;
        assert!(validate_settings(&s).is_ok());
    }

    #[test]
    fn test_bad_weekdays_rejected() {
        let mut s = valid();
        s.closed_weekdays = vec![7];
        assert!(validate_settings(&s).is_err());

        s.closed_weekdays = (0..=6).collect();
        assert!(validate_settings(&s).is_err());
    }
}
