//! Public catalog routes: studio settings, availability, plans, FAQ and the
//! contact form

use axum::{
    extract::{Extension, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use studio_shared::{
    Appointment, BlockedTimeSlot, Faq, Plan, RateLimitConfig, SiteSettings, TimeRange, UserQuestion,
};
use time::{macros::format_description, Date, OffsetDateTime};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

use super::{enforce_rate_limit, extract_client_ip, normalize_email, required_text};

const PUBLIC_CACHE: &str = "public, max-age=60";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PublicSettings {
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
}

impl From<SiteSettings> for PublicSettings {
    fn from(s: SiteSettings) -> Self {
        Self {
            studio_name: s.studio_name,
            contact_email: s.contact_email,
            contact_phone: s.contact_phone,
            hourly_rate_cents: s.hourly_rate_cents,
            currency: s.currency,
            utc_offset_minutes: s.utc_offset_minutes,
            opening_minute: s.opening_minute,
            closing_minute: s.closing_minute,
            slot_minutes: s.slot_minutes,
            min_booking_minutes: s.min_booking_minutes,
            max_booking_minutes: s.max_booking_minutes,
            booking_horizon_days: s.booking_horizon_days,
            cancellation_notice_hours: s.cancellation_notice_hours,
            closed_weekdays: s.closed_weekdays,
            hold_minutes: s.hold_minutes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    /// Local date, `YYYY-MM-DD`; today in the studio's timezone when absent
    pub date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub date: String,
    pub slot_minutes: i32,
    pub hourly_rate_cents: i64,
    pub slots: Vec<TimeRange>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitQuestionRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub question: String,
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn parse_local_date(value: &str) -> ApiResult<Date> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|_| ApiError::validation("date must be formatted as YYYY-MM-DD"))
}

/// Ranges that block new bookings within `window`: active appointments and
/// admin-blocked time
pub(crate) async fn busy_ranges(pool: &PgPool, window: &TimeRange) -> ApiResult<Vec<TimeRange>> {
    let appointments = sqlx::query_as::<_, Appointment>(&format!(
        r#"
        SELECT {} FROM appointments
        WHERE status IN ('pending', 'confirmed')
          AND starts_at < $2 AND ends_at > $1
        "#,
        Appointment::COLUMNS
    ))
    .bind(window.start)
    .bind(window.end)
    .fetch_all(pool)
    .await?;

    let blocked = sqlx::query_as::<_, BlockedTimeSlot>(
        r#"
        SELECT id, starts_at, ends_at, reason, created_by, created_at
        FROM blocked_time_slots
        WHERE starts_at < $2 AND ends_at > $1
        "#,
    )
    .bind(window.start)
    .bind(window.end)
    .fetch_all(pool)
    .await?;

    Ok(appointments
        .iter()
        .map(Appointment::range)
        .chain(blocked.iter().map(BlockedTimeSlot::range))
        .collect())
}

// =============================================================================
// Handlers
// =============================================================================

/// Studio identity, hours and pricing
pub async fn public_settings(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let settings = SiteSettings::load(&state.pool).await?;
    Ok((
        [(header::CACHE_CONTROL, PUBLIC_CACHE)],
        Json(PublicSettings::from(settings)),
    ))
}

/// Free slots for one local date
pub async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<Json<AvailabilityResponse>> {
    let settings = SiteSettings::load(&state.pool).await?;
    let hours = settings.studio_hours();
    let now = OffsetDateTime::now_utc();

    let date = match query.date.as_deref() {
        Some(value) => parse_local_date(value)?,
        None => hours.local_date(now),
    };

    let day = hours.local_day(date);
    let busy = busy_ranges(&state.pool, &day).await?;
    let slots = hours.day_slots(date, &busy, now);

    Ok(Json(AvailabilityResponse {
        date: format!(
            "{:04}-{:02}-{:02}",
            date.year(),
            u8::from(date.month()),
            date.day()
        ),
        slot_minutes: settings.slot_minutes,
        hourly_rate_cents: settings.hourly_rate_cents,
        slots,
    }))
}

/// Active plan catalog
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let plans: Vec<Plan> = state.billing.plans.list_active().await?;
    Ok(([(header::CACHE_CONTROL, PUBLIC_CACHE)], Json(plans)))
}

/// Published FAQs in display order
pub async fn list_faqs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let faqs = published_faqs(&state.pool).await?;
    Ok(([(header::CACHE_CONTROL, PUBLIC_CACHE)], Json(faqs)))
}

pub(crate) async fn published_faqs(pool: &PgPool) -> Result<Vec<Faq>, sqlx::Error> {
    sqlx::query_as::<_, Faq>(
        r#"
        SELECT id, question, answer, category, sort_order, is_published, created_at, updated_at
        FROM faqs
        WHERE is_published = true
        ORDER BY sort_order, created_at
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Contact form; signed-in users may omit name and email
pub async fn submit_question(
    State(state): State<AppState>,
    Extension(auth_user): Extension<Option<AuthUser>>,
    headers: HeaderMap,
    Json(req): Json<SubmitQuestionRequest>,
) -> ApiResult<(StatusCode, Json<UserQuestion>)> {
    let subject = match (&auth_user, extract_client_ip(&headers)) {
        (Some(user), _) => user.user_id.to_string(),
        (None, Some(ip)) => ip,
        (None, None) => "anonymous".to_string(),
    };
    enforce_rate_limit(&state, "question", &subject, RateLimitConfig::QUESTION).await?;

    let name = match (req.name.as_deref(), &auth_user) {
        (Some(name), _) if !name.trim().is_empty() => required_text("Name", name, 120)?,
        (_, Some(user)) => user.name.clone(),
        _ => return Err(ApiError::validation("Name is required")),
    };
    let email = match (req.email.as_deref(), &auth_user) {
        (Some(email), _) if !email.trim().is_empty() => normalize_email(email)?,
        (_, Some(user)) => user.email.clone(),
        _ => return Err(ApiError::validation("A valid email address is required")),
    };
    let question = required_text("Question", &req.question, 4000)?;

    let record = sqlx::query_as::<_, UserQuestion>(
        r#"
        INSERT INTO user_questions (user_id, name, email, question)
        VALUES ($1, $2, $3, $4)
        RETURNING id, user_id, name, email, question, answer, status, created_at, answered_at
        "#,
    )
    .bind(auth_user.as_ref().map(|u| u.user_id))
    .bind(&name)
    .bind(&email)
    .bind(&question)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(question_id = %record.id, "Question submitted");

    let email_service = state.email.clone();
    tokio::spawn(async move {
        email_service
            .send_new_question_to_admin(&name, &email, &question)
            .await;
    });

    Ok((StatusCode::CREATED, Json(record)))
}
