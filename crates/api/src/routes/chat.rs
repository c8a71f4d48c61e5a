//! Visitor chat with the studio assistant
//!
//! Sessions opened while signed in belong to that user and only they may
//! read them. Anonymous sessions are addressed by their id alone.

use axum::{
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use studio_shared::{format_cents, ChatMessage, ChatRole, ChatSession, RateLimitConfig, SiteSettings};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    chat::{KnowledgeBase, ReplySource, StudioContext},
    error::{ApiError, ApiResult},
    state::AppState,
};

use super::{enforce_rate_limit, extract_client_ip, normalize_email, optional_text, public::published_faqs, required_text};

/// Prior messages handed to the assistant
const HISTORY_LIMIT: usize = 20;
const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub visitor_name: Option<String>,
    pub visitor_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: ChatMessage,
    pub reply: ChatMessage,
    pub source: ReplySource,
}

pub(crate) const SESSION_COLUMNS: &str =
    "id, user_id, visitor_name, visitor_email, status, created_at, updated_at";

fn clock(minute: i32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Hours, rate and closed days as prompt lines
pub(crate) fn live_facts(settings: &SiteSettings) -> String {
    let mut facts = vec![
        format!(
            "Opening hours: {} to {}",
            clock(settings.opening_minute),
            clock(settings.closing_minute)
        ),
        format!(
            "Hourly rate: {} {}",
            settings.currency.to_uppercase(),
            format_cents(settings.hourly_rate_cents)
        ),
        format!(
            "Bookings from {} to {} minutes, in {}-minute steps, up to {} days ahead",
            settings.min_booking_minutes,
            settings.max_booking_minutes,
            settings.slot_minutes,
            settings.booking_horizon_days
        ),
        format!(
            "Cancellations need at least {} hours notice",
            settings.cancellation_notice_hours
        ),
    ];

    let closed: Vec<&str> = settings
        .closed_weekdays
        .iter()
        .filter_map(|d| usize::try_from(*d).ok().and_then(|d| WEEKDAYS.get(d)).copied())
        .collect();
    if !closed.is_empty() {
        facts.push(format!("Closed on: {}", closed.join(", ")));
    }

    facts.join("\n")
}

/// Load a session the caller may access
async fn accessible_session(
    pool: &PgPool,
    session_id: Uuid,
    auth_user: Option<&AuthUser>,
) -> ApiResult<ChatSession> {
    let session = sqlx::query_as::<_, ChatSession>(&format!(
        "SELECT {} FROM chat_sessions WHERE id = $1",
        SESSION_COLUMNS
    ))
    .bind(session_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Chat session"))?;

    match session.user_id {
        // Answer 404 rather than 403 so ids of other users' chats are not confirmed
        Some(owner) if auth_user.map(|u| u.user_id) != Some(owner) => {
            Err(ApiError::not_found("Chat session"))
        }
        _ => Ok(session),
    }
}

pub(crate) async fn session_messages(
    pool: &PgPool,
    session_id: Uuid,
) -> Result<Vec<ChatMessage>, sqlx::Error> {
    sqlx::query_as::<_, ChatMessage>(
        r#"
        SELECT id, session_id, role, content, created_at
        FROM chat_messages
        WHERE session_id = $1
        ORDER BY created_at, id
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
}

pub(crate) async fn insert_message(
    pool: &PgPool,
    session_id: Uuid,
    role: ChatRole,
    content: &str,
) -> Result<ChatMessage, sqlx::Error> {
    let message = sqlx::query_as::<_, ChatMessage>(
        r#"
        INSERT INTO chat_messages (session_id, role, content)
        VALUES ($1, $2, $3)
        RETURNING id, session_id, role, content, created_at
        "#,
    )
    .bind(session_id)
    .bind(role.as_str())
    .bind(content)
    .fetch_one(pool)
    .await?;

    sqlx::query("UPDATE chat_sessions SET updated_at = NOW() WHERE id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;

    Ok(message)
}

/// Open a chat session
pub async fn create_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<Option<AuthUser>>,
    body: Option<Json<CreateSessionRequest>>,
) -> ApiResult<(StatusCode, Json<ChatSession>)> {
    let req = body.map(|Json(b)| b).unwrap_or_default();

    let (visitor_name, visitor_email) = match &auth_user {
        Some(user) => (Some(user.name.clone()), Some(user.email.clone())),
        None => {
            let name = optional_text("Name", req.visitor_name.as_deref(), 120)?;
            let email = match req.visitor_email.as_deref().map(str::trim) {
                Some(email) if !email.is_empty() => Some(normalize_email(email)?),
                _ => None,
            };
            (name, email)
        }
    };

    let session = sqlx::query_as::<_, ChatSession>(&format!(
        r#"
        INSERT INTO chat_sessions (user_id, visitor_name, visitor_email)
        VALUES ($1, $2, $3)
        RETURNING {}
        "#,
        SESSION_COLUMNS
    ))
    .bind(auth_user.as_ref().map(|u| u.user_id))
    .bind(&visitor_name)
    .bind(&visitor_email)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        chat_session_id = %session.id,
        authenticated = auth_user.is_some(),
        "Chat session opened"
    );

    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(auth_user): Extension<Option<AuthUser>>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    let session = accessible_session(&state.pool, session_id, auth_user.as_ref()).await?;
    Ok(Json(session_messages(&state.pool, session.id).await?))
}

/// Post a visitor message and get the assistant's answer
pub async fn send_message(
    State(state): State<AppState>,
    Extension(auth_user): Extension<Option<AuthUser>>,
    headers: HeaderMap,
    Path(session_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Json<SendMessageResponse>> {
    let session = accessible_session(&state.pool, session_id, auth_user.as_ref()).await?;
    if session.status != "open" {
        return Err(ApiError::validation("This chat session is closed"));
    }

    let subject = extract_client_ip(&headers).unwrap_or_else(|| session.id.to_string());
    enforce_rate_limit(&state, "chat_message", &subject, RateLimitConfig::CHAT_MESSAGE).await?;

    let content = required_text("Message", &req.content, 2000)?;

    let mut history = session_messages(&state.pool, session.id).await?;
    let skip = history.len().saturating_sub(HISTORY_LIMIT);
    history.drain(..skip);

    let message = insert_message(&state.pool, session.id, ChatRole::User, &content).await?;

    let settings = SiteSettings::load(&state.pool).await?;
    let faqs = published_faqs(&state.pool).await?;
    let knowledge = KnowledgeBase::with_faqs(&faqs);
    let facts = live_facts(&settings);
    let studio = StudioContext {
        studio_name: &settings.studio_name,
        contact_email: &settings.contact_email,
        contact_phone: settings.contact_phone.as_deref(),
        live_facts: &facts,
    };

    let answer = state
        .assistant
        .reply(&studio, &history, &content, &knowledge)
        .await;
    let reply = insert_message(&state.pool, session.id, ChatRole::Assistant, &answer.content).await?;

    tracing::info!(
        chat_session_id = %session.id,
        source = ?answer.source,
        "Assistant replied"
    );

    Ok(Json(SendMessageResponse {
        message,
        reply,
        source: answer.source,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn settings() -> SiteSettings {
        SiteSettings {
            studio_name: "Casa do Som".to_string(),
            contact_email: "contato@casadosom.com".to_string(),
            contact_phone: None,
            hourly_rate_cents: 12_000,
            currency: "brl".to_string(),
            utc_offset_minutes: -180,
            opening_minute: 9 * 60,
            closing_minute: 22 * 60 + 30,
            slot_minutes: 30,
            min_booking_minutes: 60,
            max_booking_minutes: 480,
            booking_horizon_days: 60,
            cancellation_notice_hours: 24,
            closed_weekdays: vec![6],
            hold_minutes: 30,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_live_facts() {
        let facts = live_facts(&settings());
        assert!(facts.contains("Opening hours: 09:00 to 22:30"));
        assert!(facts.contains("BRL 120.00"));
        assert!(facts.contains("Closed on: Sunday"));
        assert!(facts.contains("24 hours notice"));
    }

    #[test]
    fn test_live_facts_ignores_bad_weekdays() {
        let mut s = settings();
        s.closed_weekdays = vec![-1, 9];
        assert!(!live_facts(&s).contains("Closed on"));
    }
}
