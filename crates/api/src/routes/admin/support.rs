//! Admin FAQ, user questions and chat sessions

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use studio_shared::{ChatMessage, ChatRole, ChatSession, Faq, UserQuestion};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::{
        chat::{insert_message, session_messages, SESSION_COLUMNS},
        optional_text, required_text, Pagination,
    },
    state::AppState,
};

use super::shared::db_err;

const FAQ_COLUMNS: &str =
    "id, question, answer, category, sort_order, is_published, created_at, updated_at";
const QUESTION_COLUMNS: &str =
    "id, user_id, name, email, question, answer, status, created_at, answered_at";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateFaqRequest {
    pub question: String,
    pub answer: String,
    pub category: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default = "default_published")]
    pub is_published: bool,
}

fn default_published() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateFaqRequest {
    pub question: Option<String>,
    pub answer: Option<String>,
    pub category: Option<String>,
    pub sort_order: Option<i32>,
    pub is_published: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuestionsQuery {
    /// `pending`, `answered` or `archived`
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnswerQuestionRequest {
    pub answer: String,
    /// Also publish the question and answer as an FAQ entry
    #[serde(default)]
    pub publish_as_faq: bool,
    pub faq_category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AnswerQuestionResponse {
    pub question: UserQuestion,
    pub faq: Option<Faq>,
    pub email_sent: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatsQuery {
    /// `open` or `closed`
    pub status: Option<String>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct ChatSessionSummary {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub session: ChatSession,
    pub message_count: i64,
    pub last_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatTranscript {
    pub session: ChatSession,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
pub struct StaffReplyRequest {
    pub content: String,
}

fn check_status(value: Option<&str>, allowed: &[&str]) -> ApiResult<()> {
    match value {
        Some(v) if !allowed.contains(&v) => Err(ApiError::validation(format!(
            "status must be one of: {}",
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}

async fn load_session(state: &AppState, id: Uuid) -> ApiResult<ChatSession> {
    sqlx::query_as::<_, ChatSession>(&format!(
        "SELECT {} FROM chat_sessions WHERE id = $1",
        SESSION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Chat session"))
}

// =============================================================================
// FAQ
// =============================================================================

/// All FAQ entries, drafts included
pub async fn list_faqs(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Faq>>> {
    auth_user.require_admin()?;

    let faqs = sqlx::query_as::<_, Faq>(&format!(
        "SELECT {} FROM faqs ORDER BY sort_order, created_at",
        FAQ_COLUMNS
    ))
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(faqs))
}

pub async fn create_faq(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateFaqRequest>,
) -> ApiResult<(StatusCode, Json<Faq>)> {
    auth_user.require_admin()?;

    let faq = sqlx::query_as::<_, Faq>(&format!(
        r#"
        INSERT INTO faqs (question, answer, category, sort_order, is_published)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {}
        "#,
        FAQ_COLUMNS
    ))
    .bind(required_text("Question", &req.question, 500)?)
    .bind(required_text("Answer", &req.answer, 4000)?)
    .bind(optional_text("Category", req.category.as_deref(), 80)?)
    .bind(req.sort_order)
    .bind(req.is_published)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(faq_id = %faq.id, admin_id = %auth_user.user_id, "FAQ created");
    Ok((StatusCode::CREATED, Json(faq)))
}

pub async fn update_faq(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateFaqRequest>,
) -> ApiResult<Json<Faq>> {
    auth_user.require_admin()?;

    let question = req
        .question
        .as_deref()
        .map(|q| required_text("Question", q, 500))
        .transpose()?;
    let answer = req
        .answer
        .as_deref()
        .map(|a| required_text("Answer", a, 4000))
        .transpose()?;
    let category = optional_text("Category", req.category.as_deref(), 80)?;

    let faq = sqlx::query_as::<_, Faq>(&format!(
        r#"
        UPDATE faqs SET
            question = COALESCE($2, question),
            answer = COALESCE($3, answer),
            category = COALESCE($4, category),
            sort_order = COALESCE($5, sort_order),
            is_published = COALESCE($6, is_published),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        FAQ_COLUMNS
    ))
    .bind(id)
    .bind(question)
    .bind(answer)
    .bind(category)
    .bind(req.sort_order)
    .bind(req.is_published)
    .fetch_optional(&state.pool)
    .await
    .map_err(db_err(id, "update_faq"))?
    .ok_or_else(|| ApiError::not_found("FAQ"))?;

    tracing::info!(faq_id = %id, admin_id = %auth_user.user_id, "FAQ updated");
    Ok(Json(faq))
}

pub async fn delete_faq(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    auth_user.require_admin()?;

    let result = sqlx::query("DELETE FROM faqs WHERE id = $1")
        .bind(id)
        .execute(&state.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ApiError::not_found("FAQ"));
    }

    tracing::info!(faq_id = %id, admin_id = %auth_user.user_id, "FAQ deleted");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// User questions
// =============================================================================

pub async fn list_questions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<QuestionsQuery>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<UserQuestion>>> {
    auth_user.require_admin()?;
    check_status(query.status.as_deref(), &["pending", "answered", "archived"])?;

    let questions = sqlx::query_as::<_, UserQuestion>(&format!(
        r#"
        SELECT {} FROM user_questions
        WHERE ($1::text IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
        QUESTION_COLUMNS
    ))
    .bind(query.status.as_deref())
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(questions))
}

/// Answer a question by email, optionally publishing it to the FAQ
pub async fn answer_question(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<AnswerQuestionRequest>,
) -> ApiResult<Json<AnswerQuestionResponse>> {
    auth_user.require_admin()?;
    let answer = required_text("Answer", &req.answer, 4000)?;
    let category = optional_text("Category", req.faq_category.as_deref(), 80)?;

    let mut tx = state.pool.begin().await?;

    let question = sqlx::query_as::<_, UserQuestion>(&format!(
        r#"
        UPDATE user_questions SET answer = $2, status = 'answered', answered_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        QUESTION_COLUMNS
    ))
    .bind(id)
    .bind(&answer)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| ApiError::not_found("Question"))?;

    let faq = if req.publish_as_faq {
        let faq = sqlx::query_as::<_, Faq>(&format!(
            r#"
            INSERT INTO faqs (question, answer, category, sort_order, is_published)
            VALUES ($1, $2, $3, COALESCE((SELECT MAX(sort_order) + 1 FROM faqs), 0), true)
            RETURNING {}
            "#,
            FAQ_COLUMNS
        ))
        .bind(&question.question)
        .bind(&answer)
        .bind(&category)
        .fetch_one(&mut *tx)
        .await?;
        Some(faq)
    } else {
        None
    };

    tx.commit().await?;

    let email_sent = state
        .email
        .send_question_answered(&question.email, &question.name, &question.question, &answer)
        .await;

    tracing::info!(
        question_id = %id,
        admin_id = %auth_user.user_id,
        published = faq.is_some(),
        email_sent = email_sent,
        "Question answered"
    );

    Ok(Json(AnswerQuestionResponse {
        question,
        faq,
        email_sent,
    }))
}

// =============================================================================
// Chats
// =============================================================================

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ChatsQuery>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<ChatSessionSummary>>> {
    auth_user.require_admin()?;
    check_status(query.status.as_deref(), &["open", "closed"])?;

    let chats = sqlx::query_as::<_, ChatSessionSummary>(
        r#"
        SELECT s.*,
               (SELECT COUNT(*) FROM chat_messages m WHERE m.session_id = s.id) AS message_count,
               (SELECT m.content FROM chat_messages m WHERE m.session_id = s.id
                ORDER BY m.created_at DESC LIMIT 1) AS last_message
        FROM chat_sessions s
        WHERE ($1::text IS NULL OR s.status = $1)
        ORDER BY s.updated_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(query.status.as_deref())
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(chats))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ChatTranscript>> {
    auth_user.require_admin()?;

    let session = load_session(&state, id).await?;
    let messages = session_messages(&state.pool, id).await?;
    Ok(Json(ChatTranscript { session, messages }))
}

/// Post a message from studio staff into a chat
pub async fn reply_to_chat(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<StaffReplyRequest>,
) -> ApiResult<(StatusCode, Json<ChatMessage>)> {
    auth_user.require_admin()?;
    let content = required_text("Message", &req.content, 4000)?;

    let session = load_session(&state, id).await?;
    if session.status != "open" {
        return Err(ApiError::validation("This chat session is closed"));
    }

    let message = insert_message(&state.pool, id, ChatRole::Staff, &content).await?;
    tracing::info!(chat_session_id = %id, admin_id = %auth_user.user_id, "Staff replied to chat");
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn close_chat(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ChatSession>> {
    auth_user.require_admin()?;

    let session = sqlx::query_as::<_, ChatSession>(&format!(
        "UPDATE chat_sessions SET status = 'closed', updated_at = NOW() WHERE id = $1 RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::not_found("Chat session"))?;

    tracing::info!(chat_session_id = %id, admin_id = %auth_user.user_id, "Chat closed");
    Ok(Json(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status() {
        assert!(check_status(None, &["open", "closed"]).is_ok());
        assert!(check_status(Some("open"), &["open", "closed"]).is_ok());
        assert!(check_status(Some("deleted"), &["open", "closed"]).is_err());
    }

    #[test]
    fn test_faq_defaults_to_published() {
        let req: CreateFaqRequest =
            serde_json::from_str(r#"{"question":"Parking?","answer":"Yes, two spots."}"#).unwrap();
        assert!(req.is_published);
        assert_eq!(req.sort_order, 0);
    }
}
