//! Admin account search and roles

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use studio_shared::{User, UserRole};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::Pagination,
    state::AppState,
};

use super::shared::db_err;

#[derive(Debug, Default, Deserialize)]
pub struct ListUsersQuery {
    /// Matches email, name or phone
    pub q: Option<String>,
    pub role: Option<UserRole>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct AdminUserSummary {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub role: String,
    pub appointment_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: UserRole,
}

/// Escape LIKE wildcards in user input
fn like_pattern(q: &str) -> String {
    let escaped = q
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListUsersQuery>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<AdminUserSummary>>> {
    auth_user.require_admin()?;

    let pattern = query
        .q
        .as_deref()
        .filter(|q| !q.trim().is_empty())
        .map(like_pattern);

    let users = sqlx::query_as::<_, AdminUserSummary>(
        r#"
        SELECT u.id, u.email, u.name, u.phone, u.role, u.created_at,
               (SELECT COUNT(*) FROM appointments a WHERE a.user_id = u.id) AS appointment_count
        FROM users u
        WHERE ($1::text IS NULL OR u.email ILIKE $1 OR u.name ILIKE $1 OR u.phone ILIKE $1)
          AND ($2::text IS NULL OR u.role = $2)
        ORDER BY u.created_at DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(pattern)
    .bind(query.role.map(|r| r.as_str()))
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(users))
}

/// Change a user's role; admins cannot demote themselves
pub async fn update_role(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRoleRequest>,
) -> ApiResult<Json<User>> {
    auth_user.require_admin()?;

    if id == auth_user.user_id && req.role != UserRole::Admin {
        return Err(ApiError::validation("You cannot remove your own admin role"));
    }

    let user = sqlx::query_as::<_, User>(
        r#"
        UPDATE users SET role = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING id, email, name, phone, password_hash, role, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(req.role.as_str())
    .fetch_optional(&state.pool)
    .await
    .map_err(db_err(id, "update_user_role"))?
    .ok_or_else(|| ApiError::not_found("User"))?;

    // Demoted admins are signed out everywhere
    let revoked = if req.role.is_admin() {
        0
    } else {
        state.sessions.revoke_all(id, None).await?
    };

    tracing::info!(
        user_id = %id,
        admin_id = %auth_user.user_id,
        role = req.role.as_str(),
        sessions_revoked = revoked,
        "User role changed"
    );

    Ok(Json(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" ana "), "%ana%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }
}
