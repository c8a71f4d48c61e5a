//! Cookie sessions
//!
//! The raw token only ever lives in the client's cookie; the database keeps
//! its SHA-256 so a leaked table cannot be replayed.

use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};
use studio_shared::UserRole;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Skip the `last_seen_at` write when the session was touched this recently
const TOUCH_INTERVAL: Duration = Duration::minutes(5);

/// The user behind a valid session
#[derive(Debug, Clone, FromRow)]
pub struct SessionUser {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    pub expires_at: OffsetDateTime,
    pub last_seen_at: OffsetDateTime,
}

impl SessionUser {
    pub fn role(&self) -> UserRole {
        UserRole::from_str_lossy(&self.role)
    }
}

/// Creates and resolves login sessions
#[derive(Clone)]
pub struct SessionManager {
    pool: PgPool,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(pool: PgPool, ttl_days: i64) -> Self {
        Self {
            pool,
            ttl: Duration::days(ttl_days),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 32 random bytes, hex-encoded (64 characters)
    fn generate_token() -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let bytes: [u8; 32] = rng.gen();
        hex::encode(bytes)
    }

    pub(crate) fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Open a session for `user_id`; returns the raw token for the cookie
    pub async fn create(
        &self,
        user_id: Uuid,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<String, sqlx::Error> {
        let raw_token = Self::generate_token();
        let expires_at = OffsetDateTime::now_utc() + self.ttl;

        sqlx::query(
            r#"
            INSERT INTO sessions (user_id, token_hash, expires_at, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id)
        .bind(Self::hash_token(&raw_token))
        .bind(expires_at)
        .bind(ip_address)
        .bind(user_agent.map(|ua| ua.chars().take(512).collect::<String>()))
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, expires_at = %expires_at, "Session created");

        Ok(raw_token)
    }

    /// Resolve a raw token to its user; expired or unknown tokens yield `None`
    pub async fn lookup(&self, raw_token: &str) -> Result<Option<SessionUser>, sqlx::Error> {
        // Anything that is not our 64-char hex cannot match, skip the query
        if raw_token.len() != 64 || !raw_token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(None);
        }

        let session = sqlx::query_as::<_, SessionUser>(
            r#"
            SELECT s.id AS session_id, u.id AS user_id, u.email, u.name, u.role,
                   s.expires_at, s.last_seen_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = $1 AND s.expires_at > NOW()
            "#,
        )
        .bind(Self::hash_token(raw_token))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(session) = &session {
            if OffsetDateTime::now_utc() - session.last_seen_at > TOUCH_INTERVAL {
                sqlx::query("UPDATE sessions SET last_seen_at = NOW() WHERE id = $1")
                    .bind(session.session_id)
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(session)
    }

    /// End the session holding `raw_token`
    pub async fn revoke(&self, raw_token: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(Self::hash_token(raw_token))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// End every session of a user, optionally keeping one
    pub async fn revoke_all(
        &self,
        user_id: Uuid,
        keep_session: Option<Uuid>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE user_id = $1 AND ($2::uuid IS NULL OR id <> $2)",
        )
        .bind(user_id)
        .bind(keep_session)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            revoked = result.rows_affected(),
            "User sessions revoked"
        );

        Ok(result.rows_affected())
    }

    /// Delete expired sessions (run periodically via background job)
    pub async fn purge_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
            .execute(pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(count = deleted, "Cleaned up expired sessions");
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use serial_test::serial;

    #[test]
    fn test_token_generation() {
        let token1 = SessionManager::generate_token();
        let token2 = SessionManager::generate_token();

        assert_eq!(token1.len(), 64);
        assert_ne!(token1, token2);
        assert!(token1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_token_hashing() {
        let hash1 = SessionManager::hash_token("abc");
        assert_eq!(hash1, SessionManager::hash_token("abc"));
        assert_eq!(hash1.len(), 64);
        assert_ne!(hash1, SessionManager::hash_token("abd"));
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_session_lifecycle() {
        let pool = test_support::pool().await;
        let user_id = test_support::insert_user(&pool, "customer").await;
        let sessions = SessionManager::new(pool.clone(), 30);

        let token = sessions.create(user_id, Some("127.0.0.1"), None).await.unwrap();
        let other = sessions.create(user_id, None, None).await.unwrap();

        let found = sessions.lookup(&token).await.unwrap().unwrap();
        assert_eq!(found.user_id, user_id);
        assert_eq!(found.role(), UserRole::Customer);

        // Malformed tokens never hit the database
        assert!(sessions.lookup("nope").await.unwrap().is_none());

        assert_eq!(
            sessions.revoke_all(user_id, Some(found.session_id)).await.unwrap(),
            1
        );
        assert!(sessions.lookup(&other).await.unwrap().is_none());
        assert!(sessions.revoke(&token).await.unwrap());
        assert!(sessions.lookup(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "Requires DATABASE_URL"]
    #[serial(sqlx_db)]
    async fn test_expired_session_is_rejected_and_purged() {
        let pool = test_support::pool().await;
        let user_id = test_support::insert_user(&pool, "customer").await;
        let sessions = SessionManager::new(pool.clone(), 30);

        let token = sessions.create(user_id, None, None).await.unwrap();
        sqlx::query("UPDATE sessions SET expires_at = NOW() - INTERVAL '1 minute' WHERE user_id = $1")
            .bind(user_id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(sessions.lookup(&token).await.unwrap().is_none());
        assert!(SessionManager::purge_expired(&pool).await.unwrap() >= 1);
    }
}
