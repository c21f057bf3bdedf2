//! Postgres-backed session store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::store::{ClientFingerprint, SWEEP_GRACE_SECONDS, SessionRecord, SessionStore};

#[derive(Clone, Debug)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> SessionRecord {
    SessionRecord {
        user_id: row.get("user_id"),
        token_family: row.get("token_family"),
        fingerprint: ClientFingerprint {
            ip: row.get("client_ip"),
            user_agent: row.get("client_user_agent"),
            device: row.get("client_device"),
        },
        created_at: row.get("created_at"),
        last_activity_at: row.get("last_activity_at"),
        expires_at: row.get("expires_at"),
        revoked: row.get("revoked"),
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, hash: Vec<u8>, record: SessionRecord) -> Result<()> {
        let query = r"
            INSERT INTO portal_sessions
                (session_hash, user_id, token_family, client_ip, client_user_agent,
                 client_device, created_at, last_activity_at, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&hash)
            .bind(record.user_id)
            .bind(record.token_family)
            .bind(&record.fingerprint.ip)
            .bind(&record.fingerprint.user_agent)
            .bind(&record.fingerprint.device)
            .bind(record.created_at)
            .bind(record.last_activity_at)
            .bind(record.expires_at)
            .bind(record.revoked)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn get(&self, hash: &[u8]) -> Result<Option<SessionRecord>> {
        let query = r"
            SELECT user_id, token_family, client_ip, client_user_agent, client_device,
                   created_at, last_activity_at, expires_at, revoked
            FROM portal_sessions
            WHERE session_hash = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup session")?;
        Ok(row.as_ref().map(record_from_row))
    }

    async fn update(&self, hash: &[u8], record: SessionRecord) -> Result<()> {
        let query = r"
            UPDATE portal_sessions
            SET last_activity_at = $2, expires_at = $3, revoked = $4
            WHERE session_hash = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(hash)
            .bind(record.last_activity_at)
            .bind(record.expires_at)
            .bind(record.revoked)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to update session")?;
        Ok(())
    }

    async fn revoke(&self, hash: &[u8]) -> Result<()> {
        // Idempotent; zero rows touched is not an error.
        let query = "UPDATE portal_sessions SET revoked = TRUE WHERE session_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke session")?;
        Ok(())
    }

    async fn revoke_for_user(&self, user_id: Uuid, except: Option<&[u8]>) -> Result<u64> {
        let query = r"
            UPDATE portal_sessions
            SET revoked = TRUE
            WHERE user_id = $1
              AND revoked = FALSE
              AND ($2::bytea IS NULL OR session_hash <> $2)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(except)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to revoke sessions for user")?;
        Ok(result.rows_affected())
    }

    async fn active_for_user(
        &self,
        user_id: Uuid,
        now: i64,
    ) -> Result<Vec<(Vec<u8>, SessionRecord)>> {
        let query = r"
            SELECT session_hash, user_id, token_family, client_ip, client_user_agent,
                   client_device, created_at, last_activity_at, expires_at, revoked
            FROM portal_sessions
            WHERE user_id = $1 AND revoked = FALSE AND expires_at > $2
            ORDER BY created_at ASC
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list active sessions")?;

        Ok(rows
            .iter()
            .map(|row| (row.get("session_hash"), record_from_row(row)))
            .collect())
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let query = "DELETE FROM portal_sessions WHERE expires_at + $2 <= $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .bind(SWEEP_GRACE_SECONDS)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to sweep expired sessions")?;
        Ok(result.rows_affected())
    }
}
