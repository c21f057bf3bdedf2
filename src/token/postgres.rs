//! Postgres-backed refresh-token store.
//!
//! The rotation compare-and-swap maps to a single conditional `UPDATE`;
//! Postgres row-level locking makes it the same linearization point the
//! in-memory store provides with its mutex.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::store::{RefreshRecord, RefreshTokenStore, SwapOutcome};

#[derive(Clone, Debug)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn insert(&self, record: RefreshRecord) -> Result<()> {
        let query = r"
            INSERT INTO refresh_token_families
                (family, user_id, current_hash, access_jti, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (family) DO UPDATE
            SET current_hash = EXCLUDED.current_hash,
                access_jti = EXCLUDED.access_jti,
                expires_at = EXCLUDED.expires_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(record.family)
            .bind(record.user_id)
            .bind(&record.current_hash)
            .bind(&record.access_jti)
            .bind(record.issued_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert refresh token family")?;
        Ok(())
    }

    async fn get(&self, family: Uuid) -> Result<Option<RefreshRecord>> {
        let query = r"
            SELECT family, user_id, current_hash, access_jti, issued_at, expires_at
            FROM refresh_token_families
            WHERE family = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(family)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup refresh token family")?;

        Ok(row.map(|row| RefreshRecord {
            family: row.get("family"),
            user_id: row.get("user_id"),
            current_hash: row.get("current_hash"),
            access_jti: row.get("access_jti"),
            issued_at: row.get("issued_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn compare_and_swap(
        &self,
        family: Uuid,
        expected_hash: &[u8],
        new_hash: Vec<u8>,
        new_access_jti: String,
        new_expires_at: i64,
    ) -> Result<SwapOutcome> {
        // The WHERE clause carries the expected hash; zero rows touched means
        // either a lost race or a missing family, disambiguated below.
        let query = r"
            UPDATE refresh_token_families
            SET current_hash = $3, access_jti = $4, expires_at = $5
            WHERE family = $1 AND current_hash = $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(family)
            .bind(expected_hash)
            .bind(&new_hash)
            .bind(&new_access_jti)
            .bind(new_expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to rotate refresh token")?;

        if result.rows_affected() > 0 {
            return Ok(SwapOutcome::Rotated);
        }

        let exists_query = "SELECT 1 FROM refresh_token_families WHERE family = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = exists_query
        );
        let exists = sqlx::query(exists_query)
            .bind(family)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to check refresh token family")?
            .is_some();

        Ok(if exists {
            SwapOutcome::Reused
        } else {
            SwapOutcome::Missing
        })
    }

    async fn remove(&self, family: Uuid) -> Result<()> {
        // Revocation is idempotent; zero deleted rows is fine.
        let query = "DELETE FROM refresh_token_families WHERE family = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(family)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete refresh token family")?;
        Ok(())
    }

    async fn remove_for_user(&self, user_id: Uuid, except: Option<Uuid>) -> Result<()> {
        let query = r"
            DELETE FROM refresh_token_families
            WHERE user_id = $1 AND ($2::uuid IS NULL OR family <> $2)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(except)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete refresh token families for user")?;
        Ok(())
    }
}
