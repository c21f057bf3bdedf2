//! Postgres-backed second-factor store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::delivery::DeliveredChallenge;
use super::store::{FactorEnrollment, TwoFactorStore};

#[derive(Clone, Debug)]
pub struct PgTwoFactorStore {
    pool: PgPool,
}

impl PgTwoFactorStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TwoFactorStore for PgTwoFactorStore {
    async fn enrollment(&self, user_id: Uuid) -> Result<Option<FactorEnrollment>> {
        let query = r"
            SELECT totp_envelope, pending_totp_envelope, email, backup_hashes, last_totp_step
            FROM factor_enrollments
            WHERE user_id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to load factor enrollment")?;

        Ok(row.map(|row| FactorEnrollment {
            totp_envelope: row.get("totp_envelope"),
            pending_totp_envelope: row.get("pending_totp_envelope"),
            email: row.get("email"),
            backup_hashes: row.get("backup_hashes"),
            last_totp_step: row
                .get::<Option<i64>, _>("last_totp_step")
                .and_then(|step| u64::try_from(step).ok()),
        }))
    }

    async fn upsert_enrollment(&self, user_id: Uuid, enrollment: FactorEnrollment) -> Result<()> {
        let query = r"
            INSERT INTO factor_enrollments
                (user_id, totp_envelope, pending_totp_envelope, email, backup_hashes,
                 last_totp_step)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
            SET totp_envelope = EXCLUDED.totp_envelope,
                pending_totp_envelope = EXCLUDED.pending_totp_envelope,
                email = EXCLUDED.email,
                backup_hashes = EXCLUDED.backup_hashes,
                last_totp_step = EXCLUDED.last_totp_step
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(&enrollment.totp_envelope)
            .bind(&enrollment.pending_totp_envelope)
            .bind(&enrollment.email)
            .bind(&enrollment.backup_hashes)
            .bind(enrollment.last_totp_step.and_then(|step| i64::try_from(step).ok()))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to upsert factor enrollment")?;
        Ok(())
    }

    async fn put_challenge(&self, user_id: Uuid, challenge: DeliveredChallenge) -> Result<()> {
        let query = r"
            INSERT INTO delivered_challenges
                (user_id, code_hash, expires_at, attempts_remaining, destination)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
            SET code_hash = EXCLUDED.code_hash,
                expires_at = EXCLUDED.expires_at,
                attempts_remaining = EXCLUDED.attempts_remaining,
                destination = EXCLUDED.destination
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(&challenge.code_hash)
            .bind(challenge.expires_at)
            .bind(i32::from(challenge.attempts_remaining))
            .bind(&challenge.destination)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to store delivered challenge")?;
        Ok(())
    }

    async fn take_challenge(&self, user_id: Uuid) -> Result<Option<DeliveredChallenge>> {
        // DELETE .. RETURNING keeps take-and-return atomic across callers.
        let query = r"
            DELETE FROM delivered_challenges
            WHERE user_id = $1
            RETURNING code_hash, expires_at, attempts_remaining, destination
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to take delivered challenge")?;

        Ok(row.map(|row| DeliveredChallenge {
            code_hash: row.get("code_hash"),
            expires_at: row.get("expires_at"),
            attempts_remaining: u8::try_from(row.get::<i32, _>("attempts_remaining"))
                .unwrap_or(0),
            destination: row.get("destination"),
        }))
    }

    async fn record_totp_step(&self, user_id: Uuid, step: u64) -> Result<bool> {
        // Conditional update doubles as the replay check.
        let query = r"
            UPDATE factor_enrollments
            SET last_totp_step = $2
            WHERE user_id = $1
              AND (last_totp_step IS NULL OR last_totp_step <> $2)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(i64::try_from(step).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to record TOTP step")?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume_backup_code(&self, user_id: Uuid, hash: &str) -> Result<bool> {
        let query = r"
            UPDATE factor_enrollments
            SET backup_hashes = array_remove(backup_hashes, $2)
            WHERE user_id = $1 AND $2 = ANY(backup_hashes)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to consume backup code")?;
        Ok(result.rows_affected() > 0)
    }
}
