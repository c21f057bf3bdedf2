//! Second-factor challenge service.
//!
//! Flow Overview:
//! - Enrollment: `enroll_totp` hands out a secret, `enable_totp` confirms it
//!   with one valid code; `enable_email` switches on delivered codes.
//! - Challenge: `send_code` creates a single pending delivered challenge;
//!   `verify_code` accepts TOTP, delivered code, or a backup code.
//! - Disable is immediate and wipes all factors (decision recorded in
//!   DESIGN.md).

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::codec::PayloadCodec;

use super::delivery::{self, CodeSender, DeliveredChallenge};
use super::recovery::{self, BackupCodeBatch};
use super::store::{FactorEnrollment, TwoFactorStore};
use super::totp;

const DEFAULT_CODE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_CODE_ATTEMPTS: u8 = 5;
const DEFAULT_ISSUER_LABEL: &str = "Staffdesk";

/// Second factors a user may verify with.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Totp,
    EmailCode,
    BackupCode,
}

#[derive(Debug, Error)]
pub enum TwoFactorError {
    /// The user has no usable second factor.
    #[error("no second factor enrolled")]
    NoProviders,
    /// Nothing pending to verify against.
    #[error("no pending challenge")]
    NoChallenge,
    /// Wrong code; for delivered codes an attempt was spent.
    #[error("invalid code")]
    Invalid,
    /// The challenge burned through its attempt budget. Terminal even for a
    /// later correct code.
    #[error("challenge attempts exhausted")]
    Exhausted,
    /// The challenge outlived its window.
    #[error("challenge expired")]
    Expired,
    /// `enable_totp` without a preceding `enroll_totp`.
    #[error("no enrollment in progress")]
    NotEnrolled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct TwoFactorConfig {
    issuer_label: String,
    code_ttl_seconds: i64,
    code_attempts: u8,
    backup_pepper: Option<Arc<[u8]>>,
}

impl TwoFactorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            issuer_label: DEFAULT_ISSUER_LABEL.to_string(),
            code_ttl_seconds: DEFAULT_CODE_TTL_SECONDS,
            code_attempts: DEFAULT_CODE_ATTEMPTS,
            backup_pepper: None,
        }
    }

    #[must_use]
    pub fn with_issuer_label(mut self, label: String) -> Self {
        self.issuer_label = label;
        self
    }

    #[must_use]
    pub fn with_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_code_attempts(mut self, attempts: u8) -> Self {
        self.code_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_backup_pepper(mut self, pepper: Arc<[u8]>) -> Self {
        self.backup_pepper = Some(pepper);
        self
    }

    #[must_use]
    pub fn issuer_label(&self) -> &str {
        &self.issuer_label
    }

    #[must_use]
    pub fn code_ttl_seconds(&self) -> i64 {
        self.code_ttl_seconds
    }

    #[must_use]
    pub fn code_attempts(&self) -> u8 {
        self.code_attempts
    }

    fn backup_pepper(&self) -> Option<&[u8]> {
        self.backup_pepper.as_deref()
    }
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of `enroll_totp`: material for the authenticator app.
#[derive(Clone, Debug)]
pub struct TotpEnrollment {
    pub secret_base32: String,
    pub otpauth_url: String,
}

pub struct TwoFactorService {
    store: Arc<dyn TwoFactorStore>,
    sender: Arc<dyn CodeSender>,
    codec: PayloadCodec,
    config: TwoFactorConfig,
}

impl TwoFactorService {
    #[must_use]
    pub fn new(
        store: Arc<dyn TwoFactorStore>,
        sender: Arc<dyn CodeSender>,
        codec: PayloadCodec,
        config: TwoFactorConfig,
    ) -> Self {
        Self {
            store,
            sender,
            codec,
            config,
        }
    }

    /// Factors the user can currently verify with.
    ///
    /// # Errors
    /// [`TwoFactorError::NoProviders`] when nothing is enrolled.
    pub async fn providers(&self, user_id: Uuid) -> Result<Vec<FactorKind>, TwoFactorError> {
        let enrollment = self.enrollment_or_default(user_id).await?;
        let mut factors = Vec::new();
        if enrollment.totp_envelope.is_some() {
            factors.push(FactorKind::Totp);
        }
        if enrollment.email.is_some() {
            factors.push(FactorKind::EmailCode);
        }
        if !enrollment.backup_hashes.is_empty() {
            factors.push(FactorKind::BackupCode);
        }
        if factors.is_empty() {
            return Err(TwoFactorError::NoProviders);
        }
        Ok(factors)
    }

    /// Whether login must go through a second-factor challenge.
    ///
    /// # Errors
    /// Returns an error only if the store fails.
    pub async fn is_enabled(&self, user_id: Uuid) -> Result<bool, TwoFactorError> {
        Ok(self
            .enrollment_or_default(user_id)
            .await?
            .has_active_factor())
    }

    /// Start TOTP enrollment: mint a secret and store it pending.
    ///
    /// # Errors
    /// Returns an error if secret generation or the store fails.
    pub async fn enroll_totp(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> Result<TotpEnrollment, TwoFactorError> {
        let (secret_base32, envelope) = totp::generate_secret(&self.codec)?;
        let otpauth_url =
            totp::provisioning_url(&secret_base32, self.config.issuer_label(), account_name)?;

        let mut enrollment = self.enrollment_or_default(user_id).await?;
        enrollment.pending_totp_envelope = Some(envelope);
        self.store
            .upsert_enrollment(user_id, enrollment)
            .await
            .context("failed to store pending TOTP enrollment")?;

        Ok(TotpEnrollment {
            secret_base32,
            otpauth_url,
        })
    }

    /// Confirm the pending TOTP secret with one valid code and activate it.
    ///
    /// # Errors
    /// [`TwoFactorError::NotEnrolled`] without a pending secret,
    /// [`TwoFactorError::Invalid`] on a wrong code.
    pub async fn enable_totp(&self, user_id: Uuid, code: &str) -> Result<(), TwoFactorError> {
        self.enable_totp_at(user_id, code, unix_now()).await
    }

    pub(crate) async fn enable_totp_at(
        &self,
        user_id: Uuid,
        code: &str,
        now: i64,
    ) -> Result<(), TwoFactorError> {
        let mut enrollment = self.enrollment_or_default(user_id).await?;
        let Some(pending) = enrollment.pending_totp_envelope.clone() else {
            return Err(TwoFactorError::NotEnrolled);
        };

        let secret = totp::open_secret(&self.codec, &pending)?;
        let now_u64 = to_u64(now);
        if !totp::check_code(&secret, code, now_u64)? {
            return Err(TwoFactorError::Invalid);
        }

        enrollment.totp_envelope = Some(pending);
        enrollment.pending_totp_envelope = None;
        // The enrollment code spends its window; it cannot double as the
        // first login verification.
        enrollment.last_totp_step = Some(totp::time_step(now_u64));
        self.store
            .upsert_enrollment(user_id, enrollment)
            .await
            .context("failed to activate TOTP factor")?;
        info!(user_id = %user_id, "TOTP factor enabled");
        Ok(())
    }

    /// Switch on the delivered-code factor for `destination`.
    ///
    /// # Errors
    /// Returns an error only if the store fails.
    pub async fn enable_email(
        &self,
        user_id: Uuid,
        destination: String,
    ) -> Result<(), TwoFactorError> {
        let mut enrollment = self.enrollment_or_default(user_id).await?;
        enrollment.email = Some(destination);
        self.store
            .upsert_enrollment(user_id, enrollment)
            .await
            .context("failed to enable email factor")?;
        Ok(())
    }

    /// Drop every factor immediately. No re-verification is required.
    ///
    /// # Errors
    /// Returns an error only if the store fails.
    pub async fn disable(&self, user_id: Uuid) -> Result<(), TwoFactorError> {
        self.store
            .upsert_enrollment(user_id, FactorEnrollment::default())
            .await
            .context("failed to disable second factors")?;
        info!(user_id = %user_id, "second factors disabled");
        Ok(())
    }

    /// Create and deliver a fresh code, replacing any pending challenge.
    ///
    /// # Errors
    /// [`TwoFactorError::NoProviders`] without an email factor; delivery and
    /// store failures surface as internal errors.
    pub async fn send_code(&self, user_id: Uuid) -> Result<(), TwoFactorError> {
        self.send_code_at(user_id, unix_now()).await
    }

    pub(crate) async fn send_code_at(&self, user_id: Uuid, now: i64) -> Result<(), TwoFactorError> {
        let enrollment = self.enrollment_or_default(user_id).await?;
        let Some(destination) = enrollment.email else {
            return Err(TwoFactorError::NoProviders);
        };

        let code = delivery::generate_code()?;
        self.sender
            .send(&destination, &code)
            .context("failed to deliver second-factor code")?;

        self.store
            .put_challenge(
                user_id,
                DeliveredChallenge {
                    code_hash: delivery::hash_code(&code),
                    expires_at: now + self.config.code_ttl_seconds(),
                    attempts_remaining: self.config.code_attempts(),
                    destination,
                },
            )
            .await
            .context("failed to store delivered challenge")?;
        Ok(())
    }

    /// Verify a code against any enrolled factor.
    ///
    /// Routing: backup-shaped input goes to the backup codes; six-digit input
    /// tries TOTP first (stateless, costs nothing), then the pending
    /// delivered challenge, which spends an attempt on mismatch.
    ///
    /// # Errors
    /// Per-factor failures as described on [`TwoFactorError`].
    pub async fn verify_code(&self, user_id: Uuid, code: &str) -> Result<FactorKind, TwoFactorError> {
        self.verify_code_at(user_id, code, unix_now()).await
    }

    pub(crate) async fn verify_code_at(
        &self,
        user_id: Uuid,
        code: &str,
        now: i64,
    ) -> Result<FactorKind, TwoFactorError> {
        let enrollment = self.enrollment_or_default(user_id).await?;
        if !enrollment.has_active_factor() && enrollment.backup_hashes.is_empty() {
            return Err(TwoFactorError::NoProviders);
        }

        if recovery::looks_like_backup_code(code) {
            return self.verify_backup(user_id, code, &enrollment).await;
        }

        if let Some(envelope) = &enrollment.totp_envelope {
            let secret = totp::open_secret(&self.codec, envelope)?;
            if totp::check_code(&secret, code, to_u64(now))? {
                let fresh = self
                    .store
                    .record_totp_step(user_id, totp::time_step(to_u64(now)))
                    .await
                    .context("failed to record TOTP step")?;
                if !fresh {
                    warn!(user_id = %user_id, "TOTP code replayed within its window");
                    return Err(TwoFactorError::Invalid);
                }
                return Ok(FactorKind::Totp);
            }
        }

        self.verify_delivered(user_id, code, now, enrollment.totp_envelope.is_some())
            .await
    }

    /// Mint a new backup-code batch, invalidating the previous one.
    ///
    /// # Errors
    /// [`TwoFactorError::NoProviders`] when no factor is active (backup codes
    /// back up a factor, they are not one on their own) or no pepper is
    /// configured.
    pub async fn generate_backup_codes(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<String>, TwoFactorError> {
        let Some(pepper) = self.config.backup_pepper() else {
            return Err(TwoFactorError::Internal(anyhow!(
                "backup codes require a configured pepper"
            )));
        };

        let mut enrollment = self.enrollment_or_default(user_id).await?;
        if !enrollment.has_active_factor() {
            return Err(TwoFactorError::NoProviders);
        }

        let batch = BackupCodeBatch::generate(pepper)?;
        enrollment.backup_hashes = batch.hashes;
        self.store
            .upsert_enrollment(user_id, enrollment)
            .await
            .context("failed to store backup codes")?;
        Ok(batch.codes)
    }

    async fn verify_backup(
        &self,
        user_id: Uuid,
        code: &str,
        enrollment: &FactorEnrollment,
    ) -> Result<FactorKind, TwoFactorError> {
        let Some(pepper) = self.config.backup_pepper() else {
            return Err(TwoFactorError::Invalid);
        };
        for hash in &enrollment.backup_hashes {
            if recovery::verify_backup_code(code, hash, pepper).unwrap_or(false) {
                let consumed = self
                    .store
                    .consume_backup_code(user_id, hash)
                    .await
                    .context("failed to consume backup code")?;
                if consumed {
                    info!(user_id = %user_id, "backup code accepted");
                    return Ok(FactorKind::BackupCode);
                }
                // Lost a race with a concurrent use of the same code.
                return Err(TwoFactorError::Invalid);
            }
        }
        Err(TwoFactorError::Invalid)
    }

    async fn verify_delivered(
        &self,
        user_id: Uuid,
        code: &str,
        now: i64,
        totp_enabled: bool,
    ) -> Result<FactorKind, TwoFactorError> {
        let Some(challenge) = self
            .store
            .take_challenge(user_id)
            .await
            .context("failed to load delivered challenge")?
        else {
            // No pending delivered code. With TOTP enabled the input was
            // simply a wrong TOTP code.
            return Err(if totp_enabled {
                TwoFactorError::Invalid
            } else {
                TwoFactorError::NoChallenge
            });
        };

        if now >= challenge.expires_at {
            // Dropped on take; an expired challenge never comes back.
            return Err(TwoFactorError::Expired);
        }
        if challenge.attempts_remaining == 0 {
            // Terminal: put it back so later calls stay exhausted too.
            self.store
                .put_challenge(user_id, challenge)
                .await
                .context("failed to restore exhausted challenge")?;
            return Err(TwoFactorError::Exhausted);
        }

        if delivery::hash_code(code) == challenge.code_hash {
            // Consumed by the take above.
            return Ok(FactorKind::EmailCode);
        }

        let mut challenge = challenge;
        challenge.attempts_remaining -= 1;
        self.store
            .put_challenge(user_id, challenge)
            .await
            .context("failed to record failed attempt")?;
        Err(TwoFactorError::Invalid)
    }

    async fn enrollment_or_default(
        &self,
        user_id: Uuid,
    ) -> Result<FactorEnrollment, TwoFactorError> {
        Ok(self
            .store
            .enrollment(user_id)
            .await
            .context("failed to load factor enrollment")?
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for TwoFactorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoFactorService")
            .field("config", &self.config)
            .finish()
    }
}

fn unix_now() -> i64 {
    crate::token::issuer::now_unix()
}

fn to_u64(now: i64) -> u64 {
    u64::try_from(now).unwrap_or(0)
}
