//! Second-factor enrollment and challenge storage.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::delivery::DeliveredChallenge;

/// Everything the portal knows about a user's second factors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FactorEnrollment {
    /// Confirmed TOTP secret, codec-encrypted at rest.
    pub totp_envelope: Option<String>,
    /// Secret generated by `enroll` but not yet confirmed with a code.
    pub pending_totp_envelope: Option<String>,
    /// Destination for delivered codes; `Some` means the email factor is on.
    pub email: Option<String>,
    /// Argon2id hashes of unspent backup codes.
    pub backup_hashes: Vec<String>,
    /// Last accepted TOTP time step, for same-window replay rejection.
    pub last_totp_step: Option<u64>,
}

impl FactorEnrollment {
    #[must_use]
    pub fn has_active_factor(&self) -> bool {
        self.totp_envelope.is_some() || self.email.is_some()
    }
}

#[async_trait]
pub trait TwoFactorStore: Send + Sync {
    async fn enrollment(&self, user_id: Uuid) -> Result<Option<FactorEnrollment>>;

    async fn upsert_enrollment(&self, user_id: Uuid, enrollment: FactorEnrollment) -> Result<()>;

    /// Replace any pending challenge; the prior one is invalidated.
    async fn put_challenge(&self, user_id: Uuid, challenge: DeliveredChallenge) -> Result<()>;

    /// Atomically remove and return the pending challenge. The caller either
    /// consumes it or puts back a decremented copy; two concurrent verifies
    /// can therefore never both succeed against one challenge.
    async fn take_challenge(&self, user_id: Uuid) -> Result<Option<DeliveredChallenge>>;

    /// Record a TOTP step as used. Returns false when the step was already
    /// spent (replay inside the same window).
    async fn record_totp_step(&self, user_id: Uuid, step: u64) -> Result<bool>;

    /// Spend one backup code hash. Returns false when it was already spent.
    async fn consume_backup_code(&self, user_id: Uuid, hash: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryTwoFactorStore {
    enrollments: Mutex<HashMap<Uuid, FactorEnrollment>>,
    challenges: Mutex<HashMap<Uuid, DeliveredChallenge>>,
}

impl MemoryTwoFactorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TwoFactorStore for MemoryTwoFactorStore {
    async fn enrollment(&self, user_id: Uuid) -> Result<Option<FactorEnrollment>> {
        let enrollments = self.enrollments.lock().await;
        Ok(enrollments.get(&user_id).cloned())
    }

    async fn upsert_enrollment(&self, user_id: Uuid, enrollment: FactorEnrollment) -> Result<()> {
        let mut enrollments = self.enrollments.lock().await;
        enrollments.insert(user_id, enrollment);
        Ok(())
    }

    async fn put_challenge(&self, user_id: Uuid, challenge: DeliveredChallenge) -> Result<()> {
        let mut challenges = self.challenges.lock().await;
        challenges.insert(user_id, challenge);
        Ok(())
    }

    async fn take_challenge(&self, user_id: Uuid) -> Result<Option<DeliveredChallenge>> {
        let mut challenges = self.challenges.lock().await;
        Ok(challenges.remove(&user_id))
    }

    async fn record_totp_step(&self, user_id: Uuid, step: u64) -> Result<bool> {
        let mut enrollments = self.enrollments.lock().await;
        let Some(enrollment) = enrollments.get_mut(&user_id) else {
            return Ok(false);
        };
        if enrollment.last_totp_step == Some(step) {
            return Ok(false);
        }
        enrollment.last_totp_step = Some(step);
        Ok(true)
    }

    async fn consume_backup_code(&self, user_id: Uuid, hash: &str) -> Result<bool> {
        let mut enrollments = self.enrollments.lock().await;
        let Some(enrollment) = enrollments.get_mut(&user_id) else {
            return Ok(false);
        };
        let before = enrollment.backup_hashes.len();
        enrollment.backup_hashes.retain(|stored| stored != hash);
        Ok(enrollment.backup_hashes.len() < before)
    }
}
