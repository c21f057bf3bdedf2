//! Server-side session registry.
//!
//! Flow Overview:
//! - Login (or 2FA success) creates a session and returns the raw token once;
//!   the store only ever sees its hash.
//! - Keep-alive validates and extends; validation failures are terminal for
//!   that session id, never silently repaired.
//! - Logout and bulk logout revoke; revoked rows stay visible so the client
//!   can be told its session *ended* rather than that it never existed.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::store::{ClientFingerprint, SessionRecord, SessionStore};

const DEFAULT_IDLE_TTL_SECONDS: i64 = 30 * 60;
const DEFAULT_MAX_LIFETIME_SECONDS: i64 = 12 * 60 * 60;
const DEFAULT_MAX_SESSIONS_PER_USER: usize = 5;

const SESSION_TOKEN_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct SessionPolicy {
    idle_ttl_seconds: i64,
    max_lifetime_seconds: i64,
    max_sessions_per_user: usize,
}

impl SessionPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self {
            idle_ttl_seconds: DEFAULT_IDLE_TTL_SECONDS,
            max_lifetime_seconds: DEFAULT_MAX_LIFETIME_SECONDS,
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
        }
    }

    #[must_use]
    pub fn with_idle_ttl_seconds(mut self, seconds: i64) -> Self {
        self.idle_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_lifetime_seconds(mut self, seconds: i64) -> Self {
        self.max_lifetime_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_sessions_per_user(mut self, cap: usize) -> Self {
        self.max_sessions_per_user = cap;
        self
    }

    #[must_use]
    pub fn idle_ttl_seconds(&self) -> i64 {
        self.idle_ttl_seconds
    }

    #[must_use]
    pub fn max_lifetime_seconds(&self) -> i64 {
        self.max_lifetime_seconds
    }

    #[must_use]
    pub fn max_sessions_per_user(&self) -> usize {
        self.max_sessions_per_user
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a session lookup. Everything but `Active` is terminal for the
/// presented session id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionValidity {
    Active(SessionRecord),
    /// The session existed and was revoked: logout elsewhere, bulk sign-out,
    /// or concurrency eviction. Distinct from `Unknown` on purpose.
    Ended,
    Expired,
    Unknown,
}

impl SessionValidity {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// A freshly created session: the raw token leaves the process exactly once.
#[derive(Clone, Debug)]
pub struct CreatedSession {
    pub session_id: String,
    pub record: SessionRecord,
}

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    policy: SessionPolicy,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Create a session for `user_id`, evicting the oldest active session
    /// when the per-user cap is exceeded.
    ///
    /// # Errors
    /// Returns an error if token generation or the store fails.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        fingerprint: ClientFingerprint,
        token_family: Uuid,
    ) -> Result<CreatedSession> {
        self.create_session_at(user_id, fingerprint, token_family, super::now_unix())
            .await
    }

    pub(crate) async fn create_session_at(
        &self,
        user_id: Uuid,
        fingerprint: ClientFingerprint,
        token_family: Uuid,
        now: i64,
    ) -> Result<CreatedSession> {
        // Opportunistic GC; expiry checks themselves stay lazy.
        let swept = self.store.sweep_expired(now).await?;
        if swept > 0 {
            debug!(swept, "swept expired sessions");
        }

        let mut active = self.store.active_for_user(user_id, now).await?;
        if active.len() >= self.policy.max_sessions_per_user() {
            active.sort_by_key(|(_, record)| record.created_at);
            let to_evict = active.len() + 1 - self.policy.max_sessions_per_user();
            for (hash, _) in active.iter().take(to_evict) {
                self.store.revoke(hash).await?;
            }
            info!(user_id = %user_id, evicted = to_evict, "evicted oldest sessions over cap");
        }

        let session_id = generate_session_token()?;
        let record = SessionRecord {
            user_id,
            token_family,
            fingerprint,
            created_at: now,
            last_activity_at: now,
            expires_at: now + self.policy.idle_ttl_seconds(),
            revoked: false,
        };
        self.store
            .insert(hash_session_token(&session_id), record.clone())
            .await?;

        Ok(CreatedSession { session_id, record })
    }

    /// Validate a session id against its claimed user.
    ///
    /// # Errors
    /// Returns an error only if the store fails; policy outcomes are values.
    pub async fn validate(&self, session_id: &str, user_id: Uuid) -> Result<SessionValidity> {
        self.validate_at(session_id, user_id, super::now_unix()).await
    }

    pub(crate) async fn validate_at(
        &self,
        session_id: &str,
        user_id: Uuid,
        now: i64,
    ) -> Result<SessionValidity> {
        let hash = hash_session_token(session_id);
        let Some(record) = self.store.get(&hash).await? else {
            return Ok(SessionValidity::Unknown);
        };
        // A session presented with the wrong user is indistinguishable from a
        // missing one; anything else would leak another user's session state.
        if record.user_id != user_id {
            return Ok(SessionValidity::Unknown);
        }
        if record.revoked {
            return Ok(SessionValidity::Ended);
        }
        if now >= record.expires_at {
            return Ok(SessionValidity::Expired);
        }
        Ok(SessionValidity::Active(record))
    }

    /// Extend a still-valid session: bump activity, push expiry out to the
    /// idle TTL, clamped to the absolute lifetime. Sessions that fail
    /// validation come back unchanged as their terminal outcome.
    ///
    /// # Errors
    /// Returns an error only if the store fails.
    pub async fn extend_session(&self, session_id: &str, user_id: Uuid) -> Result<SessionValidity> {
        self.extend_session_at(session_id, user_id, super::now_unix())
            .await
    }

    pub(crate) async fn extend_session_at(
        &self,
        session_id: &str,
        user_id: Uuid,
        now: i64,
    ) -> Result<SessionValidity> {
        let validity = self.validate_at(session_id, user_id, now).await?;
        let SessionValidity::Active(mut record) = validity else {
            return Ok(validity);
        };

        record.last_activity_at = now;
        record.expires_at = (now + self.policy.idle_ttl_seconds())
            .min(record.created_at + self.policy.max_lifetime_seconds());
        self.store
            .update(&hash_session_token(session_id), record.clone())
            .await?;
        Ok(SessionValidity::Active(record))
    }

    /// Revoke one session. Idempotent: unknown or already-ended ids are fine.
    ///
    /// # Errors
    /// Returns an error only if the store fails.
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.store.revoke(&hash_session_token(session_id)).await
    }

    /// Revoke every session of `user_id`; `except` spares the caller's own.
    ///
    /// # Errors
    /// Returns an error only if the store fails.
    pub async fn end_all_sessions(&self, user_id: Uuid, except: Option<&str>) -> Result<u64> {
        let except_hash = except.map(hash_session_token);
        self.store
            .revoke_for_user(user_id, except_hash.as_deref())
            .await
    }

    /// Look up the record without touching it (used by logout to find the
    /// token family to revoke).
    pub(crate) async fn peek(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.store.get(&hash_session_token(session_id)).await
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("policy", &self.policy)
            .finish()
    }
}

/// Random url-safe session token. The raw value goes to the client; the store
/// only keeps its hash.
fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; SESSION_TOKEN_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub(crate) fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
