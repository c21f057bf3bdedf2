//! Authentication orchestrator.
//!
//! Flow Overview:
//! - `login` verifies credentials and either establishes a session directly
//!   or parks the attempt as a pending login awaiting a second factor.
//! - `verify_two_factor` completes a pending login and establishes the
//!   session; exhausted challenges throw the caller back to square one.
//! - `refresh` delegates to the token issuer; a replayed refresh token forces
//!   full re-authentication.
//! - `keep_alive`, `unlock`, `logout`, `logout_all` operate on established
//!   sessions.
//!
//! This is the only layer that maps component outcomes onto the user-facing
//! error taxonomy; the HTTP boundary translates, it does not decide.

use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::session::{ClientFingerprint, SessionRecord, SessionRegistry, SessionValidity};
use crate::token::issuer::now_unix;
use crate::token::{RefreshError, TokenIssuer, TokenPair, jwt};
use crate::twofactor::{FactorKind, TotpEnrollment, TwoFactorError, TwoFactorService};

use super::error::AuthError;
use super::rate_limit::{RateLimitAction, RateLimitDecision, RateLimiter};
use super::verifier::{CredentialOutcome, CredentialVerifier, RejectReason, VerifiedIdentity};

const DEFAULT_PENDING_LOGIN_TTL: Duration = Duration::from_secs(5 * 60);

/// Everything a successful authentication hands back: token material plus the
/// session identifier the client must echo in `X-Session-Id`.
#[derive(Clone, Debug)]
pub struct AuthenticatedSession {
    pub tokens: TokenPair,
    pub session_id: String,
    pub session: SessionRecord,
}

/// Result of a credential check that did not fail.
#[derive(Clone, Debug)]
pub enum LoginOutcome {
    Authenticated(Box<AuthenticatedSession>),
    /// Credentials were right but a second factor must be completed first.
    /// No tokens and no session exist yet.
    SecondFactorRequired {
        user_id: Uuid,
        providers: Vec<FactorKind>,
    },
}

/// Authenticated caller context for request handling.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: Uuid,
    pub session: SessionRecord,
}

struct PendingLogin {
    email: String,
    fingerprint: ClientFingerprint,
    created_at: Instant,
}

pub struct AuthOrchestrator {
    verifier: Arc<dyn CredentialVerifier>,
    two_factor: Arc<TwoFactorService>,
    tokens: Arc<TokenIssuer>,
    sessions: Arc<SessionRegistry>,
    rate_limiter: Arc<dyn RateLimiter>,
    pending: Mutex<HashMap<Uuid, PendingLogin>>,
    pending_ttl: Duration,
}

impl AuthOrchestrator {
    #[must_use]
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        two_factor: Arc<TwoFactorService>,
        tokens: Arc<TokenIssuer>,
        sessions: Arc<SessionRegistry>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            verifier,
            two_factor,
            tokens,
            sessions,
            rate_limiter,
            pending: Mutex::new(HashMap::new()),
            pending_ttl: DEFAULT_PENDING_LOGIN_TTL,
        }
    }

    #[must_use]
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// First step of authentication.
    ///
    /// # Errors
    /// `InvalidCredentials` for unknown identity and wrong password alike,
    /// `AccountLocked`, `EmailNotConfirmed`, `RateLimited`, or
    /// `TransientUpstream` when the verifier cannot be reached.
    pub async fn login(
        &self,
        identity: &str,
        password: &str,
        fingerprint: ClientFingerprint,
    ) -> Result<LoginOutcome, AuthError> {
        if self
            .rate_limiter
            .check_ip(fingerprint.ip.as_deref(), RateLimitAction::Login)
            == RateLimitDecision::Limited
        {
            return Err(AuthError::RateLimited);
        }

        let identity = normalize_identity(identity);
        if self
            .rate_limiter
            .check_identity(&identity, RateLimitAction::Login)
            == RateLimitDecision::Limited
        {
            return Err(AuthError::RateLimited);
        }
        if !valid_identity(&identity) {
            // Malformed identity gets the same answer as a wrong password.
            return Err(AuthError::InvalidCredentials);
        }

        let verified = self.map_credential_outcome(
            self.verifier.verify(&identity, password).await,
        )?;

        if self
            .two_factor
            .is_enabled(verified.user_id)
            .await
            .map_err(map_two_factor)?
        {
            let providers = self
                .two_factor
                .providers(verified.user_id)
                .await
                .map_err(map_two_factor)?;
            self.park_pending(&verified, fingerprint).await;
            info!(user_id = %verified.user_id, "login pending second factor");
            return Ok(LoginOutcome::SecondFactorRequired {
                user_id: verified.user_id,
                providers,
            });
        }

        let session = self.establish(verified.user_id, fingerprint).await?;
        info!(user_id = %verified.user_id, "login succeeded");
        Ok(LoginOutcome::Authenticated(Box::new(session)))
    }

    /// Deliver a challenge code for a pending login.
    ///
    /// # Errors
    /// `LoginFlowExpired` without a pending login; factor errors otherwise.
    pub async fn send_second_factor_code(&self, user_id: Uuid) -> Result<(), AuthError> {
        let Some(pending_email) = self.peek_pending_email(user_id).await else {
            return Err(AuthError::LoginFlowExpired);
        };
        if self
            .rate_limiter
            .check_identity(&pending_email, RateLimitAction::SecondFactor)
            == RateLimitDecision::Limited
        {
            return Err(AuthError::RateLimited);
        }
        self.two_factor
            .send_code(user_id)
            .await
            .map_err(map_two_factor)
    }

    /// Complete a pending login with a second-factor code.
    ///
    /// # Errors
    /// `LoginFlowExpired` when no login is pending, `SecondFactorInvalid`
    /// while attempts remain, `SecondFactorExhausted` once the budget is
    /// spent (the pending login is dropped; the caller restarts at `login`).
    pub async fn verify_two_factor(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<AuthenticatedSession, AuthError> {
        let Some((email, fingerprint)) = self.peek_pending(user_id).await else {
            return Err(AuthError::LoginFlowExpired);
        };
        if self
            .rate_limiter
            .check_identity(&email, RateLimitAction::SecondFactor)
            == RateLimitDecision::Limited
        {
            return Err(AuthError::RateLimited);
        }

        match self.two_factor.verify_code(user_id, code).await {
            Ok(factor) => {
                self.drop_pending(user_id).await;
                info!(user_id = %user_id, factor = ?factor, "second factor verified");
                self.establish(user_id, fingerprint).await
            }
            Err(TwoFactorError::Exhausted) => {
                // Terminal: back to Anonymous, a fresh login is required.
                self.drop_pending(user_id).await;
                warn!(user_id = %user_id, "second factor attempts exhausted");
                Err(AuthError::SecondFactorExhausted)
            }
            Err(err) => Err(map_two_factor(err)),
        }
    }

    /// Rotate a refresh token.
    ///
    /// # Errors
    /// `TokenExpired`, `TokenInvalid`, or `TokenReused`; the last one means
    /// the caller must drop all credentials and re-authenticate.
    pub async fn refresh(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<TokenPair, AuthError> {
        match self.tokens.refresh(access_token, refresh_token).await {
            Ok(pair) => Ok(pair),
            Err(RefreshError::Expired) => Err(AuthError::TokenExpired),
            Err(RefreshError::Reused) => Err(AuthError::TokenReused),
            Err(RefreshError::Invalid) => Err(AuthError::TokenInvalid),
            Err(RefreshError::Signing(err)) => Err(AuthError::Internal(err.into())),
            Err(RefreshError::Store(err)) => Err(AuthError::Internal(err)),
        }
    }

    /// Resolve the access token + session header pair into a principal.
    ///
    /// # Errors
    /// Token failures map to `TokenExpired`/`TokenInvalid`; session failures
    /// distinguish `SessionEnded` from `SessionInvalid`.
    pub async fn authenticate(
        &self,
        access_token: &str,
        session_id: &str,
    ) -> Result<Principal, AuthError> {
        let claims = self.verify_access(access_token, true)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::TokenInvalid)?;
        match self.sessions.validate(session_id, user_id).await? {
            SessionValidity::Active(session) => Ok(Principal { user_id, session }),
            SessionValidity::Ended => Err(AuthError::SessionEnded),
            SessionValidity::Expired | SessionValidity::Unknown => Err(AuthError::SessionInvalid),
        }
    }

    /// Validate and extend the caller's session.
    ///
    /// # Errors
    /// As [`Self::authenticate`].
    pub async fn keep_alive(
        &self,
        access_token: &str,
        session_id: &str,
    ) -> Result<SessionRecord, AuthError> {
        let principal = self.authenticate(access_token, session_id).await?;
        match self
            .sessions
            .extend_session(session_id, principal.user_id)
            .await?
        {
            SessionValidity::Active(record) => Ok(record),
            SessionValidity::Ended => Err(AuthError::SessionEnded),
            SessionValidity::Expired | SessionValidity::Unknown => Err(AuthError::SessionInvalid),
        }
    }

    /// Re-verify the password behind a lock screen and extend the session.
    ///
    /// The access token may be expired here (the client sat on the lock
    /// screen); its signature still has to check out. Lockout counting on
    /// repeated failures belongs to the credential verifier.
    ///
    /// # Errors
    /// `SessionEnded`/`SessionInvalid` per session state, then credential
    /// errors as in `login`.
    pub async fn unlock(
        &self,
        access_token: &str,
        session_id: &str,
        password: &str,
    ) -> Result<SessionRecord, AuthError> {
        let claims = self.verify_access(access_token, false)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::TokenInvalid)?;

        match self.sessions.validate(session_id, user_id).await? {
            SessionValidity::Active(_) => {}
            SessionValidity::Ended => return Err(AuthError::SessionEnded),
            SessionValidity::Expired | SessionValidity::Unknown => {
                return Err(AuthError::SessionInvalid);
            }
        }

        let verified =
            self.map_credential_outcome(self.verifier.verify_password(user_id, password).await)?;

        match self
            .sessions
            .extend_session(session_id, verified.user_id)
            .await?
        {
            SessionValidity::Active(record) => Ok(record),
            SessionValidity::Ended => Err(AuthError::SessionEnded),
            SessionValidity::Expired | SessionValidity::Unknown => Err(AuthError::SessionInvalid),
        }
    }

    /// End one session and revoke its token family.
    ///
    /// Two-phase contract: the client clears its credentials regardless;
    /// server-side revocation failures are logged, never surfaced. This call
    /// therefore cannot fail and is idempotent.
    pub async fn logout(&self, session_id: &str) {
        match self.sessions.peek(session_id).await {
            Ok(Some(record)) => {
                if let Err(err) = self.sessions.end_session(session_id).await {
                    error!("session revocation failed during logout: {err}");
                }
                if let Err(err) = self.tokens.revoke_family(record.token_family).await {
                    error!("token revocation failed during logout: {err}");
                }
                info!(user_id = %record.user_id, "logout");
            }
            Ok(None) => {}
            Err(err) => error!("session lookup failed during logout: {err}"),
        }
    }

    /// "Log out everywhere": end all of the user's sessions and token
    /// families. The caller's own session survives unless `include_current`.
    ///
    /// # Errors
    /// Returns an error only if the stores fail.
    pub async fn logout_all(
        &self,
        user_id: Uuid,
        current_session_id: &str,
        include_current: bool,
    ) -> Result<u64, AuthError> {
        let current_family = self
            .sessions
            .peek(current_session_id)
            .await?
            .map(|record| record.token_family);

        let except_session = (!include_current).then_some(current_session_id);
        let ended = self.sessions.end_all_sessions(user_id, except_session).await?;

        let except_family = if include_current { None } else { current_family };
        self.tokens.revoke_all(user_id, except_family).await?;

        if include_current {
            self.logout(current_session_id).await;
        }
        info!(user_id = %user_id, ended, include_current, "bulk logout");
        Ok(ended)
    }

    /// Factor management passthroughs for the settings screens.
    ///
    /// # Errors
    /// `SecondFactorUnavailable` when nothing is enrolled.
    pub async fn second_factor_providers(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<FactorKind>, AuthError> {
        self.two_factor.providers(user_id).await.map_err(map_two_factor)
    }

    /// # Errors
    /// Factor errors as mapped by the taxonomy.
    pub async fn enroll_totp(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> Result<TotpEnrollment, AuthError> {
        self.two_factor
            .enroll_totp(user_id, account_name)
            .await
            .map_err(map_two_factor)
    }

    /// # Errors
    /// `SecondFactorInvalid` on a wrong confirmation code.
    pub async fn enable_totp(&self, user_id: Uuid, code: &str) -> Result<(), AuthError> {
        self.two_factor
            .enable_totp(user_id, code)
            .await
            .map_err(map_two_factor)
    }

    /// # Errors
    /// Store failures only.
    pub async fn enable_email_factor(
        &self,
        user_id: Uuid,
        destination: String,
    ) -> Result<(), AuthError> {
        self.two_factor
            .enable_email(user_id, destination)
            .await
            .map_err(map_two_factor)
    }

    /// Disable all second factors. Immediate, no password re-check; the
    /// trade-off is recorded in DESIGN.md.
    ///
    /// # Errors
    /// Store failures only.
    pub async fn disable_second_factor(&self, user_id: Uuid) -> Result<(), AuthError> {
        self.two_factor.disable(user_id).await.map_err(map_two_factor)
    }

    /// # Errors
    /// `SecondFactorUnavailable` without an active factor.
    pub async fn generate_backup_codes(&self, user_id: Uuid) -> Result<Vec<String>, AuthError> {
        self.two_factor
            .generate_backup_codes(user_id)
            .await
            .map_err(map_two_factor)
    }

    async fn establish(
        &self,
        user_id: Uuid,
        fingerprint: ClientFingerprint,
    ) -> Result<AuthenticatedSession, AuthError> {
        let pair = self.tokens.issue(user_id).await?;
        let created = self
            .sessions
            .create_session(user_id, fingerprint, pair.family)
            .await?;
        Ok(AuthenticatedSession {
            tokens: pair,
            session_id: created.session_id,
            session: created.record,
        })
    }

    fn verify_access(
        &self,
        access_token: &str,
        check_expiry: bool,
    ) -> Result<crate::token::AccessTokenClaims, AuthError> {
        let config = self.tokens.config();
        let result = if check_expiry {
            self.tokens
                .signer()
                .verify(access_token, config.issuer(), config.audience(), now_unix())
        } else {
            self.tokens
                .signer()
                .verify_signature(access_token, config.issuer(), config.audience())
        };
        result.map_err(|err| match err {
            jwt::Error::Expired => AuthError::TokenExpired,
            _ => AuthError::TokenInvalid,
        })
    }

    fn map_credential_outcome(
        &self,
        outcome: CredentialOutcome,
    ) -> Result<VerifiedIdentity, AuthError> {
        match outcome {
            CredentialOutcome::Verified(verified) => Ok(verified),
            CredentialOutcome::Rejected(RejectReason::BadCredentials) => {
                Err(AuthError::InvalidCredentials)
            }
            CredentialOutcome::Rejected(RejectReason::Locked) => Err(AuthError::AccountLocked),
            CredentialOutcome::Rejected(RejectReason::EmailNotConfirmed) => {
                Err(AuthError::EmailNotConfirmed)
            }
            CredentialOutcome::Unavailable => Err(AuthError::TransientUpstream),
        }
    }

    async fn park_pending(&self, verified: &VerifiedIdentity, fingerprint: ClientFingerprint) {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, entry| entry.created_at.elapsed() < self.pending_ttl);
        pending.insert(
            verified.user_id,
            PendingLogin {
                email: verified.email.clone(),
                fingerprint,
                created_at: Instant::now(),
            },
        );
    }

    async fn peek_pending(&self, user_id: Uuid) -> Option<(String, ClientFingerprint)> {
        let pending = self.pending.lock().await;
        pending
            .get(&user_id)
            .filter(|entry| entry.created_at.elapsed() < self.pending_ttl)
            .map(|entry| (entry.email.clone(), entry.fingerprint.clone()))
    }

    async fn peek_pending_email(&self, user_id: Uuid) -> Option<String> {
        self.peek_pending(user_id).await.map(|(email, _)| email)
    }

    async fn drop_pending(&self, user_id: Uuid) {
        let mut pending = self.pending.lock().await;
        pending.remove(&user_id);
    }
}

impl std::fmt::Debug for AuthOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthOrchestrator")
            .field("pending_ttl", &self.pending_ttl)
            .finish()
    }
}

fn map_two_factor(err: TwoFactorError) -> AuthError {
    match err {
        TwoFactorError::NoProviders | TwoFactorError::NotEnrolled => {
            AuthError::SecondFactorUnavailable
        }
        TwoFactorError::NoChallenge => AuthError::SecondFactorRequired,
        TwoFactorError::Invalid | TwoFactorError::Expired => AuthError::SecondFactorInvalid,
        TwoFactorError::Exhausted => AuthError::SecondFactorExhausted,
        TwoFactorError::Internal(err) => AuthError::Internal(err),
    }
}

/// Normalize an identity for lookup; identities are email addresses here.
pub(crate) fn normalize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// Basic shape check on already-normalized input.
pub(crate) fn valid_identity(identity: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(identity))
}
