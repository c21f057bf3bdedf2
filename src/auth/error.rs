//! Error taxonomy for the authentication subsystem.
//!
//! Components below the orchestrator return structured outcomes; this enum is
//! the single vocabulary the HTTP boundary translates into statuses and
//! response bodies. Only the orchestrator decides user-facing wording.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Wrong identity or wrong password; the two are indistinguishable by
    /// construction to block account enumeration.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Too many failed attempts upstream; time-boxed, user-visible.
    #[error("account locked")]
    AccountLocked,

    /// Terminal until the user confirms their address. Not a security event.
    #[error("email not confirmed")]
    EmailNotConfirmed,

    /// A challenge must be completed (or first requested) before proceeding.
    #[error("second factor required")]
    SecondFactorRequired,

    /// Wrong or expired second-factor code; retryable while attempts remain.
    #[error("second factor invalid")]
    SecondFactorInvalid,

    /// Attempt budget spent; terminal until a new challenge is issued.
    #[error("second factor exhausted")]
    SecondFactorExhausted,

    /// The user has no usable second factor.
    #[error("no second factor available")]
    SecondFactorUnavailable,

    /// The login flow state expired before 2FA completed; restart login.
    #[error("login flow expired")]
    LoginFlowExpired,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid")]
    TokenInvalid,

    /// Refresh-token replay. Forces a full re-login; presented to the user
    /// the same as any invalid token.
    #[error("token reused")]
    TokenReused,

    /// Session is unknown or expired; the caller was never (still) signed in.
    #[error("session invalid")]
    SessionInvalid,

    /// Session existed and was revoked: sign-out elsewhere, bulk logout, or
    /// eviction. Distinct so the UI can say "you were signed out".
    #[error("your session has ended")]
    SessionEnded,

    #[error("rate limited")]
    RateLimited,

    /// Upstream verification or transport failed transiently; retryable.
    #[error("upstream temporarily unavailable")]
    TransientUpstream,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Whether the error may succeed on plain retry with the same input.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientUpstream | Self::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;

    #[test]
    fn retryable_classification() {
        assert!(AuthError::TransientUpstream.is_retryable());
        assert!(AuthError::RateLimited.is_retryable());
        assert!(!AuthError::InvalidCredentials.is_retryable());
        assert!(!AuthError::TokenReused.is_retryable());
    }

    #[test]
    fn messages_do_not_leak_which_credential_failed() {
        assert_eq!(AuthError::InvalidCredentials.to_string(), "invalid credentials");
    }
}
