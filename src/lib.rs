//! # Staffdesk (employee self-service portal)
//!
//! `staffdesk` is the authentication and session-lifecycle tier of an
//! employee self-service portal. The business screens (employee records,
//! leave, payroll, dashboards) live upstream; this service owns who is
//! signed in, on which device, and with what credential material.
//!
//! ## Credential model
//!
//! A successful login yields three independently expiring credentials:
//!
//! - **Access token**: short-lived RS256 JWT; validity is a pure function
//!   of signature and expiry.
//! - **Refresh token**: opaque, single-redemption, rotated on every use.
//!   Replay of a rotated token is detected and forces a full re-login.
//! - **Session id**: opaque handle to a server-tracked session record,
//!   echoed in the `X-Session-Id` header; used for concurrent-session
//!   control and forced sign-out, independent of token validity.
//!
//! ## Transport encryption
//!
//! Request and response bodies may be wrapped in an authenticated-encryption
//! envelope ([`codec::PayloadCodec`]). The codec degrades rather than fails:
//! misconfigured peers fall back to plaintext and the mismatch surfaces as a
//! JSON parse error, never as a crash.
//!
//! ## Failure philosophy
//!
//! Components return structured outcomes; only [`auth::AuthOrchestrator`]
//! maps them to user-facing errors. Login failures are shape-uniform to
//! block account enumeration, and a revoked session is reported as "your
//! session has ended", distinct from "you were never signed in".

pub mod api;
pub mod auth;
pub mod cli;
pub mod codec;
pub mod session;
pub mod token;
pub mod transport;
pub mod twofactor;

/// Header carrying the session identifier both ways.
pub const SESSION_HEADER: &str = "x-session-id";

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
