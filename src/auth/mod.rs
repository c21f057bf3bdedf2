//! Authentication use cases and their error taxonomy.

pub mod error;
pub mod orchestrator;
pub mod rate_limit;
pub mod verifier;

pub use error::AuthError;
pub use orchestrator::{AuthOrchestrator, AuthenticatedSession, LoginOutcome, Principal};
pub use rate_limit::{NoopRateLimiter, RateLimitAction, RateLimitDecision, RateLimiter};
pub use verifier::{
    CredentialOutcome, CredentialVerifier, FixtureCredentialVerifier, RejectReason,
    UpstreamCredentialVerifier, VerifiedIdentity,
};
