//! Credential verification boundary.
//!
//! Passwords live in the upstream HR system; the portal only asks "are these
//! credentials good" and receives a structured outcome. Lockout counting is
//! upstream's job too, this side merely relays the state.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Identity established by a successful credential check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: Uuid,
    pub email: String,
}

/// Why a credential check did not verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Unknown identity or wrong password. One variant on purpose.
    BadCredentials,
    Locked,
    EmailNotConfirmed,
}

/// Structured outcome; verifiers never raise on policy failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialOutcome {
    Verified(VerifiedIdentity),
    Rejected(RejectReason),
    /// The upstream could not be reached; retryable, says nothing about the
    /// credentials themselves.
    Unavailable,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Check identity + password at login time.
    async fn verify(&self, identity: &str, password: &str) -> CredentialOutcome;

    /// Re-check the password of an already-identified user (unlock path).
    async fn verify_password(&self, user_id: Uuid, password: &str) -> CredentialOutcome;
}

/// Calls the upstream HR API's verification endpoint.
pub struct UpstreamCredentialVerifier {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    user_id: Uuid,
    email: String,
}

impl UpstreamCredentialVerifier {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_verify(&self, path: &str, body: serde_json::Value) -> CredentialOutcome {
        let url = format!("{}{path}", self.base_url);
        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("credential verification unreachable: {err}");
                return CredentialOutcome::Unavailable;
            }
        };

        match response.status().as_u16() {
            200 => match response.json::<VerifyResponse>().await {
                Ok(verified) => CredentialOutcome::Verified(VerifiedIdentity {
                    user_id: verified.user_id,
                    email: verified.email,
                }),
                Err(err) => {
                    warn!("credential verification returned malformed body: {err}");
                    CredentialOutcome::Unavailable
                }
            },
            401 | 404 => CredentialOutcome::Rejected(RejectReason::BadCredentials),
            423 => CredentialOutcome::Rejected(RejectReason::Locked),
            403 => CredentialOutcome::Rejected(RejectReason::EmailNotConfirmed),
            status if (500..600).contains(&status) => {
                warn!("credential verification failed upstream with {status}");
                CredentialOutcome::Unavailable
            }
            status => {
                warn!("credential verification returned unexpected {status}");
                CredentialOutcome::Rejected(RejectReason::BadCredentials)
            }
        }
    }
}

#[async_trait]
impl CredentialVerifier for UpstreamCredentialVerifier {
    async fn verify(&self, identity: &str, password: &str) -> CredentialOutcome {
        self.post_verify(
            "/identity/verify",
            serde_json::json!({ "identity": identity, "password": password }),
        )
        .await
    }

    async fn verify_password(&self, user_id: Uuid, password: &str) -> CredentialOutcome {
        self.post_verify(
            "/identity/verify-password",
            serde_json::json!({ "userId": user_id, "password": password }),
        )
        .await
    }
}

/// In-memory verifier for tests and local bring-up. Tracks failed attempts
/// and locks an account after the cap, mimicking the upstream counter.
pub struct FixtureCredentialVerifier {
    accounts: Mutex<HashMap<String, FixtureAccount>>,
    lockout_cap: u8,
}

#[derive(Clone, Debug)]
struct FixtureAccount {
    user_id: Uuid,
    password: String,
    email_confirmed: bool,
    failed_attempts: u8,
    locked: bool,
}

impl FixtureCredentialVerifier {
    const DEFAULT_LOCKOUT_CAP: u8 = 5;

    #[must_use]
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            lockout_cap: Self::DEFAULT_LOCKOUT_CAP,
        }
    }

    /// Register an account; returns its generated user id.
    pub fn add_account(&self, identity: &str, password: &str) -> Uuid {
        self.add_account_with(identity, password, true)
    }

    pub fn add_account_with(&self, identity: &str, password: &str, email_confirmed: bool) -> Uuid {
        let user_id = Uuid::new_v4();
        let mut accounts = self.accounts.lock().unwrap_or_else(|err| err.into_inner());
        accounts.insert(
            identity.to_lowercase(),
            FixtureAccount {
                user_id,
                password: password.to_string(),
                email_confirmed,
                failed_attempts: 0,
                locked: false,
            },
        );
        user_id
    }

    fn check(&self, identity: &str, password: &str) -> CredentialOutcome {
        let mut accounts = self.accounts.lock().unwrap_or_else(|err| err.into_inner());
        let Some(account) = accounts.get_mut(&identity.to_lowercase()) else {
            // Unknown identity: same outcome as a wrong password.
            return CredentialOutcome::Rejected(RejectReason::BadCredentials);
        };
        if account.locked {
            return CredentialOutcome::Rejected(RejectReason::Locked);
        }
        if account.password != password {
            account.failed_attempts += 1;
            if account.failed_attempts >= self.lockout_cap {
                account.locked = true;
            }
            return CredentialOutcome::Rejected(RejectReason::BadCredentials);
        }
        account.failed_attempts = 0;
        if !account.email_confirmed {
            return CredentialOutcome::Rejected(RejectReason::EmailNotConfirmed);
        }
        CredentialOutcome::Verified(VerifiedIdentity {
            user_id: account.user_id,
            email: identity.to_lowercase(),
        })
    }
}

impl Default for FixtureCredentialVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialVerifier for FixtureCredentialVerifier {
    async fn verify(&self, identity: &str, password: &str) -> CredentialOutcome {
        self.check(identity, password)
    }

    async fn verify_password(&self, user_id: Uuid, password: &str) -> CredentialOutcome {
        let identity = {
            let accounts = self.accounts.lock().unwrap_or_else(|err| err.into_inner());
            accounts
                .iter()
                .find(|(_, account)| account.user_id == user_id)
                .map(|(identity, _)| identity.clone())
        };
        match identity {
            Some(identity) => self.check(&identity, password),
            None => CredentialOutcome::Rejected(RejectReason::BadCredentials),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialOutcome, CredentialVerifier, FixtureCredentialVerifier, RejectReason};

    #[tokio::test]
    async fn unknown_identity_and_wrong_password_are_identical() {
        let verifier = FixtureCredentialVerifier::new();
        verifier.add_account("alice@example.com", "correct horse");

        let unknown = verifier.verify("nobody@example.com", "whatever").await;
        let wrong = verifier.verify("alice@example.com", "battery staple").await;
        assert_eq!(unknown, wrong);
        assert_eq!(
            unknown,
            CredentialOutcome::Rejected(RejectReason::BadCredentials)
        );
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_account() {
        let verifier = FixtureCredentialVerifier::new();
        let user_id = verifier.add_account("bob@example.com", "hunter2");

        for _ in 0..5 {
            verifier.verify("bob@example.com", "wrong").await;
        }
        let outcome = verifier.verify("bob@example.com", "hunter2").await;
        assert_eq!(outcome, CredentialOutcome::Rejected(RejectReason::Locked));

        // The unlock path sees the same lockout.
        let outcome = verifier.verify_password(user_id, "hunter2").await;
        assert_eq!(outcome, CredentialOutcome::Rejected(RejectReason::Locked));
    }

    #[tokio::test]
    async fn unconfirmed_email_is_its_own_outcome() {
        let verifier = FixtureCredentialVerifier::new();
        verifier.add_account_with("carol@example.com", "pw", false);

        let outcome = verifier.verify("carol@example.com", "pw").await;
        assert_eq!(
            outcome,
            CredentialOutcome::Rejected(RejectReason::EmailNotConfirmed)
        );
    }

    #[tokio::test]
    async fn successful_login_resets_the_counter() {
        let verifier = FixtureCredentialVerifier::new();
        verifier.add_account("dave@example.com", "pw");

        for _ in 0..4 {
            verifier.verify("dave@example.com", "wrong").await;
        }
        assert!(matches!(
            verifier.verify("dave@example.com", "pw").await,
            CredentialOutcome::Verified(_)
        ));
        // Four more failures allowed again before lockout.
        for _ in 0..4 {
            verifier.verify("dave@example.com", "wrong").await;
        }
        assert!(matches!(
            verifier.verify("dave@example.com", "pw").await,
            CredentialOutcome::Verified(_)
        ));
    }
}
