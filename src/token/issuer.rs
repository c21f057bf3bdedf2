//! Access/refresh token pair issuance and rotation.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use ulid::Ulid;
use uuid::Uuid;

use super::jwt::{self, AccessTokenClaims, AccessTokenSigner, CLAIMS_VERSION};
use super::store::{RefreshRecord, RefreshTokenStore, SwapOutcome};

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 8 * 60 * 60;

const REFRESH_PREFIX: &str = "rt_";
const REFRESH_SECRET_LEN: usize = 32;

#[derive(Clone, Debug)]
pub struct TokenConfig {
    issuer: String,
    audience: String,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
}

impl TokenConfig {
    #[must_use]
    pub fn new(issuer: String, audience: String) -> Self {
        Self {
            issuer,
            audience,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }
}

/// Bearer credential material handed to the client on login, 2FA success,
/// and every rotation. The client persists each piece independently.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub user_id: Uuid,
    pub family: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: i64,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The pair does not correspond to a known issuance.
    #[error("invalid token")]
    Invalid,
    /// The refresh token is past its lifetime.
    #[error("refresh token expired")]
    Expired,
    /// The refresh token was already rotated away. The caller must force a
    /// full re-authentication.
    #[error("refresh token reused")]
    Reused,
    #[error("token signing failed")]
    Signing(#[source] jwt::Error),
    #[error("token store unavailable")]
    Store(#[source] anyhow::Error),
}

/// Mints token pairs and rotates refresh tokens.
pub struct TokenIssuer {
    signer: Arc<AccessTokenSigner>,
    store: Arc<dyn RefreshTokenStore>,
    config: TokenConfig,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(
        signer: Arc<AccessTokenSigner>,
        store: Arc<dyn RefreshTokenStore>,
        config: TokenConfig,
    ) -> Self {
        Self {
            signer,
            store,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    #[must_use]
    pub fn signer(&self) -> &AccessTokenSigner {
        &self.signer
    }

    /// Mint a fresh pair for `user_id`, opening a new refresh-token family.
    ///
    /// # Errors
    /// Returns an error if access-token signing or store insertion fails.
    pub async fn issue(&self, user_id: Uuid) -> Result<TokenPair> {
        self.issue_at(user_id, now_unix()).await
    }

    pub(crate) async fn issue_at(&self, user_id: Uuid, now: i64) -> Result<TokenPair> {
        let family = Uuid::new_v4();
        let minted = self
            .mint(user_id, family, now)
            .context("failed to sign access token")?;

        self.store
            .insert(RefreshRecord {
                family,
                user_id,
                current_hash: minted.secret_hash,
                access_jti: minted.jti,
                issued_at: now,
                expires_at: minted.pair.refresh_expires_at,
            })
            .await
            .context("failed to store refresh token family")?;

        Ok(minted.pair)
    }

    /// Redeem a refresh token for a new pair, rotating the family.
    ///
    /// Safe under concurrent callers presenting the same stale token: the
    /// store-level compare-and-swap lets exactly one rotation win, and every
    /// loser observes [`RefreshError::Reused`].
    ///
    /// # Errors
    /// [`RefreshError::Invalid`] when the pair does not match a known
    /// issuance, [`RefreshError::Expired`] past the refresh lifetime, and
    /// [`RefreshError::Reused`] when the token was already rotated away.
    pub async fn refresh(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<TokenPair, RefreshError> {
        self.refresh_at(access_token, refresh_token, now_unix()).await
    }

    pub(crate) async fn refresh_at(
        &self,
        access_token: &str,
        refresh_token: &str,
        now: i64,
    ) -> Result<TokenPair, RefreshError> {
        let (family, presented_secret) =
            parse_refresh_token(refresh_token).ok_or(RefreshError::Invalid)?;

        // The access token may be expired; its signature and family binding
        // must still hold for the pair to count as one issuance.
        let claims = self
            .signer
            .verify_signature(access_token, self.config.issuer(), self.config.audience())
            .map_err(|_| RefreshError::Invalid)?;
        if claims.fam != family.to_string() {
            return Err(RefreshError::Invalid);
        }
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| RefreshError::Invalid)?;

        let record = self
            .store
            .get(family)
            .await
            .map_err(RefreshError::Store)?
            .ok_or(RefreshError::Invalid)?;
        if record.user_id != user_id {
            return Err(RefreshError::Invalid);
        }
        if now >= record.expires_at {
            return Err(RefreshError::Expired);
        }

        let minted = self
            .mint(user_id, family, now)
            .map_err(RefreshError::Signing)?;

        let outcome = self
            .store
            .compare_and_swap(
                family,
                &hash_refresh_secret(&presented_secret),
                minted.secret_hash,
                minted.jti,
                minted.pair.refresh_expires_at,
            )
            .await
            .map_err(RefreshError::Store)?;

        match outcome {
            SwapOutcome::Rotated => Ok(minted.pair),
            SwapOutcome::Reused => {
                // Distinguishable internally for audit; callers surface it to
                // the user the same way as any invalid token.
                warn!(user_id = %user_id, family = %family, "refresh token replay detected");
                Err(RefreshError::Reused)
            }
            SwapOutcome::Missing => Err(RefreshError::Invalid),
        }
    }

    /// Revoke one family (logout of one session).
    ///
    /// # Errors
    /// Returns an error if the store is unavailable.
    pub async fn revoke_family(&self, family: Uuid) -> Result<()> {
        self.store.remove(family).await
    }

    /// Revoke every family for the user, optionally sparing one.
    ///
    /// # Errors
    /// Returns an error if the store is unavailable.
    pub async fn revoke_all(&self, user_id: Uuid, except: Option<Uuid>) -> Result<()> {
        self.store.remove_for_user(user_id, except).await
    }

    fn mint(&self, user_id: Uuid, family: Uuid, now: i64) -> Result<Minted, jwt::Error> {
        let access_expires_at = now + self.config.access_ttl_seconds();
        let refresh_expires_at = now + self.config.refresh_ttl_seconds();

        let jti = Ulid::new().to_string();
        let claims = AccessTokenClaims {
            v: CLAIMS_VERSION,
            iss: self.config.issuer().to_string(),
            aud: self.config.audience().to_string(),
            sub: user_id.to_string(),
            fam: family.to_string(),
            iat: now,
            exp: access_expires_at,
            jti: jti.clone(),
        };
        let access_token = self.signer.sign(&claims)?;

        let mut secret = [0u8; REFRESH_SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        let refresh_token = format!(
            "{REFRESH_PREFIX}{family}.{}",
            URL_SAFE_NO_PAD.encode(secret)
        );

        Ok(Minted {
            pair: TokenPair {
                user_id,
                family,
                access_token,
                refresh_token,
                issued_at: now,
                access_expires_at,
                refresh_expires_at,
            },
            secret_hash: hash_refresh_secret(&secret),
            jti,
        })
    }
}

struct Minted {
    pair: TokenPair,
    secret_hash: Vec<u8>,
    jti: String,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("kid", &self.signer.kid())
            .field("config", &self.config)
            .finish()
    }
}

/// Split `rt_<family>.<secret>` into its parts.
fn parse_refresh_token(token: &str) -> Option<(Uuid, Vec<u8>)> {
    let rest = token.strip_prefix(REFRESH_PREFIX)?;
    let (family_str, secret_b64) = rest.split_once('.')?;
    let family = Uuid::parse_str(family_str).ok()?;
    let secret = URL_SAFE_NO_PAD.decode(secret_b64).ok()?;
    if secret.len() != REFRESH_SECRET_LEN {
        return None;
    }
    Some((family, secret))
}

/// Refresh secrets are stored hashed; raw values never touch the store.
fn hash_refresh_secret(secret: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.finalize().to_vec()
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::jwt::AccessTokenSigner;
    use super::super::store::MemoryRefreshTokenStore;
    use super::{RefreshError, TokenConfig, TokenIssuer, parse_refresh_token};
    use std::sync::{Arc, OnceLock};
    use uuid::Uuid;

    const NOW: i64 = 1_750_000_000;

    fn signer() -> Arc<AccessTokenSigner> {
        static SIGNER: OnceLock<Arc<AccessTokenSigner>> = OnceLock::new();
        SIGNER
            .get_or_init(|| Arc::new(AccessTokenSigner::generate("issuer-test").unwrap()))
            .clone()
    }

    fn issuer() -> TokenIssuer {
        let config = TokenConfig::new(
            "https://api.staffdesk.test".to_string(),
            "staffdesk-portal".to_string(),
        );
        TokenIssuer::new(signer(), Arc::new(MemoryRefreshTokenStore::new()), config)
    }

    #[tokio::test]
    async fn issue_mints_verifiable_pair() {
        let issuer = issuer();
        let user = Uuid::new_v4();
        let pair = issuer.issue_at(user, NOW).await.unwrap();

        let claims = issuer
            .signer()
            .verify(
                &pair.access_token,
                "https://api.staffdesk.test",
                "staffdesk-portal",
                NOW,
            )
            .unwrap();
        assert_eq!(claims.sub, user.to_string());
        assert_eq!(claims.fam, pair.family.to_string());

        let (family, _secret) = parse_refresh_token(&pair.refresh_token).unwrap();
        assert_eq!(family, pair.family);
    }

    #[tokio::test]
    async fn refresh_rotates_and_keeps_family() {
        let issuer = issuer();
        let user = Uuid::new_v4();
        let pair = issuer.issue_at(user, NOW).await.unwrap();

        let rotated = issuer
            .refresh_at(&pair.access_token, &pair.refresh_token, NOW + 30)
            .await
            .unwrap();
        assert_eq!(rotated.family, pair.family);
        assert_ne!(rotated.refresh_token, pair.refresh_token);
        assert_ne!(rotated.access_token, pair.access_token);
    }

    #[tokio::test]
    async fn stale_refresh_token_reports_reused() {
        let issuer = issuer();
        let user = Uuid::new_v4();
        let pair = issuer.issue_at(user, NOW).await.unwrap();

        let rotated = issuer
            .refresh_at(&pair.access_token, &pair.refresh_token, NOW + 30)
            .await
            .unwrap();

        // Redeeming the superseded token must fail as a replay.
        let result = issuer
            .refresh_at(&pair.access_token, &pair.refresh_token, NOW + 60)
            .await;
        assert!(matches!(result, Err(RefreshError::Reused)));

        // The winner's token still works.
        let again = issuer
            .refresh_at(&rotated.access_token, &rotated.refresh_token, NOW + 90)
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn concurrent_refresh_has_exactly_one_winner() {
        let issuer = Arc::new(issuer());
        let user = Uuid::new_v4();
        let pair = issuer.issue_at(user, NOW).await.unwrap();

        let (a, b) = tokio::join!(
            issuer.refresh_at(&pair.access_token, &pair.refresh_token, NOW + 10),
            issuer.refresh_at(&pair.access_token, &pair.refresh_token, NOW + 10),
        );

        let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "exactly one refresh may rotate");
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(RefreshError::Reused)));
    }

    #[tokio::test]
    async fn refresh_rejects_mismatched_pair() {
        let issuer = issuer();
        let alice = issuer.issue_at(Uuid::new_v4(), NOW).await.unwrap();
        let bob = issuer.issue_at(Uuid::new_v4(), NOW).await.unwrap();

        // Alice's access token with Bob's refresh token is not one issuance.
        let result = issuer
            .refresh_at(&alice.access_token, &bob.refresh_token, NOW + 10)
            .await;
        assert!(matches!(result, Err(RefreshError::Invalid)));
    }

    #[tokio::test]
    async fn refresh_rejects_expired_family() {
        let issuer = issuer();
        let pair = issuer.issue_at(Uuid::new_v4(), NOW).await.unwrap();

        let result = issuer
            .refresh_at(
                &pair.access_token,
                &pair.refresh_token,
                pair.refresh_expires_at,
            )
            .await;
        assert!(matches!(result, Err(RefreshError::Expired)));
    }

    #[tokio::test]
    async fn revoked_family_is_invalid() {
        let issuer = issuer();
        let pair = issuer.issue_at(Uuid::new_v4(), NOW).await.unwrap();
        issuer.revoke_family(pair.family).await.unwrap();

        let result = issuer
            .refresh_at(&pair.access_token, &pair.refresh_token, NOW + 10)
            .await;
        assert!(matches!(result, Err(RefreshError::Invalid)));
    }

    #[tokio::test]
    async fn garbage_refresh_tokens_are_invalid() {
        let issuer = issuer();
        let pair = issuer.issue_at(Uuid::new_v4(), NOW).await.unwrap();

        for bad in ["", "rt_", "rt_not-a-uuid.abc", "no-prefix.abc"] {
            let result = issuer.refresh_at(&pair.access_token, bad, NOW + 10).await;
            assert!(matches!(result, Err(RefreshError::Invalid)), "input: {bad:?}");
        }
    }
}
