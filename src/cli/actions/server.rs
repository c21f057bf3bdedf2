//! Server action: build the dependency graph and serve.

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api;
use crate::auth::{
    AuthOrchestrator, CredentialVerifier, FixtureCredentialVerifier, NoopRateLimiter,
    UpstreamCredentialVerifier,
};
use crate::cli::commands::{auth, upstream};
use crate::codec::PayloadCodec;
use crate::session::{
    MemorySessionStore, SessionPolicy, SessionRegistry, SessionStore, postgres::PgSessionStore,
};
use crate::token::{
    AccessTokenSigner, MemoryRefreshTokenStore, RefreshTokenStore, TokenConfig, TokenIssuer,
    postgres::PgRefreshTokenStore,
};
use crate::twofactor::{
    LogCodeSender, MemoryTwoFactorStore, TwoFactorConfig, TwoFactorService, TwoFactorStore,
    postgres::PgTwoFactorStore,
};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth: auth::Options,
    pub upstream: upstream::Options,
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if configuration is invalid, the database cannot be
/// reached, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let codec = match &args.auth.payload_key {
        Some(key) => PayloadCodec::from_base64_key(key.expose_secret())
            .context("invalid --payload-key")?,
        None => {
            warn!("no payload key configured; request/response bodies travel in plaintext");
            PayloadCodec::disabled()
        }
    };

    let signer = match &args.auth.signing_key_path {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read signing key: {path}"))?;
            AccessTokenSigner::from_key_material(&pem, "primary")
                .context("failed to parse signing key")?
        }
        None => {
            // Per-process key: restarting invalidates outstanding access
            // tokens, which short lifetimes make tolerable.
            info!("generating ephemeral access-token signing key");
            AccessTokenSigner::generate("primary").context("failed to generate signing key")?
        }
    };

    let (session_store, refresh_store, factor_store): (
        Arc<dyn SessionStore>,
        Arc<dyn RefreshTokenStore>,
        Arc<dyn TwoFactorStore>,
    ) = if let Some(dsn) = &args.dsn {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        (
            Arc::new(PgSessionStore::new(pool.clone())),
            Arc::new(PgRefreshTokenStore::new(pool.clone())),
            Arc::new(PgTwoFactorStore::new(pool)),
        )
    } else {
        warn!("no --dsn configured; sessions and tokens are held in memory");
        (
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryRefreshTokenStore::new()),
            Arc::new(MemoryTwoFactorStore::new()),
        )
    };

    let token_config = TokenConfig::new(
        args.auth.token_issuer.clone(),
        args.auth.token_audience.clone(),
    )
    .with_access_ttl_seconds(args.auth.access_ttl_seconds)
    .with_refresh_ttl_seconds(args.auth.refresh_ttl_seconds);
    let tokens = Arc::new(TokenIssuer::new(Arc::new(signer), refresh_store, token_config));

    let session_policy = SessionPolicy::new()
        .with_idle_ttl_seconds(args.auth.session_idle_seconds)
        .with_max_lifetime_seconds(args.auth.session_max_lifetime_seconds)
        .with_max_sessions_per_user(args.auth.max_sessions_per_user);
    let sessions = Arc::new(SessionRegistry::new(session_store, session_policy));

    let mut factor_config = TwoFactorConfig::new()
        .with_issuer_label(args.auth.totp_issuer_label.clone())
        .with_code_ttl_seconds(args.auth.code_ttl_seconds)
        .with_code_attempts(args.auth.code_attempts);
    if let Some(pepper) = &args.auth.backup_pepper {
        factor_config =
            factor_config.with_backup_pepper(Arc::from(pepper.expose_secret().as_bytes()));
    } else {
        warn!("no backup pepper configured; backup codes are unavailable");
    }
    let two_factor = Arc::new(TwoFactorService::new(
        factor_store,
        Arc::new(LogCodeSender),
        codec.clone(),
        factor_config,
    ));

    let verifier: Arc<dyn CredentialVerifier> = match &args.upstream.upstream_url {
        Some(url) => {
            let client = reqwest::Client::builder()
                .user_agent(crate::APP_USER_AGENT)
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(10))
                .build()
                .context("failed to build upstream HTTP client")?;
            Arc::new(UpstreamCredentialVerifier::new(client, url.clone()))
        }
        None => {
            let fixture = FixtureCredentialVerifier::new();
            match &args.upstream.dev_account {
                Some((identity, password)) => {
                    let user_id = fixture.add_account(identity, password);
                    warn!(identity = %identity, user_id = %user_id, "fixture verifier with dev account");
                }
                None => warn!("fixture verifier with no accounts; logins will fail"),
            }
            Arc::new(fixture)
        }
    };

    let orchestrator = Arc::new(AuthOrchestrator::new(
        verifier,
        two_factor,
        tokens,
        sessions,
        Arc::new(NoopRateLimiter),
    ));

    api::serve(
        args.port,
        orchestrator,
        codec,
        args.auth.frontend_base_url.as_deref(),
    )
    .await
}
