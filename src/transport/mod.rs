//! Resilient client transport for the portal API.
//!
//! This module keeps outbound connectivity logic in one place so callers can
//! share request construction, timeouts, retry, and error handling. Bodies
//! are encrypted through the payload codec transparently; the access token
//! and session identifier ride along on every authenticated call.
//!
//! Flow Overview:
//! - `request` sends one logical call: encrypt, attach credentials, send.
//! - Connect errors, timeouts, and 5xx responses are transient: retried with
//!   exponential backoff and counted by the circuit breaker.
//! - A 401 triggers exactly one refresh-then-retry. The refresh itself is
//!   single-flight: concurrent 401s collapse onto one rotation, latecomers
//!   reuse the winner's credentials.
//! - A refresh rejection drops the credential bundle; the caller must send
//!   the user back through login.

pub mod breaker;

use anyhow::{Context, anyhow, bail};
use rand::Rng;
use reqwest::{
    Method, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::SESSION_HEADER;
use crate::codec::PayloadCodec;

pub use breaker::{BreakerState, CircuitBreaker};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(200);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(5);
const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

const REFRESH_PATH: &str = "/v1/auth/refresh-token";

#[derive(Clone, Debug)]
pub struct TransportConfig {
    base_url: String,
    request_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
}

impl TransportConfig {
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            breaker_cooldown: DEFAULT_BREAKER_COOLDOWN,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    #[must_use]
    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// The client-held credential triple. Each piece expires on its own; logout
/// clears all three together.
#[derive(Clone, Debug)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The breaker is open; the call was rejected without an attempt.
    #[error("portal API circuit open")]
    CircuitOpen,
    /// Network/5xx-class failure that outlived the retry budget.
    #[error("transient transport failure")]
    Transient(#[source] anyhow::Error),
    /// The refresh path gave up: credentials are gone, log in again.
    #[error("re-authentication required")]
    ReauthenticationRequired,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// A completed call: HTTP status plus the decoded (decrypted) body.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    /// Parse the body as JSON.
    ///
    /// # Errors
    /// Returns an error if the body is not valid JSON, which is also how a
    /// caller notices that decryption degraded to pass-through.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<T> {
        serde_json::from_str(&self.body).context("response body is not valid JSON")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    access_expires_at: Option<i64>,
    #[serde(default)]
    refresh_expires_at: Option<i64>,
}

pub struct ResilientTransport {
    client: reqwest::Client,
    codec: PayloadCodec,
    config: TransportConfig,
    breaker: CircuitBreaker,
    credentials: RwLock<Option<CredentialBundle>>,
    refresh_lock: Mutex<()>,
}

impl ResilientTransport {
    /// Build a transport against the configured base URL.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: TransportConfig, codec: PayloadCodec) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        Ok(Self {
            client,
            codec,
            config,
            breaker,
            credentials: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    pub async fn set_credentials(&self, bundle: CredentialBundle) {
        let mut credentials = self.credentials.write().await;
        *credentials = Some(bundle);
    }

    /// Local credential clearing always succeeds, regardless of what the
    /// server later says about revocation.
    pub async fn clear_credentials(&self) {
        let mut credentials = self.credentials.write().await;
        *credentials = None;
    }

    pub async fn credentials(&self) -> Option<CredentialBundle> {
        self.credentials.read().await.clone()
    }

    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// One logical API call with the configured timeout.
    ///
    /// # Errors
    /// See [`TransportError`]; non-2xx statuses other than the handled 401
    /// are returned as `Ok` responses for the caller to interpret.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, TransportError> {
        self.request_with_timeout(method, path, body, self.config.request_timeout)
            .await
    }

    /// One logical API call with a caller-specified timeout. A timeout is a
    /// transient failure, never an authorization signal.
    ///
    /// # Errors
    /// See [`TransportError`].
    pub async fn request_with_timeout(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<ApiResponse, TransportError> {
        if !path.starts_with('/') {
            return Err(TransportError::InvalidRequest(format!(
                "path must start with /: {path}"
            )));
        }

        let mut attempted_refresh = false;
        let mut transient_attempts = 0u32;
        loop {
            if !self.breaker.try_acquire() {
                return Err(TransportError::CircuitOpen);
            }

            match self.send_once(method.clone(), path, body, timeout).await {
                Ok(response) => {
                    self.breaker.record_success();
                    let has_credentials = self.credentials.read().await.is_some();
                    if response.status == StatusCode::UNAUTHORIZED
                        && !attempted_refresh
                        && has_credentials
                        && path != REFRESH_PATH
                    {
                        attempted_refresh = true;
                        debug!("401 received, attempting token refresh");
                        self.refresh_credentials().await?;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    self.breaker.record_failure();
                    transient_attempts += 1;
                    if transient_attempts >= self.config.max_attempts {
                        return Err(TransportError::Transient(err));
                    }
                    let delay = self.backoff_delay(transient_attempts);
                    warn!(
                        attempt = transient_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient transport failure, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> anyhow::Result<ApiResponse> {
        let url = format!("{}{path}", self.config.base_url);
        let mut request = self
            .client
            .request(method, &url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json");

        if let Some(bundle) = self.credentials.read().await.as_ref() {
            request = request
                .header(AUTHORIZATION, format!("Bearer {}", bundle.access_token))
                .header(SESSION_HEADER, bundle.session_id.clone());
        }
        if let Some(body) = body {
            let plaintext = serde_json::to_string(body).context("failed to encode request body")?;
            request = request.body(self.codec.encrypt(&plaintext));
        }

        let response = request.send().await.context("request failed")?;
        let status = response.status();
        if status.is_server_error() {
            bail!("server error: {status}");
        }
        let raw = response.text().await.context("failed to read response body")?;
        Ok(ApiResponse {
            status,
            body: self.codec.decrypt(&raw),
        })
    }

    /// Redeem the refresh token once, single-flight across callers.
    async fn refresh_credentials(&self) -> Result<(), TransportError> {
        let stale_access = match self.credentials.read().await.as_ref() {
            Some(bundle) => bundle.access_token.clone(),
            None => return Err(TransportError::ReauthenticationRequired),
        };

        let _guard = self.refresh_lock.lock().await;

        // A concurrent caller may have rotated while we waited on the lock.
        let current = match self.credentials.read().await.clone() {
            Some(bundle) => bundle,
            None => return Err(TransportError::ReauthenticationRequired),
        };
        if current.access_token != stale_access {
            debug!("credentials already rotated by a concurrent refresh");
            return Ok(());
        }

        let body = serde_json::json!({
            "accessToken": current.access_token,
            "refreshToken": current.refresh_token,
        });
        let response = self
            .send_once(
                Method::POST,
                REFRESH_PATH,
                Some(&body),
                self.config.request_timeout,
            )
            .await
            .map_err(TransportError::Transient)?;

        if !response.status.is_success() {
            // Stale, reused, or expired: every outcome here means the stored
            // bundle is dead. Drop it and send the user back to login.
            warn!(status = %response.status, "token refresh rejected");
            self.clear_credentials().await;
            return Err(TransportError::ReauthenticationRequired);
        }

        let parsed: RefreshBody = response
            .json()
            .map_err(|err| TransportError::Transient(anyhow!(err)))?;
        let mut credentials = self.credentials.write().await;
        if let Some(bundle) = credentials.as_mut() {
            bundle.access_token = parsed.access_token;
            bundle.refresh_token = parsed.refresh_token;
            if let Some(expires) = parsed.access_expires_at {
                bundle.access_expires_at = expires;
            }
            if let Some(expires) = parsed.refresh_expires_at {
                bundle.refresh_expires_at = expires;
            }
        }
        info!("access token refreshed");
        Ok(())
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.backoff_cap);
        // Up to 50% jitter keeps concurrent retries from stampeding.
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

impl std::fmt::Debug for ResilientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientTransport")
            .field("base_url", &self.config.base_url)
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{CredentialBundle, PayloadCodec, ResilientTransport, TransportConfig, TransportError};
    use reqwest::Method;
    use std::time::Duration;

    fn transport(base_url: &str) -> ResilientTransport {
        let config = TransportConfig::new(base_url.to_string())
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
            .with_breaker(2, Duration::from_secs(30));
        ResilientTransport::new(config, PayloadCodec::disabled()).expect("client should build")
    }

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            session_id: "sid".to_string(),
            access_expires_at: 0,
            refresh_expires_at: 0,
        }
    }

    #[tokio::test]
    async fn rejects_relative_paths() {
        let transport = transport("http://127.0.0.1:9");
        let result = transport.request(Method::GET, "health", None).await;
        assert!(matches!(result, Err(TransportError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn unreachable_host_exhausts_retries_and_opens_breaker() {
        // Port 9 (discard) is unroutable for HTTP; every attempt fails fast.
        let transport = transport("http://127.0.0.1:9");

        let result = transport.request(Method::GET, "/health", None).await;
        assert!(matches!(result, Err(TransportError::Transient(_))));

        // Two failed attempts tripped the threshold-2 breaker.
        let result = transport.request(Method::GET, "/health", None).await;
        assert!(matches!(result, Err(TransportError::CircuitOpen)));
    }

    #[tokio::test]
    async fn credentials_are_cleared_locally_without_a_server() {
        let transport = transport("http://127.0.0.1:9");
        transport.set_credentials(bundle()).await;
        assert!(transport.credentials().await.is_some());
        transport.clear_credentials().await;
        assert!(transport.credentials().await.is_none());
    }
}
