//! Token, session, and second-factor arguments.

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_session_args(command);
    with_factor_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("token-issuer")
                .long("token-issuer")
                .help("Issuer claim stamped into access tokens")
                .env("STAFFDESK_TOKEN_ISSUER")
                .default_value("https://api.staffdesk.dev"),
        )
        .arg(
            Arg::new("token-audience")
                .long("token-audience")
                .help("Audience claim stamped into access tokens")
                .env("STAFFDESK_TOKEN_AUDIENCE")
                .default_value("staffdesk-portal"),
        )
        .arg(
            Arg::new("signing-key-path")
                .long("signing-key-path")
                .help("PEM RSA private key for access-token signing; generated per process when omitted")
                .env("STAFFDESK_SIGNING_KEY_PATH"),
        )
        .arg(
            Arg::new("access-ttl-seconds")
                .long("access-ttl-seconds")
                .help("Access token lifetime in seconds")
                .env("STAFFDESK_ACCESS_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("refresh-ttl-seconds")
                .long("refresh-ttl-seconds")
                .help("Refresh token lifetime in seconds")
                .env("STAFFDESK_REFRESH_TTL_SECONDS")
                .default_value("28800")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("session-idle-seconds")
                .long("session-idle-seconds")
                .help("Idle TTL a keep-alive extends the session by")
                .env("STAFFDESK_SESSION_IDLE_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("session-max-lifetime-seconds")
                .long("session-max-lifetime-seconds")
                .help("Absolute session lifetime cap")
                .env("STAFFDESK_SESSION_MAX_LIFETIME_SECONDS")
                .default_value("43200")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("max-sessions-per-user")
                .long("max-sessions-per-user")
                .help("Concurrent sessions per user before the oldest is evicted")
                .env("STAFFDESK_MAX_SESSIONS_PER_USER")
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("frontend-base-url")
                .long("frontend-base-url")
                .help("Portal frontend origin for CORS; permissive when omitted")
                .env("STAFFDESK_FRONTEND_BASE_URL"),
        )
        .arg(
            Arg::new("payload-key")
                .long("payload-key")
                .help("Base64url 32-byte key for payload envelopes; plaintext bodies when omitted")
                .env("STAFFDESK_PAYLOAD_KEY"),
        )
}

fn with_factor_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("totp-issuer-label")
                .long("totp-issuer-label")
                .help("Issuer label shown in authenticator apps")
                .env("STAFFDESK_TOTP_ISSUER_LABEL")
                .default_value("Staffdesk"),
        )
        .arg(
            Arg::new("backup-pepper")
                .long("backup-pepper")
                .help("Server-side pepper for backup-code hashing; backup codes disabled when omitted")
                .env("STAFFDESK_BACKUP_PEPPER"),
        )
        .arg(
            Arg::new("code-ttl-seconds")
                .long("code-ttl-seconds")
                .help("Delivered second-factor code lifetime")
                .env("STAFFDESK_CODE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("code-attempts")
                .long("code-attempts")
                .help("Attempts before a delivered code becomes terminal")
                .env("STAFFDESK_CODE_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(u8)),
        )
}

#[derive(Clone, Debug)]
pub struct Options {
    pub token_issuer: String,
    pub token_audience: String,
    pub signing_key_path: Option<String>,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub session_idle_seconds: i64,
    pub session_max_lifetime_seconds: i64,
    pub max_sessions_per_user: usize,
    pub frontend_base_url: Option<String>,
    pub payload_key: Option<SecretString>,
    pub totp_issuer_label: String,
    pub backup_pepper: Option<SecretString>,
    pub code_ttl_seconds: i64,
    pub code_attempts: u8,
}

impl Options {
    /// # Errors
    /// Returns an error if a required argument is missing from the matches.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            token_issuer: matches
                .get_one::<String>("token-issuer")
                .cloned()
                .context("missing token-issuer")?,
            token_audience: matches
                .get_one::<String>("token-audience")
                .cloned()
                .context("missing token-audience")?,
            signing_key_path: matches.get_one::<String>("signing-key-path").cloned(),
            access_ttl_seconds: matches
                .get_one::<i64>("access-ttl-seconds")
                .copied()
                .context("missing access-ttl-seconds")?,
            refresh_ttl_seconds: matches
                .get_one::<i64>("refresh-ttl-seconds")
                .copied()
                .context("missing refresh-ttl-seconds")?,
            session_idle_seconds: matches
                .get_one::<i64>("session-idle-seconds")
                .copied()
                .context("missing session-idle-seconds")?,
            session_max_lifetime_seconds: matches
                .get_one::<i64>("session-max-lifetime-seconds")
                .copied()
                .context("missing session-max-lifetime-seconds")?,
            max_sessions_per_user: matches
                .get_one::<usize>("max-sessions-per-user")
                .copied()
                .context("missing max-sessions-per-user")?,
            frontend_base_url: matches.get_one::<String>("frontend-base-url").cloned(),
            payload_key: matches
                .get_one::<String>("payload-key")
                .map(|key| SecretString::from(key.clone())),
            totp_issuer_label: matches
                .get_one::<String>("totp-issuer-label")
                .cloned()
                .context("missing totp-issuer-label")?,
            backup_pepper: matches
                .get_one::<String>("backup-pepper")
                .map(|pepper| SecretString::from(pepper.clone())),
            code_ttl_seconds: matches
                .get_one::<i64>("code-ttl-seconds")
                .copied()
                .context("missing code-ttl-seconds")?,
            code_attempts: matches
                .get_one::<u8>("code-attempts")
                .copied()
                .context("missing code-attempts")?,
        })
    }
}
