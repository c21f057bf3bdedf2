//! Upstream HR API arguments.

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("upstream-url")
                .long("upstream-url")
                .help("Base URL of the HR API used for credential verification")
                .long_help(
                    "Base URL of the HR API used for credential verification. When omitted, an \
                     in-memory fixture verifier is used; seed it with --dev-account.",
                )
                .env("STAFFDESK_UPSTREAM_URL"),
        )
        .arg(
            Arg::new("dev-account")
                .long("dev-account")
                .help("identity:password pair seeded into the fixture verifier (dev only)")
                .env("STAFFDESK_DEV_ACCOUNT")
                .conflicts_with("upstream-url"),
        )
}

#[derive(Clone, Debug)]
pub struct Options {
    pub upstream_url: Option<String>,
    pub dev_account: Option<(String, String)>,
}

impl Options {
    /// # Errors
    /// Returns an error if `--dev-account` is not `identity:password` shaped.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let dev_account = matches
            .get_one::<String>("dev-account")
            .map(|raw| {
                raw.split_once(':')
                    .map(|(identity, password)| (identity.to_string(), password.to_string()))
                    .ok_or_else(|| anyhow::anyhow!("--dev-account must be identity:password"))
            })
            .transpose()?;

        Ok(Self {
            upstream_url: matches.get_one::<String>("upstream-url").cloned(),
            dev_account,
        })
    }
}
