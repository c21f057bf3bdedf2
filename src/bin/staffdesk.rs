use anyhow::{Context, Result};
use rustls::crypto::ring;
use staffdesk::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Both reqwest and sqlx link rustls; pin one crypto provider up front.
    ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))
        .context("TLS crypto provider initialization failed")?;

    let action = cli::start()?;

    action.execute().await?;

    Ok(())
}
