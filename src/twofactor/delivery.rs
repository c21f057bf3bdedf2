//! Delivered one-time codes (email factor).

use anyhow::{Context, Result};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use tracing::info;

const CODE_DIGITS: u32 = 6;

/// Pending delivered-code challenge. Only the hash of the code is at rest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveredChallenge {
    pub code_hash: Vec<u8>,
    pub expires_at: i64,
    pub attempts_remaining: u8,
    pub destination: String,
}

/// Generate a zero-padded 6-digit code.
///
/// # Errors
/// Returns an error if the system RNG fails.
pub(super) fn generate_code() -> Result<String> {
    let mut bytes = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate delivery code")?;
    let value = u32::from_be_bytes(bytes) % 10u32.pow(CODE_DIGITS);
    Ok(format!("{value:06}"))
}

pub(super) fn hash_code(code: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(code.trim().as_bytes());
    hasher.finalize().to_vec()
}

/// Delivery seam. The portal does not own email mechanics; production wiring
/// points this at the upstream notification service.
pub trait CodeSender: Send + Sync {
    /// Deliver `code` to `destination`.
    ///
    /// # Errors
    /// Returns an error if the code could not be handed off for delivery.
    fn send(&self, destination: &str, code: &str) -> Result<()>;
}

/// Log-only sender for development and tests.
#[derive(Clone, Debug)]
pub struct LogCodeSender;

impl CodeSender for LogCodeSender {
    fn send(&self, destination: &str, code: &str) -> Result<()> {
        info!(destination = %destination, code = %code, "second-factor code delivery stub");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{CodeSender, LogCodeSender, generate_code, hash_code};

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_code().unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|ch| ch.is_ascii_digit()));
        }
    }

    #[test]
    fn hash_ignores_surrounding_whitespace() {
        assert_eq!(hash_code("123456"), hash_code(" 123456 "));
        assert_ne!(hash_code("123456"), hash_code("654321"));
    }

    #[test]
    fn log_sender_always_succeeds() {
        assert!(LogCodeSender.send("alice@example.com", "123456").is_ok());
    }
}
