//! Single-use backup codes.
//!
//! The fallback factor when the authenticator app or inbox is unavailable.
//! Codes are Argon2id-hashed with a server-side pepper; the plaintext batch is
//! shown to the user exactly once at generation time.

use anyhow::{Context, Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::{RngCore, rngs::OsRng};

pub(super) const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP: usize = 4;
// No I/O/0/1: codes get read over the phone to the help desk.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// One freshly generated batch: plaintext for the user, hashes for the store.
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub codes: Vec<String>,
    pub hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// Generate a full batch under the given pepper.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn generate(pepper: &[u8]) -> Result<Self> {
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = random_code();
            hashes.push(hash_backup_code(&code, pepper)?);
            codes.push(code);
        }
        Ok(Self { codes, hashes })
    }
}

/// Strip separators, uppercase, and validate shape.
///
/// # Errors
/// Returns an error for anything that cannot be a backup code.
pub fn normalize_backup_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow!("invalid backup code length"));
    }
    if !normalized
        .bytes()
        .all(|byte| BACKUP_CODE_ALPHABET.contains(&byte))
    {
        return Err(anyhow!("invalid backup code characters"));
    }
    Ok(normalized)
}

/// Quick shape test so `verify_code` can route input without consuming a
/// delivered-code attempt on something that is clearly a backup code.
#[must_use]
pub(super) fn looks_like_backup_code(input: &str) -> bool {
    normalize_backup_code(input).is_ok()
}

/// Check `code` against a stored hash.
///
/// # Errors
/// Returns an error when the input is malformed or the stored hash is not a
/// valid Argon2 string.
pub fn verify_backup_code(code: &str, stored_hash: &str, pepper: &[u8]) -> Result<bool> {
    let normalized = normalize_backup_code(code)?;
    let parsed =
        PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid backup code hash"))?;
    Ok(peppered_argon2(pepper)?
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok())
}

fn random_code() -> String {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    OsRng.fill_bytes(&mut raw);
    let body: String = raw
        .iter()
        .map(|byte| {
            let idx = usize::from(*byte) % BACKUP_CODE_ALPHABET.len();
            BACKUP_CODE_ALPHABET[idx] as char
        })
        .collect();
    // Grouped for readability: XXXX-XXXX-XXXX.
    body.as_bytes()
        .chunks(BACKUP_CODE_GROUP)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-")
}

fn hash_backup_code(code: &str, pepper: &[u8]) -> Result<String> {
    let normalized = normalize_backup_code(code)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = peppered_argon2(pepper)?
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash backup code"))?
        .to_string();
    Ok(hash)
}

fn peppered_argon2(pepper: &[u8]) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper,
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::default(),
    )
    .map_err(|_| anyhow!("failed to initialize Argon2id"))
    .context("backup code hashing unavailable")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::{
        BACKUP_CODE_COUNT, BackupCodeBatch, looks_like_backup_code, normalize_backup_code,
        verify_backup_code,
    };

    const PEPPER: &[u8] = b"test-pepper";

    #[test]
    fn batch_has_full_count_of_grouped_codes() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        assert_eq!(batch.codes.len(), BACKUP_CODE_COUNT);
        assert_eq!(batch.hashes.len(), BACKUP_CODE_COUNT);
        for code in &batch.codes {
            assert_eq!(code.len(), 14, "XXXX-XXXX-XXXX: {code}");
            assert!(looks_like_backup_code(code));
        }
    }

    #[test]
    fn normalize_accepts_sloppy_input() {
        assert_eq!(
            normalize_backup_code(" abcd-efgh jklm ").unwrap(),
            "ABCDEFGHJKLM"
        );
        assert!(normalize_backup_code("too-short").is_err());
        assert!(normalize_backup_code("ABCD-EFGH-JKL0").is_err());
    }

    #[test]
    fn verify_matches_only_its_own_code() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        assert!(verify_backup_code(&batch.codes[0], &batch.hashes[0], PEPPER).unwrap());
        assert!(!verify_backup_code(&batch.codes[1], &batch.hashes[0], PEPPER).unwrap());
    }

    #[test]
    fn verify_is_pepper_sensitive() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        assert!(!verify_backup_code(&batch.codes[0], &batch.hashes[0], b"other-pepper").unwrap());
    }

    #[test]
    fn six_digit_codes_are_not_backup_shaped() {
        assert!(!looks_like_backup_code("123456"));
    }
}
