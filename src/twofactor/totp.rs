//! TOTP factor helpers.
//!
//! Secrets at rest are wrapped in the payload codec envelope; the raw base32
//! value exists only while provisioning the authenticator app and while
//! checking a code. Verification is stateless apart from the last-accepted
//! time step, which blocks replay inside the same 30-second window.

use anyhow::{Result, anyhow};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::codec::PayloadCodec;

pub(super) const TOTP_STEP_SECONDS: u64 = 30;
const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;

/// Generate a fresh TOTP secret, returning `(base32, envelope)` where the
/// envelope is what goes to the store.
pub(super) fn generate_secret(codec: &PayloadCodec) -> Result<(String, String)> {
    let Secret::Encoded(base32) = Secret::generate_secret().to_encoded() else {
        return Err(anyhow!("generated TOTP secret did not encode"));
    };
    let envelope = codec.encrypt(&base32);
    Ok((base32, envelope))
}

/// Open a stored secret envelope back into its base32 form.
pub(super) fn open_secret(codec: &PayloadCodec, envelope: &str) -> Result<String> {
    let base32 = codec.decrypt(envelope);
    // A wrong key degrades to the envelope itself; that is not a secret.
    if codec.is_encrypted(&base32) {
        return Err(anyhow!("failed to open stored TOTP secret"));
    }
    Ok(base32)
}

fn build(secret_base32: &str, issuer: &str, account_name: &str) -> Result<TOTP> {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|err| anyhow!("invalid TOTP secret encoding: {err:?}"))?;
    TOTP::new(
        Algorithm::SHA1,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP_SECONDS,
        secret_bytes,
        Some(issuer.to_string()),
        account_name.to_string(),
    )
    .map_err(|err| anyhow!("failed to build TOTP: {err}"))
}

/// The `otpauth://` provisioning URL shown to the user during enrollment.
pub(super) fn provisioning_url(
    secret_base32: &str,
    issuer: &str,
    account_name: &str,
) -> Result<String> {
    Ok(build(secret_base32, issuer, account_name)?.get_url())
}

/// Check a code against the secret at `now` (unix seconds).
pub(super) fn check_code(secret_base32: &str, code: &str, now: u64) -> Result<bool> {
    let totp = build(secret_base32, "staffdesk", "verify")?;
    Ok(totp.check(code.trim(), now))
}

/// The time step `now` falls into, recorded to enforce single-use per window.
pub(super) fn time_step(now: u64) -> u64 {
    now / TOTP_STEP_SECONDS
}

/// Generate the expected code for a secret at `now`; test support.
#[cfg(test)]
pub(super) fn code_at(secret_base32: &str, now: u64) -> Result<String> {
    let totp = build(secret_base32, "staffdesk", "verify")?;
    Ok(totp.generate(now))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{check_code, code_at, generate_secret, open_secret, provisioning_url, time_step};
    use crate::codec::PayloadCodec;

    const NOW: u64 = 1_750_000_000;

    #[test]
    fn generated_secret_round_trips_through_envelope() {
        let codec = PayloadCodec::new([3u8; 32]);
        let (base32, envelope) = generate_secret(&codec).unwrap();
        assert_ne!(base32, envelope);
        assert_eq!(open_secret(&codec, &envelope).unwrap(), base32);
    }

    #[test]
    fn open_secret_rejects_wrong_key() {
        let codec = PayloadCodec::new([3u8; 32]);
        let (_base32, envelope) = generate_secret(&codec).unwrap();
        let other = PayloadCodec::new([4u8; 32]);
        assert!(open_secret(&other, &envelope).is_err());
    }

    #[test]
    fn correct_code_checks_within_step() {
        let codec = PayloadCodec::disabled();
        let (base32, _envelope) = generate_secret(&codec).unwrap();
        let code = code_at(&base32, NOW).unwrap();
        assert!(check_code(&base32, &code, NOW).unwrap());
        assert!(!check_code(&base32, "000000", NOW).unwrap());
    }

    #[test]
    fn stale_code_fails_outside_skew() {
        let codec = PayloadCodec::disabled();
        let (base32, _envelope) = generate_secret(&codec).unwrap();
        let code = code_at(&base32, NOW).unwrap();
        // Two steps later the skew window has moved past the old code.
        assert!(!check_code(&base32, &code, NOW + 90).unwrap());
    }

    #[test]
    fn provisioning_url_embeds_issuer() {
        let codec = PayloadCodec::disabled();
        let (base32, _envelope) = generate_secret(&codec).unwrap();
        let url = provisioning_url(&base32, "Staffdesk", "alice@example.com").unwrap();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("Staffdesk"));
    }

    #[test]
    fn time_step_is_thirty_seconds() {
        assert_eq!(time_step(0), 0);
        assert_eq!(time_step(29), 0);
        assert_eq!(time_step(30), 1);
        assert_eq!(time_step(NOW), NOW / 30);
    }
}
