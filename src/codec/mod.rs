//! Authenticated-encryption envelope for payloads exchanged with the portal.
//!
//! Bodies on the wire are either plaintext JSON or an `enc.v1.` envelope:
//! `enc.v1.<base64url(nonce || ciphertext+tag)>` under ChaCha20-Poly1305.
//!
//! Security boundary: the codec degrades, it never fails the request. A
//! missing key turns `encrypt` into the identity function; a payload that does
//! not look like an envelope, or fails authentication, is returned unchanged
//! and the caller notices through JSON parsing. Inbound trust decisions must
//! never rest on whether a payload arrived encrypted.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use tracing::warn;

/// Structural marker every envelope starts with.
const ENVELOPE_PREFIX: &str = "enc.v1.";
/// Envelope version label, bound into the AEAD as associated data.
const ENVELOPE_AAD: &[u8] = b"staffdesk-payload:v1";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Symmetric codec for portal payloads. Cheap to clone.
#[derive(Clone)]
pub struct PayloadCodec {
    key: Option<[u8; KEY_LEN]>,
}

impl PayloadCodec {
    /// Codec with no key configured: `encrypt` and `decrypt` are identity.
    #[must_use]
    pub fn disabled() -> Self {
        Self { key: None }
    }

    #[must_use]
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key: Some(key) }
    }

    /// Parse a base64url-encoded 32-byte key, as passed on the command line.
    ///
    /// # Errors
    /// Returns an error if the value is not valid base64url or not 32 bytes.
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .context("payload key is not valid base64url")?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("payload key must be {KEY_LEN} bytes"))?;
        Ok(Self::new(key))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Wrap `plaintext` in an envelope, or return it unchanged when no key is
    /// configured. Never fails outward: an encryption error (which cannot
    /// occur for valid key material) also degrades to plaintext.
    #[must_use]
    pub fn encrypt(&self, plaintext: &str) -> String {
        let Some(key) = self.key.as_ref() else {
            return plaintext.to_string();
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let payload = Payload {
            msg: plaintext.as_bytes(),
            aad: ENVELOPE_AAD,
        };
        match cipher.encrypt(nonce, payload) {
            Ok(ciphertext) => {
                let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                raw.extend_from_slice(&nonce_bytes);
                raw.extend_from_slice(&ciphertext);
                format!("{ENVELOPE_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
            }
            Err(err) => {
                warn!("payload encryption failed, sending plaintext: {err}");
                plaintext.to_string()
            }
        }
    }

    /// Unwrap an envelope. Anything that does not look like one, or fails
    /// authentication, comes back unchanged; the degradation is logged so it
    /// is visible without being user-facing.
    #[must_use]
    pub fn decrypt(&self, payload: &str) -> String {
        if !self.is_encrypted(payload) {
            return payload.to_string();
        }
        let Some(key) = self.key.as_ref() else {
            // Envelope-shaped data with no key to open it.
            warn!("received envelope payload but no payload key is configured");
            return payload.to_string();
        };

        match self.open(key, payload) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!("payload decryption degraded to pass-through: {err}");
                payload.to_string()
            }
        }
    }

    /// Heuristic envelope check: prefix, decodable base64url, room for
    /// nonce and tag. Used to avoid double-decrypting plaintext error bodies.
    #[must_use]
    pub fn is_encrypted(&self, payload: &str) -> bool {
        let Some(encoded) = payload.strip_prefix(ENVELOPE_PREFIX) else {
            return false;
        };
        URL_SAFE_NO_PAD
            .decode(encoded)
            .is_ok_and(|raw| raw.len() >= NONCE_LEN + TAG_LEN)
    }

    fn open(&self, key: &[u8; KEY_LEN], payload: &str) -> Result<String> {
        let encoded = payload
            .strip_prefix(ENVELOPE_PREFIX)
            .context("missing envelope prefix")?;
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .context("invalid envelope encoding")?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            anyhow::bail!("envelope too short");
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: ENVELOPE_AAD,
                },
            )
            .map_err(|err| anyhow::anyhow!("envelope authentication failed: {err}"))?;
        String::from_utf8(plaintext).context("decrypted payload is not UTF-8")
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{ENVELOPE_PREFIX, PayloadCodec};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn keyed() -> PayloadCodec {
        PayloadCodec::new([7u8; 32])
    }

    #[test]
    fn round_trip_with_key() {
        let codec = keyed();
        let plaintext = r#"{"employeeId":42,"name":"Alice"}"#;
        let envelope = codec.encrypt(plaintext);
        assert!(envelope.starts_with(ENVELOPE_PREFIX));
        assert_ne!(envelope, plaintext);
        assert_eq!(codec.decrypt(&envelope), plaintext);
    }

    #[test]
    fn encrypt_is_identity_without_key() {
        let codec = PayloadCodec::disabled();
        assert_eq!(codec.encrypt("hello"), "hello");
        assert_eq!(codec.decrypt("hello"), "hello");
    }

    #[test]
    fn decrypt_passes_through_non_envelope() {
        let codec = keyed();
        assert_eq!(codec.decrypt("not-a-valid-envelope"), "not-a-valid-envelope");
        assert_eq!(codec.decrypt(""), "");
    }

    #[test]
    fn decrypt_passes_through_tampered_envelope() {
        let codec = keyed();
        let envelope = codec.encrypt("secret");
        let mut raw = URL_SAFE_NO_PAD
            .decode(envelope.strip_prefix(ENVELOPE_PREFIX).unwrap())
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = format!("{ENVELOPE_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw));
        assert_eq!(codec.decrypt(&tampered), tampered);
    }

    #[test]
    fn decrypt_with_wrong_key_degrades() {
        let envelope = keyed().encrypt("secret");
        let other = PayloadCodec::new([9u8; 32]);
        assert_eq!(other.decrypt(&envelope), envelope);
    }

    #[test]
    fn is_encrypted_requires_prefix_and_length() {
        let codec = keyed();
        assert!(codec.is_encrypted(&codec.encrypt("x")));
        assert!(!codec.is_encrypted("enc.v1.%%%"));
        assert!(!codec.is_encrypted(&format!(
            "{ENVELOPE_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(b"short")
        )));
        assert!(!codec.is_encrypted("plain text body"));
    }

    #[test]
    fn nonce_is_fresh_per_envelope() {
        let codec = keyed();
        assert_ne!(codec.encrypt("same"), codec.encrypt("same"));
    }
}
