//! RS256 access tokens.
//!
//! Access tokens are stateless: validity is a pure function of signature and
//! expiry, checked against a caller-supplied clock. The claims bind the token
//! to its refresh-token family (`fam`) so a refresh call can prove the pair
//! was issued together.

use base64ct::{Base64UrlUnpadded, Encoding};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{Keypair, SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, errors::Error as RsaError};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const CLAIMS_VERSION: u8 = 1;

const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl AccessTokenHeader {
    fn rs256(kid: impl Into<String>) -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
            kid: kid.into(),
        }
    }
}

/// Claims carried by every portal access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub v: u8,
    pub iss: String,
    pub aud: String,
    /// User id the token authenticates.
    pub sub: String,
    /// Refresh-token family this access token was minted alongside.
    pub fam: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("unknown key id: {0}")]
    UnknownKid(String),
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("rsa error")]
    Rsa(#[from] RsaError),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("invalid token version")]
    InvalidVersion,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn decode_private_key(pem_or_der: &[u8]) -> Result<RsaPrivateKey, Error> {
    if pem_or_der.starts_with(b"-----BEGIN") {
        let s = std::str::from_utf8(pem_or_der).map_err(|_| Error::KeyParse)?;
        if let Ok(k) = RsaPrivateKey::from_pkcs8_pem(s) {
            return Ok(k);
        }
        if let Ok(k) = RsaPrivateKey::from_pkcs1_pem(s) {
            return Ok(k);
        }
        return Err(Error::KeyParse);
    }

    if let Ok(k) = RsaPrivateKey::from_pkcs8_der(pem_or_der) {
        return Ok(k);
    }
    if let Ok(k) = RsaPrivateKey::from_pkcs1_der(pem_or_der) {
        return Ok(k);
    }
    Err(Error::KeyParse)
}

/// Holds the active signing key pair. One `kid` per process generation;
/// restarting the service invalidates outstanding access tokens, which is
/// acceptable because they live for minutes.
pub struct AccessTokenSigner {
    signing_key: SigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    kid: String,
}

impl AccessTokenSigner {
    /// Build a signer from a PEM/DER private key.
    ///
    /// # Errors
    /// Returns an error if the key cannot be parsed.
    pub fn from_key_material(pem_or_der: &[u8], kid: impl Into<String>) -> Result<Self, Error> {
        let private_key = decode_private_key(pem_or_der)?;
        Ok(Self::from_private_key(private_key, kid))
    }

    /// Generate a fresh RSA key pair for this process.
    ///
    /// # Errors
    /// Returns an error if key generation fails.
    pub fn generate(kid: impl Into<String>) -> Result<Self, Error> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)?;
        Ok(Self::from_private_key(private_key, kid))
    }

    fn from_private_key(private_key: RsaPrivateKey, kid: impl Into<String>) -> Self {
        let signing_key = SigningKey::<Sha256>::new(private_key);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
            kid: kid.into(),
        }
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Create a signed access token.
    ///
    /// # Errors
    /// Returns an error if claims/header JSON cannot be encoded.
    pub fn sign(&self, claims: &AccessTokenClaims) -> Result<String, Error> {
        let header = AccessTokenHeader::rs256(&self.kid);
        let header_b64 = b64e_json(&header)?;
        let claims_b64 = b64e_json(claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");

        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_vec());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    /// Returns an error if the token is malformed, signed by an unknown key,
    /// carries an invalid signature, or fails claims validation
    /// (`v`, `iss`, `aud`, `exp` against `now_unix_seconds`).
    pub fn verify(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
        now_unix_seconds: i64,
    ) -> Result<AccessTokenClaims, Error> {
        let claims = self.verify_signature(token, expected_issuer, expected_audience)?;
        if claims.exp <= now_unix_seconds {
            return Err(Error::Expired);
        }
        Ok(claims)
    }

    /// Like [`Self::verify`] but accepts an expired token. The refresh path
    /// uses this: the access token is usually past `exp` by the time the
    /// client redeems its refresh token, but the signature must still hold.
    ///
    /// # Errors
    /// Same as [`Self::verify`], minus the expiry check.
    pub fn verify_signature(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
    ) -> Result<AccessTokenClaims, Error> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(Error::TokenFormat)?;
        if parts.next().is_some() {
            return Err(Error::TokenFormat);
        }

        let header: AccessTokenHeader = b64d_json(header_b64)?;
        if header.alg != "RS256" {
            return Err(Error::UnsupportedAlg(header.alg));
        }
        if header.kid != self.kid {
            return Err(Error::UnknownKid(header.kid));
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::Base64)?;
        let signature =
            Signature::try_from(signature_bytes.as_slice()).map_err(|_| Error::InvalidSignature)?;
        self.verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| Error::InvalidSignature)?;

        let claims: AccessTokenClaims = b64d_json(claims_b64)?;
        if claims.v != CLAIMS_VERSION {
            return Err(Error::InvalidVersion);
        }
        if claims.iss != expected_issuer {
            return Err(Error::InvalidIssuer);
        }
        if claims.aud != expected_audience {
            return Err(Error::InvalidAudience);
        }
        Ok(claims)
    }
}

impl std::fmt::Debug for AccessTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenSigner")
            .field("kid", &self.kid)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{AccessTokenClaims, AccessTokenSigner, CLAIMS_VERSION, Error};
    use std::sync::OnceLock;

    const NOW: i64 = 1_750_000_000;

    pub(crate) fn test_signer() -> &'static AccessTokenSigner {
        static SIGNER: OnceLock<AccessTokenSigner> = OnceLock::new();
        SIGNER.get_or_init(|| AccessTokenSigner::generate("test-key").unwrap())
    }

    fn claims(jti: &str) -> AccessTokenClaims {
        AccessTokenClaims {
            v: CLAIMS_VERSION,
            iss: "https://api.staffdesk.test".to_string(),
            aud: "staffdesk-portal".to_string(),
            sub: "9a1f38f6-4cf9-4d0e-93f5-73b6a8e6f001".to_string(),
            fam: "7f3d2a10-88f1-4b5e-9a61-0c3aa3a1c002".to_string(),
            iat: NOW,
            exp: NOW + 600,
            jti: jti.to_string(),
        }
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let signer = test_signer();
        let token = signer.sign(&claims("jti-1")).unwrap();
        let verified = signer
            .verify(&token, "https://api.staffdesk.test", "staffdesk-portal", NOW)
            .unwrap();
        assert_eq!(verified, claims("jti-1"));
    }

    #[test]
    fn rejects_expired_but_signature_still_checks() {
        let signer = test_signer();
        let token = signer.sign(&claims("jti-2")).unwrap();

        let result = signer.verify(
            &token,
            "https://api.staffdesk.test",
            "staffdesk-portal",
            NOW + 601,
        );
        assert!(matches!(result, Err(Error::Expired)));

        // The refresh path still accepts the same token.
        let verified = signer
            .verify_signature(&token, "https://api.staffdesk.test", "staffdesk-portal")
            .unwrap();
        assert_eq!(verified.jti, "jti-2");
    }

    #[test]
    fn rejects_wrong_audience_and_issuer() {
        let signer = test_signer();
        let token = signer.sign(&claims("jti-3")).unwrap();

        let result = signer.verify(&token, "https://api.staffdesk.test", "other-aud", NOW);
        assert!(matches!(result, Err(Error::InvalidAudience)));

        let result = signer.verify(&token, "https://other.test", "staffdesk-portal", NOW);
        assert!(matches!(result, Err(Error::InvalidIssuer)));
    }

    #[test]
    fn rejects_tampered_claims() {
        let signer = test_signer();
        let token = signer.sign(&claims("jti-4")).unwrap();

        // Swap the claims segment for one with a different subject.
        let mut other = claims("jti-4");
        other.sub = "00000000-0000-0000-0000-000000000000".to_string();
        let forged_token = {
            let forged_claims = super::b64e_json(&other).unwrap();
            let mut parts = token.split('.');
            let header = parts.next().unwrap();
            let _claims = parts.next().unwrap();
            let sig = parts.next().unwrap();
            format!("{header}.{forged_claims}.{sig}")
        };

        let result = signer.verify(
            &forged_token,
            "https://api.staffdesk.test",
            "staffdesk-portal",
            NOW,
        );
        assert!(matches!(result, Err(Error::InvalidSignature)));
    }

    #[test]
    fn rejects_malformed_tokens() {
        let signer = test_signer();
        assert!(matches!(
            signer.verify("a.b", "iss", "aud", NOW),
            Err(Error::Base64 | Error::TokenFormat)
        ));
        assert!(matches!(
            signer.verify("a.b.c.d", "iss", "aud", NOW),
            Err(Error::TokenFormat)
        ));
    }

    #[test]
    fn rejects_unknown_kid() {
        let signer = test_signer();
        let other = AccessTokenSigner::generate("rotated-key").unwrap();
        let token = other.sign(&claims("jti-5")).unwrap();
        let result = signer.verify(&token, "https://api.staffdesk.test", "staffdesk-portal", NOW);
        assert!(matches!(result, Err(Error::UnknownKid(_))));
    }
}
