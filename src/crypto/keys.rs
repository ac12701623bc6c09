//! P-256 signing/agreement keys, HKDF, and PKIX SPKI DER export.
//!
//! Grounded on the same RustCrypto family the pack already reaches for
//! elsewhere: `p256` (used by `googleapis-google-cloud-rust`'s auth crate
//! for JWT signing), `hkdf` (used the same way by the relay-crypto file in
//! `other_examples` to derive direction-specific keys from a shared secret).

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hkdf::Hkdf;
use p256::ecdsa::signature::Signer as _;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePublicKey;
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use sha2::Sha256;

use crate::error::{TachyonError, Result};

/// The client's P-256 "refresh key". Its public half (PKIX SPKI DER) is
/// submitted at pairing time; the private half signs periodic
/// `RegisterRefresh` requests.
#[derive(Clone)]
pub struct RefreshKey {
    secret: SecretKey,
}

impl RefreshKey {
    /// Generate a fresh random refresh key.
    pub fn generate() -> Self {
        Self { secret: SecretKey::random(&mut OsRng) }
    }

    /// Reconstruct a refresh key from its raw 32-byte scalar (as persisted
    /// in [`crate::auth::AuthState`]).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| TachyonError::Crypto(format!("invalid P-256 scalar: {e}")))?;
        Ok(Self { secret })
    }

    /// The raw 32-byte scalar, for persistence.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }

    /// The public key in PKIX SubjectPublicKeyInfo DER encoding, submitted
    /// during pairing.
    pub fn public_key_spki_der(&self) -> Result<Vec<u8>> {
        let public = PublicKey::from(self.secret.public_key());
        public
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| TachyonError::Crypto(format!("SPKI DER encode failed: {e}")))
    }

    /// The public key in base64 (standard alphabet) PKIX SPKI DER, as
    /// embedded in the QR URL's `URLData`.
    pub fn public_key_spki_der_base64(&self) -> Result<String> {
        Ok(B64.encode(self.public_key_spki_der()?))
    }

    /// The uncompressed SEC1 point, as used for agreement with the phone's
    /// ephemeral key during the Gaia handshake.
    pub fn public_point_uncompressed(&self) -> Vec<u8> {
        self.secret.public_key().to_encoded_point(false).as_bytes().to_vec()
    }

    /// Sign `"<request_id>:<timestamp_micros>"` with ECDSA P-256/SHA-256,
    /// returning the DER-encoded signature.
    pub fn sign_refresh_request(&self, request_id: &str, timestamp_micros: i64) -> Vec<u8> {
        let signing_key = SigningKey::from(&self.secret);
        let message = format!("{request_id}:{timestamp_micros}");
        let signature: Signature = signing_key.sign(message.as_bytes());
        signature.to_der().as_bytes().to_vec()
    }

    /// Verify a signature produced by [`Self::sign_refresh_request`] (used by tests).
    pub fn verify(&self, request_id: &str, timestamp_micros: i64, der_sig: &[u8]) -> bool {
        use p256::ecdsa::signature::Verifier as _;
        let verifying_key = VerifyingKey::from(self.secret.public_key());
        let Ok(signature) = Signature::from_der(der_sig) else { return false };
        let message = format!("{request_id}:{timestamp_micros}");
        verifying_key.verify(message.as_bytes(), &signature).is_ok()
    }
}

/// Derive `length` bytes of key material via HKDF-SHA256.
pub fn hkdf_expand(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], length: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|e| TachyonError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_key_round_trips_through_bytes() {
        let key = RefreshKey::generate();
        let bytes = key.to_bytes();
        let restored = RefreshKey::from_bytes(&bytes).unwrap();
        assert_eq!(key.public_key_spki_der().unwrap(), restored.public_key_spki_der().unwrap());
    }

    #[test]
    fn refresh_request_signature_verifies() {
        let key = RefreshKey::generate();
        let sig = key.sign_refresh_request("req-1", 1_700_000_000_000_000);
        assert!(key.verify("req-1", 1_700_000_000_000_000, &sig));
        assert!(!key.verify("req-2", 1_700_000_000_000_000, &sig));
    }

    #[test]
    fn hkdf_expand_is_deterministic() {
        let a = hkdf_expand(b"shared-secret", None, b"info-a", 32).unwrap();
        let b = hkdf_expand(b"shared-secret", None, b"info-a", 32).unwrap();
        let c = hkdf_expand(b"shared-secret", None, b"info-b", 32).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
