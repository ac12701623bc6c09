//! Request-payload AES-256-CTR + HMAC-SHA256.
//!
//! Wire layout: `ciphertext || iv(16) || hmac_sha256(ciphertext || iv)(32)`.
//! The HMAC covers the ciphertext and IV but not itself, so a single-bit
//! flip anywhere in the payload is detected before decryption is attempted.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::error::{Result, TachyonError};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const HMAC_LEN: usize = 32;

/// The pair of keys used to encrypt/MAC outgoing RPC payloads and decrypt
/// incoming ones. Both are 32 raw bytes.
#[derive(Clone)]
pub struct RequestCryptoKeys {
    pub aes_key: [u8; 32],
    pub hmac_key: [u8; 32],
}

impl RequestCryptoKeys {
    pub fn generate() -> Self {
        let mut aes_key = [0u8; 32];
        let mut hmac_key = [0u8; 32];
        OsRng.fill_bytes(&mut aes_key);
        OsRng.fill_bytes(&mut hmac_key);
        Self { aes_key, hmac_key }
    }

    pub fn from_bytes(aes_key: &[u8], hmac_key: &[u8]) -> Result<Self> {
        let aes_key: [u8; 32] = aes_key
            .try_into()
            .map_err(|_| TachyonError::Crypto("aes_key must be 32 bytes".into()))?;
        let hmac_key: [u8; 32] = hmac_key
            .try_into()
            .map_err(|_| TachyonError::Crypto("hmac_key must be 32 bytes".into()))?;
        Ok(Self { aes_key, hmac_key })
    }

    fn mac(&self, ciphertext: &[u8], iv: &[u8]) -> Result<[u8; HMAC_LEN]> {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key)
            .map_err(|e| TachyonError::Crypto(format!("bad HMAC key: {e}")))?;
        mac.update(ciphertext);
        mac.update(iv);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Encrypt `plaintext`, returning `ciphertext || iv || hmac`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut ciphertext = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new_from_slices(&self.aes_key, &iv)
            .expect("fixed-size key/iv are always valid");
        cipher.apply_keystream(&mut ciphertext);

        let tag = self.mac(&ciphertext, &iv)?;

        let mut out = Vec::with_capacity(ciphertext.len() + IV_LEN + HMAC_LEN);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    /// Decrypt a `ciphertext || iv || hmac` blob, verifying the HMAC first.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < IV_LEN + HMAC_LEN {
            return Err(TachyonError::Crypto("encrypted payload too short".into()));
        }
        let split_at = payload.len() - IV_LEN - HMAC_LEN;
        let (ciphertext, rest) = payload.split_at(split_at);
        let (iv, tag) = rest.split_at(IV_LEN);

        let expected = self.mac(ciphertext, iv)?;
        if !constant_time_eq(&expected, tag) {
            return Err(TachyonError::Crypto("HMAC verification failed".into()));
        }

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new_from_slices(&self.aes_key, iv)
            .expect("fixed-size key/iv are always valid");
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }
}

/// Constant-time byte comparison without pulling in the `subtle` crate for
/// a single 32-byte compare.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_plaintext() {
        let keys = RequestCryptoKeys::generate();
        for len in [0usize, 1, 15, 16, 17, 1024] {
            let plaintext = vec![0xAB; len];
            let encrypted = keys.encrypt(&plaintext).unwrap();
            let decrypted = keys.decrypt(&encrypted).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn bit_flip_anywhere_fails_decryption() {
        let keys = RequestCryptoKeys::generate();
        let encrypted = keys.encrypt(b"hello, tachyon").unwrap();
        for i in 0..encrypted.len() {
            let mut tampered = encrypted.clone();
            tampered[i] ^= 0x01;
            assert!(keys.decrypt(&tampered).is_err(), "byte {i} flip should fail verification");
        }
    }

    #[test]
    fn wrong_keys_fail_decryption() {
        let keys = RequestCryptoKeys::generate();
        let other = RequestCryptoKeys::generate();
        let encrypted = keys.encrypt(b"payload").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }
}
