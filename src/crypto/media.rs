//! Media upload/download chunked AEAD.
//!
//! Out of scope at the protocol-orchestration level — the upload/download
//! HTTP flow itself is left to the embedding application — but the chunk
//! codec is ordinary AES-256-GCM over a fixed-size frame and simple enough
//! to implement for real rather than stub, so the round-trip property has
//! something to run against.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::{Result, TachyonError};

/// Plaintext chunk size. Each sealed chunk is this many bytes larger (the
/// GCM tag), i.e. `32 KiB - 28` bytes of plaintext per `32 KiB` ciphertext
/// chunk.
pub const CHUNK_SIZE: usize = 32 * 1024 - 28;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// A chunked AES-256-GCM encryptor/decryptor keyed for one media transfer.
/// Each chunk's nonce is the transfer-wide 12-byte base nonce with its last
/// 4 bytes replaced by a big-endian chunk counter, so chunk order matters
/// but chunks can be processed independently once received in order.
pub struct MediaCipher {
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
}

impl MediaCipher {
    pub fn new(key: &[u8; 32], base_nonce: [u8; NONCE_LEN]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)), base_nonce }
    }

    fn nonce_for(&self, chunk_index: u32) -> [u8; NONCE_LEN] {
        let mut nonce = self.base_nonce;
        nonce[NONCE_LEN - 4..].copy_from_slice(&chunk_index.to_be_bytes());
        nonce
    }

    /// Encrypt `plaintext` (of any length) as a sequence of sealed chunks.
    pub fn seal_stream(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + TAG_LEN * plaintext.len().div_ceil(CHUNK_SIZE).max(1));
        for (index, chunk) in plaintext.chunks(CHUNK_SIZE).enumerate().map(|(i, c)| (i as u32, c)) {
            let nonce = self.nonce_for(index);
            let sealed = self
                .cipher
                .encrypt(Nonce::from_slice(&nonce), Payload { msg: chunk, aad: &[] })
                .map_err(|_| TachyonError::Crypto("media chunk seal failed".into()))?;
            out.extend_from_slice(&sealed);
        }
        if plaintext.is_empty() {
            let nonce = self.nonce_for(0);
            let sealed = self
                .cipher
                .encrypt(Nonce::from_slice(&nonce), Payload { msg: &[], aad: &[] })
                .map_err(|_| TachyonError::Crypto("media chunk seal failed".into()))?;
            out.extend_from_slice(&sealed);
        }
        Ok(out)
    }

    /// Decrypt a sequence of sealed chunks, each `CHUNK_SIZE + TAG_LEN` bytes
    /// except possibly the last.
    pub fn open_stream(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let sealed_chunk_size = CHUNK_SIZE + TAG_LEN;
        let mut out = Vec::with_capacity(sealed.len());
        let mut index: u32 = 0;
        let mut offset = 0;
        while offset < sealed.len() {
            let end = (offset + sealed_chunk_size).min(sealed.len());
            let chunk = &sealed[offset..end];
            let nonce = self.nonce_for(index);
            let opened = self
                .cipher
                .decrypt(Nonce::from_slice(&nonce), Payload { msg: chunk, aad: &[] })
                .map_err(|_| TachyonError::Crypto("media chunk open failed".into()))?;
            out.extend_from_slice(&opened);
            offset = end;
            index += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> MediaCipher {
        MediaCipher::new(&[0x42; 32], [0x11; NONCE_LEN])
    }

    #[test]
    fn round_trips_empty_and_small() {
        let mc = cipher();
        for len in [0usize, 1, 100, CHUNK_SIZE - 1] {
            let plaintext = vec![0x5Au8; len];
            let sealed = mc.seal_stream(&plaintext).unwrap();
            assert_eq!(mc.open_stream(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn round_trips_across_chunk_boundaries() {
        let mc = cipher();
        for len in [CHUNK_SIZE, CHUNK_SIZE + 1, CHUNK_SIZE * 2, CHUNK_SIZE * 3 + 17] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = mc.seal_stream(&plaintext).unwrap();
            assert_eq!(mc.open_stream(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn tampered_chunk_fails_to_open() {
        let mc = cipher();
        let plaintext = vec![7u8; CHUNK_SIZE + 500];
        let mut sealed = mc.seal_stream(&plaintext).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(mc.open_stream(&sealed).is_err());
    }
}
