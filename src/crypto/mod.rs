//! Cryptographic primitives: request-payload AES-CTR+HMAC, media AES-GCM
//! chunking, and P-256 signing/agreement/HKDF for the refresh key.

pub mod keys;
pub mod media;
pub mod request;

pub use keys::RefreshKey;
pub use media::MediaCipher;
pub use request::RequestCryptoKeys;
