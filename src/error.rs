//! Crate-wide error types.

use thiserror::Error;

/// Errors that can occur anywhere in the Tachyon transport/session core.
#[derive(Debug, Error)]
pub enum TachyonError {
    // ── Transport failures ───────────────────────────────────────────────────
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("invalid HTTP header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("response body was not valid for the requested codec")]
    InvalidResponse,

    // ── Codec failures ───────────────────────────────────────────────────────
    #[error("pblite/protobuf codec error: {0}")]
    Codec(String),

    #[error("long-poll framing error: {0}")]
    Framing(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    // ── Crypto failures ──────────────────────────────────────────────────────
    #[error("crypto error: {0}")]
    Crypto(String),

    // ── Protocol violations during pairing ───────────────────────────────────
    #[error(transparent)]
    Pairing(#[from] PairingError),

    // ── Auth state failures ──────────────────────────────────────────────────
    #[error("not logged in")]
    NotLoggedIn,

    #[error("background polling exited uncleanly: no data payload was ever received")]
    BackgroundPollingExitedUncleanly,

    // ── Timeouts & cancellation ──────────────────────────────────────────────
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("request was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Protocol violations specific to the Gaia pairing handshake.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("unexpected message type during pairing: {0}")]
    UnexpectedMessageType(String),

    #[error("unsupported pairing protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported cipher suite: {0}")]
    UnsupportedCipher(String),

    #[error("invalid random length: expected {expected}, got {actual}")]
    InvalidRandomLength { expected: usize, actual: usize },

    #[error("unsupported emoji table version: {0}")]
    UnsupportedEmojiVersion(u32),

    #[error("unsupported key-derivation version: {0}")]
    UnsupportedKdfVersion(u32),
}

pub type Result<T> = std::result::Result<T, TachyonError>;
