//! The event contract surfaced to the embedding application.
//!
//! A single async callback receives one [`Event`] at a time, serialized per
//! component — callers never see two events from the same source
//! interleaved, though events from independent sources (the poll loop vs.
//! the pinger) may interleave with each other.

use serde_json::Value;

/// One event kind in the contract surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum Event {
    /// A QR code (or, in Gaia mode, an emoji-pair) is ready for the phone to scan.
    QrCodeReady { url: String },

    /// Pairing completed; carries the phone id and the decoded pair-data payload.
    PairSuccessful { phone_id: String, data: Value },

    /// The tachyon token was refreshed via `RegisterRefresh`.
    AuthTokenRefreshed,

    /// The poll loop recovered after one or more temporary errors.
    ListenRecovered,

    /// The poll loop hit a recoverable transport error and will retry.
    ListenTemporaryError { error: String },

    /// The poll loop gave up for this connection attempt.
    ListenFatalError { error: String },

    /// A ditto ping RPC failed.
    PingFailed { error: String, consecutive_failures: u32 },

    /// The phone has not responded to pings for the timeout window.
    PhoneNotResponding,

    /// The phone responded again after a `PhoneNotResponding` episode.
    PhoneRespondingAgain,

    /// No data payload has arrived for longer than expected; a best-effort
    /// `GET_UPDATES` nudge was sent.
    NoDataReceived,

    /// An incoming message update. `is_old` is true when it was part of
    /// backlog replay (covered by the skip count).
    Message { data: Value, is_old: bool },

    /// An incoming conversation update.
    Conversation { data: Value, is_old: bool },

    /// A typing indicator update. Never deduped; suppressed entirely while old.
    Typing { data: Value },

    /// A user-alert update, emitted only when not part of backlog replay.
    UserAlert { data: Value },

    /// A settings update, emitted unconditionally.
    Settings { data: Value },

    /// An account-change update. `is_fake` marks the decrypted
    /// `encrypted_data2` heuristic used to detect a synthetic entry.
    AccountChange { data: Value, is_fake: bool },

    /// The phone revoked the pairing, or the logged-out sentinel was seen.
    GaiaLoggedOut,
}

/// The callback an embedder registers to receive [`Event`]s.
pub type EventSink = std::sync::Arc<dyn Fn(Event) + Send + Sync + 'static>;
