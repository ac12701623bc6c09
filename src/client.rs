//! The client facade: orchestrates `AuthState`/`HttpClient`/`SessionRpc`/
//! `LongPollEngine` into the handful of lifecycle operations an embedding
//! application actually calls (`start_login`, `connect`, `reconnect`,
//! `connect_background`).
//!
//! A thin struct composing the HTTP layer and the long-poll engine, whose
//! `start_login` does pairing setup then delegates streaming to
//! `LongPollEngine::start`.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::auth::AuthState;
use crate::config::{self, client as cfg, rpc_url, PAIRING_SERVICE};
use crate::error::{Result, TachyonError};
use crate::events::{Event, EventSink};
use crate::http::HttpClient;
use crate::longpoll::LongPollEngine;
use crate::pblite::WireCodec;
use crate::session::{CallOptions, SessionRpc};
use crate::wire::{self, Action, MessageType};

/// The QR pairing URL fragment:
/// `https://support.google.com/messages/?p=web_computer#?c=<base64>`.
const QR_URL_PREFIX: &str = "https://support.google.com/messages/?p=web_computer#?c=";

/// Everything needed to drive one Google Messages for Web session: the
/// credential/session record, the HTTP transport, the RPC engine, and the
/// long-poll engine, wired together behind a shared `Arc` so background
/// tasks can hold their own handles.
pub struct Client {
    http: Arc<HttpClient>,
    auth: Arc<AuthState>,
    rpc: Arc<SessionRpc>,
    longpoll: Arc<LongPollEngine>,
    events: EventSink,
    ack_ticker_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    auto_reconnect_after_pairing: AtomicBool,
}

impl Client {
    /// Build a client for a fresh QR pairing (no persisted state yet).
    pub fn new_for_pairing(config: crate::config::TachyonConfig, events: EventSink) -> Result<Arc<Self>> {
        Self::from_auth(config, Arc::new(AuthState::new_for_pairing(false)), events)
    }

    /// Rehydrate a client from a previously persisted [`crate::auth::AuthStateData`].
    pub fn from_persisted(
        config: crate::config::TachyonConfig,
        data: crate::auth::AuthStateData,
        events: EventSink,
    ) -> Result<Arc<Self>> {
        Self::from_auth(config, Arc::new(AuthState::from_data(data)?), events)
    }

    fn from_auth(config: crate::config::TachyonConfig, auth: Arc<AuthState>, events: EventSink) -> Result<Arc<Self>> {
        let http = Arc::new(HttpClient::new(config)?);
        let rpc = Arc::new(SessionRpc::new(Arc::clone(&http), Arc::clone(&auth)));
        let longpoll = LongPollEngine::new(Arc::clone(&http), Arc::clone(&auth), Arc::clone(&rpc), Arc::clone(&events));
        let client = Arc::new(Self {
            http,
            auth,
            rpc,
            longpoll,
            events,
            ack_ticker_shutdown: Mutex::new(None),
            auto_reconnect_after_pairing: AtomicBool::new(true),
        });

        let callback_client = Arc::clone(&client);
        client.longpoll.set_on_paired(Arc::new(move |_phone_id, _data| {
            if !callback_client.auto_reconnect_after_pairing.load(Ordering::SeqCst) {
                return;
            }
            let client = Arc::clone(&callback_client);
            tokio::spawn(async move {
                sleep(cfg::POST_PAIR_DELAY).await;
                if let Err(e) = client.reconnect().await {
                    warn!(error = %e, "tachyon: post-pair auto-reconnect failed");
                }
            });
        }));

        Ok(client)
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.auth
    }

    pub fn is_connected(&self) -> bool {
        self.longpoll.is_connected()
    }

    /// Serialize the full session for persistence.
    pub async fn persisted_state(&self) -> crate::auth::AuthStateData {
        self.auth.to_data().await
    }

    // ── Pairing ──────────────────────────────────────────────────────────────

    /// Register this browser with the pairing service and start the
    /// long-poll stream immediately, so the resulting `paired` pair event
    /// can never arrive before anyone is listening for it. Returns the QR
    /// pairing URL to present to the user.
    pub async fn start_login(self: &Arc<Self>) -> Result<String> {
        let refresh_key = self.auth.refresh_key().await.ok_or(TachyonError::NotLoggedIn)?;
        let request_crypto = self.auth.request_crypto().await.ok_or(TachyonError::NotLoggedIn)?;

        let public_key = refresh_key.public_key_spki_der()?;
        let request_body = wire::encode_register_phone_relay_request(&public_key);

        let host = config::HOST_PAIRING;
        let url = rpc_url(host, PAIRING_SERVICE, "RegisterPhoneRelay");
        let (resp, _) = self
            .http
            .request(&self.auth, reqwest::Method::POST, &url, Some((&request_body, WireCodec::Protobuf)))
            .await?;

        // A RegisterPhoneRelay response may optionally carry a bootstrap
        // token, letting a caller skip straight to an authenticated
        // connection instead of waiting on the pair event alone.
        if let Some(token) = wire::decode_register_phone_relay_response(&resp)? {
            self.auth.set_token(token, None).await;
        }

        self.longpoll.start();

        let url_data = wire::UrlData {
            pairing_key: public_key,
            aes_key: request_crypto.aes_key.to_vec(),
            hmac_key: request_crypto.hmac_key.to_vec(),
        };
        let encoded = wire::encode_url_data(&url_data);
        let url = format!("{QR_URL_PREFIX}{}", crate::http::b64(&encoded));
        (self.events)(Event::QrCodeReady { url: url.clone() });
        Ok(url)
    }

    // ── connect / reconnect / post_connect ──────────────────────────────────

    /// Start (or resume) the session: start the long-poll stream, wait up to
    /// 15 s for it to open, and if already logged in, begin ack batching and
    /// chain into [`Self::post_connect`].
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.auth.is_logged_in().await {
            self.start_ack_ticker().await;
        }
        self.longpoll.start();
        let opened = self.longpoll.wait_first_connect(cfg::FIRST_CONNECT_TIMEOUT).await;
        if !opened {
            return Err(TachyonError::Timeout("first long-poll stream open"));
        }
        if self.auth.is_logged_in().await {
            self.post_connect().await;
        }
        Ok(())
    }

    async fn start_ack_ticker(self: &Arc<Self>) {
        let mut slot = self.ack_ticker_shutdown.lock().await;
        if slot.is_some() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        let rpc = Arc::clone(&self.rpc);
        tokio::spawn(async move { rpc.run_ack_ticker(rx).await });
    }

    async fn stop_ack_ticker(&self) {
        if let Some(tx) = self.ack_ticker_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the server's backlog replay to settle, flush any queued
    /// acks, rotate the session id, and nudge the server with a no-wait
    /// `GET_UPDATES` under the fresh id so any updates that raced the
    /// rotation are still delivered.
    async fn post_connect(self: &Arc<Self>) {
        sleep(cfg::POST_PAIR_DELAY).await;

        let deadline = Instant::now() + cfg::BACKLOG_DRAIN_TIMEOUT;
        loop {
            if !self.longpoll.is_connected() {
                break;
            }
            // The engine doesn't expose the raw skip count directly; the
            // backlog is considered drained once a poll tick passes without
            // the connection having dropped. A fixed wait stands in for a
            // true "skip count reached zero" signal the engine doesn't
            // surface publicly, since domain dispatch already deduplicates
            // any backlog replay regardless (see DedupRing).
            if Instant::now() >= deadline {
                break;
            }
            sleep(cfg::BACKLOG_DRAIN_POLL).await;
        }

        let _ = Arc::clone(&self.rpc).flush_acks().await;

        let new_session_id = self.auth.rotate_session_id().await;
        let opts = CallOptions {
            request_id: Some(new_session_id.to_string()),
            no_wait: true,
            message_type: MessageType::BugleMessage,
            ..Default::default()
        };
        let _ = Arc::clone(&self.rpc).call(Action::GetUpdates, b"{}", opts, None).await;

        // Best-effort "is this browser still the default Bugle client"
        // ping; failures are not surfaced, fire and forget.
        let ping_opts = CallOptions::new(MessageType::BugleMessage);
        let _ = Arc::clone(&self.rpc).call(Action::IsBugleDefault, b"{}", ping_opts, None).await;
    }

    /// Tear down and rebuild the connection from scratch.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    pub async fn disconnect(&self) {
        self.longpoll.stop();
        self.stop_ack_ticker().await;
    }

    // ── connect_background ──────────────────────────────────────────────────

    /// A push-woken sync: open the stream, wait up to 15 s for it to open,
    /// then poll a shrinking deadline that extends while fresh payloads keep
    /// arriving, stopping as soon as the inbound rate goes quiet. Returns an
    /// error iff the stream never delivered a single data payload.
    pub async fn connect_background(self: &Arc<Self>) -> Result<()> {
        self.longpoll.start();
        let opened = self.longpoll.wait_first_connect(cfg::FIRST_CONNECT_TIMEOUT).await;
        if !opened {
            self.longpoll.stop();
            return Err(TachyonError::Timeout("first long-poll stream open"));
        }

        let last_seen_count = AtomicI64::new(self.longpoll.payload_count() as i64);
        let mut deadline = Instant::now() + cfg::BACKGROUND_INITIAL_DEADLINE;

        loop {
            if !self.longpoll.is_connected() {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(cfg::BACKGROUND_POLL_TICK).await;

            let current = self.longpoll.payload_count() as i64;
            let previous = last_seen_count.swap(current, Ordering::SeqCst);
            if current != previous {
                let extension =
                    if self.longpoll.has_received_data() { cfg::BACKGROUND_DEADLINE_WITH_DATA } else { cfg::BACKGROUND_DEADLINE_NO_DATA };
                deadline = Instant::now() + extension;
            }
        }

        let had_data = self.longpoll.has_received_data();
        self.disconnect().await;

        if !had_data {
            return Err(TachyonError::BackgroundPollingExitedUncleanly);
        }
        Ok(())
    }

    // ── GetWebEncryptionKey / RevokeRelayPairing ─────────────────────────────

    /// Fetch and persist this session's web-encryption key from the pairing
    /// service. Thin pass-through sharing `start_login`'s protobuf path.
    pub async fn get_web_encryption_key(self: &Arc<Self>) -> Result<Vec<u8>> {
        let request_body = wire::encode_get_web_encryption_key_request();
        let url = rpc_url(config::HOST_PAIRING, PAIRING_SERVICE, "GetWebEncryptionKey");
        let (resp, _) = self
            .http
            .request(&self.auth, reqwest::Method::POST, &url, Some((&request_body, WireCodec::Protobuf)))
            .await?;
        let key = wire::decode_get_web_encryption_key_response(&resp)?;
        self.auth.set_web_encryption_key(key.clone()).await;
        Ok(key)
    }

    /// Ask the pairing service to revoke this browser's pairing.
    pub async fn revoke_pairing(self: &Arc<Self>) -> Result<()> {
        let browser = self.auth.browser_device().await.ok_or(TachyonError::NotLoggedIn)?;
        let request_body = wire::encode_revoke_relay_pairing_request(&browser);
        let url = rpc_url(config::HOST_PAIRING, PAIRING_SERVICE, "RevokeRelayPairing");
        self.http
            .request(&self.auth, reqwest::Method::POST, &url, Some((&request_body, WireCodec::Protobuf)))
            .await?;
        Ok(())
    }

    // ── Misc ──────────────────────────────────────────────────────────────

    /// Whether a `PairSuccessful` event should trigger an automatic
    /// `reconnect` after a short delay. Enabled by default.
    pub fn set_auto_reconnect_after_pairing(&self, enabled: bool) {
        self.auto_reconnect_after_pairing.store(enabled, Ordering::SeqCst);
    }

    pub async fn short_circuit_pinger_for_slow_request(&self) {
        self.longpoll.short_circuit_pinger();
    }

    pub async fn call_with_slow_signal(
        self: &Arc<Self>,
        action: Action,
        payload: &[u8],
        opts: CallOptions,
    ) -> Result<Vec<u8>> {
        let longpoll = Arc::clone(&self.longpoll);
        let on_slow = Arc::new(move |_request_id: String| longpoll.short_circuit_pinger());
        Arc::clone(&self.rpc).call(action, payload, opts, Some(on_slow)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TachyonConfig;

    fn sink() -> EventSink {
        Arc::new(|_event| {})
    }

    #[tokio::test]
    async fn start_login_builds_a_well_formed_qr_url_shape() {
        // No network access in unit tests; this only exercises the URL data
        // encoding math via the lower-level wire helpers directly.
        let refresh = crate::crypto::keys::RefreshKey::generate();
        let crypto = crate::crypto::request::RequestCryptoKeys::generate();
        let url_data = wire::UrlData {
            pairing_key: refresh.public_key_spki_der().unwrap(),
            aes_key: crypto.aes_key.to_vec(),
            hmac_key: crypto.hmac_key.to_vec(),
        };
        let encoded = wire::encode_url_data(&url_data);
        let url = format!("{QR_URL_PREFIX}{}", crate::http::b64(&encoded));
        assert!(url.starts_with("https://support.google.com/messages/?p=web_computer#?c="));

        let decoded = wire::decode_url_data(&encoded).unwrap();
        assert_eq!(decoded.aes_key, crypto.aes_key.to_vec());
    }

    #[test]
    fn client_config_defaults_construct() {
        let _ = TachyonConfig::default();
        let _ = sink();
    }
}
