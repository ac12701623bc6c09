//! The long-poll engine: holds the persistent `ReceiveMessages` stream open,
//! reconnects with backoff on transport failure, frames the `[[...]]`
//! response body into discrete JSON elements, and dispatches each decoded
//! envelope to events, RPC waiters, and the updates handler.
//!
//! The outer "reconnect, sleep on failure" loop runs alongside a sibling
//! pinger task that is spawned with the stream read and aborted on
//! disconnect.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthState;
use crate::config::{self, rpc_url, MESSAGING_SERVICE};
use crate::dedup::{DedupOutcome, DedupRing};
use crate::error::{Result, TachyonError};
use crate::events::{Event, EventSink};
use crate::http::HttpClient;
use crate::pinger::{Pinger, PingPulse, ReceiveCheckDeadline, ShortCircuit};
use crate::session::SessionRpc;
use crate::wire::{self, Action, BugleRoute, IncomingEnvelope, LongPollPayload, PairEvent, UpdateKind};

/// Five seconds per consecutive failure, capped at a minute:
/// `sleep min(5*(n+1), 60) seconds, n = consecutive errors`.
fn poll_backoff(consecutive_errors: u32) -> Duration {
    Duration::from_secs((5 * consecutive_errors).min(60) as u64)
}

/// Incrementally frames the `[[...]]` long-poll body into discrete JSON
/// values. The leading `[[` is two literal brackets: the outer array open
/// plus the first element's own open bracket, so only one is discarded —
/// the second is re-injected as the start of element one.
struct StreamFramer {
    buffer: Vec<u8>,
    prefix_seen: usize,
    closed: bool,
}

impl StreamFramer {
    fn new() -> Self {
        Self { buffer: Vec::new(), prefix_seen: 0, closed: false }
    }

    /// Feed one freshly-received chunk, returning any elements completed by
    /// it, in order. Errors are fatal for this stream attempt.
    fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for &byte in chunk {
            if self.closed {
                continue;
            }

            if self.prefix_seen < 2 {
                if byte != b'[' {
                    return Err(TachyonError::Framing(format!(
                        "expected '[' at long-poll stream prefix, got {byte:#x}"
                    )));
                }
                self.prefix_seen += 1;
                if self.prefix_seen == 2 {
                    self.buffer.push(b'[');
                }
                continue;
            }

            if self.buffer.is_empty() {
                match byte {
                    b',' | b' ' | b'\n' | b'\r' | b'\t' => continue,
                    b']' => {
                        self.closed = true;
                        continue;
                    }
                    _ => {}
                }
            }

            self.buffer.push(byte);
            if self.buffer.len() > config::MAX_ELEMENT_SIZE {
                return Err(TachyonError::Framing("long-poll element exceeded the 10 MB cap".into()));
            }

            if byte == b']' {
                // Always clear the buffer on a successful parse, even if a
                // later decode step fails, so the framer stays synchronized
                // with the stream.
                if let Ok(value) = serde_json::from_slice::<Value>(&self.buffer) {
                    out.push(value);
                    self.buffer.clear();
                }
            }
        }
        Ok(out)
    }
}

/// Callback fired once a `paired` pair-event is observed.
pub type OnPaired = Arc<dyn Fn(String, Value) + Send + Sync + 'static>;

/// The restartable poll loop plus its sibling ditto-pinger task. Owns the
/// connection-up flag, the payload counter, the "received data" flag, the
/// first-connect barrier, the backlog skip count, and the DedupRing — all
/// state that belongs to "the engine" as opposed to one connection attempt,
/// which only owns its own framer.
pub struct LongPollEngine {
    http: Arc<HttpClient>,
    auth: Arc<AuthState>,
    rpc: Arc<SessionRpc>,
    events: EventSink,
    on_paired: StdMutex<Option<OnPaired>>,

    connected: AtomicBool,
    payload_count: AtomicU64,
    received_data: AtomicBool,
    skip_count: AtomicI64,
    dedup: Mutex<DedupRing>,

    first_connect: Notify,
    first_connect_done: AtomicBool,

    poll_task: StdMutex<Option<JoinHandle<()>>>,
    pinger_task: StdMutex<Option<JoinHandle<()>>>,
    pinger_pulse: StdMutex<Option<PingPulse>>,
    pinger_short_circuit: StdMutex<Option<ShortCircuit>>,
    receive_check: StdMutex<Option<ReceiveCheckDeadline>>,
}

impl LongPollEngine {
    pub fn new(http: Arc<HttpClient>, auth: Arc<AuthState>, rpc: Arc<SessionRpc>, events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            http,
            auth,
            rpc,
            events,
            on_paired: StdMutex::new(None),
            connected: AtomicBool::new(false),
            payload_count: AtomicU64::new(0),
            received_data: AtomicBool::new(false),
            skip_count: AtomicI64::new(0),
            dedup: Mutex::new(DedupRing::new()),
            first_connect: Notify::new(),
            first_connect_done: AtomicBool::new(false),
            poll_task: StdMutex::new(None),
            pinger_task: StdMutex::new(None),
            pinger_pulse: StdMutex::new(None),
            pinger_short_circuit: StdMutex::new(None),
            receive_check: StdMutex::new(None),
        })
    }

    /// Register (or replace) the "on paired" callback invoked after a
    /// `paired` pair-event is persisted.
    pub fn set_on_paired(&self, callback: OnPaired) {
        *self.on_paired.lock().unwrap() = Some(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn payload_count(&self) -> u64 {
        self.payload_count.load(Ordering::SeqCst)
    }

    pub fn has_received_data(&self) -> bool {
        self.received_data.load(Ordering::SeqCst)
    }

    /// A handle the client facade can use to bump the receive-check deadline
    /// directly (not otherwise needed — the engine bumps it itself on every
    /// non-old data payload).
    pub fn receive_check_deadline(&self) -> Option<ReceiveCheckDeadline> {
        self.receive_check.lock().unwrap().clone()
    }

    /// Wait up to `timeout` for the first successful stream open (the
    /// client's `connect` uses a 15 s `FIRST_CONNECT_TIMEOUT`). Returns
    /// `true` iff it opened within the deadline.
    pub async fn wait_first_connect(&self, timeout: Duration) -> bool {
        if self.first_connect_done.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = self.first_connect.notified() => true,
            _ = sleep(timeout) => self.first_connect_done.load(Ordering::SeqCst),
        }
    }

    /// Spawn the poll loop as a background task. Idempotent: a second call
    /// while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { engine.poll_loop().await }));
    }

    /// Abort the poll loop and the pinger, if running.
    pub fn stop(&self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
        self.abort_pinger();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn spawn_pinger(self: &Arc<Self>) {
        let auth = Arc::clone(&self.auth);
        let should_ping: Arc<dyn Fn() -> bool + Send + Sync> = {
            let flag = Arc::new(AtomicBool::new(false));
            let updater_flag = Arc::clone(&flag);
            let updater_auth = Arc::clone(&auth);
            tokio::spawn(async move {
                loop {
                    let eligible =
                        updater_auth.is_logged_in().await && updater_auth.should_use_google_host().await;
                    updater_flag.store(eligible, Ordering::SeqCst);
                    sleep(Duration::from_secs(5)).await;
                }
            });
            Arc::new(move || flag.load(Ordering::SeqCst))
        };

        let (pinger, pulse, short_circuit, receive_check) =
            Pinger::new(Arc::clone(&self.rpc), Arc::clone(&self.auth), Arc::clone(&self.events), should_ping);
        *self.pinger_pulse.lock().unwrap() = Some(pulse);
        *self.pinger_short_circuit.lock().unwrap() = Some(short_circuit);
        *self.receive_check.lock().unwrap() = Some(receive_check);
        *self.pinger_task.lock().unwrap() = Some(tokio::spawn(pinger.run()));
    }

    fn abort_pinger(&self) {
        if let Some(task) = self.pinger_task.lock().unwrap().take() {
            task.abort();
        }
        self.pinger_pulse.lock().unwrap().take();
        self.pinger_short_circuit.lock().unwrap().take();
        self.receive_check.lock().unwrap().take();
    }

    fn pulse_pinger(&self) {
        if let Some(pulse) = self.pinger_pulse.lock().unwrap().as_ref() {
            pulse.notify_one();
        }
    }

    /// Short-circuit the pinger's current wait. Exposed so a caller issuing
    /// RPCs through [`SessionRpc::call`]'s `on_slow` hook — a 5 s slow timer
    /// — can wire it through.
    pub fn short_circuit_pinger(&self) {
        if let Some(sc) = self.pinger_short_circuit.lock().unwrap().as_ref() {
            sc.fire();
        }
    }

    async fn should_ping_phone(&self) -> bool {
        self.auth.is_logged_in().await && self.auth.should_use_google_host().await
    }

    /// Refresh the tachyon token before opening a fresh stream if a browser
    /// identity exists and the current token is expired or within the 1 h
    /// refresh window.
    async fn refresh_token_if_needed(&self) -> Result<()> {
        if self.auth.browser_device().await.is_none() || !self.auth.needs_token_refresh().await {
            return Ok(());
        }
        let Some(refresh_key) = self.auth.refresh_key().await else { return Ok(()) };
        let Some(token) = self.auth.tachyon_token().await else { return Ok(()) };

        let request_id = Uuid::new_v4().to_string();
        let timestamp_micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        let signature = refresh_key.sign_refresh_request(&request_id, timestamp_micros);

        let push_keys = self.auth.push_keys().await;
        let mut body = serde_json::json!({
            "requestId": request_id,
            "timestampMicros": timestamp_micros,
            "currentToken": crate::http::b64(&token),
            "signature": crate::http::b64(&signature),
        });
        if let Some(keys) = push_keys {
            body["pushKeys"] = serde_json::json!({
                "endpoint": keys.endpoint,
                "p256dh": crate::http::b64(&keys.p256dh),
                "auth": crate::http::b64(&keys.auth),
            });
        }

        let host = config::messaging_host(self.auth.should_use_google_host().await);
        let url = rpc_url(host, MESSAGING_SERVICE, "RefreshPhoneRelay");
        let payload = serde_json::to_vec(&body)?;
        let (resp, _) = self
            .http
            .request(&self.auth, reqwest::Method::POST, &url, Some((&payload, crate::pblite::WireCodec::Pblite)))
            .await?;

        let parsed: Value = serde_json::from_slice(&resp).unwrap_or(Value::Null);
        let new_token = parsed
            .get("tachyonAuthenticatedToken")
            .and_then(Value::as_str)
            .map(|s| crate::http::b64_decode(s))
            .transpose()?;
        let ttl_micros = parsed.get("ttl").and_then(Value::as_i64);
        if let Some(new_token) = new_token {
            self.auth.set_token(new_token, ttl_micros).await;
            (self.events)(Event::AuthTokenRefreshed);
        }
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut consecutive_errors: u32 = 0;
        let mut had_error = false;

        loop {
            if let Err(e) = self.refresh_token_if_needed().await {
                warn!(error = %e, "tachyon: token refresh before stream open failed");
            }

            let listen_request_id = Uuid::new_v4().to_string();
            let auth_request_id = Uuid::new_v4().to_string();
            let token = self.auth.tachyon_token().await.unwrap_or_default();
            let request_body =
                wire::encode_receive_messages_request(&listen_request_id, &auth_request_id, &token);
            let body = match serde_json::to_vec(&request_body) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "tachyon: failed to encode ReceiveMessagesRequest");
                    sleep(poll_backoff(1)).await;
                    continue;
                }
            };

            let host = config::messaging_host(self.auth.should_use_google_host().await);
            let url = rpc_url(host, MESSAGING_SERVICE, "ReceiveMessages");

            match self.http.open_stream(&self.auth, &url, &body).await {
                Ok(stream) => {
                    consecutive_errors = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    self.spawn_pinger();

                    let already_connected_once = self.first_connect_done.swap(true, Ordering::SeqCst);
                    if !already_connected_once {
                        self.first_connect.notify_one();
                    }
                    if had_error {
                        (self.events)(Event::ListenRecovered);
                        had_error = false;
                    }
                    if self.should_ping_phone().await {
                        self.pulse_pinger();
                    }

                    let result = self.drain_stream(stream).await;

                    self.connected.store(false, Ordering::SeqCst);
                    self.abort_pinger();
                    if let Err(e) = result {
                        had_error = true;
                        warn!(error = %e, "tachyon: long-poll stream ended with an error");
                        (self.events)(Event::ListenTemporaryError { error: e.to_string() });
                    }
                }
                Err(e) => {
                    had_error = true;
                    warn!(error = %e, "tachyon: failed to open long-poll stream");
                    (self.events)(Event::ListenTemporaryError { error: e.to_string() });
                }
            }

            consecutive_errors += 1;
            sleep(poll_backoff(consecutive_errors)).await;
        }
    }

    async fn drain_stream(&self, stream: impl Stream<Item = reqwest::Result<Bytes>>) -> Result<()> {
        tokio::pin!(stream);
        let mut framer = StreamFramer::new();
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    let elements = framer.feed(&chunk)?;
                    for element in elements {
                        self.payload_count.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = self.handle_element(&element).await {
                            debug!(error = %e, "tachyon: long-poll element dispatch error, continuing");
                        }
                    }
                }
                Some(Err(e)) => return Err(TachyonError::Http(e)),
                None => return Ok(()),
            }
        }
    }

    async fn handle_element(&self, element: &Value) -> Result<()> {
        match wire::parse_long_poll_payload(element)? {
            LongPollPayload::Ack { count } => {
                self.skip_count.store(count, Ordering::SeqCst);
                Ok(())
            }
            LongPollPayload::Other => Ok(()),
            LongPollPayload::Data(envelope) => {
                self.received_data.store(true, Ordering::SeqCst);
                self.handle_incoming(envelope).await
            }
        }
    }

    async fn handle_incoming(&self, envelope: IncomingEnvelope) -> Result<()> {
        match envelope.bugle_route {
            BugleRoute::PairEvent => self.handle_pair_event(&envelope).await,
            BugleRoute::GaiaEvent => Ok(()), // left unimplemented, see DESIGN.md.
            BugleRoute::DataEvent => self.handle_data_event(envelope).await,
        }
    }

    async fn handle_pair_event(&self, envelope: &IncomingEnvelope) -> Result<()> {
        let payload = envelope
            .unencrypted_data
            .as_deref()
            .or(envelope.encrypted_data.as_deref())
            .unwrap_or(&[]);
        let pair_event = parse_pair_event_payload(payload)?;
        match pair_event {
            PairEvent::Paired { phone_id, token, browser, mobile } => {
                self.auth.set_paired(browser, mobile, token).await;
                let data = serde_json::json!({ "phoneId": phone_id });
                (self.events)(Event::PairSuccessful { phone_id: phone_id.clone(), data: data.clone() });
                let callback = self.on_paired.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(phone_id, data);
                }
            }
            PairEvent::Revoked => {
                (self.events)(Event::GaiaLoggedOut);
            }
        }
        Ok(())
    }

    async fn handle_data_event(&self, envelope: IncomingEnvelope) -> Result<()> {
        self.rpc.queue_ack(envelope.response_id.clone()).await;

        let crypto = self.auth.request_crypto().await;
        let mut decrypted: Option<Vec<u8>> = None;

        if let (Some(enc), Some(crypto)) = (&envelope.encrypted_data, &crypto) {
            decrypted = Some(crypto.decrypt(enc)?);
        } else if let (Some(enc2), Some(crypto)) = (&envelope.encrypted_data2, &crypto) {
            let payload = crypto.decrypt(enc2)?;
            if is_fake_account_change(&payload) {
                (self.events)(Event::AccountChange { data: Value::Null, is_fake: true });
                return Ok(());
            }
            decrypted = Some(payload);
        }

        let payload_for_waiter = decrypted.clone().or_else(|| envelope.unencrypted_data.clone());

        let should_use_google_host = self.auth.should_use_google_host().await;
        let is_phantom = should_use_google_host
            && !envelope.action.is_gaia_pairing()
            && envelope.encrypted_data.is_none()
            && envelope.encrypted_data2.is_none()
            && envelope.unencrypted_data.is_some();

        let matched = if is_phantom {
            false
        } else if let Some(payload) = &payload_for_waiter {
            self.rpc.resolve(&envelope.session_id, Ok(payload.clone())).await
        } else {
            false
        };

        if matched {
            return Ok(());
        }

        let previous_skip = self.skip_count.load(Ordering::SeqCst);
        let is_old = previous_skip > 0;
        if is_old {
            self.skip_count.fetch_sub(1, Ordering::SeqCst);
        }

        // Every non-old data payload bumps the next data-receive-check
        // deadline forward, not just GET_UPDATES ones.
        if !is_old {
            if let Some(deadline) = self.receive_check_deadline() {
                deadline.bump();
            }
        }

        if envelope.action == Action::GetUpdates {
            if let Some(payload) = decrypted.as_deref().or(envelope.unencrypted_data.as_deref()) {
                self.dispatch_updates(payload, is_old).await?;
            }
        }

        if decrypted.is_none() {
            if let Some(unenc) = &envelope.unencrypted_data {
                if unenc.as_slice() == [0x72, 0x00] {
                    (self.events)(Event::GaiaLoggedOut);
                }
            }
        }

        Ok(())
    }

    async fn dispatch_updates(&self, payload: &[u8], is_old: bool) -> Result<()> {
        let value: Value = serde_json::from_slice(payload)?;
        let items = wire::parse_update_envelope(&value)?;

        let has_dedup_kind = items.iter().any(|i| matches!(i.kind, UpdateKind::Conversation | UpdateKind::Message));
        if has_dedup_kind {
            if let Some(update_id) = items.iter().find_map(|i| i.update_id.clone()) {
                let hash = DedupRing::sha256(payload);
                let outcome = self.dedup.lock().await.check(&update_id, hash);
                if outcome == DedupOutcome::Duplicate {
                    return Ok(());
                }
            }
        }

        for item in &items {
            match item.kind {
                UpdateKind::Conversation => {
                    (self.events)(Event::Conversation { data: item.raw.clone(), is_old })
                }
                UpdateKind::Message => (self.events)(Event::Message { data: item.raw.clone(), is_old }),
                UpdateKind::Typing => {
                    if !is_old {
                        (self.events)(Event::Typing { data: item.raw.clone() });
                    }
                }
                UpdateKind::UserAlert => {
                    if !is_old {
                        (self.events)(Event::UserAlert { data: item.raw.clone() });
                    }
                }
                UpdateKind::Settings => (self.events)(Event::Settings { data: item.raw.clone() }),
                UpdateKind::AccountChange => {
                    let is_fake = item.account.as_deref().is_some_and(|a| a.contains('@'));
                    (self.events)(Event::AccountChange { data: item.raw.clone(), is_fake });
                }
                UpdateKind::BrowserPresenceCheck | UpdateKind::Unknown => {}
            }
        }

        Ok(())
    }
}

/// Pair events are carried as the UTF-8 pblite JSON text of an
/// `authentication.PairEvent` message inside the envelope's payload bytes
/// field — a judgment call recorded in DESIGN.md, since the exact
/// sub-encoding is otherwise unspecified.
fn parse_pair_event_payload(payload: &[u8]) -> Result<PairEvent> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| TachyonError::Codec(format!("pair event payload was not UTF-8: {e}")))?;
    let value: Value = serde_json::from_str(text)?;
    wire::decode_pair_event(&value)
}

fn is_fake_account_change(payload: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<Value>(payload) else { return false };
    let Ok(items) = wire::parse_update_envelope(&value) else { return false };
    items
        .iter()
        .any(|item| item.kind == UpdateKind::AccountChange && item.account.as_deref().is_some_and(|a| a.contains('@')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_splits_two_elements_fed_in_one_chunk() {
        let mut framer = StreamFramer::new();
        let elements = framer.feed(br#"[[[1,"a"],[2,"b"]]]"#).unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0], serde_json::json!([1, "a"]));
        assert_eq!(elements[1], serde_json::json!([2, "b"]));
    }

    #[test]
    fn framer_handles_elements_split_across_chunks() {
        let mut framer = StreamFramer::new();
        let mut out = Vec::new();
        out.extend(framer.feed(b"[[[1,\"a").unwrap());
        out.extend(framer.feed(b"\"],[2,\"b\"]").unwrap());
        out.extend(framer.feed(b"]]").unwrap());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn framer_rejects_bad_prefix() {
        let mut framer = StreamFramer::new();
        assert!(framer.feed(b"{not json").is_err());
    }

    #[test]
    fn framer_errors_on_oversize_element() {
        let mut framer = StreamFramer::new();
        framer.feed(b"[[").unwrap();
        let huge = vec![b'a'; config::MAX_ELEMENT_SIZE + 1];
        assert!(framer.feed(&huge).is_err());
    }

    #[test]
    fn poll_backoff_is_linear_and_capped() {
        assert_eq!(poll_backoff(1), Duration::from_secs(5));
        assert_eq!(poll_backoff(2), Duration::from_secs(10));
        assert_eq!(poll_backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn fake_account_change_detects_at_sign_in_account() {
        let payload = serde_json::json!(["update-1", null, null, null, null, null, ["user@example.com"], null]);
        let bytes = serde_json::to_vec(&payload).unwrap();
        assert!(is_fake_account_change(&bytes));
    }
}
