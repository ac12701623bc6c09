//! The session RPC engine: builds outgoing envelopes, issues request-id
//! keyed waiters, batches acks on a timer, and raises the "slow request"
//! signal.
//!
//! The waiter table is a `Mutex<HashMap<String, oneshot::Sender<...>>>`; the
//! ack batch ticker is a `tokio::time::interval` loop spawned once.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tokio::time::{interval, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthState;
use crate::config::{rpc_url, ACK_BATCH_INTERVAL, MESSAGING_SERVICE, SLOW_REQUEST_TIMEOUT};
use crate::error::{Result, TachyonError};
use crate::http::HttpClient;
use crate::pblite::WireCodec;
use crate::wire::{Action, MessageType, OutgoingEnvelope};

/// Either the decoded response payload or a failure, delivered once to a
/// pending request's waiter.
pub type RpcOutcome = std::result::Result<Vec<u8>, String>;

struct PendingRequest {
    tx: oneshot::Sender<RpcOutcome>,
}

/// Options for one outgoing call, covering the envelope-construction knobs
/// a caller might need to override.
#[derive(Default)]
pub struct CallOptions {
    /// Honor a caller-supplied request id instead of generating one.
    pub request_id: Option<String>,
    /// Send `unencrypted_proto_data` instead of the default encrypted form.
    pub unencrypted: bool,
    /// Suppress the TTL field even when AuthState has a default.
    pub omit_ttl: bool,
    /// Don't wait for a response; used for "no-wait" nudges like the
    /// `GET_UPDATES` sent from `postConnect`/the data-receive check.
    pub no_wait: bool,
    pub message_type: MessageType,
}

impl CallOptions {
    pub fn new(message_type: MessageType) -> Self {
        Self { message_type, ..Default::default() }
    }
}

/// Fired at most once per outstanding request, 5 s after it was sent, iff
/// still pending — the "slow request" signal. Used by the long-poll engine
/// to short-circuit the pinger.
pub type SlowCallback = Arc<dyn Fn(String) + Send + Sync + 'static>;

/// Builds and issues outgoing RPC envelopes, correlates responses delivered
/// out-of-band on the long-poll stream, and batches ack ids on a timer.
pub struct SessionRpc {
    http: Arc<HttpClient>,
    auth: Arc<AuthState>,
    waiters: Mutex<HashMap<String, PendingRequest>>,
    ack_queue: Mutex<Vec<String>>,
}

impl SessionRpc {
    pub fn new(http: Arc<HttpClient>, auth: Arc<AuthState>) -> Self {
        Self { http, auth, waiters: Mutex::new(HashMap::new()), ack_queue: Mutex::new(Vec::new()) }
    }

    /// Construct and send one RPC envelope, correlating the response via the
    /// long-poll stream. `on_slow`, if given, fires at most once 5 s after
    /// send iff the waiter is still pending.
    ///
    /// Takes `self: Arc<Self>` (not `&self`) because the slow-request watcher
    /// is a detached `'static` task that needs its own owning handle.
    pub async fn call(
        self: Arc<Self>,
        action: Action,
        payload: &[u8],
        opts: CallOptions,
        on_slow: Option<SlowCallback>,
    ) -> Result<Vec<u8>> {
        if !self.auth.is_logged_in().await {
            return Err(TachyonError::NotLoggedIn);
        }
        let crypto = self.auth.request_crypto().await.ok_or(TachyonError::NotLoggedIn)?;
        let (encrypted, unencrypted) = if opts.unencrypted {
            (None, Some(payload.to_vec()))
        } else {
            (Some(crypto.encrypt(payload)?), None)
        };

        let request_id = opts.request_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string().to_lowercase());
        let session_id = self.auth.session_id().await.to_string();
        let mobile = self.auth.mobile_device().await;
        let token = self.auth.tachyon_token().await.unwrap_or_default();
        let ttl_micros = if opts.omit_ttl { None } else { Some(self.auth.tachyon_ttl_micros().await) };

        let envelope = OutgoingEnvelope {
            mobile,
            request_id: request_id.clone(),
            message_type: opts.message_type,
            action,
            session_id,
            encrypted_proto_data: encrypted,
            unencrypted_proto_data: unencrypted,
            auth_request_id: request_id.clone(),
            token,
            destination_registration_ids: self
                .auth
                .dest_reg_id()
                .await
                .map(|id| vec![id.to_string()])
                .unwrap_or_default(),
            ttl_micros,
        };

        let body = serde_json::to_vec(&envelope.encode())?;

        if opts.no_wait {
            self.post(&body).await?;
            return Ok(Vec::new());
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(request_id.clone(), PendingRequest { tx });

        if let Err(e) = self.post(&body).await {
            self.waiters.lock().await.remove(&request_id);
            return Err(e);
        }

        if let Some(on_slow) = on_slow {
            let this = Arc::clone(self);
            let rid = request_id.clone();
            tokio::spawn(async move {
                sleep(SLOW_REQUEST_TIMEOUT).await;
                if this.has_waiter(&rid).await {
                    debug!(request_id = %rid, "tachyon: request still pending after 5s, firing slow callback");
                    on_slow(rid);
                }
            });
        }

        match rx.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(TachyonError::Other(err)),
            Err(_) => Err(TachyonError::Cancelled),
        }
    }

    async fn post(&self, body: &[u8]) -> Result<()> {
        let host = crate::config::messaging_host(self.auth.should_use_google_host().await);
        let url = rpc_url(host, MESSAGING_SERVICE, "SendMessage");
        self.http
            .request(&self.auth, reqwest::Method::POST, &url, Some((body, WireCodec::Pblite)))
            .await?;
        Ok(())
    }

    /// Remove a waiter by request id, used by explicit caller cancellation.
    /// Cancellation removes the waiter without sending anything.
    pub async fn cancel(&self, request_id: &str) {
        self.waiters.lock().await.remove(request_id);
    }

    /// Resolve a waiter keyed by `session_id`. A lookup-key quirk: incoming
    /// data envelopes are matched by the envelope's `session_id` field, not
    /// a distinct response id. Returns `true` iff a waiter matched.
    pub async fn resolve(&self, session_id: &str, outcome: RpcOutcome) -> bool {
        match self.waiters.lock().await.remove(session_id) {
            Some(p) => {
                let _ = p.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub async fn has_waiter(&self, request_id: &str) -> bool {
        self.waiters.lock().await.contains_key(request_id)
    }

    // ── Ack batching ──────────────────────────────────────────────────────

    pub async fn queue_ack(&self, response_id: String) {
        self.ack_queue.lock().await.push(response_id);
    }

    pub async fn has_queued_acks(&self) -> bool {
        !self.ack_queue.lock().await.is_empty()
    }

    /// Flush the queued ack ids via `AckMessages`. Re-queues on failure or
    /// when AuthState lacks a token/browser identity (ack requires both).
    pub async fn flush_acks(self: Arc<Self>) -> Result<()> {
        let batch = {
            let mut q = self.ack_queue.lock().await;
            if q.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *q)
        };

        if !self.auth.is_logged_in().await {
            self.ack_queue.lock().await.extend(batch);
            return Ok(());
        }

        let payload = serde_json::json!({ "ids": batch.clone() }).to_string().into_bytes();
        let opts = CallOptions { no_wait: true, message_type: MessageType::BugleMessage, ..Default::default() };
        match Arc::clone(&self).call(Action::AckMessages, &payload, opts, None).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "tachyon: ack batch post failed, re-queueing");
                self.ack_queue.lock().await.extend(batch);
                Ok(())
            }
        }
    }

    /// Run the 5 s ack-flush ticker until `shutdown` resolves. Stopping the
    /// ticker always flushes once more, matching "stopping the ticker
    /// optionally flushes once" (the client facade always opts in).
    pub async fn run_ack_ticker(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut tick = interval(ACK_BATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = Arc::clone(&self).flush_acks().await {
                        warn!(error = %e, "tachyon: ack ticker flush error");
                    }
                }
                _ = &mut shutdown => {
                    let _ = Arc::clone(&self).flush_acks().await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TachyonConfig;

    fn make_rpc() -> Arc<SessionRpc> {
        let http = Arc::new(HttpClient::new(TachyonConfig::default()).unwrap());
        let auth = Arc::new(AuthState::new_for_pairing(false));
        Arc::new(SessionRpc::new(http, auth))
    }

    #[tokio::test]
    async fn resolve_with_no_waiter_returns_false() {
        let rpc = make_rpc();
        assert!(!rpc.resolve("nonexistent", Ok(vec![])).await);
    }

    #[tokio::test]
    async fn call_without_login_fails_fast() {
        let rpc = make_rpc();
        let err =
            Arc::clone(&rpc).call(Action::GetUpdates, b"{}", CallOptions::default(), None).await.unwrap_err();
        assert!(matches!(err, TachyonError::NotLoggedIn));
    }

    #[tokio::test]
    async fn ack_queue_accumulates_and_flush_requeues_without_login() {
        let rpc = make_rpc();
        rpc.queue_ack("id-1".into()).await;
        rpc.queue_ack("id-2".into()).await;
        assert!(rpc.has_queued_acks().await);
        Arc::clone(&rpc).flush_acks().await.unwrap();
        // not logged in => re-queued, not dropped
        assert!(rpc.has_queued_acks().await);
    }

    #[tokio::test]
    async fn cancel_removes_waiter_without_resolving() {
        let rpc = make_rpc();
        let (tx, _rx) = oneshot::channel();
        rpc.waiters.lock().await.insert("req-1".into(), PendingRequest { tx });
        assert!(rpc.has_waiter("req-1").await);
        rpc.cancel("req-1").await;
        assert!(!rpc.has_waiter("req-1").await);
        assert!(!rpc.resolve("req-1", Ok(vec![])).await);
    }
}
