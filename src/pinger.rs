//! The ditto pinger: a continuous health-check loop that probes the paired
//! phone via `notify-ditto-activity` and reports unresponsive / recovered
//! transitions.
//!
//! The pinger's three-way and five-way races map onto concurrent
//! `tokio::select!` over channels: `(rpc-done, timer-fired, reset-fired,
//! short-circuit-fired, reping-tick)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::auth::AuthState;
use crate::config::pinger as cfg;
use crate::config::BUGLE_DEFAULT_CHECK_INTERVAL;
use crate::events::{Event, EventSink};
use crate::session::{CallOptions, SessionRpc};
use crate::wire::{Action, MessageType};

/// At-most-one buffered pulse: `notify_one` coalesces additional signals
/// into a single pending permit.
pub type PingPulse = Arc<Notify>;

/// Unbuffered short-circuit signal: every send wakes exactly one waiter,
/// surplus sends are dropped (bounded mpsc of capacity 1, `try_send`).
#[derive(Clone)]
pub struct ShortCircuit {
    tx: mpsc::Sender<()>,
}

impl ShortCircuit {
    fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }
}

/// One-shot barrier shared across a ping chain: when the outermost ping
/// resolves, it notifies all sub-wait awaiters so they unblock instead of
/// hanging.
#[derive(Clone, Default)]
pub struct Resetter {
    notify: Arc<Notify>,
}

impl Resetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self) {
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

struct State {
    last_ping: Option<Instant>,
    ping_fails: u32,
    not_responding_sent: bool,
    first_ping_done: bool,
    id_counter: AtomicU64,
}

/// A deadline shared between the pinger and the long-poll engine: the
/// "receive-check bump" the engine applies on incoming data advances the
/// same deadline the pinger's "data-receive check" reads, so it lives
/// behind an `Arc<Mutex<_>>` instead of inside either component's private
/// state.
#[derive(Clone)]
pub struct ReceiveCheckDeadline(Arc<StdMutex<Instant>>);

impl ReceiveCheckDeadline {
    fn new(initial: Instant) -> Self {
        Self(Arc::new(StdMutex::new(initial)))
    }

    /// Advance the deadline to "now + the bugle default check interval" —
    /// every non-old data payload bumps the next data-receive-check
    /// deadline forward.
    pub fn bump(&self) {
        *self.0.lock().unwrap() = Instant::now() + BUGLE_DEFAULT_CHECK_INTERVAL;
    }

    fn get(&self) -> Instant {
        *self.0.lock().unwrap()
    }

    fn set(&self, when: Instant) {
        *self.0.lock().unwrap() = when;
    }
}

/// Runs the continuous ditto-ping loop. `should_ping` gates each cycle on
/// whether a token/browser is present and the session is on the Google host.
pub struct Pinger {
    rpc: Arc<SessionRpc>,
    auth: Arc<AuthState>,
    events: EventSink,
    pulse: PingPulse,
    short_circuit_rx: mpsc::Receiver<()>,
    should_ping: Arc<dyn Fn() -> bool + Send + Sync>,
    receive_check: ReceiveCheckDeadline,
}

impl Pinger {
    /// Returns the pinger (to be moved into a spawned task via [`Pinger::run`])
    /// plus the handles the long-poll engine uses to drive it: a pulse, a
    /// short-circuit signal, and the shared receive-check deadline. Takes an
    /// `AuthState` handle (not just `SessionRpc`) so the data-receive check's
    /// synthesized `GET_UPDATES` can use the current session id as its
    /// request id, per spec.
    pub fn new(
        rpc: Arc<SessionRpc>,
        auth: Arc<AuthState>,
        events: EventSink,
        should_ping: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> (Self, PingPulse, ShortCircuit, ReceiveCheckDeadline) {
        let pulse = Arc::new(Notify::new());
        let (short_circuit_tx, short_circuit_rx) = ShortCircuit::channel();
        let receive_check = ReceiveCheckDeadline::new(Instant::now() + BUGLE_DEFAULT_CHECK_INTERVAL);
        let pinger = Self {
            rpc,
            auth,
            events,
            pulse: Arc::clone(&pulse),
            short_circuit_rx,
            should_ping,
            receive_check: receive_check.clone(),
        };
        (pinger, pulse, short_circuit_tx, receive_check)
    }

    /// Drive the pinger loop forever (until the task is aborted by the
    /// owning long-poll engine on disconnect).
    pub async fn run(mut self) {
        let mut state = State {
            last_ping: None,
            ping_fails: 0,
            not_responding_sent: false,
            first_ping_done: false,
            id_counter: AtomicU64::new(0),
        };

        loop {
            tokio::select! {
                _ = self.pulse.notified() => {}
                _ = self.short_circuit_rx.recv() => {}
            }

            if !(self.should_ping)() {
                continue;
            }
            if let Some(last) = state.last_ping {
                if last.elapsed() < cfg::MIN_PING_SPACING {
                    continue;
                }
            }

            let cycle_start = Instant::now();
            self.run_one_ping_cycle(&mut state, false).await;
            self.maybe_data_receive_check(&mut state, cycle_start).await;
        }
    }

    /// One full ping attempt: send, race response/error/timeout/short-circuit,
    /// and on timeout run the exponential reping phase. `is_sub_ping` disables
    /// recursive reping — it never fires when the initial wait was itself a
    /// sub-ping.
    async fn run_one_ping_cycle(&mut self, state: &mut State, is_sub_ping: bool) {
        let ping_id = state.id_counter.fetch_add(1, Ordering::SeqCst);
        state.last_ping = Some(Instant::now());
        debug!(ping_id, "tachyon: sending ditto ping");

        let resetter = Resetter::new();
        let response_timeout = if is_sub_ping { cfg::SUB_PING_TIMEOUT } else { cfg::NORMAL_RESPONSE_TIMEOUT };
        let rpc = Arc::clone(&self.rpc);
        let ping_fut =
            Box::pin(rpc.call(Action::NotifyDittoActivity, b"{}", CallOptions::new(MessageType::BugleMessage), None));
        tokio::pin!(ping_fut);

        let deadline = sleep(response_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = &mut ping_fut => {
                    match result {
                        Ok(_) => self.on_ping_response(state, &resetter),
                        Err(e) => self.on_ping_error(state, &e),
                    }
                    return;
                }
                _ = self.short_circuit_rx.recv() => {
                    if !state.not_responding_sent {
                        state.not_responding_sent = true;
                        (self.events)(Event::PhoneNotResponding);
                    }
                    // keep racing the same ping/timeout.
                }
                _ = &mut deadline => {
                    self.on_ping_timeout(state);
                    if !is_sub_ping {
                        self.run_reping_phase(state, &resetter).await;
                    }
                    return;
                }
            }
        }
    }

    fn on_ping_response(&self, state: &mut State, resetter: &Resetter) {
        if state.not_responding_sent || state.ping_fails > 0 {
            (self.events)(Event::PhoneRespondingAgain);
        }
        state.ping_fails = 0;
        state.not_responding_sent = false;
        state.first_ping_done = true;
        resetter.resolve();
    }

    fn on_ping_error(&self, state: &mut State, error: &crate::error::TachyonError) {
        state.ping_fails += 1;
        warn!(error = %error, fails = state.ping_fails, "tachyon: ditto ping failed");
        (self.events)(Event::PingFailed { error: error.to_string(), consecutive_failures: state.ping_fails });
    }

    /// On timeout, `phoneNotResponding` fires iff `(not firstPingDone) OR
    /// sendNotResponding` and not already sent. This core always treats
    /// `sendNotResponding` as true (no caller-configurable opt-out is
    /// exposed), so the effective condition is just "not already sent".
    fn on_ping_timeout(&self, state: &mut State) {
        if !state.not_responding_sent {
            state.not_responding_sent = true;
            (self.events)(Event::PhoneNotResponding);
        }
    }

    /// Exponential reping ticker: 60 s, doubling, capped at 64 min. Each tick
    /// issues a sub-ping; the outer ping continues racing response/error/
    /// reset/short-circuit via the shared [`Resetter`].
    async fn run_reping_phase(&mut self, state: &mut State, resetter: &Resetter) {
        let mut wait = cfg::REPING_START;
        loop {
            tokio::select! {
                _ = resetter.wait() => return,
                _ = sleep(wait) => {}
            }
            self.run_one_ping_cycle(state, true).await;
            if !state.not_responding_sent {
                // a sub-ping resolved the episode; stop repinging.
                return;
            }
            wait = Duration::min(wait * 2, cfg::REPING_CAP);
        }
    }

    /// Data-receive check: synthesize a no-wait `GET_UPDATES` if the
    /// deadline passed or the cycle ran unusually long.
    async fn maybe_data_receive_check(&self, _state: &mut State, cycle_start: Instant) {
        let now = Instant::now();
        let deadline = self.receive_check.get();
        let cycle_duration = now.duration_since(cycle_start);
        let overdue = now >= deadline;
        let very_slow = cycle_duration > Duration::from_secs(5 * 60);
        let moderately_slow_and_check_stale = cycle_duration > Duration::from_secs(60)
            && deadline.saturating_duration_since(now) + cycle_duration > Duration::from_secs(30 * 60);

        if overdue || very_slow || moderately_slow_and_check_stale {
            self.receive_check.set(now + BUGLE_DEFAULT_CHECK_INTERVAL);
            let request_id = self.auth.session_id().await.to_string();
            let opts = CallOptions {
                request_id: Some(request_id),
                no_wait: true,
                omit_ttl: true,
                message_type: MessageType::BugleMessage,
                ..Default::default()
            };
            let _ = Arc::clone(&self.rpc).call(Action::GetUpdates, b"{}", opts, None).await;
            (self.events)(Event::NoDataReceived);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_circuit_surplus_signals_are_dropped() {
        let (sc, mut rx) = ShortCircuit::channel();
        sc.fire();
        sc.fire();
        sc.fire();
        assert!(rx.try_recv().is_ok(), "first signal delivered");
        assert!(rx.try_recv().is_err(), "surplus signals coalesced away, not queued");
    }

    #[tokio::test]
    async fn resetter_wakes_all_waiters() {
        let resetter = Resetter::new();
        let r1 = resetter.clone();
        let r2 = resetter.clone();
        let a = tokio::spawn(async move { r1.wait().await });
        let b = tokio::spawn(async move { r2.wait().await });
        tokio::task::yield_now().await;
        resetter.resolve();
        a.await.unwrap();
        b.await.unwrap();
    }
}
