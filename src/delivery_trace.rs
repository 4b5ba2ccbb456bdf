use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Synchronization handle for one logical traced send: which peers were targeted, and which
///  of them have acknowledged delivery so far.
///
/// A fragmented send creates one trace per fragment, chained through `next`; the public wait
///  and peek operations walk the whole chain, so "fully delivered" means every fragment
///  reached every target. All traces of one chain share a single notifier, so a waiter wakes
///  on any delivery anywhere in the chain and re-checks.
#[derive(Debug)]
pub struct DeliveryTrace {
    state: Mutex<TraceState>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct TraceState {
    targets: Vec<SocketAddr>,
    delivered: Vec<SocketAddr>,
    next: Option<Arc<DeliveryTrace>>,
}

impl DeliveryTrace {
    pub(crate) fn new() -> Arc<DeliveryTrace> {
        Self::with_notify(Arc::new(Notify::new()))
    }

    fn with_notify(notify: Arc<Notify>) -> Arc<DeliveryTrace> {
        Arc::new(DeliveryTrace {
            state: Mutex::new(TraceState {
                targets: Vec::new(),
                delivered: Vec::new(),
                next: None,
            }),
            notify,
        })
    }

    pub(crate) fn add_target(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        if !state.targets.contains(&addr) {
            state.targets.push(addr);
        }
    }

    /// Called from the receive path when an ack retires the traced message for `addr`.
    pub(crate) fn mark_delivered(&self, addr: SocketAddr) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.delivered.contains(&addr) {
                state.delivered.push(addr);
            }
        }
        self.notify.notify_waiters();
    }

    /// Returns the trace for the next fragment of the same logical send, creating it on
    ///  first use. The returned trace shares this trace's notifier.
    pub(crate) fn chain_next(self: &Arc<Self>) -> Arc<DeliveryTrace> {
        let mut state = self.state.lock().unwrap();
        match &state.next {
            Some(next) => next.clone(),
            None => {
                let next = DeliveryTrace::with_notify(self.notify.clone());
                state.next = Some(next.clone());
                next
            }
        }
    }

    /// Non-blocking: have all targets of all chained fragments acknowledged?
    pub fn peek_all(&self) -> bool {
        let state = self.state.lock().unwrap();
        let this_done = state.targets.iter().all(|t| state.delivered.contains(t));
        let next = state.next.clone();
        drop(state);

        this_done && next.map_or(true, |n| n.peek_all())
    }

    /// Non-blocking: has `addr` acknowledged every chained fragment it was targeted by?
    ///  Returns false if `addr` is not a target of this trace at all.
    pub fn peek_specific(&self, addr: SocketAddr) -> bool {
        self.is_target(addr) && self.delivered_to(addr)
    }

    fn is_target(&self, addr: SocketAddr) -> bool {
        self.state.lock().unwrap().targets.contains(&addr)
    }

    fn delivered_to(&self, addr: SocketAddr) -> bool {
        let state = self.state.lock().unwrap();
        let this_done = !state.targets.contains(&addr) || state.delivered.contains(&addr);
        let next = state.next.clone();
        drop(state);

        this_done && next.map_or(true, |n| n.delivered_to(addr))
    }

    /// Waits until all targets of all chained fragments have acknowledged, or until the
    ///  timeout elapses. Returns whether delivery completed.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // enabled before the check, so a delivery racing in from another thread between
            // the check and the await still wakes us
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.peek_all() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.peek_all();
            }
        }
    }

    /// Waits until `addr` has acknowledged every chained fragment, or until the timeout
    ///  elapses. It is an error to wait for an address that was never targeted.
    pub async fn wait_specific(&self, addr: SocketAddr, timeout: Duration) -> anyhow::Result<bool> {
        if !self.is_target(addr) {
            bail!("{:?} is not a target of this delivery trace", addr);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.delivered_to(addr) {
                return Ok(true);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(self.delivered_to(addr));
            }
        }
    }
}
