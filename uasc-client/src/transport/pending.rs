// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The registry of outstanding service calls. Every request written to the channel is
//! registered here under its request id; the entry is resolved exactly once, by the matching
//! response, by its timeout, or by channel teardown.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::{debug, warn};
use tokio::sync::oneshot;

use uasc_core::ResponseMessage;
use uasc_types::StatusCode;

/// The resolution side of a registered call.
pub type ResponseSender = oneshot::Sender<Result<ResponseMessage, StatusCode>>;
/// What the caller holds while the call is outstanding.
pub type ResponseReceiver = oneshot::Receiver<Result<ResponseMessage, StatusCode>>;

struct PendingCall {
    sent_at: Instant,
    deadline: Instant,
    callback: ResponseSender,
}

/// Outstanding calls keyed by request id.
pub struct PendingCalls {
    calls: HashMap<u32, PendingCall>,
    max_inflight: usize,
}

impl PendingCalls {
    /// Create a registry bounded to `max_inflight` outstanding calls. 0 means unbounded.
    pub fn new(max_inflight: usize) -> Self {
        Self {
            calls: HashMap::new(),
            max_inflight,
        }
    }

    /// Register a call. Returns the receiver resolved when the call completes, or
    /// `BadTooManyOperations` when the registry is full.
    pub fn register(
        &mut self,
        request_id: u32,
        timeout: Duration,
    ) -> Result<ResponseReceiver, StatusCode> {
        if self.max_inflight > 0 && self.calls.len() >= self.max_inflight {
            warn!(
                "Rejecting request {request_id}, too many outstanding calls ({})",
                self.calls.len()
            );
            return Err(StatusCode::BadTooManyOperations);
        }
        let (send, recv) = oneshot::channel();
        let now = Instant::now();
        self.calls.insert(
            request_id,
            PendingCall {
                sent_at: now,
                deadline: now + timeout,
                callback: send,
            },
        );
        Ok(recv)
    }

    /// Resolve the call registered under `request_id`. The entry is removed before the
    /// callback fires, so a late duplicate cannot resolve it twice. Returns `false` for an
    /// unknown request id.
    pub fn complete(
        &mut self,
        request_id: u32,
        result: Result<ResponseMessage, StatusCode>,
    ) -> bool {
        match self.calls.remove(&request_id) {
            Some(call) => {
                debug!(
                    "Request {} completed after {:?}",
                    request_id,
                    call.sent_at.elapsed()
                );
                // The receiver may be gone if the caller stopped waiting; that is fine.
                let _ = call.callback.send(result);
                true
            }
            None => {
                debug!("Discarding response for unknown request id {request_id}");
                false
            }
        }
    }

    /// The earliest deadline among the outstanding calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.values().map(|call| call.deadline).min()
    }

    /// Resolve every call whose deadline has passed with `BadTimeout`.
    pub fn sweep(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            warn!("Request {request_id} timed out");
            self.complete(request_id, Err(StatusCode::BadTimeout));
        }
    }

    /// Resolve every outstanding call with the given status. Used at channel teardown.
    pub fn drain(&mut self, status: StatusCode) {
        let ids: Vec<u32> = self.calls.keys().copied().collect();
        for request_id in ids {
            self.complete(request_id, Err(status));
        }
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether there are no outstanding calls.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_exactly_once() {
        let mut pending = PendingCalls::new(0);
        let mut recv = pending.register(1, Duration::from_secs(10)).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.complete(1, Err(StatusCode::BadTimeout)));
        assert!(pending.is_empty());
        // A duplicate response cannot resolve the call a second time.
        assert!(!pending.complete(1, Err(StatusCode::BadShutdown)));

        assert_eq!(recv.try_recv().unwrap(), Err(StatusCode::BadTimeout));
        assert!(recv.try_recv().is_err());
    }

    #[test]
    fn sweep_times_out_only_expired() {
        let mut pending = PendingCalls::new(0);
        let mut fast = pending.register(1, Duration::from_millis(0)).unwrap();
        let mut slow = pending.register(2, Duration::from_secs(60)).unwrap();

        pending.sweep(Instant::now() + Duration::from_millis(1));
        assert_eq!(pending.len(), 1);
        assert_eq!(fast.try_recv().unwrap(), Err(StatusCode::BadTimeout));
        assert!(slow.try_recv().is_err());

        // Sweeping again with the same now is a no-op.
        pending.sweep(Instant::now() + Duration::from_millis(1));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn drain_on_teardown() {
        let mut pending = PendingCalls::new(0);
        let mut a = pending.register(1, Duration::from_secs(60)).unwrap();
        let mut b = pending.register(2, Duration::from_secs(60)).unwrap();
        pending.drain(StatusCode::BadShutdown);
        assert!(pending.is_empty());
        assert_eq!(a.try_recv().unwrap(), Err(StatusCode::BadShutdown));
        assert_eq!(b.try_recv().unwrap(), Err(StatusCode::BadShutdown));
    }

    #[test]
    fn inflight_cap() {
        let mut pending = PendingCalls::new(2);
        let _a = pending.register(1, Duration::from_secs(1)).unwrap();
        let _b = pending.register(2, Duration::from_secs(1)).unwrap();
        let err = pending.register(3, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, StatusCode::BadTooManyOperations);
        // Existing entries are untouched.
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn next_deadline_is_earliest() {
        let mut pending = PendingCalls::new(0);
        let _a = pending.register(1, Duration::from_secs(60)).unwrap();
        let _b = pending.register(2, Duration::from_secs(1)).unwrap();
        let deadline = pending.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(1));
    }
}
