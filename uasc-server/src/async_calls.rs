// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The async call manager: bookkeeping for service calls whose results are produced on a
//! worker pool and re-enter the network loop later. Each entry tracks a countdown of
//! expected results; results default to `BadTimeout` so a sweep can complete an entry that
//! waited too long.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, warn};

use uasc_types::{Error, NodeId, StatusCode};

/// A call being worked on outside the network loop.
#[derive(Debug)]
pub struct AsyncCallEntry {
    /// The request id of the call, scoped to its session.
    pub request_id: u32,
    /// The session the call belongs to.
    pub session_id: NodeId,
    /// The request handle to answer with.
    pub request_handle: u32,
    /// When the call was dispatched to the worker.
    pub dispatched_at: Instant,
    /// How many results are still outstanding.
    pub countdown: usize,
    /// Per-operation results. Prefilled with `BadTimeout`, overwritten as workers finish.
    pub results: Vec<StatusCode>,
}

impl AsyncCallEntry {
    /// Whether every operation of the call has produced a result.
    pub fn is_done(&self) -> bool {
        self.countdown == 0
    }
}

/// Owns the outstanding async calls. The size counter is atomic so workers can observe it
/// without the registry lock; structural mutation happens on the network loop only.
pub struct AsyncCallManager {
    entries: Vec<AsyncCallEntry>,
    current_count: Arc<AtomicUsize>,
    timeout: Duration,
}

impl AsyncCallManager {
    /// Create a manager completing stragglers after `timeout_ms`.
    pub fn new(timeout_ms: u64) -> AsyncCallManager {
        AsyncCallManager {
            entries: Vec::new(),
            current_count: Arc::new(AtomicUsize::new(0)),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// The shared outstanding-call counter.
    pub fn current_count(&self) -> Arc<AtomicUsize> {
        self.current_count.clone()
    }

    /// Register a call expecting `operation_count` results.
    pub fn create_entry(
        &mut self,
        session_id: NodeId,
        request_id: u32,
        request_handle: u32,
        operation_count: usize,
    ) -> Result<(), Error> {
        if self.get_by_id(request_id, &session_id).is_some() {
            return Err(Error::new(
                StatusCode::BadInternalError,
                format!("Async call entry for request {request_id} already exists"),
            ));
        }
        debug!("Creating async call entry, request {request_id}, {operation_count} operations");
        self.entries.push(AsyncCallEntry {
            request_id,
            session_id,
            request_handle,
            dispatched_at: Instant::now(),
            countdown: operation_count,
            // Unfinished operations answer BadTimeout.
            results: vec![StatusCode::BadTimeout; operation_count],
        });
        self.current_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Look up an entry by request and session.
    pub fn get_by_id(&self, request_id: u32, session_id: &NodeId) -> Option<&AsyncCallEntry> {
        self.entries
            .iter()
            .find(|entry| entry.request_id == request_id && &entry.session_id == session_id)
    }

    /// Record one operation result. Returns the whole entry once its countdown reaches
    /// zero, for the caller to answer.
    pub fn set_result(
        &mut self,
        request_id: u32,
        session_id: &NodeId,
        operation_index: usize,
        status: StatusCode,
    ) -> Result<Option<AsyncCallEntry>, Error> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.request_id == request_id && &entry.session_id == session_id)
            .ok_or_else(|| {
                Error::new(
                    StatusCode::BadNotFound,
                    format!("No async call entry for request {request_id}"),
                )
            })?;
        let entry = &mut self.entries[index];
        if operation_index >= entry.results.len() {
            return Err(Error::new(
                StatusCode::BadInvalidArgument,
                format!(
                    "Operation index {} is out of bounds for {} operations",
                    operation_index,
                    entry.results.len()
                ),
            ));
        }
        entry.results[operation_index] = status;
        entry.countdown = entry.countdown.saturating_sub(1);
        if entry.is_done() {
            Ok(Some(self.remove_at(index)))
        } else {
            Ok(None)
        }
    }

    /// Drop an entry without completing it, e.g. because its session is gone.
    pub fn remove_entry(&mut self, request_id: u32, session_id: &NodeId) {
        if let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.request_id == request_id && &entry.session_id == session_id)
        {
            self.remove_at(index);
        }
    }

    /// Complete entries that waited longer than the configured timeout. Their remaining
    /// results stay `BadTimeout`; the returned entries are answered by the caller.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<AsyncCallEntry> {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            if !entry.is_done() && entry.dispatched_at + self.timeout <= now {
                warn!(
                    "Async call {} was removed due to a timeout",
                    entry.request_id
                );
                expired.push(self.remove_at(index));
            } else {
                index += 1;
            }
        }
        expired
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no outstanding entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_at(&mut self, index: usize) -> AsyncCallEntry {
        self.current_count.fetch_sub(1, Ordering::Relaxed);
        self.entries.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> NodeId {
        NodeId::new_numeric(1, 99)
    }

    #[test]
    fn results_complete_entry() {
        let mut manager = AsyncCallManager::new(120_000);
        manager.create_entry(session(), 5, 10, 2).unwrap();
        assert_eq!(manager.current_count().load(Ordering::Relaxed), 1);

        let done = manager
            .set_result(5, &session(), 0, StatusCode::Good)
            .unwrap();
        assert!(done.is_none());

        let done = manager
            .set_result(5, &session(), 1, StatusCode::BadNotSupported)
            .unwrap()
            .expect("entry should be complete");
        assert_eq!(done.results, vec![StatusCode::Good, StatusCode::BadNotSupported]);
        assert!(manager.is_empty());
        assert_eq!(manager.current_count().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn duplicate_entry_rejected() {
        let mut manager = AsyncCallManager::new(120_000);
        manager.create_entry(session(), 5, 10, 1).unwrap();
        let err = manager.create_entry(session(), 5, 10, 1).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadInternalError);
    }

    #[test]
    fn timeout_completes_with_bad_timeout() {
        let mut manager = AsyncCallManager::new(1_000);
        manager.create_entry(session(), 7, 11, 2).unwrap();
        manager
            .set_result(7, &session(), 0, StatusCode::Good)
            .unwrap();

        assert!(manager.check_timeouts(Instant::now()).is_empty());
        let expired = manager.check_timeouts(Instant::now() + Duration::from_millis(1_001));
        assert_eq!(expired.len(), 1);
        // The finished operation keeps its result, the rest answer BadTimeout.
        assert_eq!(expired[0].results, vec![StatusCode::Good, StatusCode::BadTimeout]);
        assert!(manager.is_empty());
    }

    #[test]
    fn out_of_bounds_result_rejected() {
        let mut manager = AsyncCallManager::new(120_000);
        manager.create_entry(session(), 8, 12, 1).unwrap();
        assert!(manager
            .set_result(8, &session(), 3, StatusCode::Good)
            .is_err());
    }
}
