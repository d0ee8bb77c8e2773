//! Pluggable network responder for deterministic tests: records outbound
//! commands and delivers canned responses at scheduled virtual dates.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::net::{CommandDispatcher, OutboundRequest, RemoteResponse, RequestId};
use crate::sched::Date;

/// Mock network: dispatched commands pile up for the test to inspect;
/// responses the test schedules are released by delivery date.
pub struct MockNetwork {
    inner: Mutex<MockNetworkInner>,
}

struct MockNetworkInner {
    pending: VecDeque<OutboundRequest>,
    scheduled: Vec<(Date, u64, RequestId, RemoteResponse)>,
    seq: u64,
}

impl MockNetwork {
    /// Creates a new mock network behind an `Arc` for sharing with the
    /// coordinator under test.
    pub fn new() -> Arc<MockNetwork> {
        Arc::new(MockNetwork {
            inner: Mutex::new(MockNetworkInner {
                pending: VecDeque::new(),
                scheduled: Vec::new(),
                seq: 0,
            }),
        })
    }

    /// True if any dispatched command awaits inspection.
    pub fn has_ready_requests(&self) -> bool {
        !self.inner.lock().unwrap().pending.is_empty()
    }

    /// Pops the oldest dispatched command.
    pub fn take_request(&self) -> Option<OutboundRequest> {
        self.inner.lock().unwrap().pending.pop_front()
    }

    /// Drops a request without responding, like a partitioned peer.
    pub fn black_hole(&self, req: OutboundRequest) {
        pf_debug!("black holing request {} to {}", req.id, req.target);
    }

    /// Schedules a response for delivery at the given date.
    pub fn schedule_response(&self, id: RequestId, at: Date, resp: RemoteResponse) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.seq;
        inner.seq += 1;
        inner.scheduled.push((at, seq, id, resp));
    }

    /// Earliest pending delivery date, if any.
    pub fn next_delivery(&self) -> Option<Date> {
        self.inner
            .lock()
            .unwrap()
            .scheduled
            .iter()
            .map(|&(at, ..)| at)
            .min()
    }

    /// Releases all responses due at or before `now`, in schedule order.
    pub fn take_due_responses(&self, now: Date) -> Vec<(RequestId, RemoteResponse)> {
        let mut inner = self.inner.lock().unwrap();
        let mut due: Vec<_> = Vec::new();
        let mut rest = Vec::new();
        for entry in inner.scheduled.drain(..) {
            if entry.0 <= now {
                due.push(entry);
            } else {
                rest.push(entry);
            }
        }
        inner.scheduled = rest;
        due.sort_by_key(|&(at, seq, ..)| (at, seq));
        due.into_iter().map(|(_, _, id, resp)| (id, resp)).collect()
    }
}

impl CommandDispatcher for MockNetwork {
    fn dispatch(&self, req: OutboundRequest) {
        self.inner.lock().unwrap().pending.push_back(req);
    }
}
