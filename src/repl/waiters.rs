//! Sleeping operations: write-concern waiters, read-concern waiters, and
//! the handles their callers block on.

use crate::repl::optime::{OpTime, SnapshotName};
use crate::sched::{Date, EventHandle};
use crate::utils::{ErrorCode, ReplSetError};

use tokio::sync::oneshot;

/// Mode string of the majority write concern.
pub const MAJORITY_MODE: &str = "majority";

/// How long a blocking operation is willing to wait.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum WTimeout {
    /// Check once, never sleep.
    NoWaiting,

    /// Sleep until satisfied (or cancelled).
    NoTimeout,

    /// Sleep up to this many milliseconds.
    Millis(u64),
}

/// The durability predicate of a write concern.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum WValue {
    /// At least this many members, self included.
    Nodes(usize),

    /// A named mode from the config, or `"majority"`.
    Mode(String),
}

/// Durability predicate attached to a write.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct WriteConcern {
    pub w: WValue,
    pub timeout: WTimeout,
}

impl WriteConcern {
    /// Numeric node-count concern.
    pub fn nodes(num: usize, timeout: WTimeout) -> Self {
        WriteConcern {
            w: WValue::Nodes(num),
            timeout,
        }
    }

    /// Named-mode concern.
    pub fn mode(name: impl ToString, timeout: WTimeout) -> Self {
        WriteConcern {
            w: WValue::Mode(name.to_string()),
            timeout,
        }
    }

    /// The majority concern.
    pub fn majority(timeout: WTimeout) -> Self {
        Self::mode(MAJORITY_MODE, timeout)
    }

    /// True if this is the majority concern.
    pub fn is_majority(&self) -> bool {
        matches!(&self.w, WValue::Mode(m) if m == MAJORITY_MODE)
    }
}

/// Freshness predicate attached to a read.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ReadConcernLevel {
    Local,
    Majority,
}

/// A read-concern wait request.
#[derive(Debug, PartialEq, Clone)]
pub struct ReadConcernArgs {
    /// Position the read must observe; absent means no waiting.
    pub target: Option<OpTime>,
    pub level: ReadConcernLevel,
}

impl ReadConcernArgs {
    pub fn new(target: Option<OpTime>, level: ReadConcernLevel) -> Self {
        ReadConcernArgs { target, level }
    }
}

/// What a registered waiter sleeps on.
#[derive(Debug, PartialEq, Clone)]
pub enum WaitCondition {
    /// Replication of `target` under a write concern.
    Replication(WriteConcern),

    /// Local applied position reaching `target`.
    ReadLocal,

    /// Committed snapshot position reaching `target`.
    ReadMajority,
}

/// One sleeping operation.
pub struct Waiter {
    pub id: u64,
    pub op_id: u64,
    pub target: OpTime,
    pub condition: WaitCondition,

    /// Snapshot name reserved at operation start; gates majority concerns.
    pub min_snapshot: Option<SnapshotName>,

    pub registered_at: Date,

    /// Deadline event in the coordinator's queue, if any.
    pub deadline_event: Option<EventHandle>,

    tx: oneshot::Sender<Result<(), ReplSetError>>,
}

impl Waiter {
    fn finish(self, now: Date, mut result: Result<(), ReplSetError>) {
        if let Err(e) = &mut result {
            // liveness errors report how long the caller waited
            if matches!(
                e.code(),
                ErrorCode::WriteConcernFailed | ErrorCode::ExceededTimeLimit
            ) {
                e.1 = format!(
                    "{} (waited {} ms)",
                    e.1,
                    now.millis_since(self.registered_at)
                );
            }
        }
        // the caller may have given up on the handle; that is fine
        let _ = self.tx.send(result);
    }
}

/// Caller-side handle to one registered waiter.
pub struct WaitHandle {
    rx: oneshot::Receiver<Result<(), ReplSetError>>,
}

impl WaitHandle {
    /// Builds a handle that is already resolved.
    pub fn immediate(result: Result<(), ReplSetError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        WaitHandle { rx }
    }

    /// Builds an unresolved handle plus the sender that resolves it, for
    /// waits that do not go through the registry (stepdown, quorum checks).
    pub(crate) fn new_pair(
    ) -> (oneshot::Sender<Result<(), ReplSetError>>, WaitHandle) {
        let (tx, rx) = oneshot::channel();
        (tx, WaitHandle { rx })
    }

    /// Blocks until the waiter resolves.
    pub async fn wait(self) -> Result<(), ReplSetError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ReplSetError::msg(
                ErrorCode::ShutdownInProgress,
                "coordinator went away while waiting",
            )),
        }
    }

    /// Non-blocking poll: `None` while still sleeping.
    pub fn try_result(&mut self) -> Option<Result<(), ReplSetError>> {
        use tokio::sync::oneshot::error::TryRecvError;
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(ReplSetError::msg(
                ErrorCode::ShutdownInProgress,
                "coordinator went away while waiting",
            ))),
        }
    }
}

/// Registry of all sleeping operations.
#[derive(Default)]
pub struct WaiterRegistry {
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new waiter, returning the caller handle and the waiter
    /// id (for deadline bookkeeping).
    pub fn register(
        &mut self,
        op_id: u64,
        target: OpTime,
        condition: WaitCondition,
        min_snapshot: Option<SnapshotName>,
        registered_at: Date,
    ) -> (WaitHandle, u64) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter {
            id,
            op_id,
            target,
            condition,
            min_snapshot,
            registered_at,
            deadline_event: None,
            tx,
        });
        (WaitHandle { rx }, id)
    }

    /// Attaches a deadline event handle to a registered waiter.
    pub fn set_deadline_event(&mut self, id: u64, event: EventHandle) {
        if let Some(w) = self.waiters.iter_mut().find(|w| w.id == id) {
            w.deadline_event = Some(event);
        }
    }

    /// Number of sleeping operations.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Completes every waiter for which `decide` produces a result.
    /// Returns the deadline events of completed waiters, for the caller to
    /// unschedule.
    pub fn complete_where(
        &mut self,
        now: Date,
        mut decide: impl FnMut(&Waiter) -> Option<Result<(), ReplSetError>>,
    ) -> Vec<EventHandle> {
        let mut freed = Vec::new();
        let mut idx = 0;
        while idx < self.waiters.len() {
            if let Some(result) = decide(&self.waiters[idx]) {
                let waiter = self.waiters.swap_remove(idx);
                if let Some(event) = waiter.deadline_event {
                    freed.push(event);
                }
                waiter.finish(now, result);
            } else {
                idx += 1;
            }
        }
        freed
    }

    /// Completes the waiter with the given id, if still sleeping.
    pub fn complete_by_id(
        &mut self,
        id: u64,
        now: Date,
        result: Result<(), ReplSetError>,
    ) -> Vec<EventHandle> {
        let mut result = Some(result);
        self.complete_where(now, |w| {
            if w.id == id {
                result.take()
            } else {
                None
            }
        })
    }

    /// Completes every waiter belonging to the given operation.
    pub fn complete_op(
        &mut self,
        op_id: u64,
        now: Date,
        result: Result<(), ReplSetError>,
    ) -> Vec<EventHandle> {
        self.complete_where(now, |w| {
            if w.op_id == op_id {
                Some(result.clone())
            } else {
                None
            }
        })
    }

    /// Completes every waiter, e.g. at shutdown.
    pub fn complete_all(
        &mut self,
        now: Date,
        result: Result<(), ReplSetError>,
    ) -> Vec<EventHandle> {
        self.complete_where(now, |_| Some(result.clone()))
    }
}
