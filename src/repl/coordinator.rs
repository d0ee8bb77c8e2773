//! The replication coordinator: the public façade owning all mutable
//! replication state. Serializes every mutation through one event loop,
//! delegates decisions to the topology coordinator, applies state and
//! timer changes, notifies sleeping operations, and emits outbound
//! commands through the abstract dispatcher.

mod configure;
mod election;
mod heartbeats;
mod writes;

#[cfg(test)]
mod testing;

pub use writes::ReadWaitHandle;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{HostAndPort, ReplicaSetConfig};
use crate::net::{
    CommandDispatcher, RemoteResponse, RequestId,
};
use crate::repl::external::ExternalState;
use crate::repl::optime::{OpTime, SnapshotName, Timestamp};
use crate::repl::snapshots::SnapshotTracker;
use crate::repl::state::MemberState;
use crate::repl::topology::{Role, TopologyCoordinator};
use crate::repl::tracker::OpTimeTracker;
use crate::repl::waiters::{WaitCondition, WaiterRegistry};
use crate::sched::{Clock, Date, EventHandle, EventQueue};
use crate::utils::{Bitmap, ErrorCode, ReplSetError};

use serde::Deserialize;
use serde_json::{json, Value};

use tokio::sync::{mpsc, oneshot};

/// Node-level replication options, fixed at construction. Parsed from an
/// optional TOML string via `parsed_config!` by server bootstrap code.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplOptions {
    /// Replica set name, optionally with a seed list after a slash
    /// ("mySet" or "mySet/host1:port,host2:port"). Empty means the node
    /// was not started as a replica-set member.
    pub replset: String,

    /// Legacy master/slave master flag.
    pub master: bool,

    /// Legacy master/slave slave flag.
    pub slave: bool,

    /// True if this node serves as a sharding config server.
    pub configsvr: bool,

    /// Whether the storage engine supports majority read concern.
    pub majority_read_concern: bool,
}

impl ReplOptions {
    /// Parses options from an optional TOML string.
    pub fn from_config_str(config_str: Option<&str>) -> Result<Self, ReplSetError> {
        parsed_config!(config_str => ReplOptions;
                       replset, master, slave, configsvr,
                       majority_read_concern)
    }

    /// Shorthand for replica-set options with the given set name.
    pub fn for_set(set_name: impl ToString) -> Self {
        ReplOptions {
            replset: set_name.to_string(),
            ..Default::default()
        }
    }

    /// The set name portion of the replset string, if one was supplied.
    pub fn set_name(&self) -> Option<&str> {
        if self.replset.is_empty() {
            None
        } else {
            self.replset.split('/').next()
        }
    }
}

/// Replication mode, determined once from the options.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ReplicationMode {
    None,
    MasterSlave,
    ReplSet,
}

/// Per-operation context for blocking coordinator calls.
#[derive(Debug, Clone, Default)]
pub struct OpCtx {
    /// Operation id, the target of `interrupt`.
    pub op_id: u64,

    /// Snapshot name reserved at operation start; gates majority write
    /// concerns.
    pub min_snapshot: Option<SnapshotName>,

    /// Interrupt status injected by the kill path.
    pub interrupt_status: Option<ReplSetError>,
}

impl OpCtx {
    pub fn new(op_id: u64) -> Self {
        OpCtx {
            op_id,
            ..Default::default()
        }
    }
}

/// Deferred work items on the coordinator's event queue.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum CoordEvent {
    /// Send the next heartbeat to one member.
    Heartbeat { member_index: usize },

    /// The election timer fired.
    ElectionTimeout,

    /// A member's liveness lease ran out.
    LivenessTimeout { member_index: usize },

    /// A registered waiter's deadline passed.
    WaiterDeadline { waiter_id: u64 },

    /// The stepdown catch-up budget ran out.
    StepDownTimeout,
}

/// What kind of response an outstanding request id maps back to.
enum PendingKind {
    Heartbeat { member_index: usize },
    QuorumCheck { target: HostAndPort },
    VoteRequest { dry_run: bool, term: i64, member_index: usize },
}

/// An in-flight vote round.
struct ElectionState {
    dry_run: bool,
    vote_term: i64,

    /// Member indexes whose vote we hold this round (self included).
    votes: Bitmap,
}

/// An in-flight stepdown waiting for a secondary to catch up.
struct StepDownState {
    op_id: u64,
    stepdown_ms: u64,
    deadline_event: EventHandle,
    tx: oneshot::Sender<Result<(), ReplSetError>>,
}

/// What a pending quorum check is for.
enum QuorumPurpose {
    /// Initiate: every probed host must respond empty.
    Initiate,

    /// Reconfig: a majority of voters (self included) must acknowledge.
    Reconfig,
}

/// An in-flight initiate/reconfig quorum check.
struct QuorumState {
    purpose: QuorumPurpose,
    config: ReplicaSetConfig,
    self_index: Option<usize>,
    doc: Value,
    outstanding: usize,
    oks: usize,
    tx: oneshot::Sender<Result<(), ReplSetError>>,
}

/// The per-node replication coordinator.
pub struct ReplCoordinator {
    options: ReplOptions,
    mode: ReplicationMode,
    self_host: HostAndPort,
    clock: Clock,
    net: Arc<dyn CommandDispatcher>,
    external: Arc<dyn ExternalState>,

    /// Pure decision engine.
    topology: TopologyCoordinator,

    /// Per-member applied positions and liveness.
    tracker: OpTimeTracker,

    /// Storage-engine snapshot bookkeeping.
    snapshots: SnapshotTracker,

    /// Sleeping operations.
    waiters: WaiterRegistry,

    /// Deferred events (heartbeats, timers, deadlines).
    events: EventQueue<CoordEvent>,

    /// Scheduled heartbeat event per member index.
    hb_events: HashMap<usize, EventHandle>,

    /// Scheduled liveness timeout per member index.
    liveness_events: HashMap<usize, EventHandle>,

    /// The election timer event, when armed.
    election_event: Option<EventHandle>,

    /// When the election timer fires; the zero date when unarmed.
    election_timeout_at: Date,

    /// Outstanding remote commands by request id.
    outstanding: HashMap<RequestId, PendingKind>,
    request_id_counter: RequestId,

    election: Option<ElectionState>,
    stepdown: Option<StepDownState>,
    quorum: Option<QuorumState>,

    /// Greatest position known durable on a majority of voters.
    last_committed: OpTime,

    /// Rollback id counter.
    rbid: u64,

    /// Set on election win, cleared by `signal_drain_complete`.
    drain_pending: bool,

    start_complete: bool,
    shutting_down: bool,

    /// Master/slave handshake table: rid -> (client host, applied ts).
    slave_table: HashMap<String, (HostAndPort, Timestamp)>,
}

impl ReplCoordinator {
    /// Creates a coordinator. The mode is fixed here from the options;
    /// state machines start at `Startup` until a config arrives.
    pub fn new(
        options: ReplOptions,
        self_host: HostAndPort,
        clock: Clock,
        net: Arc<dyn CommandDispatcher>,
        external: Arc<dyn ExternalState>,
    ) -> Self {
        let mode = if !options.replset.is_empty() {
            ReplicationMode::ReplSet
        } else if options.master || options.slave {
            ReplicationMode::MasterSlave
        } else {
            ReplicationMode::None
        };
        ReplCoordinator {
            options,
            mode,
            self_host,
            clock,
            net,
            external,
            topology: TopologyCoordinator::new(),
            tracker: OpTimeTracker::new(),
            snapshots: SnapshotTracker::new(),
            waiters: WaiterRegistry::new(),
            events: EventQueue::new(),
            hb_events: HashMap::new(),
            liveness_events: HashMap::new(),
            election_event: None,
            election_timeout_at: Date::ZERO,
            outstanding: HashMap::new(),
            request_id_counter: 0,
            election: None,
            stepdown: None,
            quorum: None,
            last_committed: OpTime::ZERO,
            rbid: 1,
            drain_pending: false,
            start_complete: false,
            shutting_down: false,
            slave_table: HashMap::new(),
        }
    }

    #[inline]
    pub fn replication_mode(&self) -> ReplicationMode {
        self.mode
    }

    #[inline]
    pub fn member_state(&self) -> MemberState {
        self.topology.member_state()
    }

    #[inline]
    pub fn term(&self) -> i64 {
        self.topology.term()
    }

    #[inline]
    pub fn my_last_optime(&self) -> OpTime {
        self.tracker.my_applied()
    }

    #[inline]
    pub fn last_committed_optime(&self) -> OpTime {
        self.last_committed
    }

    #[inline]
    pub fn current_committed_snapshot_optime(&self) -> OpTime {
        self.snapshots.committed_optime()
    }

    #[inline]
    pub fn config(&self) -> Option<&ReplicaSetConfig> {
        self.topology.config()
    }

    /// Read access to the topology coordinator, for inspection.
    #[inline]
    pub fn topology(&self) -> &TopologyCoordinator {
        &self.topology
    }

    /// When the election timer fires; the zero date when unarmed.
    #[inline]
    pub fn election_timeout_date(&self) -> Date {
        self.election_timeout_at
    }

    #[inline]
    pub fn is_waiting_for_applier_to_drain(&self) -> bool {
        self.drain_pending
    }

    /// True while a vote round is in flight.
    #[inline]
    pub fn election_in_progress(&self) -> bool {
        self.election.is_some()
    }

    #[inline]
    pub fn now(&self) -> Date {
        self.clock.now()
    }

    /// Earliest pending deferred-event deadline.
    pub fn next_event_deadline(&self) -> Option<Date> {
        self.events.next_deadline()
    }

    /// Current rollback id.
    #[inline]
    pub fn get_rbid(&self) -> u64 {
        self.rbid
    }

    /// Advances the rollback id; called exactly once per rollback start.
    pub fn increment_rollback_id(&mut self) {
        self.rbid += 1;
        pf_info!("incremented rollback id to {}", self.rbid);
    }

    /// Builds the `replSetGetRBID` reply document.
    pub fn process_replset_get_rbid(&self) -> Value {
        json!({ "rbid": self.rbid })
    }

    /// Fires every deferred event that has come due. The production `run`
    /// loop calls this as deadlines pass; deterministic tests call it
    /// after advancing the virtual clock.
    pub fn process_ready_events(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = self.clock.now();
        for event in self.events.fire_due(now) {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: CoordEvent) {
        match event {
            CoordEvent::Heartbeat { member_index } => {
                self.handle_heartbeat_event(member_index)
            }
            CoordEvent::ElectionTimeout => self.handle_election_timeout(),
            CoordEvent::LivenessTimeout { member_index } => {
                self.handle_liveness_timeout(member_index)
            }
            CoordEvent::WaiterDeadline { waiter_id } => {
                self.handle_waiter_deadline(waiter_id)
            }
            CoordEvent::StepDownTimeout => self.handle_stepdown_timeout(),
        }
    }

    /// Feeds one transport response back into the coordinator.
    pub async fn handle_response(
        &mut self,
        id: RequestId,
        resp: RemoteResponse,
    ) -> Result<(), ReplSetError> {
        if self.shutting_down {
            return Ok(());
        }
        let kind = match self.outstanding.remove(&id) {
            Some(kind) => kind,
            None => {
                pf_trace!("dropping response for unknown request {}", id);
                return Ok(());
            }
        };
        match kind {
            PendingKind::Heartbeat { member_index } => {
                self.handle_heartbeat_response(member_index, resp).await
            }
            PendingKind::QuorumCheck { target } => {
                self.handle_quorum_response(target, resp).await
            }
            PendingKind::VoteRequest {
                dry_run,
                term,
                member_index,
            } => self.handle_vote_response(dry_run, term, member_index, resp),
        }
    }

    /// Production event loop: sleeps to the next deadline, processes
    /// transport responses, until shutdown.
    pub async fn run(
        &mut self,
        mut rx_response: mpsc::UnboundedReceiver<(RequestId, RemoteResponse)>,
    ) -> Result<(), ReplSetError> {
        while !self.shutting_down {
            let next = self.events.next_deadline();
            let clock = self.clock.clone();
            tokio::select! {
                resp = rx_response.recv() => match resp {
                    Some((id, resp)) => self.handle_response(id, resp).await?,
                    None => break,
                },
                () = Self::sleep_until(clock, next) => {
                    self.process_ready_events();
                },
            }
        }
        Ok(())
    }

    async fn sleep_until(clock: Clock, when: Option<Date>) {
        match when {
            Some(when) if !clock.is_virtual() => {
                let wait_ms = when.millis_since(clock.now());
                tokio::time::sleep(std::time::Duration::from_millis(wait_ms))
                    .await;
            }
            // nothing scheduled (or a test-driven virtual clock): only a
            // response can wake the loop
            _ => futures::future::pending::<()>().await,
        }
    }

    /// Shuts the coordinator down, waking every sleeping operation with
    /// `ShutdownInProgress`.
    pub fn shutdown(&mut self) {
        if !self.start_complete {
            pf_warn!("shutdown() called before startReplication() finished; ignoring");
            return;
        }
        self.shutting_down = true;
        let now = self.clock.now();
        let shutdown_err = ReplSetError::msg(
            ErrorCode::ShutdownInProgress,
            "replication is being shut down",
        );
        let freed = self.waiters.complete_all(now, Err(shutdown_err.clone()));
        for event in freed {
            self.events.cancel(event);
        }
        if let Some(st) = self.stepdown.take() {
            self.events.cancel(st.deadline_event);
            self.external.release_global_shared();
            let _ = st.tx.send(Err(shutdown_err.clone()));
        }
        if let Some(q) = self.quorum.take() {
            let _ = q.tx.send(Err(shutdown_err));
        }
    }

    /// Cancels the waiters (and any pending stepdown) belonging to one
    /// operation id.
    pub fn interrupt(&mut self, op_id: u64) {
        let now = self.clock.now();
        let freed = self.waiters.complete_op(
            op_id,
            now,
            Err(ReplSetError::msg(
                ErrorCode::Interrupted,
                "operation was interrupted",
            )),
        );
        for event in freed {
            self.events.cancel(event);
        }
        if self.stepdown.as_ref().map(|st| st.op_id) == Some(op_id) {
            let st = self.stepdown.take().unwrap();
            self.events.cancel(st.deadline_event);
            self.external.release_global_shared();
            let _ = st.tx.send(Err(ReplSetError::msg(
                ErrorCode::Interrupted,
                "stepdown was interrupted",
            )));
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        self.request_id_counter += 1;
        self.request_id_counter
    }

    /// Re-evaluates every sleeping operation against current state.
    fn wake_ready_waiters(&mut self) {
        let now = self.clock.now();
        let topology = &self.topology;
        let tracker = &self.tracker;
        let snapshots = &self.snapshots;
        let freed = self.waiters.complete_where(now, |waiter| {
            match &waiter.condition {
                WaitCondition::ReadLocal => {
                    (tracker.my_applied() >= waiter.target).then(|| Ok(()))
                }
                WaitCondition::ReadMajority => {
                    (snapshots.committed_optime() >= waiter.target)
                        .then(|| Ok(()))
                }
                WaitCondition::Replication(wc) => {
                    let config = topology.config()?;
                    match writes::check_write_concern(
                        config,
                        tracker,
                        snapshots,
                        waiter.target,
                        wc,
                        waiter.min_snapshot,
                    ) {
                        writes::WcCheck::Satisfied => Some(Ok(())),
                        writes::WcCheck::Unsatisfied => None,
                        writes::WcCheck::Infeasible
                        | writes::WcCheck::UnknownMode => {
                            Some(Err(ReplSetError::msg(
                                ErrorCode::CannotSatisfyWriteConcern,
                                "write concern cannot be satisfied by the \
                                 current replica set configuration",
                            )))
                        }
                    }
                }
            }
        });
        for event in freed {
            self.events.cancel(event);
        }
    }

    /// Recomputes the commit point from tracked voter positions.
    /// Positions from terms older than the current one never advance the
    /// commit point.
    fn advance_commit_point(&mut self) {
        let config = match self.topology.config() {
            Some(config) => config,
            None => return,
        };
        let mut candidate = match self.tracker.committed_candidate(config) {
            Some(candidate) => candidate,
            None => return,
        };
        if self.topology.role() == Role::Leader {
            // a primary never commits past what it has applied itself
            candidate = candidate.min(self.tracker.my_applied());
        }
        if candidate.term == self.topology.term()
            && candidate > self.last_committed
        {
            pf_debug!(
                "commit point advancing from {} to {}",
                self.last_committed,
                candidate
            );
            self.last_committed = candidate;
            self.snapshots.update_committed(candidate);
        }
    }

    /// Refreshes a member's liveness stamp and re-arms its liveness
    /// timeout at one election-timeout period out.
    fn refresh_member_liveness(&mut self, member_index: usize) {
        let now = self.clock.now();
        self.tracker.refresh_liveness(member_index, now);
        let timeout_ms = match self.topology.config() {
            Some(config) => config.election_timeout_ms(),
            None => return,
        };
        if let Some(old) = self.liveness_events.remove(&member_index) {
            self.events.cancel(old);
        }
        let event = self.events.schedule_at(
            now.plus_millis(timeout_ms),
            CoordEvent::LivenessTimeout { member_index },
        );
        self.liveness_events.insert(member_index, event);
    }
}
