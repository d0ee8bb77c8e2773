//! `ReplCoordinator` -- operation-time bookkeeping, write-concern and
//! read-concern waiting, the position-update protocol, and commit-point
//! installation from peer metadata.

use super::*;
use crate::config::MemberId;
use crate::net::{ReplSetMetadata, UpdatePositionArgs, UpdatePositionEntry};
use crate::repl::waiters::{
    ReadConcernArgs, ReadConcernLevel, WTimeout, WaitHandle, WriteConcern,
    WValue, MAJORITY_MODE,
};

/// Outcome of one write-concern satisfaction check.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(super) enum WcCheck {
    Satisfied,
    Unsatisfied,

    /// No future state of this config can satisfy the concern.
    Infeasible,

    /// The named mode does not exist in this config.
    UnknownMode,
}

/// Evaluates a write concern against current progress state.
pub(super) fn check_write_concern(
    config: &ReplicaSetConfig,
    tracker: &OpTimeTracker,
    snapshots: &SnapshotTracker,
    target: OpTime,
    wc: &WriteConcern,
    min_snapshot: Option<SnapshotName>,
) -> WcCheck {
    match &wc.w {
        WValue::Nodes(num) => {
            if *num > config.members.len() {
                WcCheck::Infeasible
            } else if tracker.have_num_nodes_reached(target, *num) {
                WcCheck::Satisfied
            } else {
                WcCheck::Unsatisfied
            }
        }
        WValue::Mode(name) if name == MAJORITY_MODE => {
            if !tracker.have_majority_reached(config, target) {
                return WcCheck::Unsatisfied;
            }
            // majority additionally gates on the committed snapshot: one
            // must exist, and it must not predate the snapshot name the
            // operation reserved when it started
            match snapshots.committed_name() {
                None => WcCheck::Unsatisfied,
                Some(name) => {
                    if min_snapshot.map_or(true, |min| name >= min) {
                        WcCheck::Satisfied
                    } else {
                        WcCheck::Unsatisfied
                    }
                }
            }
        }
        WValue::Mode(name) => match config.get_mode(name) {
            None => WcCheck::UnknownMode,
            Some(mode) => {
                if !config.mode_feasible(mode) {
                    WcCheck::Infeasible
                } else if tracker.have_tagged_reached(config, target, mode) {
                    WcCheck::Satisfied
                } else {
                    WcCheck::Unsatisfied
                }
            }
        },
    }
}

/// Caller-side handle to a read-concern wait.
pub struct ReadWaitHandle {
    /// False when a precondition failed before any waiting could happen.
    pub did_wait: bool,

    handle: WaitHandle,
}

impl ReadWaitHandle {
    fn resolved(did_wait: bool, result: Result<(), ReplSetError>) -> Self {
        ReadWaitHandle {
            did_wait,
            handle: WaitHandle::immediate(result),
        }
    }

    /// Blocks until the read target is satisfied (or the wait fails).
    pub async fn wait(self) -> Result<(), ReplSetError> {
        self.handle.wait().await
    }

    /// Non-blocking poll: `None` while still sleeping.
    pub fn try_result(&mut self) -> Option<Result<(), ReplSetError>> {
        self.handle.try_result()
    }
}

// ReplCoordinator write/read concern handling
impl ReplCoordinator {
    /// Consumes an applied position from the oplog/apply pipeline. The
    /// position is monotone; older positions are ignored.
    pub fn set_my_last_optime(&mut self, optime: OpTime) {
        if self.tracker.advance_my_applied(optime) {
            self.advance_commit_point();
            self.wake_ready_waiters();
        }
    }

    /// Like `set_my_last_optime`, but spelled for call sites that only
    /// ever move forward: equal or smaller values are silently ignored.
    pub fn set_my_last_optime_forward(&mut self, optime: OpTime) {
        self.set_my_last_optime(optime);
    }

    /// Records another member's applied position, as the position-update
    /// protocol would. Entries about self are ignored.
    pub fn set_last_optime(
        &mut self,
        config_version: i64,
        member_id: MemberId,
        optime: OpTime,
    ) -> Result<(), ReplSetError> {
        let args = UpdatePositionArgs {
            entries: vec![UpdatePositionEntry {
                config_version,
                member_id,
                op_time: optime,
            }],
        };
        let mut ignored = -1;
        self.process_update_position(&args, &mut ignored)
    }

    /// Handles a `replSetUpdatePosition` command. On a config-version
    /// mismatch the local version is written to `our_config_version` and
    /// no entry is applied.
    pub fn process_update_position(
        &mut self,
        args: &UpdatePositionArgs,
        our_config_version: &mut i64,
    ) -> Result<(), ReplSetError> {
        let config = match self.topology.config() {
            Some(config) => config,
            None => {
                return Err(ReplSetError::msg(
                    ErrorCode::NotYetInitialized,
                    "received replSetUpdatePosition before a config was \
                     installed",
                ));
            }
        };
        let self_id = self
            .topology
            .self_index()
            .map(|idx| config.members[idx].id);

        // validate the whole batch before applying any of it
        let mut updates = Vec::with_capacity(args.entries.len());
        for entry in &args.entries {
            if Some(entry.member_id) == self_id {
                continue;
            }
            if entry.config_version != config.version {
                *our_config_version = config.version;
                return Err(ReplSetError::msg(
                    ErrorCode::InvalidReplicaSetConfig,
                    format!(
                        "Received replSetUpdatePosition for node with config \
                         version {} whereas our config version is {}",
                        entry.config_version, config.version
                    ),
                ));
            }
            match config.member_index_by_id(entry.member_id) {
                Some(idx) => updates.push((idx, entry.op_time)),
                None => {
                    return Err(ReplSetError::msg(
                        ErrorCode::NodeNotFound,
                        format!(
                            "Received replSetUpdatePosition for node with \
                             memberId {} which doesn't exist in our config",
                            entry.member_id
                        ),
                    ));
                }
            }
        }

        for (idx, optime) in updates {
            self.tracker.advance_applied(idx, optime);
            self.refresh_member_liveness(idx);
        }
        self.advance_commit_point();
        self.wake_ready_waiters();
        Ok(())
    }

    /// Builds the `replSetUpdatePosition` command this node forwards
    /// upstream: its own position plus every live member's known one.
    pub fn prepare_update_position_command(&self) -> Result<Value, ReplSetError> {
        let config = match self.topology.config() {
            Some(config) => config,
            None => {
                return Err(ReplSetError::msg(
                    ErrorCode::NotYetInitialized,
                    "no config installed",
                ));
            }
        };
        let entries = self.tracker.update_position_entries(config);
        Ok(UpdatePositionArgs { entries }.to_doc())
    }

    /// Waits for replication of `target` under the given write concern.
    /// The returned handle resolves immediately for non-blocking
    /// outcomes.
    pub fn await_replication(
        &mut self,
        op: &OpCtx,
        target: OpTime,
        wc: &WriteConcern,
    ) -> WaitHandle {
        match self.mode {
            // standalone nodes have nothing to wait for
            ReplicationMode::None => return WaitHandle::immediate(Ok(())),
            ReplicationMode::MasterSlave => {
                return WaitHandle::immediate(
                    self.master_slave_await(target, wc),
                );
            }
            ReplicationMode::ReplSet => {}
        }
        if let Some(status) = &op.interrupt_status {
            return WaitHandle::immediate(Err(status.clone()));
        }
        if self.shutting_down {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::ShutdownInProgress,
                "replication is being shut down",
            )));
        }
        if let WValue::Mode(name) = &wc.w {
            if name != MAJORITY_MODE
                && self
                    .topology
                    .config()
                    .map_or(true, |config| config.get_mode(name).is_none())
            {
                return WaitHandle::immediate(Err(ReplSetError::msg(
                    ErrorCode::UnknownReplWriteConcern,
                    format!("unrecognized write concern mode: {}", name),
                )));
            }
        }
        if self.topology.role() != Role::Leader {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::NotMaster,
                "Not master while waiting for replication",
            )));
        }

        let check = check_write_concern(
            self.topology.config().unwrap(),
            &self.tracker,
            &self.snapshots,
            target,
            wc,
            op.min_snapshot,
        );
        match check {
            WcCheck::Satisfied => WaitHandle::immediate(Ok(())),
            WcCheck::Infeasible => {
                WaitHandle::immediate(Err(ReplSetError::msg(
                    ErrorCode::CannotSatisfyWriteConcern,
                    "write concern cannot be satisfied by the current \
                     replica set configuration",
                )))
            }
            WcCheck::UnknownMode => {
                WaitHandle::immediate(Err(ReplSetError::msg(
                    ErrorCode::UnknownReplWriteConcern,
                    "unrecognized write concern mode",
                )))
            }
            WcCheck::Unsatisfied => match wc.timeout {
                WTimeout::NoWaiting => {
                    WaitHandle::immediate(Err(ReplSetError::msg(
                        ErrorCode::WriteConcernFailed,
                        "waiting for replication timed out",
                    )))
                }
                WTimeout::NoTimeout => {
                    let now = self.clock.now();
                    let (handle, _) = self.waiters.register(
                        op.op_id,
                        target,
                        WaitCondition::Replication(wc.clone()),
                        op.min_snapshot,
                        now,
                    );
                    handle
                }
                WTimeout::Millis(ms) => {
                    let now = self.clock.now();
                    let (handle, waiter_id) = self.waiters.register(
                        op.op_id,
                        target,
                        WaitCondition::Replication(wc.clone()),
                        op.min_snapshot,
                        now,
                    );
                    let event = self.events.schedule_at(
                        now.plus_millis(ms),
                        CoordEvent::WaiterDeadline { waiter_id },
                    );
                    self.waiters.set_deadline_event(waiter_id, event);
                    handle
                }
            },
        }
    }

    /// Waits for replication of this node's own last applied position,
    /// on behalf of the calling client.
    pub fn await_replication_of_last_op_for_client(
        &mut self,
        op: &OpCtx,
        wc: &WriteConcern,
    ) -> WaitHandle {
        let target = self.tracker.my_applied();
        self.await_replication(op, target, wc)
    }

    fn master_slave_await(
        &self,
        target: OpTime,
        wc: &WriteConcern,
    ) -> Result<(), ReplSetError> {
        match &wc.w {
            // w:majority always works on master/slave
            WValue::Mode(name) if name == MAJORITY_MODE => Ok(()),
            WValue::Mode(name) => Err(ReplSetError::msg(
                ErrorCode::UnknownReplWriteConcern,
                format!("unrecognized write concern mode: {}", name),
            )),
            WValue::Nodes(num) => {
                let count = 1 + self
                    .slave_table
                    .values()
                    .filter(|(_, ts)| *ts >= target.ts)
                    .count();
                if count >= *num {
                    Ok(())
                } else {
                    Err(ReplSetError::msg(
                        ErrorCode::WriteConcernFailed,
                        "waiting for replication timed out",
                    ))
                }
            }
        }
    }

    /// Fires when a blocking write-concern wait outlives its timeout.
    pub(super) fn handle_waiter_deadline(&mut self, waiter_id: u64) {
        let now = self.clock.now();
        let freed = self.waiters.complete_by_id(
            waiter_id,
            now,
            Err(ReplSetError::msg(
                ErrorCode::WriteConcernFailed,
                "waiting for replication timed out",
            )),
        );
        for event in freed {
            self.events.cancel(event);
        }
    }

    /// Waits until this node's view satisfies a read concern.
    pub fn wait_until_optime(
        &mut self,
        op: &OpCtx,
        args: ReadConcernArgs,
    ) -> ReadWaitHandle {
        if self.mode != ReplicationMode::ReplSet {
            return ReadWaitHandle::resolved(
                false,
                Err(ReplSetError::msg(
                    ErrorCode::NotAReplicaSet,
                    "node needs to be a replica set member to use read \
                     concern",
                )),
            );
        }
        if args.level == ReadConcernLevel::Majority
            && !self.options.majority_read_concern
        {
            return ReadWaitHandle::resolved(
                false,
                Err(ReplSetError::msg(
                    ErrorCode::ReadConcernMajorityNotEnabled,
                    "Majority read concern requested, but it is not \
                     supported by the storage engine",
                )),
            );
        }
        let target = match args.target {
            Some(target) => target,
            None => return ReadWaitHandle::resolved(true, Ok(())),
        };
        if let Some(status) = &op.interrupt_status {
            return ReadWaitHandle::resolved(true, Err(status.clone()));
        }
        if self.shutting_down {
            return ReadWaitHandle::resolved(
                true,
                Err(ReplSetError::msg(
                    ErrorCode::ShutdownInProgress,
                    "replication is being shut down",
                )),
            );
        }

        let satisfied = match args.level {
            ReadConcernLevel::Local => self.tracker.my_applied() >= target,
            ReadConcernLevel::Majority => {
                self.snapshots.committed_optime() >= target
            }
        };
        if satisfied {
            return ReadWaitHandle::resolved(true, Ok(()));
        }
        let condition = match args.level {
            ReadConcernLevel::Local => WaitCondition::ReadLocal,
            ReadConcernLevel::Majority => WaitCondition::ReadMajority,
        };
        let (handle, _) = self.waiters.register(
            op.op_id,
            target,
            condition,
            None,
            self.clock.now(),
        );
        ReadWaitHandle {
            did_wait: true,
            handle,
        }
    }

    /// Installs commit-point and term information from a trusted peer's
    /// replica-set metadata block. Metadata for another config version is
    /// discarded whole; the primary index is never taken from metadata.
    pub fn process_replset_metadata(&mut self, metadata: &ReplSetMetadata) {
        let our_version = match self.topology.config() {
            Some(config) => config.version,
            None => return,
        };
        if metadata.config_version != our_version {
            pf_debug!(
                "ignoring replica set metadata for config version {} (ours \
                 is {})",
                metadata.config_version,
                our_version
            );
            return;
        }
        if metadata.last_op_committed > self.last_committed {
            self.last_committed = metadata.last_op_committed;
            self.snapshots.update_committed(self.last_committed);
            self.wake_ready_waiters();
        }
        if metadata.term > self.topology.term() {
            self.update_term_and_maybe_step_down(metadata.term);
        }
    }

    /// Records a new storage-engine snapshot; it becomes the committed
    /// snapshot immediately if the commit point already covers it.
    pub fn on_snapshot_create(&mut self, optime: OpTime, name: SnapshotName) {
        self.snapshots.on_snapshot_create(optime, name);
        self.snapshots.update_committed(self.last_committed);
        self.wake_ready_waiters();
    }

    /// Forgets all snapshots; the committed snapshot resets to zero.
    pub fn drop_all_snapshots(&mut self) {
        self.snapshots.drop_all();
    }

    /// Reserves a fresh monotone snapshot name.
    pub fn reserve_snapshot_name(&mut self) -> SnapshotName {
        self.snapshots.reserve_name()
    }

    /// Hosts whose applied position covers `target`. In master/slave
    /// mode the handshake table answers (self excluded).
    pub fn get_hosts_written_to(&self, target: OpTime) -> Vec<HostAndPort> {
        match self.mode {
            ReplicationMode::MasterSlave => self
                .slave_table
                .values()
                .filter(|(_, ts)| *ts >= target.ts)
                .map(|(host, _)| host.clone())
                .collect(),
            _ => match self.topology.config() {
                Some(config) => self.tracker.hosts_written_to(config, target),
                None => Vec::new(),
            },
        }
    }

    /// Registers a master/slave client by replica id.
    pub fn process_handshake(&mut self, rid: &str) -> Result<(), ReplSetError> {
        if self.mode != ReplicationMode::MasterSlave {
            return Err(ReplSetError::msg(
                ErrorCode::BadValue,
                "handshakes are only used in master/slave mode",
            ));
        }
        let host = self.external.client_host_and_port().ok_or_else(|| {
            ReplSetError::msg(
                ErrorCode::NodeNotFound,
                "no client host known for handshaking slave",
            )
        })?;
        self.slave_table
            .insert(rid.to_string(), (host, Timestamp::ZERO));
        Ok(())
    }

    /// Moves a handshaken slave's applied timestamp forward.
    pub fn set_last_optime_for_slave(
        &mut self,
        rid: &str,
        ts: Timestamp,
    ) -> Result<(), ReplSetError> {
        match self.slave_table.get_mut(rid) {
            Some(entry) => {
                if ts > entry.1 {
                    entry.1 = ts;
                }
                Ok(())
            }
            None => Err(ReplSetError::msg(
                ErrorCode::NodeNotFound,
                "received optime notification for unknown slave",
            )),
        }
    }
}
