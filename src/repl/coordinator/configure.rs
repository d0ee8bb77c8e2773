//! `ReplCoordinator` -- configuration lifecycle: startup config load,
//! `replSetInitiate`, `replSetReconfig`, and config installs learned over
//! heartbeats.

use super::*;
use crate::net::{
    HeartbeatArgs, IsMasterResponse, OutboundRequest, RemoteCommand,
    ResponseBody,
};
use crate::repl::waiters::WaitHandle;

// ReplCoordinator configuration lifecycle
impl ReplCoordinator {
    /// Loads and installs the locally persisted config, if one exists.
    /// Called once at node startup; without a local config the node stays
    /// in `Startup` waiting for an initiate or a remote heartbeat.
    pub async fn start_up(&mut self) -> Result<(), ReplSetError> {
        if self.start_complete {
            return Ok(());
        }
        self.start_complete = true;
        if self.mode != ReplicationMode::ReplSet {
            return Ok(());
        }
        let doc = match self.external.load_local_config().await? {
            Some(doc) => doc,
            None => {
                pf_info!(
                    "Did not find local replica set configuration document at \
                     startup; use replSetInitiate to create the set"
                );
                return Ok(());
            }
        };
        let config = match ReplicaSetConfig::from_doc(&doc) {
            Ok(config) => config,
            Err(e) => {
                pf_error!(
                    "locally stored replica set configuration does not \
                     parse: {}",
                    e
                );
                return Ok(());
            }
        };
        if let Some(flag_name) = self.options.set_name() {
            if config.name != flag_name {
                pf_warn!(
                    "Local replica set configuration document reports set \
                     name of {}, but command line reports {}; waiting for \
                     reconfig or remote heartbeat",
                    config.name,
                    flag_name
                );
                return Ok(());
            }
        }
        let self_index = config.find_member_index(&self.self_host);
        if self_index.is_none() {
            pf_warn!(
                "Locally stored replica set configuration does not list this \
                 node; NodeNotFound: waiting for reconfig or remote heartbeat"
            );
        }
        self.finish_install_config(config, self_index);
        Ok(())
    }

    /// Handles a `replSetInitiate` command. Single-node configs resolve
    /// immediately; multi-node configs resolve once the emptiness quorum
    /// check completes.
    pub async fn process_replset_initiate(&mut self, doc: &Value) -> WaitHandle {
        if self.mode == ReplicationMode::ReplSet && self.topology.config().is_some()
        {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::AlreadyInitialized,
                "already initialized",
            )));
        }
        if self.quorum.is_some() {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::AlreadyInitialized,
                "another initiate or reconfig is already in progress",
            )));
        }

        let config = match ReplicaSetConfig::from_doc(doc) {
            Ok(config) => config,
            Err(e) => return WaitHandle::immediate(Err(e)),
        };

        match self.options.set_name() {
            Some(flag_name) => {
                if config.name != flag_name {
                    return WaitHandle::immediate(Err(ReplSetError::msg(
                        ErrorCode::InvalidReplicaSetConfig,
                        format!(
                            "Attempting to initiate a replica set with name \
                             {}, but command line reports {}; rejecting",
                            config.name, flag_name
                        ),
                    )));
                }
            }
            None => {
                // a set started without the replSet option may only host a
                // trivial single-node config
                if config.version != 1 {
                    return WaitHandle::immediate(Err(ReplSetError::msg(
                        ErrorCode::InvalidReplicaSetConfig,
                        format!(
                            "a replica set configuration for a set started \
                             without the replSet option must have version 1, \
                             but found {}",
                            config.version
                        ),
                    )));
                }
                if config.members.len() != 1 {
                    return WaitHandle::immediate(Err(ReplSetError::msg(
                        ErrorCode::InvalidReplicaSetConfig,
                        "you can only specify one member in the config when \
                         starting without the replSet option",
                    )));
                }
            }
        }

        let self_index = match config.find_member_index(&self.self_host) {
            Some(idx) => idx,
            None => {
                return WaitHandle::immediate(Err(ReplSetError::msg(
                    ErrorCode::InvalidReplicaSetConfig,
                    format!(
                        "No host described in new configuration {} for \
                         replica set {} maps to this node",
                        config.version, config.name
                    ),
                )));
            }
        };
        if !config.members[self_index].is_electable() {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::InvalidReplicaSetConfig,
                format!(
                    "This node, {}, with _id {} is not electable under the \
                     new configuration version {} for replica set {}",
                    self.self_host,
                    config.members[self_index].id,
                    config.version,
                    config.name
                ),
            )));
        }

        let others: Vec<HostAndPort> = config
            .members
            .iter()
            .enumerate()
            .filter(|&(idx, _)| idx != self_index)
            .map(|(_, m)| m.host.clone())
            .collect();
        if others.is_empty() {
            let result = self.finish_initiate(config, self_index, doc).await;
            return WaitHandle::immediate(result);
        }

        // every other listed host must prove empty before the set forms
        let sender_id = config.members[self_index].id;
        let outstanding = others.len();
        for host in others {
            let args = HeartbeatArgs {
                set_name: config.name.clone(),
                protocol_version: 1,
                config_version: config.version,
                sender_host: self.self_host.clone(),
                sender_id,
                check_empty: true,
            };
            let id = self.next_request_id();
            self.outstanding.insert(
                id,
                PendingKind::QuorumCheck {
                    target: host.clone(),
                },
            );
            self.net.dispatch(OutboundRequest {
                id,
                target: host,
                cmd: RemoteCommand::Heartbeat(args),
            });
        }
        let (tx, handle) = WaitHandle::new_pair();
        self.quorum = Some(QuorumState {
            purpose: QuorumPurpose::Initiate,
            config,
            self_index: Some(self_index),
            doc: doc.clone(),
            outstanding,
            oks: 0,
            tx,
        });
        handle
    }

    /// Handles a `replSetReconfig` command. Non-forced reconfigs require
    /// primacy and a majority quorum acknowledgement; forced ones install
    /// straight away.
    pub async fn process_replset_reconfig(
        &mut self,
        doc: &Value,
        force: bool,
    ) -> WaitHandle {
        let current = match self.topology.config() {
            Some(config) => config,
            None => {
                return WaitHandle::immediate(Err(ReplSetError::msg(
                    ErrorCode::NotYetInitialized,
                    "node is not yet initialized; use replSetInitiate first",
                )));
            }
        };
        let (current_name, current_version) =
            (current.name.clone(), current.version);
        if !force && self.topology.role() != Role::Leader {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::NotMaster,
                "replSetReconfig should only be run on PRIMARY, but my state \
                 is not PRIMARY; use the \"force\" argument to override",
            )));
        }
        if self.quorum.is_some() {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::OperationFailed,
                "another initiate or reconfig is already in progress",
            )));
        }

        let config = match ReplicaSetConfig::from_doc(doc) {
            Ok(config) => config,
            Err(e) => return WaitHandle::immediate(Err(e)),
        };
        if config.name != current_name {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::InvalidReplicaSetConfig,
                format!(
                    "New configuration names set {}, but our set is named {}",
                    config.name, current_name
                ),
            )));
        }
        if config.version <= current_version {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::InvalidReplicaSetConfig,
                format!(
                    "New config version {} is not greater than the current \
                     config version {}",
                    config.version, current_version
                ),
            )));
        }
        let self_index = config.find_member_index(&self.self_host);

        if force {
            let result = self.finish_reconfig(config, self_index, doc).await;
            return WaitHandle::immediate(result);
        }

        // heartbeat every other member; a majority of voters (counting
        // ourselves) must acknowledge before the new config installs
        let sender_id = self_index.map(|idx| config.members[idx].id).unwrap_or(-1);
        let mut outstanding = 0;
        let targets: Vec<HostAndPort> = config
            .members
            .iter()
            .enumerate()
            .filter(|&(idx, _)| Some(idx) != self_index)
            .map(|(_, m)| m.host.clone())
            .collect();
        for host in targets {
            let args = HeartbeatArgs {
                set_name: config.name.clone(),
                protocol_version: config.protocol_version,
                config_version: config.version,
                sender_host: self.self_host.clone(),
                sender_id,
                check_empty: false,
            };
            let id = self.next_request_id();
            self.outstanding.insert(
                id,
                PendingKind::QuorumCheck {
                    target: host.clone(),
                },
            );
            self.net.dispatch(OutboundRequest {
                id,
                target: host,
                cmd: RemoteCommand::Heartbeat(args),
            });
            outstanding += 1;
        }
        if outstanding == 0 {
            let result = self.finish_reconfig(config, self_index, doc).await;
            return WaitHandle::immediate(result);
        }
        let (tx, handle) = WaitHandle::new_pair();
        self.quorum = Some(QuorumState {
            purpose: QuorumPurpose::Reconfig,
            config,
            self_index,
            doc: doc.clone(),
            outstanding,
            oks: 0,
            tx,
        });
        handle
    }

    /// Routes one quorum-check heartbeat response.
    pub(super) async fn handle_quorum_response(
        &mut self,
        target: HostAndPort,
        resp: RemoteResponse,
    ) -> Result<(), ReplSetError> {
        let mut st = match self.quorum.take() {
            Some(st) => st,
            None => {
                pf_trace!("dropping quorum response from {}", target);
                return Ok(());
            }
        };
        st.outstanding -= 1;

        let verdict: Result<(), String> = match &resp {
            Err(e) => Err(format!("{} failed with {}", target, e.reason())),
            Ok(ResponseBody::Heartbeat(resp)) => match st.purpose {
                QuorumPurpose::Initiate => {
                    if resp
                        .set_name
                        .as_deref()
                        .map_or(false, |name| name != st.config.name)
                    {
                        Err(format!(
                            "{} reports set name of {}, expected {}",
                            target,
                            resp.set_name.as_deref().unwrap(),
                            st.config.name
                        ))
                    } else if resp.config_version.unwrap_or(0) >= 1 {
                        Err(format!(
                            "{} already has a replica set configuration",
                            target
                        ))
                    } else {
                        Ok(())
                    }
                }
                QuorumPurpose::Reconfig => Ok(()),
            },
            Ok(_) => Err(format!("{} sent an unexpected response", target)),
        };

        match st.purpose {
            QuorumPurpose::Initiate => match verdict {
                Err(reason) => {
                    pf_warn!("replSetInitiate quorum check failed: {}", reason);
                    let _ = st.tx.send(Err(ReplSetError::msg(
                        ErrorCode::NodeNotFound,
                        format!(
                            "Quorum check failed because not all proposed set \
                             members responded affirmatively: {}",
                            reason
                        ),
                    )));
                }
                Ok(()) => {
                    st.oks += 1;
                    if st.outstanding == 0 {
                        let QuorumState {
                            config,
                            self_index,
                            doc,
                            tx,
                            ..
                        } = st;
                        let result = self
                            .finish_initiate(config, self_index.unwrap(), &doc)
                            .await;
                        let _ = tx.send(result);
                    } else {
                        self.quorum = Some(st);
                    }
                }
            },
            QuorumPurpose::Reconfig => {
                if verdict.is_ok() {
                    st.oks += 1;
                }
                let majority = st.config.majority_vote_count();
                if 1 + st.oks >= majority {
                    let QuorumState {
                        config,
                        self_index,
                        doc,
                        tx,
                        ..
                    } = st;
                    let result =
                        self.finish_reconfig(config, self_index, &doc).await;
                    let _ = tx.send(result);
                } else if st.outstanding == 0 {
                    let _ = st.tx.send(Err(ReplSetError::msg(
                        ErrorCode::NodeNotFound,
                        "Quorum check failed because not enough voting nodes \
                         responded",
                    )));
                } else {
                    self.quorum = Some(st);
                }
            }
        }
        Ok(())
    }

    /// Persists and installs an initiate config. A storage failure keeps
    /// the node in `Startup`.
    async fn finish_initiate(
        &mut self,
        config: ReplicaSetConfig,
        self_index: usize,
        doc: &Value,
    ) -> Result<(), ReplSetError> {
        if let Err(e) = self.external.store_local_config(doc).await {
            pf_error!("replSetInitiate failed to store config document: {}", e);
            return Err(e);
        }
        self.mode = ReplicationMode::ReplSet;
        self.finish_install_config(config, Some(self_index));
        pf_info!("replSetInitiate succeeded");
        Ok(())
    }

    /// Persists and installs a reconfig config.
    async fn finish_reconfig(
        &mut self,
        config: ReplicaSetConfig,
        self_index: Option<usize>,
        doc: &Value,
    ) -> Result<(), ReplSetError> {
        if let Err(e) = self.external.store_local_config(doc).await {
            pf_error!("replSetReconfig failed to store config document: {}", e);
            return Err(e);
        }
        pf_info!("replSetReconfig succeeded, version is now {}", config.version);
        self.finish_install_config(config, self_index);
        Ok(())
    }

    /// Installs a newer config learned from a heartbeat response.
    pub(super) async fn install_config_from_heartbeat(
        &mut self,
        config: ReplicaSetConfig,
    ) {
        let self_index = config.find_member_index(&self.self_host);
        if self_index.is_none() {
            pf_warn!(
                "Cannot find self in new replica set configuration version \
                 {}; transitioning to REMOVED",
                config.version
            );
        }
        match serde_json::to_value(&config) {
            Ok(doc) => {
                if let Err(e) = self.external.store_local_config(&doc).await {
                    pf_error!(
                        "failed to store config document received via \
                         heartbeat: {}",
                        e
                    );
                }
            }
            Err(e) => pf_error!("could not serialize heartbeat config: {}", e),
        }
        self.finish_install_config(config, self_index);
    }

    /// The common tail of every config install: swap the config into the
    /// topology coordinator, rebuild progress tracking, restart
    /// heartbeats and timers, and re-evaluate sleeping operations.
    pub(super) fn finish_install_config(
        &mut self,
        config: ReplicaSetConfig,
        self_index: Option<usize>,
    ) {
        let now = self.clock.now();
        let is_arbiter = self_index
            .map(|idx| config.members[idx].arbiter_only)
            .unwrap_or(false);
        let version = config.version;
        self.topology.install_config(config, self_index);
        self.tracker.reconfigure(
            self.topology.config().unwrap(),
            self_index,
            now,
        );
        for (_, event) in self.liveness_events.drain() {
            self.events.cancel(event);
        }
        if self_index.is_some() && !is_arbiter {
            self.external.start_threads();
        }
        self.schedule_heartbeats(now);
        self.cancel_and_reschedule_election_timeout();
        self.advance_commit_point();
        self.wake_ready_waiters();
        pf_info!(
            "new replica set config in use, version {}; this node is {}",
            version,
            self.topology.member_state()
        );
    }

    /// Gate for replica-set admin commands.
    pub fn check_repl_enabled_for_command(
        &self,
        result: &mut serde_json::Map<String, Value>,
    ) -> Result<(), ReplSetError> {
        match self.mode {
            ReplicationMode::None | ReplicationMode::MasterSlave => {
                if self.options.configsvr {
                    result.insert("info".into(), json!("configsvr"));
                }
                Err(ReplSetError::msg(
                    ErrorCode::NoReplicationEnabled,
                    "not running with --replSet",
                ))
            }
            ReplicationMode::ReplSet if self.topology.config().is_none() => {
                result.insert(
                    "info".into(),
                    json!("run rs.initiate(...) if not yet done for the set"),
                );
                Err(ReplSetError::msg(
                    ErrorCode::NotYetInitialized,
                    "no replset config has been received",
                ))
            }
            ReplicationMode::ReplSet => Ok(()),
        }
    }

    /// Fills the replica-set portion of an `isMaster` reply.
    pub fn fill_is_master(&self) -> IsMasterResponse {
        let mut resp = IsMasterResponse::default();
        let config = match self.topology.config() {
            Some(config) => config,
            None => {
                resp.is_replica_set = true;
                resp.build_indexes = true;
                resp.info =
                    Some("Does not have a valid replica set config".into());
                return resp;
            }
        };

        let state = self.topology.member_state();
        resp.is_master = state.is_primary();
        resp.secondary = state.is_secondary();
        resp.set_name = Some(config.name.clone());
        resp.set_version = Some(config.version);
        for member in &config.members {
            if member.hidden {
                continue;
            }
            if member.arbiter_only {
                resp.arbiters.push(member.host.clone());
            } else if member.priority == 0 {
                resp.passives.push(member.host.clone());
            } else {
                resp.hosts.push(member.host.clone());
            }
        }
        let primary_index = self.topology.current_primary_index();
        if primary_index >= 0 {
            resp.primary =
                Some(config.members[primary_index as usize].host.clone());
        }
        if let Some(self_index) = self.topology.self_index() {
            let me = &config.members[self_index];
            resp.me = Some(me.host.clone());
            resp.arbiter_only = me.arbiter_only;
            resp.passive = me.priority == 0 && !me.arbiter_only;
            resp.hidden = me.hidden;
            resp.build_indexes = me.build_indexes;
            resp.slave_delay_secs = me.slave_delay_secs;
            resp.tags = me.tags.clone();
        } else {
            resp.build_indexes = true;
        }
        resp
    }

    /// Every configured host except this node's own.
    pub fn get_other_nodes_in_repl_set(&self) -> Vec<HostAndPort> {
        match self.topology.config() {
            None => Vec::new(),
            Some(config) => config
                .members
                .iter()
                .enumerate()
                .filter(|&(idx, _)| Some(idx) != self.topology.self_index())
                .map(|(_, m)| m.host.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod configure_scenarios {
    use super::testing::ReplCoordTest;
    use super::*;
    use crate::net::{HeartbeatResponse, RemoteCommand, ResponseBody};
    use crate::repl::waiters::{WTimeout, WriteConcern};
    use serde_json::json;

    fn one_node_doc() -> Value {
        json!({
            "_id": "mySet",
            "version": 1,
            "members": [{ "_id": 0, "host": "node1:12345" }],
        })
    }

    #[tokio::test]
    async fn startup_with_valid_local_config() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.assert_start_success(json!({
            "_id": "mySet",
            "version": 2,
            "members": [{ "_id": 1, "host": "node1:12345" }],
        }))
        .await;
        assert_eq!(fix.coord.member_state(), MemberState::Secondary);
        assert!(fix.external.threads_started());
    }

    #[tokio::test]
    async fn startup_with_valid_local_config_as_arbiter() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.assert_start_success(json!({
            "_id": "mySet",
            "version": 2,
            "members": [
                { "_id": 1, "host": "node1:12345", "arbiterOnly": true },
                { "_id": 2, "host": "node2:12345" },
            ],
        }))
        .await;
        assert_eq!(fix.coord.member_state(), MemberState::Arbiter);
        assert!(!fix.external.threads_started());
    }

    #[tokio::test]
    async fn startup_with_config_missing_self() {
        let mut fix = ReplCoordTest::new("mySet", "node3:12345");
        fix.assert_start_success(json!({
            "_id": "mySet",
            "version": 2,
            "members": [
                { "_id": 1, "host": "node1:12345" },
                { "_id": 2, "host": "node2:54321" },
            ],
        }))
        .await;
        assert_eq!(fix.coord.member_state(), MemberState::Removed);
        assert!(!fix.external.threads_started());
    }

    #[tokio::test]
    async fn startup_with_local_config_set_name_mismatch() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.external.set_local_config(json!({
            "_id": "notMySet",
            "version": 2,
            "members": [{ "_id": 1, "host": "node1:12345" }],
        }));
        fix.coord.start_up().await.unwrap();
        // mismatched document is refused; node stays in startup
        assert!(fix.coord.config().is_none());
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn startup_with_no_local_config() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn initiate_fails_with_empty_config() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let mut handle = fix.coord.process_replset_initiate(&json!({})).await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidReplicaSetConfig);
        assert!(err.reason().contains("Missing expected field \"_id\""));
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn initiate_succeeds_with_one_node_config() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        assert_eq!(fix.coord.member_state(), MemberState::Startup);

        let mut handle =
            fix.coord.process_replset_initiate(&one_node_doc()).await;
        assert_eq!(handle.try_result(), Some(Ok(())));
        assert_eq!(fix.coord.replication_mode(), ReplicationMode::ReplSet);
        assert!(fix.external.threads_started());

        // a second initiate fails now
        let mut handle =
            fix.coord.process_replset_initiate(&one_node_doc()).await;
        assert_eq!(
            handle.try_result().unwrap().unwrap_err().code(),
            ErrorCode::AlreadyInitialized
        );
        assert_eq!(fix.coord.replication_mode(), ReplicationMode::ReplSet);
    }

    #[tokio::test]
    async fn initiate_fails_as_arbiter() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [
                    { "_id": 0, "host": "node1:12345", "arbiterOnly": true },
                    { "_id": 1, "host": "node2:12345" },
                ],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidReplicaSetConfig);
        assert!(err
            .reason()
            .contains("is not electable under the new configuration version"));
        assert!(!fix.external.threads_started());
    }

    #[tokio::test]
    async fn initiate_succeeds_after_failing() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let mut handle = fix.coord.process_replset_initiate(&json!({})).await;
        assert_eq!(
            handle.try_result().unwrap().unwrap_err().code(),
            ErrorCode::InvalidReplicaSetConfig
        );
        assert_eq!(fix.coord.member_state(), MemberState::Startup);

        let mut handle =
            fix.coord.process_replset_initiate(&one_node_doc()).await;
        assert_eq!(handle.try_result(), Some(Ok(())));
        assert_eq!(fix.coord.replication_mode(), ReplicationMode::ReplSet);
    }

    #[tokio::test]
    async fn initiate_fails_if_self_missing() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [{ "_id": 0, "host": "node4" }],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidReplicaSetConfig);
        assert!(err.reason().contains("No host described in new configuration"));
        assert!(err.reason().contains("maps to this node"));
    }

    fn two_node_initiate_doc() -> Value {
        json!({
            "_id": "mySet",
            "version": 1,
            "members": [
                { "_id": 0, "host": "node1:12345" },
                { "_id": 1, "host": "node2:54321" },
            ],
        })
    }

    #[tokio::test]
    async fn initiate_fails_if_quorum_not_met() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let start_date = fix.now();

        let mut handle = fix
            .coord
            .process_replset_initiate(&two_node_initiate_doc())
            .await;
        assert!(handle.try_result().is_none());

        let req = fix.net.take_request().unwrap();
        assert_eq!(req.target, HostAndPort::new("node2", 54321));
        match &req.cmd {
            RemoteCommand::Heartbeat(args) => {
                let doc = args.to_doc();
                assert_eq!(doc["replSetHeartbeat"], json!("mySet"));
                assert_eq!(doc["protocolVersion"], json!(1));
                assert_eq!(doc["configVersion"], json!(1));
                assert_eq!(doc["senderHost"], json!("node1:12345"));
                assert_eq!(doc["senderId"], json!(0));
                assert_eq!(doc["checkEmpty"], json!(true));
            }
            other => panic!("unexpected command {:?}", other),
        }

        fix.net.schedule_response(
            req.id,
            start_date.plus_millis(10),
            Err(ReplSetError::msg(ErrorCode::OperationFailed, "No response")),
        );
        fix.run_until(start_date.plus_millis(10)).await;
        assert_eq!(fix.now(), start_date.plus_millis(10));

        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NodeNotFound);
        assert!(err
            .reason()
            .contains("not all proposed set members responded affirmatively"));
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn initiate_passes_if_quorum_met() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let start_date = fix.now();

        let mut handle = fix
            .coord
            .process_replset_initiate(&two_node_initiate_doc())
            .await;
        assert!(handle.try_result().is_none());

        let req = fix.net.take_request().unwrap();
        assert_eq!(req.target, HostAndPort::new("node2", 54321));
        let resp = HeartbeatResponse {
            config_version: Some(0),
            ..Default::default()
        };
        fix.net.schedule_response(
            req.id,
            start_date.plus_millis(10),
            Ok(ResponseBody::Heartbeat(resp)),
        );
        fix.run_until(start_date.plus_millis(10)).await;

        assert_eq!(handle.try_result(), Some(Ok(())));
        assert_eq!(fix.coord.replication_mode(), ReplicationMode::ReplSet);
        assert_eq!(fix.coord.member_state(), MemberState::Secondary);
    }

    #[tokio::test]
    async fn initiate_refused_by_initialized_peer() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let mut handle = fix
            .coord
            .process_replset_initiate(&two_node_initiate_doc())
            .await;

        // a peer carrying any config version refuses the emptiness probe
        let req = fix.net.take_request().unwrap();
        let resp = HeartbeatResponse {
            config_version: Some(1),
            ..Default::default()
        };
        fix.coord
            .handle_response(req.id, Ok(ResponseBody::Heartbeat(resp)))
            .await
            .unwrap();
        assert_eq!(
            handle.try_result().unwrap().unwrap_err().code(),
            ErrorCode::NodeNotFound
        );
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn initiate_fails_with_set_name_mismatch() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "wrongSet",
                "version": 1,
                "members": [{ "_id": 0, "host": "node1:12345" }],
            }))
            .await;
        assert_eq!(
            handle.try_result().unwrap().unwrap_err().code(),
            ErrorCode::InvalidReplicaSetConfig
        );
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn initiate_without_replset_flag_rules() {
        // version must be exactly 1
        let mut fix =
            ReplCoordTest::new_with_options(ReplOptions::default(), "node1:12345");
        fix.start().await;
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 2,
                "members": [{ "_id": 0, "host": "node1:12345" }],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidReplicaSetConfig);
        assert!(err.reason().contains("have version 1, but found 2"));

        // exactly one member
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [
                    { "_id": 0, "host": "node1:12345" },
                    { "_id": 1, "host": "node2:12345" },
                ],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert!(err
            .reason()
            .contains("you can only specify one member in the config"));

        // the lone member must map to this node
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [{ "_id": 0, "host": "node5:12345" }],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert!(err.reason().contains("No host described in new configuration"));

        // an arbiter-only or passive lone member cannot form a set
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [
                    { "_id": 0, "host": "node1:12345", "arbiterOnly": true },
                ],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert!(err
            .reason()
            .contains("must contain at least one non-arbiter member"));

        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [{ "_id": 0, "host": "node1:12345", "priority": 0 }],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert!(err
            .reason()
            .contains("must contain at least one non-arbiter member"));

        // non-voting and hidden members must carry priority 0
        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [{ "_id": 0, "host": "node1:12345", "votes": 0 }],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert!(err
            .reason()
            .contains("priority must be 0 when non-voting (votes:0)"));

        let mut handle = fix
            .coord
            .process_replset_initiate(&json!({
                "_id": "mySet",
                "version": 1,
                "members": [{ "_id": 0, "host": "node1:12345", "hidden": true }],
            }))
            .await;
        let err = handle.try_result().unwrap().unwrap_err();
        assert!(err.reason().contains("priority must be 0 when hidden=true"));

        // and a plain single-node config passes
        let mut handle =
            fix.coord.process_replset_initiate(&one_node_doc()).await;
        assert_eq!(handle.try_result(), Some(Ok(())));
        assert_eq!(fix.coord.replication_mode(), ReplicationMode::ReplSet);
    }

    #[tokio::test]
    async fn initiate_fails_while_storing_config() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        fix.external.set_store_local_config_status(ReplSetError::msg(
            ErrorCode::OutOfDiskSpace,
            "The test set this",
        ));
        let mut handle =
            fix.coord.process_replset_initiate(&one_node_doc()).await;
        assert_eq!(
            handle.try_result().unwrap().unwrap_err().code(),
            ErrorCode::OutOfDiskSpace
        );
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn check_repl_enabled_gates() {
        // no replication configured at all
        let mut fix =
            ReplCoordTest::new_with_options(ReplOptions::default(), "node1:12345");
        fix.start().await;
        let mut result = serde_json::Map::new();
        let status = fix.coord.check_repl_enabled_for_command(&mut result);
        assert_eq!(status.unwrap_err().code(), ErrorCode::NoReplicationEnabled);
        assert!(result.is_empty());

        // config server flavor mentions configsvr
        let options = ReplOptions {
            configsvr: true,
            ..Default::default()
        };
        let mut fix = ReplCoordTest::new_with_options(options, "node1:12345");
        fix.start().await;
        let mut result = serde_json::Map::new();
        let status = fix.coord.check_repl_enabled_for_command(&mut result);
        assert_eq!(status.unwrap_err().code(), ErrorCode::NoReplicationEnabled);
        assert_eq!(result["info"], json!("configsvr"));

        // replset flag without a config yet
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let mut result = serde_json::Map::new();
        let status = fix.coord.check_repl_enabled_for_command(&mut result);
        assert_eq!(status.unwrap_err().code(), ErrorCode::NotYetInitialized);
        assert!(result["info"]
            .as_str()
            .unwrap()
            .contains("rs.initiate"));

        // fully configured
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.assert_start_success(json!({
            "_id": "mySet",
            "version": 2,
            "members": [{ "_id": 0, "host": "node1:12345" }],
        }))
        .await;
        let mut result = serde_json::Map::new();
        assert!(fix.coord.check_repl_enabled_for_command(&mut result).is_ok());
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn is_master_no_config() {
        let mut fix =
            ReplCoordTest::new_with_options(ReplOptions::default(), "node1:12345");
        fix.start().await;
        let resp = fix.coord.fill_is_master();
        assert!(!resp.is_master);
        assert!(!resp.secondary);
        assert!(resp.is_replica_set);
        assert_eq!(
            resp.info.as_deref(),
            Some("Does not have a valid replica set config")
        );
        let doc = resp.to_doc();
        assert_eq!(doc["ismaster"], json!(false));
        assert_eq!(doc["secondary"], json!(false));
        assert_eq!(doc["isreplicaset"], json!(true));
    }

    #[tokio::test]
    async fn is_master_full_fields() {
        let mut fix = ReplCoordTest::new("mySet", "h4");
        fix.assert_start_success(json!({
            "_id": "mySet",
            "version": 2,
            "members": [
                { "_id": 0, "host": "h1" },
                { "_id": 1, "host": "h2" },
                { "_id": 2, "host": "h3", "arbiterOnly": true },
                { "_id": 3, "host": "h4", "priority": 0,
                  "tags": { "key1": "value1", "key2": "value2" } },
            ],
        }))
        .await;
        assert!(fix.coord.set_follower_mode(MemberState::Secondary));

        let resp = fix.coord.fill_is_master();
        assert_eq!(resp.set_name.as_deref(), Some("mySet"));
        assert_eq!(resp.set_version, Some(2));
        assert!(!resp.is_master);
        assert!(resp.secondary);
        assert!(!resp.arbiter_only);
        assert!(resp.passive);
        assert!(!resp.hidden);
        assert!(resp.build_indexes);
        assert_eq!(resp.slave_delay_secs, 0);
        assert_eq!(resp.me, Some(HostAndPort::new("h4", 27017)));

        let mut hosts = resp.hosts.clone();
        hosts.sort_by_key(|h| h.host.clone());
        assert_eq!(
            hosts,
            vec![HostAndPort::new("h1", 27017), HostAndPort::new("h2", 27017)]
        );
        assert_eq!(resp.passives, vec![HostAndPort::new("h4", 27017)]);
        assert_eq!(resp.arbiters, vec![HostAndPort::new("h3", 27017)]);
        assert_eq!(resp.tags.len(), 2);
        assert_eq!(resp.tags["key1"], "value1");
        assert_eq!(resp.tags["key2"], "value2");
        assert!(resp.info.is_none());
    }

    #[tokio::test]
    async fn other_nodes_in_repl_set() {
        let mut fix = ReplCoordTest::new("mySet", "h1");
        fix.start().await;
        assert!(fix.coord.get_other_nodes_in_repl_set().is_empty());

        let mut fix = ReplCoordTest::new("mySet", "h1");
        fix.assert_start_success(json!({
            "_id": "mySet",
            "version": 2,
            "members": [
                { "_id": 0, "host": "h1" },
                { "_id": 1, "host": "h2" },
                { "_id": 2, "host": "h3", "priority": 0, "hidden": true },
            ],
        }))
        .await;
        let mut others = fix.coord.get_other_nodes_in_repl_set();
        others.sort_by_key(|h| h.host.clone());
        assert_eq!(
            others,
            vec![HostAndPort::new("h2", 27017), HostAndPort::new("h3", 27017)]
        );
    }

    #[tokio::test]
    async fn shutdown_before_startup_is_ignored() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.coord.shutdown();
        // the node still starts normally afterwards
        fix.start().await;
        assert_eq!(fix.coord.member_state(), MemberState::Startup);
    }

    #[tokio::test]
    async fn basic_rbid_usage() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.start().await;
        let initial = fix.coord.process_replset_get_rbid()["rbid"]
            .as_u64()
            .unwrap();
        fix.coord.increment_rollback_id();
        let incremented = fix.coord.process_replset_get_rbid()["rbid"]
            .as_u64()
            .unwrap();
        assert_eq!(incremented, initial + 1);
    }

    fn reconfig_fixture_doc() -> Value {
        json!({
            "_id": "mySet",
            "version": 2,
            "protocolVersion": 1,
            "members": [
                { "_id": 0, "host": "node1:12345" },
                { "_id": 1, "host": "node2:12345" },
                { "_id": 2, "host": "node3:12345" },
            ],
        })
    }

    #[tokio::test]
    async fn reconfig_requires_primary() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.assert_start_success(reconfig_fixture_doc()).await;
        assert!(fix.coord.set_follower_mode(MemberState::Secondary));
        let mut handle = fix
            .coord
            .process_replset_reconfig(&reconfig_fixture_doc(), false)
            .await;
        assert_eq!(
            handle.try_result().unwrap().unwrap_err().code(),
            ErrorCode::NotMaster
        );
    }

    #[tokio::test]
    async fn await_replication_reconfig_simple() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.assert_start_success(reconfig_fixture_doc()).await;
        assert!(fix.coord.set_follower_mode(MemberState::Secondary));
        let time = OpTime::from_parts(100, 2, 0);
        fix.coord.set_my_last_optime(time);
        fix.simulate_successful_v1_election().await;

        let wc = WriteConcern::nodes(3, WTimeout::NoTimeout);
        let mut waiter =
            fix.coord.await_replication(&OpCtx::new(7), time, &wc);
        assert!(waiter.try_result().is_none());

        // reconfig to version 3 and acknowledge its quorum heartbeat
        let new_doc = json!({
            "_id": "mySet",
            "version": 3,
            "protocolVersion": 1,
            "members": [
                { "_id": 0, "host": "node1:12345", "priority": 3 },
                { "_id": 1, "host": "node2:12345" },
                { "_id": 2, "host": "node3:12345" },
            ],
        });
        let mut handle =
            fix.coord.process_replset_reconfig(&new_doc, false).await;
        assert!(handle.try_result().is_none());
        let req = fix.net.take_request().unwrap();
        fix.reply_to_heartbeat(req, MemberState::Secondary, None).await;
        assert_eq!(handle.try_result(), Some(Ok(())));
        assert_eq!(fix.coord.config().unwrap().version, 3);

        // satisfy the waiter against the new config
        fix.coord.set_last_optime(3, 1, time).unwrap();
        assert!(waiter.try_result().is_none());
        fix.coord.set_last_optime(3, 2, time).unwrap();
        assert_eq!(waiter.try_result(), Some(Ok(())));
    }

    #[tokio::test]
    async fn await_replication_reconfig_to_fewer_nodes_cannot_satisfy() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.assert_start_success(reconfig_fixture_doc()).await;
        assert!(fix.coord.set_follower_mode(MemberState::Secondary));
        let time = OpTime::from_parts(100, 2, 0);
        fix.coord.set_my_last_optime(time);
        fix.simulate_successful_v1_election().await;

        let wc = WriteConcern::nodes(3, WTimeout::NoTimeout);
        let mut waiter =
            fix.coord.await_replication(&OpCtx::new(7), time, &wc);
        assert!(waiter.try_result().is_none());

        let new_doc = json!({
            "_id": "mySet",
            "version": 3,
            "protocolVersion": 1,
            "members": [
                { "_id": 0, "host": "node1:12345" },
                { "_id": 2, "host": "node3:12345" },
            ],
        });
        let mut handle =
            fix.coord.process_replset_reconfig(&new_doc, false).await;
        let req = fix.net.take_request().unwrap();
        fix.reply_to_heartbeat(req, MemberState::Secondary, None).await;
        assert_eq!(handle.try_result(), Some(Ok(())));

        // w:3 can never hold against a two-member config
        assert_eq!(
            waiter.try_result().unwrap().unwrap_err().code(),
            ErrorCode::CannotSatisfyWriteConcern
        );
    }

    #[tokio::test]
    async fn await_replication_reconfig_to_smaller_majority() {
        let mut fix = ReplCoordTest::new("mySet", "node1:12345");
        fix.assert_start_success(json!({
            "_id": "mySet",
            "version": 2,
            "protocolVersion": 1,
            "members": [
                { "_id": 0, "host": "node1:12345" },
                { "_id": 1, "host": "node2:12345" },
                { "_id": 2, "host": "node3:12345" },
                { "_id": 3, "host": "node4:12345" },
                { "_id": 4, "host": "node5:12345" },
            ],
        }))
        .await;
        assert!(fix.coord.set_follower_mode(MemberState::Secondary));
        fix.coord.set_my_last_optime(OpTime::from_parts(100, 1, 0));
        fix.simulate_successful_v1_election().await;

        let time = OpTime::from_parts(100, 2, 1);
        fix.coord.set_my_last_optime(time);
        fix.coord.on_snapshot_create(time, SnapshotName(1));
        fix.coord.set_last_optime(2, 1, time).unwrap();

        // majority of five voters is out of reach with only two copies
        let wc = WriteConcern::majority(WTimeout::NoWaiting);
        let mut check =
            fix.coord.await_replication(&OpCtx::new(8), time, &wc);
        assert_eq!(
            check.try_result().unwrap().unwrap_err().code(),
            ErrorCode::WriteConcernFailed
        );

        let wc_blocking = WriteConcern::majority(WTimeout::NoTimeout);
        let mut waiter =
            fix.coord
                .await_replication(&OpCtx::new(7), time, &wc_blocking);
        assert!(waiter.try_result().is_none());

        // shrink the set to three members; two copies now make a majority
        let new_doc = json!({
            "_id": "mySet",
            "version": 3,
            "protocolVersion": 1,
            "members": [
                { "_id": 0, "host": "node1:12345", "priority": 3 },
                { "_id": 1, "host": "node2:12345" },
                { "_id": 2, "host": "node3:12345" },
            ],
        });
        let mut handle =
            fix.coord.process_replset_reconfig(&new_doc, false).await;
        let req = fix.net.take_request().unwrap();
        fix.reply_to_heartbeat(req, MemberState::Secondary, None).await;
        assert_eq!(handle.try_result(), Some(Ok(())));

        assert_eq!(waiter.try_result(), Some(Ok(())));
    }
}
