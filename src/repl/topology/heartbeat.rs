//! `TopologyCoordinator` -- heartbeat request preparation and response
//! processing.

use super::*;
use crate::config::HostAndPort;
use crate::net::{HeartbeatArgs, HeartbeatResponse};
use crate::repl::state::MemberState;

/// What the replication coordinator must do after one processed heartbeat
/// response.
#[derive(Debug, Clone)]
pub enum ResponseActionKind {
    /// Nothing beyond scheduling the next heartbeat.
    None,

    /// Install the newer config the peer supplied.
    Reconfig(ReplicaSetConfig),

    /// Relinquish leadership; a peer holds a newer claim.
    StepDownSelf,
}

/// Decision produced by `process_heartbeat_response`.
#[derive(Debug, Clone)]
pub struct HeartbeatResponseAction {
    pub kind: ResponseActionKind,

    /// When the next heartbeat to this member should start.
    pub next_heartbeat: Date,
}

// TopologyCoordinator heartbeat handling
impl TopologyCoordinator {
    /// Prepares the heartbeat request for one remote member and records
    /// the send date.
    pub fn prepare_heartbeat_request(
        &mut self,
        now: Date,
        target_index: usize,
        self_host: &HostAndPort,
    ) -> HeartbeatArgs {
        let config = self.config.as_ref().expect("no config installed");
        self.member_data[target_index].last_heartbeat_sent = now;
        HeartbeatArgs {
            set_name: config.name.clone(),
            protocol_version: config.protocol_version,
            config_version: config.version,
            sender_host: self_host.clone(),
            sender_id: self
                .self_index
                .map(|idx| config.members[idx].id)
                .unwrap_or(-1),
            check_empty: false,
        }
    }

    /// Digests one heartbeat response (or transport failure) from a remote
    /// member and decides what the coordinator must do next.
    pub fn process_heartbeat_response(
        &mut self,
        now: Date,
        target_index: usize,
        resp: Result<&HeartbeatResponse, &ReplSetError>,
    ) -> HeartbeatResponseAction {
        let interval_ms = self
            .config
            .as_ref()
            .map(|c| c.heartbeat_interval_ms())
            .unwrap_or(crate::config::DEFAULT_HEARTBEAT_INTERVAL_MS);
        let mut action = HeartbeatResponseAction {
            kind: ResponseActionKind::None,
            next_heartbeat: now.plus_millis(interval_ms),
        };

        match resp {
            Err(e) => {
                // no retry machinery: the down bit simply follows failed
                // rounds, and the next heartbeat keeps the normal cadence
                let data = &mut self.member_data[target_index];
                data.up = false;
                data.state = MemberState::Down;
                pf_debug!(
                    "heartbeat to member {} failed: {}",
                    target_index,
                    e
                );
            }
            Ok(resp) => {
                let our_version =
                    self.config.as_ref().map(|c| c.version).unwrap_or(-1);
                let data = &mut self.member_data[target_index];
                data.up = true;
                data.last_heartbeat_recv = now;
                data.state = resp.state.unwrap_or(MemberState::Unknown);
                data.auth_issue = false;
                if let Some(version) = resp.config_version {
                    data.config_version = version;
                }
                if let Some(optime) = resp.op_time {
                    if optime > data.last_applied {
                        data.last_applied = optime;
                    }
                }
                data.election_time = resp.election_time;

                if resp.state == Some(MemberState::Primary)
                    && resp.term.unwrap_or(self.term) >= self.term
                    && self.role != Role::Leader
                {
                    self.current_primary_index = target_index as i64;
                }

                if let Some(config) = &resp.config {
                    if config.version > our_version {
                        action.kind = ResponseActionKind::Reconfig(config.clone());
                    }
                }
            }
        }

        action
    }

    /// Builds the response to an inbound heartbeat request, refreshing
    /// what we know about the sender along the way.
    pub fn prepare_heartbeat_response(
        &mut self,
        now: Date,
        args: &HeartbeatArgs,
        my_applied: OpTime,
    ) -> Result<HeartbeatResponse, ReplSetError> {
        if let Some(config) = &self.config {
            if args.set_name != config.name {
                return logged_err!(
                    ErrorCode::BadValue;
                    "replica set names do not match, ours: {}; remote node's: {}",
                    config.name, args.set_name
                );
            }
        }

        // an initiate-time emptiness probe against an initialized node
        // must see our config version and back off
        let response_config = match (&self.config, args.check_empty) {
            (Some(config), _) if args.config_version < config.version => {
                Some(config.clone())
            }
            _ => None,
        };

        // refresh the sender's heartbeat data if it is a known member
        if let Some(config) = &self.config {
            if let Some(idx) = config.member_index_by_id(args.sender_id) {
                if Some(idx) != self.self_index {
                    let data = &mut self.member_data[idx];
                    data.up = true;
                    data.last_heartbeat_recv = now;
                }
            }
        }

        Ok(HeartbeatResponse {
            set_name: self.config.as_ref().map(|c| c.name.clone()),
            state: Some(self.member_state()),
            term: Some(self.term),
            config_version: Some(
                self.config.as_ref().map(|c| c.version).unwrap_or(0),
            ),
            op_time: Some(my_applied),
            election_time: None,
            config: response_config,
            syncing_to: None,
        })
    }
}

#[cfg(test)]
mod heartbeat_tests {
    use super::*;
    use serde_json::json;

    fn two_node_topo() -> TopologyCoordinator {
        let config = ReplicaSetConfig::from_doc(&json!({
            "_id": "mySet",
            "version": 2,
            "protocolVersion": 1,
            "members": [
                { "_id": 0, "host": "node1:12345" },
                { "_id": 1, "host": "node2:12345" },
            ],
        }))
        .unwrap();
        let mut topo = TopologyCoordinator::new();
        topo.install_config(config, Some(0));
        topo
    }

    #[test]
    fn request_shape_and_send_stamp() {
        let mut topo = two_node_topo();
        let args = topo.prepare_heartbeat_request(
            Date(5000),
            1,
            &HostAndPort::new("node1", 12345),
        );
        assert_eq!(args.set_name, "mySet");
        assert_eq!(args.protocol_version, 1);
        assert_eq!(args.config_version, 2);
        assert_eq!(args.sender_id, 0);
        assert!(!args.check_empty);
        assert_eq!(topo.member_data(1).last_heartbeat_sent, Date(5000));
    }

    #[test]
    fn response_updates_member_data() {
        let mut topo = two_node_topo();
        let optime = OpTime::from_parts(100, 1, 0);
        let resp = HeartbeatResponse {
            set_name: Some("mySet".into()),
            state: Some(MemberState::Secondary),
            config_version: Some(2),
            op_time: Some(optime),
            ..Default::default()
        };
        let action = topo.process_heartbeat_response(Date(5000), 1, Ok(&resp));
        assert!(matches!(action.kind, ResponseActionKind::None));
        // next heartbeat rides the configured cadence from receipt time
        assert_eq!(action.next_heartbeat, Date(5000 + 2000));

        let data = topo.member_data(1);
        assert!(data.up);
        assert_eq!(data.state, MemberState::Secondary);
        assert_eq!(data.last_applied, optime);
        assert_eq!(data.last_heartbeat_recv, Date(5000));
    }

    #[test]
    fn failed_response_marks_down() {
        let mut topo = two_node_topo();
        let err = ReplSetError::msg(ErrorCode::NodeNotFound, "No response");
        let action = topo.process_heartbeat_response(Date(5000), 1, Err(&err));
        assert!(matches!(action.kind, ResponseActionKind::None));
        assert!(!topo.member_data(1).up);
        assert_eq!(topo.member_data(1).state, MemberState::Down);
    }

    #[test]
    fn newer_config_triggers_reconfig_action() {
        let mut topo = two_node_topo();
        let newer = ReplicaSetConfig::from_doc(&json!({
            "_id": "mySet",
            "version": 3,
            "protocolVersion": 1,
            "members": [{ "_id": 1, "host": "node2:12345" }],
        }))
        .unwrap();
        let resp = HeartbeatResponse {
            set_name: Some("mySet".into()),
            state: Some(MemberState::Secondary),
            config_version: Some(3),
            config: Some(newer.clone()),
            ..Default::default()
        };
        let action = topo.process_heartbeat_response(Date(5000), 1, Ok(&resp));
        match action.kind {
            ResponseActionKind::Reconfig(config) => {
                assert_eq!(config.version, 3)
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn primary_peer_recorded() {
        let mut topo = two_node_topo();
        let resp = HeartbeatResponse {
            set_name: Some("mySet".into()),
            state: Some(MemberState::Primary),
            term: Some(0),
            ..Default::default()
        };
        topo.process_heartbeat_response(Date(5000), 1, Ok(&resp));
        assert_eq!(topo.current_primary_index(), 1);
    }

    #[test]
    fn inbound_set_name_mismatch() {
        let mut topo = two_node_topo();
        let args = HeartbeatArgs {
            set_name: "notMySet".into(),
            protocol_version: 1,
            config_version: 2,
            sender_host: HostAndPort::new("node2", 12345),
            sender_id: 1,
            check_empty: false,
        };
        let err = topo
            .prepare_heartbeat_response(Date(5000), &args, OpTime::ZERO)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
        assert!(err.reason().contains("replica set names do not match"));
    }

    #[test]
    fn inbound_refreshes_sender_and_ships_config() {
        let mut topo = two_node_topo();
        let args = HeartbeatArgs {
            set_name: "mySet".into(),
            protocol_version: 1,
            config_version: 1,
            sender_host: HostAndPort::new("node2", 12345),
            sender_id: 1,
            check_empty: false,
        };
        let my_applied = OpTime::from_parts(100, 2, 0);
        let resp = topo
            .prepare_heartbeat_response(Date(5000), &args, my_applied)
            .unwrap();
        assert_eq!(resp.set_name.as_deref(), Some("mySet"));
        assert_eq!(resp.state, Some(MemberState::Secondary));
        assert_eq!(resp.config_version, Some(2));
        assert_eq!(resp.op_time, Some(my_applied));
        // sender trailed our config version, so ours rides along
        assert!(resp.config.is_some());
        assert!(topo.member_data(1).up);
    }
}
