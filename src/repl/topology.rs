//! The topology coordinator: the pure decision engine behind the
//! replication coordinator. Holds role, term, config, and per-member
//! heartbeat data; turns inputs (heartbeat replies, vote requests, clock
//! readings) into state transitions and action descriptors. No I/O, no
//! locks, no timers.

mod election;
mod heartbeat;

use std::collections::HashMap;

use crate::config::{MemberId, ReplicaSetConfig};
use crate::repl::optime::{OpTime, Timestamp};
use crate::repl::state::MemberState;
use crate::sched::Date;
use crate::utils::{ErrorCode, ReplSetError};

pub use heartbeat::{HeartbeatResponseAction, ResponseActionKind};

/// Local consensus role.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// What is known about one remote member, learned over heartbeats.
#[derive(Debug, Clone)]
pub struct MemberHeartbeatData {
    /// Last state the member reported.
    pub state: MemberState,

    /// Health bit; cleared on failed heartbeats.
    pub up: bool,

    /// Greatest applied position the member reported over heartbeats.
    pub last_applied: OpTime,

    /// When the last good heartbeat response arrived (zero if never).
    pub last_heartbeat_recv: Date,

    /// When the last heartbeat request left (zero if never).
    pub last_heartbeat_sent: Date,

    /// Config version the member reported.
    pub config_version: i64,

    /// Election time the member reported, if any.
    pub election_time: Option<Timestamp>,

    /// True if the member rejected us for authentication reasons.
    pub auth_issue: bool,
}

impl Default for MemberHeartbeatData {
    fn default() -> Self {
        MemberHeartbeatData {
            state: MemberState::Unknown,
            up: false,
            last_applied: OpTime::ZERO,
            last_heartbeat_recv: Date::ZERO,
            last_heartbeat_sent: Date::ZERO,
            config_version: -1,
            election_time: None,
            auth_issue: false,
        }
    }
}

/// The pure per-node topology decision engine.
pub struct TopologyCoordinator {
    role: Role,
    term: i64,
    config: Option<ReplicaSetConfig>,
    self_index: Option<usize>,
    member_data: Vec<MemberHeartbeatData>,

    /// Base follower state set by `setFollowerMode`; masked by maintenance
    /// mode in `member_state`.
    follower_state: MemberState,

    /// Maintenance mode nesting counter.
    maintenance_count: u32,

    /// Until when this node refuses to stand for election after stepdown.
    stepdown_until: Date,

    /// Index of the member currently believed primary, -1 if unknown.
    current_primary_index: i64,

    /// Vote cast in the newest term we voted in: (term, candidate id).
    last_vote: Option<(i64, MemberId)>,
}

impl TopologyCoordinator {
    /// Creates a fresh topology coordinator with no config.
    pub fn new() -> Self {
        TopologyCoordinator {
            role: Role::Follower,
            term: 0,
            config: None,
            self_index: None,
            member_data: Vec::new(),
            follower_state: MemberState::Startup,
            maintenance_count: 0,
            stepdown_until: Date::ZERO,
            current_primary_index: -1,
            last_vote: None,
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn term(&self) -> i64 {
        self.term
    }

    #[inline]
    pub fn config(&self) -> Option<&ReplicaSetConfig> {
        self.config.as_ref()
    }

    #[inline]
    pub fn self_index(&self) -> Option<usize> {
        self.self_index
    }

    #[inline]
    pub fn stepdown_until(&self) -> Date {
        self.stepdown_until
    }

    #[inline]
    pub fn current_primary_index(&self) -> i64 {
        self.current_primary_index
    }

    /// Heartbeat data for one member index.
    pub fn member_data(&self, index: usize) -> &MemberHeartbeatData {
        &self.member_data[index]
    }

    /// The member state this node observes for itself.
    pub fn member_state(&self) -> MemberState {
        let config = match &self.config {
            Some(config) => config,
            None => return MemberState::Startup,
        };
        let self_index = match self.self_index {
            Some(idx) => idx,
            None => return MemberState::Removed,
        };
        if config.members[self_index].arbiter_only {
            return MemberState::Arbiter;
        }
        if self.role == Role::Leader {
            return MemberState::Primary;
        }
        if self.follower_state == MemberState::Secondary && self.maintenance_count > 0
        {
            return MemberState::Recovering;
        }
        self.follower_state
    }

    /// Installs (or replaces) the replica-set config, carrying heartbeat
    /// data over by member ID. A node seeing its first config leaves
    /// `Startup` for `Secondary` (observed as `Arbiter`/`Removed` where
    /// applicable).
    pub fn install_config(
        &mut self,
        config: ReplicaSetConfig,
        self_index: Option<usize>,
    ) {
        let mut old: HashMap<MemberId, MemberHeartbeatData> = match &self.config {
            Some(old_config) => old_config
                .members
                .iter()
                .map(|m| m.id)
                .zip(self.member_data.drain(..))
                .collect(),
            None => HashMap::new(),
        };
        self.member_data = config
            .members
            .iter()
            .map(|m| old.remove(&m.id).unwrap_or_default())
            .collect();

        self.config = Some(config);
        self.self_index = self_index;
        self.current_primary_index = -1;
        if self.follower_state == MemberState::Startup {
            self.follower_state = MemberState::Secondary;
        }
        if self_index.is_none() && self.role == Role::Leader {
            // removed from the set while primary
            self.role = Role::Follower;
            self.follower_state = MemberState::Secondary;
        }
    }

    /// Applies a `setFollowerMode` request. Returns false when the
    /// transition is not legal from the current role.
    pub fn set_follower_mode(&mut self, state: MemberState) -> bool {
        if !state.is_follower_mode() {
            return false;
        }
        if self.role != Role::Follower {
            return false;
        }
        self.follower_state = state;
        true
    }

    /// Adjusts the maintenance mode counter.
    pub fn set_maintenance_mode(&mut self, enable: bool) -> Result<(), ReplSetError> {
        if self.role != Role::Follower {
            return Err(ReplSetError::msg(
                ErrorCode::NotSecondary,
                "currently running for election or primary",
            ));
        }
        let observed = self.member_state();
        if !(observed.is_secondary() || observed.is_recovering() || observed.is_rollback())
        {
            return Err(ReplSetError::msg(
                ErrorCode::NotSecondary,
                format!("cannot set maintenance mode in state {}", observed),
            ));
        }
        if enable {
            self.maintenance_count += 1;
            pf_info!(
                "going into maintenance mode with {} other tasks in progress",
                self.maintenance_count - 1
            );
        } else if self.maintenance_count > 0 {
            self.maintenance_count -= 1;
            pf_info!(
                "leaving maintenance mode ({} other tasks)",
                self.maintenance_count
            );
        } else {
            return Err(ReplSetError::msg(
                ErrorCode::OperationFailed,
                "already out of maintenance mode",
            ));
        }
        Ok(())
    }

    /// Bumps the term if `term` is newer; clears the known primary on any
    /// bump. Returns true if the term changed.
    pub fn advance_term(&mut self, term: i64) -> bool {
        if term > self.term {
            self.term = term;
            self.current_primary_index = -1;
            true
        } else {
            false
        }
    }

    /// Records which member we believe is primary.
    pub fn set_current_primary_index(&mut self, index: i64) {
        self.current_primary_index = index;
    }

    /// Relinquishes leadership (or abandons candidacy) and enters the
    /// post-stepdown refractory period.
    pub fn step_down_self(&mut self, until: Date) {
        self.role = Role::Follower;
        self.follower_state = MemberState::Secondary;
        self.stepdown_until = until;
        if let Some(self_index) = self.self_index {
            if self.current_primary_index == self_index as i64 {
                self.current_primary_index = -1;
            }
        }
    }

    /// True if some electable member other than self has confirmed, over
    /// heartbeats, an applied position at or past `my_applied`. This is
    /// the stepdown catch-up predicate.
    pub fn caught_up_secondary_exists(&self, my_applied: OpTime) -> bool {
        let config = match &self.config {
            Some(config) => config,
            None => return false,
        };
        self.member_data
            .iter()
            .zip(config.members.iter())
            .enumerate()
            .any(|(idx, (data, member))| {
                Some(idx) != self.self_index
                    && member.is_electable()
                    && data.last_applied >= my_applied
            })
    }
}

impl Default for TopologyCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
