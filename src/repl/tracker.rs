//! Per-member replication progress: last-applied positions, liveness
//! stamps, write-concern satisfaction, and commit-point candidates.

use std::collections::{HashMap, HashSet};

use crate::config::{HostAndPort, MemberId, ReplicaSetConfig, TagMode};
use crate::net::UpdatePositionEntry;
use crate::repl::optime::OpTime;
use crate::sched::Date;

/// One tracked member's replication progress.
#[derive(Debug, Clone)]
pub struct MemberProgress {
    /// Member ID, for command building.
    pub member_id: MemberId,

    /// Greatest position this member is known to have applied.
    pub applied: OpTime,

    /// When we last heard from this member (heartbeat reply or position
    /// update).
    pub last_update: Date,

    /// Liveness bit; cleared when `last_update` goes stale.
    pub up: bool,

    /// True for the local node's own entry.
    pub is_self: bool,
}

/// Tracks progress for every member of the current config, index-aligned
/// with the config's member list.
#[derive(Default)]
pub struct OpTimeTracker {
    entries: Vec<MemberProgress>,
    self_index: Option<usize>,
}

impl OpTimeTracker {
    /// Creates an empty tracker (no config installed yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds entries for a new config, carrying over known positions by
    /// member ID.
    pub fn reconfigure(
        &mut self,
        config: &ReplicaSetConfig,
        self_index: Option<usize>,
        now: Date,
    ) {
        let old: HashMap<MemberId, MemberProgress> = self
            .entries
            .drain(..)
            .map(|e| (e.member_id, e))
            .collect();
        self.entries = config
            .members
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                let is_self = Some(idx) == self_index;
                match old.get(&m.id) {
                    Some(prev) => MemberProgress {
                        member_id: m.id,
                        applied: prev.applied,
                        last_update: prev.last_update,
                        up: prev.up,
                        is_self,
                    },
                    None => MemberProgress {
                        member_id: m.id,
                        applied: OpTime::ZERO,
                        last_update: now,
                        up: true,
                        is_self,
                    },
                }
            })
            .collect();
        self.self_index = self_index;
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no config is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The tracked entry at a member index.
    pub fn entry(&self, index: usize) -> &MemberProgress {
        &self.entries[index]
    }

    /// The local node's applied position (zero when unconfigured).
    pub fn my_applied(&self) -> OpTime {
        match self.self_index {
            Some(idx) => self.entries[idx].applied,
            None => OpTime::ZERO,
        }
    }

    /// Moves a member's applied position monotonically forward. Returns
    /// true if the position advanced.
    pub fn advance_applied(&mut self, index: usize, optime: OpTime) -> bool {
        let entry = &mut self.entries[index];
        if optime > entry.applied {
            entry.applied = optime;
            true
        } else {
            false
        }
    }

    /// Moves the local node's applied position forward.
    pub fn advance_my_applied(&mut self, optime: OpTime) -> bool {
        match self.self_index {
            Some(idx) => self.advance_applied(idx, optime),
            None => false,
        }
    }

    /// Refreshes a member's liveness stamp.
    pub fn refresh_liveness(&mut self, index: usize, now: Date) {
        let entry = &mut self.entries[index];
        entry.last_update = now;
        entry.up = true;
    }

    /// Marks a member down if its liveness stamp has gone stale. Returns
    /// true if the member was just marked down.
    pub fn mark_down_if_stale(
        &mut self,
        index: usize,
        now: Date,
        timeout_ms: u64,
    ) -> bool {
        let entry = &mut self.entries[index];
        if entry.is_self || !entry.up {
            return false;
        }
        if now >= entry.last_update.plus_millis(timeout_ms) {
            entry.up = false;
            true
        } else {
            false
        }
    }

    /// Number of voting members currently considered live (self included).
    pub fn count_live_voters(&self, config: &ReplicaSetConfig) -> usize {
        self.entries
            .iter()
            .zip(config.members.iter())
            .filter(|(e, m)| m.is_voter() && (e.is_self || e.up))
            .count()
    }

    /// True if at least `num` members (self included) have applied up to
    /// `target`.
    pub fn have_num_nodes_reached(&self, target: OpTime, num: usize) -> bool {
        self.entries.iter().filter(|e| e.applied >= target).count() >= num
    }

    /// True if the members that applied up to `target` cover the required
    /// number of distinct values for every tag of the mode.
    pub fn have_tagged_reached(
        &self,
        config: &ReplicaSetConfig,
        target: OpTime,
        mode: &TagMode,
    ) -> bool {
        mode.iter().all(|(tag_key, &required)| {
            let distinct: HashSet<&str> = self
                .entries
                .iter()
                .zip(config.members.iter())
                .filter(|(e, _)| e.applied >= target)
                .filter_map(|(_, m)| m.tags.get(tag_key).map(String::as_str))
                .collect();
            distinct.len() >= required
        })
    }

    /// True if a strict majority of the voting members have applied up to
    /// `target`. Only voting data-bearing members can count toward the
    /// majority; arbiters raise the bar without being able to meet it.
    pub fn have_majority_reached(
        &self,
        config: &ReplicaSetConfig,
        target: OpTime,
    ) -> bool {
        let satisfied = self
            .entries
            .iter()
            .zip(config.members.iter())
            .filter(|(e, m)| {
                m.is_voter() && !m.arbiter_only && e.applied >= target
            })
            .count();
        satisfied >= config.majority_vote_count()
    }

    /// The greatest position a strict majority of voters has applied, if
    /// one exists yet. Term gating against the current term is the
    /// caller's business.
    pub fn committed_candidate(&self, config: &ReplicaSetConfig) -> Option<OpTime> {
        let mut applied: Vec<OpTime> = self
            .entries
            .iter()
            .zip(config.members.iter())
            .filter(|(_, m)| m.is_voter() && !m.arbiter_only)
            .map(|(e, _)| e.applied)
            .collect();
        applied.sort_unstable_by(|a, b| b.cmp(a));
        applied.get(config.majority_vote_count() - 1).copied()
    }

    /// Entries for a `replSetUpdatePosition` command: self always, plus
    /// every member with a known position that is still considered live.
    pub fn update_position_entries(
        &self,
        config: &ReplicaSetConfig,
    ) -> Vec<UpdatePositionEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_self || (e.up && !e.applied.is_zero()))
            .map(|e| UpdatePositionEntry {
                config_version: config.version,
                member_id: e.member_id,
                op_time: e.applied,
            })
            .collect()
    }

    /// Hosts (self included) whose applied position covers `target`.
    pub fn hosts_written_to(
        &self,
        config: &ReplicaSetConfig,
        target: OpTime,
    ) -> Vec<HostAndPort> {
        self.entries
            .iter()
            .zip(config.members.iter())
            .filter(|(e, _)| e.applied >= target)
            .map(|(_, m)| m.host.clone())
            .collect()
    }
}
