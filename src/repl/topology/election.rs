//! `TopologyCoordinator` -- election eligibility, vote handling, and
//! candidacy bookkeeping.

use super::*;
use crate::net::{VoteRequestArgs, VoteResponse};

// TopologyCoordinator election logic
impl TopologyCoordinator {
    /// Checks whether this node may stand for election right now. Returns
    /// the reason it may not, if any.
    pub fn can_stand_for_election(
        &self,
        now: Date,
        my_applied: OpTime,
    ) -> Result<(), &'static str> {
        let config = match &self.config {
            Some(config) => config,
            None => return Err("no config installed"),
        };
        let self_index = match self.self_index {
            Some(idx) => idx,
            None => return Err("removed from config"),
        };
        if self.role != Role::Follower {
            return Err("already candidate or leader");
        }
        if config.protocol_version != 1 {
            return Err("not protocol version 1");
        }
        if !config.members[self_index].is_electable()
            || config.members[self_index].hidden
        {
            return Err("not electable under current config");
        }
        if !self.member_state().is_secondary() {
            return Err("not in secondary state");
        }
        if !self.stepdown_until.is_zero() && now < self.stepdown_until {
            return Err("still in stepdown period");
        }
        if my_applied.is_zero() {
            return Err("no applied optime yet");
        }
        Ok(())
    }

    /// Enters candidacy (dry-run phase).
    pub fn begin_candidacy(&mut self) {
        debug_assert_eq!(self.role, Role::Follower);
        self.role = Role::Candidate;
    }

    /// Abandons a running candidacy, returning to follower without a term
    /// or state change.
    pub fn abandon_candidacy(&mut self) {
        if self.role == Role::Candidate {
            self.role = Role::Follower;
        }
    }

    /// Builds the vote request for the current election phase. Dry runs
    /// propose `term + 1` without bumping the real term.
    pub fn prepare_vote_request(
        &mut self,
        dry_run: bool,
        my_applied: OpTime,
    ) -> VoteRequestArgs {
        let config = self.config.as_ref().expect("no config installed");
        let self_index = self.self_index.expect("not in config");
        let candidate_id = config.members[self_index].id;
        let term = if dry_run { self.term + 1 } else { self.term };
        if !dry_run {
            // real rounds record the self-vote
            self.last_vote = Some((term, candidate_id));
        }
        VoteRequestArgs {
            set_name: config.name.clone(),
            dry_run,
            term,
            candidate_id,
            config_version: config.version,
            last_applied: my_applied,
        }
    }

    /// Responds to an inbound vote request. Dry-run requests never record
    /// the vote.
    pub fn process_request_votes(
        &mut self,
        args: &VoteRequestArgs,
        my_applied: OpTime,
    ) -> VoteResponse {
        let denied = |reason: String| VoteResponse {
            term: self.term,
            vote_granted: false,
            reason,
        };
        let config = match &self.config {
            Some(config) => config,
            None => return denied("no local config".into()),
        };
        if args.set_name != config.name {
            return denied(format!(
                "candidate's set name {} differs from ours",
                args.set_name
            ));
        }
        if args.term < self.term {
            return denied(format!(
                "candidate's term {} is lower than ours ({})",
                args.term, self.term
            ));
        }
        if args.config_version != config.version {
            return denied(format!(
                "candidate's config version {} differs from ours ({})",
                args.config_version, config.version
            ));
        }
        if args.last_applied < my_applied {
            return denied("candidate's data is staler than ours".into());
        }
        if !args.dry_run {
            if let Some((term, voted_for)) = self.last_vote {
                if term == args.term && voted_for != args.candidate_id {
                    return denied(format!(
                        "already voted for member {} in term {}",
                        voted_for, term
                    ));
                }
            }
            self.last_vote = Some((args.term, args.candidate_id));
        }
        VoteResponse {
            term: self.term,
            vote_granted: true,
            reason: String::new(),
        }
    }

    /// Takes leadership after winning the real vote round.
    pub fn win_election(&mut self) {
        debug_assert_eq!(self.role, Role::Candidate);
        self.role = Role::Leader;
        self.stepdown_until = Date::ZERO;
        if let Some(self_index) = self.self_index {
            self.current_primary_index = self_index as i64;
        }
    }
}
