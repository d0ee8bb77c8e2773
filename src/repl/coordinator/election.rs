//! `ReplCoordinator` -- the election path, term updates, stepdown with
//! catch-up, follower-mode and maintenance-mode changes.

use super::*;
use crate::net::{
    OutboundRequest, RemoteCommand, ResponseBody, VoteRequestArgs,
    VoteResponse,
};
use crate::repl::waiters::WaitHandle;

// ReplCoordinator election and stepdown handling
impl ReplCoordinator {
    /// Fires when the election timer expires: checks eligibility and
    /// starts the dry-run vote round.
    pub(super) fn handle_election_timeout(&mut self) {
        self.election_event = None;
        self.election_timeout_at = Date::ZERO;
        let now = self.clock.now();
        let my_applied = self.tracker.my_applied();
        if let Err(reason) = self.topology.can_stand_for_election(now, my_applied)
        {
            pf_debug!("not standing for election: {}", reason);
            self.cancel_and_reschedule_election_timeout();
            return;
        }
        pf_info!(
            "election timeout expired, starting dry-run election for term {}",
            self.topology.term() + 1
        );
        self.topology.begin_candidacy();
        let vote_term = self.topology.term() + 1;
        self.election = Some(self.fresh_vote_round(true, vote_term));
        self.broadcast_vote_requests(true);
        self.try_conclude_vote_round();
    }

    /// A vote round holding only the self-vote so far.
    fn fresh_vote_round(&self, dry_run: bool, vote_term: i64) -> ElectionState {
        let config = self.topology.config().unwrap();
        let mut votes = Bitmap::new(config.members.len(), false);
        if let Some(self_index) = self.topology.self_index() {
            votes.set(self_index, true).unwrap();
        }
        ElectionState {
            dry_run,
            vote_term,
            votes,
        }
    }

    /// Sends the current vote round's request to every other voter.
    fn broadcast_vote_requests(&mut self, dry_run: bool) {
        let my_applied = self.tracker.my_applied();
        let args = self.topology.prepare_vote_request(dry_run, my_applied);
        let targets: Vec<(usize, HostAndPort)> = {
            let config = self.topology.config().unwrap();
            config
                .members
                .iter()
                .enumerate()
                .filter(|&(idx, m)| {
                    Some(idx) != self.topology.self_index() && m.is_voter()
                })
                .map(|(idx, m)| (idx, m.host.clone()))
                .collect()
        };
        for (member_index, target) in targets {
            let id = self.next_request_id();
            self.outstanding.insert(
                id,
                PendingKind::VoteRequest {
                    dry_run,
                    term: args.term,
                    member_index,
                },
            );
            self.net.dispatch(OutboundRequest {
                id,
                target,
                cmd: RemoteCommand::RequestVotes(args.clone()),
            });
        }
    }

    /// Advances the election whenever the current round holds a majority
    /// of votes: dry run -> real round -> leadership. Loops so that a
    /// single-voter set wins without any responses.
    fn try_conclude_vote_round(&mut self) {
        loop {
            let majority = match self.topology.config() {
                Some(config) => config.majority_vote_count(),
                None => return,
            };
            let (dry_run, vote_term, granted) = match &self.election {
                Some(st) => (st.dry_run, st.vote_term, st.votes.count()),
                None => return,
            };
            if granted < majority {
                return;
            }
            if dry_run {
                pf_info!(
                    "dry-run election successful, running for election in \
                     term {}",
                    vote_term
                );
                self.topology.advance_term(vote_term);
                self.election = Some(self.fresh_vote_round(false, vote_term));
                self.broadcast_vote_requests(false);
                continue;
            }
            self.election = None;
            self.win_election_finish();
            return;
        }
    }

    /// Routes one vote response into the running election, if any.
    pub(super) fn handle_vote_response(
        &mut self,
        dry_run: bool,
        term: i64,
        member_index: usize,
        resp: RemoteResponse,
    ) -> Result<(), ReplSetError> {
        let stale = match &self.election {
            Some(st) => st.dry_run != dry_run || st.vote_term != term,
            None => true,
        };
        if stale {
            pf_trace!("ignoring stale vote response for term {}", term);
            return Ok(());
        }
        match resp {
            Ok(ResponseBody::Votes(vote)) => {
                // a responder ahead of the term we are proposing means a
                // newer election round exists somewhere
                if vote.term > term {
                    pf_info!(
                        "vote response carried newer term {}, abandoning \
                         election",
                        vote.term
                    );
                    self.election = None;
                    self.topology.abandon_candidacy();
                    self.update_term_and_maybe_step_down(vote.term);
                    self.cancel_and_reschedule_election_timeout();
                    return Ok(());
                }
                if vote.vote_granted {
                    if let Some(st) = &mut self.election {
                        st.votes.set(member_index, true)?;
                    }
                    self.try_conclude_vote_round();
                } else {
                    pf_debug!("vote denied: {}", vote.reason);
                }
            }
            Ok(_) => pf_warn!("unexpected response body to a vote request"),
            Err(e) => pf_debug!("vote request failed: {}", e),
        }
        Ok(())
    }

    /// Takes leadership after the real vote round held a majority. The
    /// applier must drain before writes are admitted.
    fn win_election_finish(&mut self) {
        self.topology.win_election();
        self.drain_pending = true;
        pf_info!(
            "election succeeded, assuming primary role in term {}",
            self.topology.term()
        );
        self.external.signal_applier_to_cancel_fetcher();
        self.cancel_and_reschedule_election_timeout();
        let now = self.clock.now();
        self.schedule_heartbeats(now);
        self.advance_commit_point();
        self.wake_ready_waiters();
    }

    /// Called by the applier once its buffers drain after an election
    /// win; completes the transition to a writable primary.
    pub fn signal_drain_complete(&mut self) {
        if self.drain_pending && self.topology.role() == Role::Leader {
            self.drain_pending = false;
            pf_info!(
                "transition to primary complete; database writes are now \
                 permitted"
            );
        }
    }

    /// Handles an inbound vote request from a candidate peer.
    pub fn process_request_votes(
        &mut self,
        args: &VoteRequestArgs,
    ) -> VoteResponse {
        let my_applied = self.tracker.my_applied();
        let resp = self.topology.process_request_votes(args, my_applied);
        if args.term > self.topology.term() {
            self.update_term_and_maybe_step_down(args.term);
        }
        resp
    }

    /// Applies a term seen from a client command. A newer term bumps ours
    /// (stepping a primary down) and surfaces `StaleTerm`.
    pub fn update_term(&mut self, term: i64) -> Result<(), ReplSetError> {
        if self.mode != ReplicationMode::ReplSet {
            return Err(ReplSetError::msg(
                ErrorCode::BadValue,
                "cannot supply 'term' without active replication",
            ));
        }
        if self.update_term_and_maybe_step_down(term) {
            return Err(ReplSetError::msg(
                ErrorCode::StaleTerm,
                format!("term out of date, updated to {}", term),
            ));
        }
        Ok(())
    }

    /// Bumps the term if newer, abandoning any candidacy and stepping a
    /// primary down. Returns true if the term changed.
    pub(super) fn update_term_and_maybe_step_down(&mut self, term: i64) -> bool {
        if !self.topology.advance_term(term) {
            return false;
        }
        pf_info!("updated term to {}", term);
        match self.topology.role() {
            Role::Leader => self.relinquish_primary(Date::ZERO),
            Role::Candidate => {
                self.election = None;
                self.topology.abandon_candidacy();
                self.cancel_and_reschedule_election_timeout();
            }
            Role::Follower => {}
        }
        true
    }

    /// Applies a follower-mode change. From candidacy, only `Rollback` is
    /// legal: it cancels the vote round with no leadership change.
    pub fn set_follower_mode(&mut self, state: MemberState) -> bool {
        match self.topology.role() {
            Role::Leader => false,
            Role::Candidate => {
                if state != MemberState::Rollback {
                    return false;
                }
                pf_info!(
                    "cancelling election due to follower mode change to \
                     ROLLBACK"
                );
                self.election = None;
                self.topology.abandon_candidacy();
                let changed = self.topology.set_follower_mode(state);
                debug_assert!(changed);
                self.external.signal_applier_to_cancel_fetcher();
                self.cancel_and_reschedule_election_timeout();
                true
            }
            Role::Follower => {
                if !self.topology.set_follower_mode(state) {
                    return false;
                }
                self.external.signal_applier_to_cancel_fetcher();
                self.cancel_and_reschedule_election_timeout();
                self.wake_ready_waiters();
                true
            }
        }
    }

    /// Adjusts the maintenance-mode counter; the observed state follows.
    pub fn set_maintenance_mode(&mut self, enable: bool) -> Result<(), ReplSetError> {
        let result = self.topology.set_maintenance_mode(enable);
        if result.is_ok() {
            self.cancel_and_reschedule_election_timeout();
        }
        result
    }

    /// Relinquishes leadership: waits (via the returned handle) until an
    /// electable secondary has caught up, unless `force` or one already
    /// has. On success the node refuses to stand again for `stepdown_ms`.
    pub fn step_down(
        &mut self,
        op: &OpCtx,
        force: bool,
        wait_timeout_ms: u64,
        stepdown_ms: u64,
    ) -> WaitHandle {
        if self.topology.role() != Role::Leader {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::NotMaster,
                "not primary so can't step down",
            )));
        }
        if !self.external.try_acquire_global_shared(wait_timeout_ms) {
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::ExceededTimeLimit,
                "Could not acquire the global shared lock within the deadline",
            )));
        }
        let now = self.clock.now();
        if force
            || self
                .topology
                .caught_up_secondary_exists(self.tracker.my_applied())
        {
            self.external.release_global_shared();
            self.relinquish_primary(now.plus_millis(stepdown_ms));
            return WaitHandle::immediate(Ok(()));
        }
        if wait_timeout_ms == 0 {
            self.external.release_global_shared();
            return WaitHandle::immediate(Err(ReplSetError::msg(
                ErrorCode::ExceededTimeLimit,
                "No electable secondaries caught up as of the time of the \
                 stepdown command",
            )));
        }
        let deadline_event = self.events.schedule_at(
            now.plus_millis(wait_timeout_ms),
            CoordEvent::StepDownTimeout,
        );
        let (tx, handle) = WaitHandle::new_pair();
        self.stepdown = Some(StepDownState {
            op_id: op.op_id,
            stepdown_ms,
            deadline_event,
            tx,
        });
        // cancel the pending heartbeat cadence and probe the secondaries
        // right away
        self.schedule_heartbeats(now);
        self.process_ready_events();
        handle
    }

    /// Re-checks a pending stepdown's catch-up predicate.
    pub(super) fn check_stepdown_progress(&mut self) {
        if self.stepdown.is_none() {
            return;
        }
        if self.topology.role() != Role::Leader {
            // leadership was lost some other way; the goal is met
            let st = self.stepdown.take().unwrap();
            self.events.cancel(st.deadline_event);
            self.external.release_global_shared();
            let _ = st.tx.send(Ok(()));
            return;
        }
        if self
            .topology
            .caught_up_secondary_exists(self.tracker.my_applied())
        {
            let st = self.stepdown.take().unwrap();
            self.events.cancel(st.deadline_event);
            self.external.release_global_shared();
            let until = self.clock.now().plus_millis(st.stepdown_ms);
            self.relinquish_primary(until);
            let _ = st.tx.send(Ok(()));
        }
    }

    /// Fires when a pending stepdown's wait budget runs out; the node
    /// remains primary.
    pub(super) fn handle_stepdown_timeout(&mut self) {
        if let Some(st) = self.stepdown.take() {
            self.external.release_global_shared();
            let _ = st.tx.send(Err(ReplSetError::msg(
                ErrorCode::ExceededTimeLimit,
                "No electable secondaries caught up as of the stepdown \
                 deadline",
            )));
        }
    }

    /// The common stepdown tail: secondary state, refractory period, wake
    /// write waiters with `NotMaster`, re-arm timers.
    pub(super) fn relinquish_primary(&mut self, until: Date) {
        if self.topology.role() != Role::Leader {
            return;
        }
        pf_info!("stepping down from primary");
        self.topology.step_down_self(until);
        self.drain_pending = false;
        self.external.signal_applier_to_cancel_fetcher();

        // write-concern waiters resolve with NotMaster; read-concern
        // waiters keep sleeping until their predicate holds
        let now = self.clock.now();
        let freed = self.waiters.complete_where(now, |waiter| {
            match &waiter.condition {
                WaitCondition::Replication(_) => Some(Err(ReplSetError::msg(
                    ErrorCode::NotMaster,
                    "operation was interrupted by a stepdown",
                ))),
                _ => None,
            }
        });
        for event in freed {
            self.events.cancel(event);
        }

        self.cancel_and_reschedule_election_timeout();

        // the lone member of a single-node set stands again the moment
        // its refractory period ends
        let single_node = self
            .topology
            .config()
            .map_or(false, |config| config.members.len() == 1);
        if single_node && !until.is_zero() {
            if let Some(event) = self.election_event.take() {
                self.events.cancel(event);
            }
            self.election_timeout_at = until;
            self.election_event = Some(
                self.events.schedule_at(until, CoordEvent::ElectionTimeout),
            );
        }
    }
}
