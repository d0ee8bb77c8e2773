//! `ReplCoordinator` -- heartbeat send/receive scheduling, the election
//! timer, and liveness timeouts.

use super::*;
use crate::net::{
    HeartbeatArgs, HeartbeatResponse, OutboundRequest, RemoteCommand,
    ResponseBody,
};
use crate::repl::topology::ResponseActionKind;

use rand::prelude::*;

// ReplCoordinator heartbeat handling
impl ReplCoordinator {
    /// Cancels any scheduled heartbeats and schedules a round to every
    /// remote member at `when`.
    pub(super) fn schedule_heartbeats(&mut self, when: Date) {
        for (_, event) in self.hb_events.drain() {
            self.events.cancel(event);
        }
        let (member_count, self_index) = match self.topology.config() {
            Some(config) => (config.members.len(), self.topology.self_index()),
            None => return,
        };
        for member_index in 0..member_count {
            if Some(member_index) == self_index {
                continue;
            }
            let event = self
                .events
                .schedule_at(when, CoordEvent::Heartbeat { member_index });
            self.hb_events.insert(member_index, event);
        }
    }

    /// Fires one scheduled heartbeat: prepares the request and hands it
    /// to the dispatcher.
    pub(super) fn handle_heartbeat_event(&mut self, member_index: usize) {
        self.hb_events.remove(&member_index);
        let target = match self.topology.config() {
            Some(config)
                if member_index < config.members.len()
                    && Some(member_index) != self.topology.self_index() =>
            {
                config.members[member_index].host.clone()
            }
            _ => return,
        };
        let now = self.clock.now();
        let args = self.topology.prepare_heartbeat_request(
            now,
            member_index,
            &self.self_host,
        );
        let id = self.next_request_id();
        self.outstanding
            .insert(id, PendingKind::Heartbeat { member_index });
        pf_trace!("sending heartbeat {} to {}", id, target);
        self.net.dispatch(OutboundRequest {
            id,
            target,
            cmd: RemoteCommand::Heartbeat(args),
        });
    }

    /// Digests one heartbeat response: updates topology and progress
    /// state, applies the resulting action, and schedules the next round.
    pub(super) async fn handle_heartbeat_response(
        &mut self,
        member_index: usize,
        resp: RemoteResponse,
    ) -> Result<(), ReplSetError> {
        if self.topology.config().is_none() || member_index >= self.tracker.len()
        {
            return Ok(());
        }
        let now = self.clock.now();

        let hb: Result<&HeartbeatResponse, &ReplSetError> = match &resp {
            Ok(ResponseBody::Heartbeat(hb)) => Ok(hb),
            Ok(_) => {
                pf_warn!("unexpected response body to a heartbeat request");
                return Ok(());
            }
            Err(e) => Err(e),
        };

        let action =
            self.topology.process_heartbeat_response(now, member_index, hb);

        if let Ok(hb) = hb {
            self.refresh_member_liveness(member_index);
            if let Some(optime) = hb.op_time {
                if self.tracker.advance_applied(member_index, optime) {
                    self.advance_commit_point();
                    self.wake_ready_waiters();
                }
            }
            if let Some(term) = hb.term {
                if term > self.topology.term() {
                    self.update_term_and_maybe_step_down(term);
                }
            }
            if hb.state == Some(MemberState::Primary)
                && hb.term.unwrap_or(self.topology.term())
                    >= self.topology.term()
            {
                // a live primary defers our own candidacy by one period
                self.cancel_and_reschedule_election_timeout();
            }
        }

        if let Some(old) = self.hb_events.remove(&member_index) {
            self.events.cancel(old);
        }
        let event = self.events.schedule_at(
            action.next_heartbeat,
            CoordEvent::Heartbeat { member_index },
        );
        self.hb_events.insert(member_index, event);

        match action.kind {
            ResponseActionKind::None => {}
            ResponseActionKind::Reconfig(config) => {
                self.install_config_from_heartbeat(config).await
            }
            ResponseActionKind::StepDownSelf => {
                self.relinquish_primary(Date::ZERO)
            }
        }

        // a pending stepdown re-checks its catch-up predicate on every
        // heartbeat reply
        self.check_stepdown_progress();
        Ok(())
    }

    /// Handles an inbound heartbeat request from a peer.
    pub fn process_heartbeat(
        &mut self,
        args: &HeartbeatArgs,
    ) -> Result<HeartbeatResponse, ReplSetError> {
        if self.mode != ReplicationMode::ReplSet {
            return Err(ReplSetError::msg(
                ErrorCode::NoReplicationEnabled,
                "not running with --replSet",
            ));
        }
        let now = self.clock.now();
        let my_applied = self.tracker.my_applied();
        let resp =
            self.topology.prepare_heartbeat_response(now, args, my_applied)?;

        let sender_index = self
            .topology
            .config()
            .and_then(|config| config.member_index_by_id(args.sender_id));
        if let Some(idx) = sender_index {
            if Some(idx) != self.topology.self_index() {
                self.refresh_member_liveness(idx);
            }
        }

        // hearing a heartbeat is evidence of a live primary somewhere;
        // electable secondaries push their election timer out
        self.cancel_and_reschedule_election_timeout();
        Ok(resp)
    }

    /// Clears the election timer, then re-arms it one period (plus
    /// jitter) out -- but only for an electable secondary under protocol
    /// version 1. In every other state the timer stays at the zero date.
    pub fn cancel_and_reschedule_election_timeout(&mut self) {
        if let Some(event) = self.election_event.take() {
            self.events.cancel(event);
        }
        self.election_timeout_at = Date::ZERO;

        let (protocol_version, electable) =
            match (self.topology.config(), self.topology.self_index()) {
                (Some(config), Some(self_index)) => (
                    config.protocol_version,
                    config.members[self_index].is_electable(),
                ),
                _ => return,
            };
        if protocol_version != 1 || !electable {
            return;
        }
        if !self.topology.member_state().is_secondary() {
            return;
        }

        let period_ms = self.topology.config().unwrap().election_timeout_ms();
        let jitter = thread_rng().gen_range(0..=period_ms / 10);
        let when = self.clock.now().plus_millis(period_ms + jitter);
        self.election_timeout_at = when;
        self.election_event =
            Some(self.events.schedule_at(when, CoordEvent::ElectionTimeout));
    }

    /// Fires when a member's liveness lease runs out. A primary that can
    /// no longer see a majority of voters relinquishes leadership.
    pub(super) fn handle_liveness_timeout(&mut self, member_index: usize) {
        self.liveness_events.remove(&member_index);
        let timeout_ms = match self.topology.config() {
            Some(config) => config.election_timeout_ms(),
            None => return,
        };
        if member_index >= self.tracker.len() {
            return;
        }
        let now = self.clock.now();
        if !self.tracker.mark_down_if_stale(member_index, now, timeout_ms) {
            // refreshed since this event was armed; re-arm for the
            // remaining lease
            let entry = self.tracker.entry(member_index);
            if entry.up && !entry.is_self {
                let when = entry.last_update.plus_millis(timeout_ms);
                let event = self.events.schedule_at(
                    when,
                    CoordEvent::LivenessTimeout { member_index },
                );
                self.liveness_events.insert(member_index, event);
            }
            return;
        }
        pf_info!(
            "member {} is now in state DOWN (no liveness updates within {} ms)",
            member_index,
            timeout_ms
        );

        if self.topology.role() == Role::Leader {
            let (live, majority) = {
                let config = self.topology.config().unwrap();
                (
                    self.tracker.count_live_voters(config),
                    config.majority_vote_count(),
                )
            };
            if live < majority {
                pf_info!(
                    "can't see a majority of the set, relinquishing primary"
                );
                self.relinquish_primary(Date::ZERO);
            }
        }
    }
}
