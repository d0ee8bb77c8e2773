//! Deterministic scenario-test fixture: a coordinator on a virtual
//! clock, wired to the mock network and the in-memory external state.

use std::sync::Arc;

use super::*;
use crate::net::{
    HeartbeatResponse, MockNetwork, OutboundRequest, RemoteCommand,
    ResponseBody, VoteResponse,
};
use crate::repl::external::InMemExternalState;

pub(super) struct ReplCoordTest {
    pub coord: ReplCoordinator,
    pub net: Arc<MockNetwork>,
    pub external: Arc<InMemExternalState>,
    pub clock: Clock,
}

impl ReplCoordTest {
    pub fn new_with_options(options: ReplOptions, host: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = Clock::virtual_clock();
        let net = MockNetwork::new();
        let external = Arc::new(InMemExternalState::new());
        let coord = ReplCoordinator::new(
            options,
            host.parse().unwrap(),
            clock.clone(),
            net.clone() as Arc<dyn CommandDispatcher>,
            external.clone() as Arc<dyn ExternalState>,
        );
        ReplCoordTest {
            coord,
            net,
            external,
            clock,
        }
    }

    /// Fixture for a replica-set node with the given set name.
    pub fn new(set_name: &str, host: &str) -> Self {
        Self::new_with_options(ReplOptions::for_set(set_name), host)
    }

    /// Starts the node with no local config; it stays in `Startup`.
    pub async fn start(&mut self) {
        self.coord.start_up().await.unwrap();
    }

    /// Seeds the given document as the local config and starts the node,
    /// asserting the install succeeded.
    pub async fn assert_start_success(&mut self, doc: Value) {
        self.external.set_local_config(doc);
        self.coord.start_up().await.unwrap();
        assert!(self.coord.config().is_some());
    }

    pub fn now(&self) -> Date {
        self.clock.now()
    }

    /// Runs virtual time forward to `when`, firing deferred events and
    /// delivering scheduled mock responses in order.
    pub async fn run_until(&mut self, when: Date) {
        loop {
            let next = [
                self.coord.next_event_deadline(),
                self.net.next_delivery(),
            ]
            .into_iter()
            .flatten()
            .filter(|&d| d <= when)
            .min();
            let next = match next {
                Some(next) => next,
                None => break,
            };
            self.clock.advance_to(next).unwrap();
            for (id, resp) in self.net.take_due_responses(next) {
                self.coord.handle_response(id, resp).await.unwrap();
            }
            self.coord.process_ready_events();
        }
        self.clock.advance_to(when).unwrap();
        self.coord.process_ready_events();
    }

    /// Answers one dispatched request with an ok heartbeat response in
    /// the given state, carrying an optional applied optime.
    pub async fn reply_to_heartbeat(
        &mut self,
        req: OutboundRequest,
        state: MemberState,
        optime: Option<OpTime>,
    ) {
        let args = match &req.cmd {
            RemoteCommand::Heartbeat(args) => args.clone(),
            other => panic!("not a heartbeat request: {:?}", other),
        };
        let resp = HeartbeatResponse {
            set_name: Some(args.set_name.clone()),
            state: Some(state),
            config_version: Some(args.config_version),
            op_time: optime,
            ..Default::default()
        };
        self.coord
            .handle_response(req.id, Ok(ResponseBody::Heartbeat(resp)))
            .await
            .unwrap();
    }

    /// Responds to every dispatched request: heartbeats get an ok
    /// secondary reply, vote requests are granted.
    pub async fn grant_all_requests(&mut self) {
        while let Some(req) = self.net.take_request() {
            match &req.cmd {
                RemoteCommand::Heartbeat(_) => {
                    self.reply_to_heartbeat(req, MemberState::Secondary, None)
                        .await;
                }
                RemoteCommand::RequestVotes(args) => {
                    let resp = VoteResponse {
                        term: args.term,
                        vote_granted: true,
                        reason: String::new(),
                    };
                    self.coord
                        .handle_response(req.id, Ok(ResponseBody::Votes(resp)))
                        .await
                        .unwrap();
                }
            }
        }
    }

    /// Drops every dispatched request on the floor.
    pub fn black_hole_all_requests(&mut self) {
        while let Some(req) = self.net.take_request() {
            self.net.black_hole(req);
        }
    }

    /// Drives a full successful v1 election: runs to the election
    /// timeout, grants every vote, and completes the drain.
    pub async fn simulate_successful_v1_election(&mut self) {
        let when = self.coord.election_timeout_date();
        assert!(!when.is_zero(), "election timer not armed");
        self.run_until(when).await;
        let mut rounds = 0;
        while !self.coord.member_state().is_primary() {
            rounds += 1;
            assert!(rounds < 10, "election never concluded");
            self.grant_all_requests().await;
        }
        // answer the victory heartbeat round as well
        self.coord.process_ready_events();
        self.grant_all_requests().await;
        assert!(self.coord.is_waiting_for_applier_to_drain());
        self.coord.signal_drain_complete();
        assert!(self.coord.member_state().is_primary());
    }

    /// Runs the dry-run phase of an election to completion, leaving the
    /// real vote round outstanding.
    pub async fn simulate_successful_dry_run(&mut self) {
        let when = self.coord.election_timeout_date();
        assert!(!when.is_zero(), "election timer not armed");
        self.run_until(when).await;
        let mut votes = Vec::new();
        while let Some(req) = self.net.take_request() {
            match &req.cmd {
                RemoteCommand::RequestVotes(args) if args.dry_run => {
                    votes.push((req.id, args.term));
                }
                _ => self.net.black_hole(req),
            }
        }
        for (id, term) in votes {
            let resp = VoteResponse {
                term,
                vote_granted: true,
                reason: String::new(),
            };
            self.coord
                .handle_response(id, Ok(ResponseBody::Votes(resp)))
                .await
                .unwrap();
        }
    }

    /// Brings a single-node set to primary.
    pub async fn run_single_node_election(&mut self) {
        let when = self.coord.election_timeout_date();
        assert!(!when.is_zero(), "election timer not armed");
        self.run_until(when).await;
        assert!(self.coord.member_state().is_primary());
        self.coord.signal_drain_complete();
    }
}
