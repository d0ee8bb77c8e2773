//! The replication coordination subsystem: the per-node coordinator
//! façade, the pure topology decision engine it drives, and the
//! progress/snapshot/waiter bookkeeping in between.

mod coordinator;
mod external;
mod optime;
mod snapshots;
mod state;
mod topology;
mod tracker;
mod waiters;

pub use coordinator::{
    OpCtx, ReadWaitHandle, ReplCoordinator, ReplOptions, ReplicationMode,
};
pub use external::{ExternalState, InMemExternalState};
pub use optime::{OpTime, SnapshotName, Timestamp};
pub use snapshots::SnapshotTracker;
pub use state::MemberState;
pub use topology::{
    HeartbeatResponseAction, MemberHeartbeatData, ResponseActionKind, Role,
    TopologyCoordinator,
};
pub use tracker::{MemberProgress, OpTimeTracker};
pub use waiters::{
    ReadConcernArgs, ReadConcernLevel, WTimeout, WValue, WaitCondition,
    WaitHandle, Waiter, WaiterRegistry, WriteConcern, MAJORITY_MODE,
};
