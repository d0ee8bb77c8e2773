//! Public interface to the replset core library: the per-node replication
//! coordinator of a replica-set cluster, together with the pure topology
//! decision engine it drives.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

pub mod config;
pub mod net;
pub mod repl;
pub mod sched;

pub use config::{HostAndPort, MemberConfig, MemberId, ReplicaSetConfig};
pub use repl::{
    ExternalState, MemberState, OpCtx, OpTime, ReadConcernArgs,
    ReadConcernLevel, ReplCoordinator, ReplOptions, ReplicationMode,
    SnapshotName, Timestamp, WTimeout, WriteConcern,
};
pub use utils::{ErrorCode, ReplSetError};
