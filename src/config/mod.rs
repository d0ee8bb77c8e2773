//! Replica-set configuration model: members, tags, modes, timings.

mod member;
mod rsconfig;

pub use member::{HostAndPort, MemberConfig, MemberId, DEFAULT_PORT};
pub use rsconfig::{
    ReplSetSettings, ReplicaSetConfig, TagMode, DEFAULT_ELECTION_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS,
};
