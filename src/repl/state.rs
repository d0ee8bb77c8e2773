//! Member states of a replica-set node.

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of one replica-set member, as observed locally or reported over
/// heartbeats.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize,
)]
pub enum MemberState {
    /// Fresh node, no config installed yet.
    Startup,

    /// Config installed, initial sync not finished.
    Startup2,

    /// Replicating, eligible to stand for election.
    Secondary,

    /// Not accepting reads; also the observed state under maintenance mode.
    Recovering,

    /// Truncating a divergent log tail.
    Rollback,

    /// Leader of the set.
    Primary,

    /// Voting-only member with no data.
    Arbiter,

    /// Unreachable.
    Down,

    /// No longer listed in the config.
    Removed,

    /// State not yet known.
    Unknown,
}

impl MemberState {
    #[inline]
    pub fn is_primary(&self) -> bool {
        *self == MemberState::Primary
    }

    #[inline]
    pub fn is_secondary(&self) -> bool {
        *self == MemberState::Secondary
    }

    #[inline]
    pub fn is_recovering(&self) -> bool {
        *self == MemberState::Recovering
    }

    #[inline]
    pub fn is_rollback(&self) -> bool {
        *self == MemberState::Rollback
    }

    /// True for the states a `setFollowerMode` call may name.
    pub fn is_follower_mode(&self) -> bool {
        matches!(
            self,
            MemberState::Startup2
                | MemberState::Secondary
                | MemberState::Recovering
                | MemberState::Rollback
        )
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Startup2 => "STARTUP2",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Primary => "PRIMARY",
            MemberState::Arbiter => "ARBITER",
            MemberState::Down => "DOWN",
            MemberState::Removed => "REMOVED",
            MemberState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    #[test]
    fn follower_modes() {
        assert!(MemberState::Secondary.is_follower_mode());
        assert!(MemberState::Rollback.is_follower_mode());
        assert!(MemberState::Recovering.is_follower_mode());
        assert!(MemberState::Startup2.is_follower_mode());
        assert!(!MemberState::Primary.is_follower_mode());
        assert!(!MemberState::Startup.is_follower_mode());
        assert!(!MemberState::Removed.is_follower_mode());
    }

    #[test]
    fn state_display() {
        assert_eq!(format!("{}", MemberState::Secondary), "SECONDARY");
        assert_eq!(format!("{}", MemberState::Primary), "PRIMARY");
    }
}
