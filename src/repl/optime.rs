//! Positions in the replicated log and snapshot names.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage timestamp: seconds plus an intra-second counter.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Copy,
    Clone,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Timestamp = Timestamp { secs: 0, inc: 0 };

    /// Creates from seconds and counter.
    pub const fn new(secs: u32, inc: u32) -> Self {
        Timestamp { secs, inc }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.inc)
    }
}

/// A position in the replicated log: `(timestamp, term)`, totally ordered
/// lexicographically on `(term, timestamp)`. Term 0 denotes pre-election
/// mode.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Hash, Default, Serialize, Deserialize,
)]
pub struct OpTime {
    #[serde(rename = "ts")]
    pub ts: Timestamp,

    #[serde(rename = "t")]
    pub term: i64,
}

impl OpTime {
    /// The zero position.
    pub const ZERO: OpTime = OpTime {
        ts: Timestamp::ZERO,
        term: 0,
    };

    /// Creates from a timestamp and term.
    pub const fn new(ts: Timestamp, term: i64) -> Self {
        OpTime { ts, term }
    }

    /// Shorthand for building from raw parts.
    pub const fn from_parts(secs: u32, inc: u32, term: i64) -> Self {
        OpTime::new(Timestamp::new(secs, inc), term)
    }

    /// True if this is the zero position.
    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == OpTime::ZERO
    }
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.term, self.ts).cmp(&(other.term, other.ts))
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, t{})", self.ts, self.term)
    }
}

/// Opaque storage-engine snapshot name; monotone across a run.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Copy,
    Clone,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
pub struct SnapshotName(pub u64);
