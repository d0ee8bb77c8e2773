//! Per-member configuration entry of a replica-set config document.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::{ErrorCode, ReplSetError};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Member ID type: a small integer unique within one config document.
pub type MemberId = i64;

/// Default port assumed when a host string carries none.
pub const DEFAULT_PORT: u16 = 27017;

/// A network name for a member node.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    /// Creates from explicit parts.
    pub fn new(host: impl ToString, port: u16) -> Self {
        HostAndPort {
            host: host.to_string(),
            port,
        }
    }
}

impl FromStr for HostAndPort {
    type Err = ReplSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ReplSetError(
                ErrorCode::BadValue,
                "empty host field".into(),
            ));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ReplSetError(
                        ErrorCode::BadValue,
                        format!("invalid port in host string '{}'", s),
                    )
                })?;
                Ok(HostAndPort::new(host, port))
            }
            None => Ok(HostAndPort::new(s, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// Serialized as the "host:port" string on the wire and in config documents.
impl Serialize for HostAndPort {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HostAndPort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|e: ReplSetError| D::Error::custom(e.1))
    }
}

/// One member entry of a replica-set configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Member ID, unique within the config.
    #[serde(rename = "_id")]
    pub id: MemberId,

    /// Network name of the member.
    pub host: HostAndPort,

    /// Election priority; 0 means never stands for election.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Number of votes this member casts in elections (0 or 1).
    #[serde(default = "default_votes")]
    pub votes: u32,

    /// True if this member is a voting-only arbiter bearing no data.
    #[serde(rename = "arbiterOnly", default)]
    pub arbiter_only: bool,

    /// True if this member is hidden from client host lists.
    #[serde(default)]
    pub hidden: bool,

    /// Whether this member builds indexes.
    #[serde(rename = "buildIndexes", default = "default_build_indexes")]
    pub build_indexes: bool,

    /// Intentional apply lag, in seconds.
    #[serde(rename = "slaveDelay", default)]
    pub slave_delay_secs: u64,

    /// Tag key -> value pairs for named write-concern modes.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

fn default_priority() -> u32 {
    1
}

fn default_votes() -> u32 {
    1
}

fn default_build_indexes() -> bool {
    true
}

impl MemberConfig {
    /// True if this member casts a vote in elections.
    #[inline]
    pub fn is_voter(&self) -> bool {
        self.votes > 0
    }

    /// True if this member may stand for election.
    #[inline]
    pub fn is_electable(&self) -> bool {
        !self.arbiter_only && self.priority > 0
    }

    /// Checks the per-member invariants, returning a diagnostic on the
    /// first violation.
    pub fn validate(&self) -> Result<(), ReplSetError> {
        let invalid = |m: String| {
            Err(ReplSetError(ErrorCode::InvalidReplicaSetConfig, m))
        };
        if self.votes > 1 {
            return invalid(format!(
                "votes field value of member {} must be either 0 or 1",
                self.id
            ));
        }
        if self.arbiter_only && self.votes == 0 {
            return invalid(format!(
                "arbiter member {} must vote (cannot have votes:0)",
                self.id
            ));
        }
        if self.arbiter_only && self.priority != 0 {
            return invalid(format!(
                "priority must be 0 when arbiterOnly=true for member {}",
                self.id
            ));
        }
        if self.hidden && self.priority != 0 {
            return invalid(format!(
                "priority must be 0 when hidden=true for member {}",
                self.id
            ));
        }
        if self.votes == 0 && self.priority != 0 {
            return invalid(format!(
                "priority must be 0 when non-voting (votes:0) for member {}",
                self.id
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod member_tests {
    use super::*;

    #[test]
    fn host_and_port_parsing() -> Result<(), ReplSetError> {
        let hp: HostAndPort = "node1:12345".parse()?;
        assert_eq!(hp, HostAndPort::new("node1", 12345));
        let hp: HostAndPort = "h2".parse()?;
        assert_eq!(hp, HostAndPort::new("h2", DEFAULT_PORT));
        assert!("".parse::<HostAndPort>().is_err());
        assert!("node1:badport".parse::<HostAndPort>().is_err());
        assert_eq!(format!("{}", HostAndPort::new("h", 42)), "h:42");
        Ok(())
    }

    fn plain_member(id: MemberId) -> MemberConfig {
        MemberConfig {
            id,
            host: HostAndPort::new("node", 12345),
            priority: 1,
            votes: 1,
            arbiter_only: false,
            hidden: false,
            build_indexes: true,
            slave_delay_secs: 0,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn member_invariants() {
        assert!(plain_member(0).validate().is_ok());

        let mut hidden = plain_member(1);
        hidden.hidden = true;
        assert!(hidden
            .validate()
            .unwrap_err()
            .reason()
            .contains("priority must be 0 when hidden=true"));
        hidden.priority = 0;
        assert!(hidden.validate().is_ok());

        let mut nonvoter = plain_member(2);
        nonvoter.votes = 0;
        assert!(nonvoter
            .validate()
            .unwrap_err()
            .reason()
            .contains("priority must be 0 when non-voting (votes:0)"));

        let mut arbiter = plain_member(3);
        arbiter.arbiter_only = true;
        arbiter.priority = 0;
        assert!(arbiter.validate().is_ok());
        assert!(arbiter.is_voter());
        assert!(!arbiter.is_electable());
        arbiter.votes = 0;
        assert!(arbiter.validate().is_err());
    }
}
