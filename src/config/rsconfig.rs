//! Parsed, validated replica-set configuration document.

use std::collections::{HashMap, HashSet};

use crate::config::member::{HostAndPort, MemberConfig, MemberId};
use crate::utils::{ErrorCode, ReplSetError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default election timeout when the config document carries none.
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 10000;

/// Default heartbeat interval when the config document carries none.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2000;

/// A named write-concern mode: tag key -> required number of distinct
/// values of that tag among acknowledging members.
pub type TagMode = HashMap<String, usize>;

/// Tunable settings block of a replica-set config.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ReplSetSettings {
    /// Time without a heartbeat from a primary before standing for election.
    #[serde(
        rename = "electionTimeoutMillis",
        default = "default_election_timeout"
    )]
    pub election_timeout_millis: u64,

    /// Interval between heartbeats to each remote member.
    #[serde(
        rename = "heartbeatIntervalMillis",
        default = "default_heartbeat_interval"
    )]
    pub heartbeat_interval_millis: u64,

    /// Named write-concern modes.
    #[serde(rename = "getLastErrorModes", default)]
    pub get_last_error_modes: HashMap<String, TagMode>,
}

fn default_election_timeout() -> u64 {
    DEFAULT_ELECTION_TIMEOUT_MS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

impl Default for ReplSetSettings {
    fn default() -> Self {
        ReplSetSettings {
            election_timeout_millis: DEFAULT_ELECTION_TIMEOUT_MS,
            heartbeat_interval_millis: DEFAULT_HEARTBEAT_INTERVAL_MS,
            get_last_error_modes: HashMap::new(),
        }
    }
}

/// A parsed, validated replica-set configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ReplicaSetConfig {
    /// Replica set name.
    #[serde(rename = "_id")]
    pub name: String,

    /// Config version; replaced configs must carry a larger one.
    pub version: i64,

    /// Consensus protocol version, 0 or 1.
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: i64,

    /// Member entries.
    pub members: Vec<MemberConfig>,

    /// Settings block.
    #[serde(default)]
    pub settings: ReplSetSettings,
}

// document field extraction helpers with client-facing diagnostics
fn req_field<'a>(doc: &'a Value, name: &str) -> Result<&'a Value, ReplSetError> {
    doc.get(name).ok_or_else(|| {
        ReplSetError(
            ErrorCode::InvalidReplicaSetConfig,
            format!("Missing expected field \"{}\"", name),
        )
    })
}

fn field_str<'a>(doc: &'a Value, name: &str) -> Result<&'a str, ReplSetError> {
    req_field(doc, name)?.as_str().ok_or_else(|| {
        ReplSetError(
            ErrorCode::InvalidReplicaSetConfig,
            format!("Expected field \"{}\" to be a string", name),
        )
    })
}

fn field_i64(doc: &Value, name: &str) -> Result<i64, ReplSetError> {
    req_field(doc, name)?.as_i64().ok_or_else(|| {
        ReplSetError(
            ErrorCode::InvalidReplicaSetConfig,
            format!("Expected field \"{}\" to be a number", name),
        )
    })
}

fn opt_i64(doc: &Value, name: &str) -> Result<Option<i64>, ReplSetError> {
    match doc.get(name) {
        None => Ok(None),
        Some(v) => Ok(Some(v.as_i64().ok_or_else(|| {
            ReplSetError(
                ErrorCode::InvalidReplicaSetConfig,
                format!("Expected field \"{}\" to be a number", name),
            )
        })?)),
    }
}

fn opt_bool(doc: &Value, name: &str) -> Result<Option<bool>, ReplSetError> {
    match doc.get(name) {
        None => Ok(None),
        Some(v) => Ok(Some(v.as_bool().ok_or_else(|| {
            ReplSetError(
                ErrorCode::InvalidReplicaSetConfig,
                format!("Expected field \"{}\" to be a boolean", name),
            )
        })?)),
    }
}

fn invalid(m: String) -> ReplSetError {
    ReplSetError(ErrorCode::InvalidReplicaSetConfig, m)
}

impl MemberConfig {
    /// Parses one member entry from a config document.
    pub fn from_doc(doc: &Value) -> Result<MemberConfig, ReplSetError> {
        let id = field_i64(doc, "_id")?;
        let host: HostAndPort = field_str(doc, "host")?
            .parse()
            .map_err(|e: ReplSetError| invalid(e.1))?;
        let arbiter_only = opt_bool(doc, "arbiterOnly")?.unwrap_or(false);
        let hidden = opt_bool(doc, "hidden")?.unwrap_or(false);
        let build_indexes = opt_bool(doc, "buildIndexes")?.unwrap_or(true);
        let votes = match opt_i64(doc, "votes")? {
            Some(v) if (0..=1).contains(&v) => v as u32,
            Some(v) => {
                return Err(invalid(format!(
                    "votes field value of member {} must be either 0 or 1, got {}",
                    id, v
                )));
            }
            None => 1,
        };
        // arbiters that do not name a priority get the only legal one
        let priority = match opt_i64(doc, "priority")? {
            Some(p) if p >= 0 => p as u32,
            Some(p) => {
                return Err(invalid(format!(
                    "priority field value of member {} must be 0 or greater, got {}",
                    id, p
                )));
            }
            None if arbiter_only => 0,
            None => 1,
        };
        let slave_delay_secs = match opt_i64(doc, "slaveDelay")? {
            Some(d) if d >= 0 => d as u64,
            Some(d) => {
                return Err(invalid(format!(
                    "slaveDelay field value of member {} must be 0 or greater, got {}",
                    id, d
                )));
            }
            None => 0,
        };
        let mut tags = HashMap::new();
        if let Some(tags_doc) = doc.get("tags") {
            let table = tags_doc.as_object().ok_or_else(|| {
                invalid("Expected field \"tags\" to be an object".into())
            })?;
            for (key, val) in table {
                let val = val.as_str().ok_or_else(|| {
                    invalid(format!("Expected tag \"{}\" to be a string", key))
                })?;
                tags.insert(key.clone(), val.to_string());
            }
        }

        let member = MemberConfig {
            id,
            host,
            priority,
            votes,
            arbiter_only,
            hidden,
            build_indexes,
            slave_delay_secs,
            tags,
        };
        member.validate()?;
        Ok(member)
    }
}

impl ReplicaSetConfig {
    /// Parses and validates a full replica-set config document.
    pub fn from_doc(doc: &Value) -> Result<ReplicaSetConfig, ReplSetError> {
        let name = field_str(doc, "_id")?.to_string();
        let version = field_i64(doc, "version")?;
        let protocol_version = opt_i64(doc, "protocolVersion")?.unwrap_or(0);

        let members_doc = req_field(doc, "members")?.as_array().ok_or_else(|| {
            invalid("Expected field \"members\" to be an array".into())
        })?;
        let mut members = Vec::with_capacity(members_doc.len());
        for member_doc in members_doc {
            members.push(MemberConfig::from_doc(member_doc)?);
        }

        let settings = match doc.get("settings") {
            None => ReplSetSettings::default(),
            Some(settings_doc) => serde_json::from_value(settings_doc.clone())
                .map_err(|e| invalid(format!("invalid settings block: {}", e)))?,
        };

        let config = ReplicaSetConfig {
            name,
            version,
            protocol_version,
            members,
            settings,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the config-wide invariants, returning a diagnostic on the
    /// first violation.
    pub fn validate(&self) -> Result<(), ReplSetError> {
        if self.version < 1 {
            return Err(invalid(format!(
                "version field value of {} is out of range",
                self.version
            )));
        }
        if self.protocol_version != 0 && self.protocol_version != 1 {
            return Err(invalid(format!(
                "protocolVersion field value of {} is not 0 or 1",
                self.protocol_version
            )));
        }
        if self.members.is_empty() {
            return Err(invalid(
                "Replica set configuration must contain at least one member".into(),
            ));
        }

        let mut ids = HashSet::new();
        let mut hosts = HashSet::new();
        for member in &self.members {
            if !ids.insert(member.id) {
                return Err(invalid(format!(
                    "found two member configurations with same _id field, {}",
                    member.id
                )));
            }
            if !hosts.insert(member.host.clone()) {
                return Err(invalid(format!(
                    "found two member configurations with same host field, {}",
                    member.host
                )));
            }
            member.validate()?;
        }

        if !self.members.iter().any(|m| m.is_electable()) {
            return Err(invalid(
                "Replica set configuration must contain at least one \
                 non-arbiter member with priority > 0"
                    .into(),
            ));
        }

        for (mode_name, mode) in &self.settings.get_last_error_modes {
            for (tag_key, &required) in mode {
                if required == 0 {
                    return Err(invalid(format!(
                        "getLastErrorMode \"{}\" requires a positive count \
                         for tag \"{}\"",
                        mode_name, tag_key
                    )));
                }
                let available = self.distinct_tag_values(tag_key);
                if required > available {
                    return Err(invalid(format!(
                        "getLastErrorMode \"{}\" requires {} distinct values \
                         of tag \"{}\", but only {} exist",
                        mode_name, required, tag_key, available
                    )));
                }
            }
        }

        Ok(())
    }

    /// Index of the member with the given network name, if any.
    pub fn find_member_index(&self, host: &HostAndPort) -> Option<usize> {
        self.members.iter().position(|m| &m.host == host)
    }

    /// Index of the member with the given member ID, if any.
    pub fn member_index_by_id(&self, id: MemberId) -> Option<usize> {
        self.members.iter().position(|m| m.id == id)
    }

    /// Total votes castable in this config.
    pub fn total_votes(&self) -> usize {
        self.members.iter().map(|m| m.votes as usize).sum()
    }

    /// Strict majority of the voting members.
    pub fn majority_vote_count(&self) -> usize {
        self.total_votes() / 2 + 1
    }

    /// Looks up a named write-concern mode.
    pub fn get_mode(&self, name: &str) -> Option<&TagMode> {
        self.settings.get_last_error_modes.get(name)
    }

    /// Number of distinct values of the given tag key across all members.
    pub fn distinct_tag_values(&self, tag_key: &str) -> usize {
        self.members
            .iter()
            .filter_map(|m| m.tags.get(tag_key))
            .collect::<HashSet<_>>()
            .len()
    }

    /// True if the given tag mode can possibly be satisfied by this config.
    pub fn mode_feasible(&self, mode: &TagMode) -> bool {
        mode.iter()
            .all(|(key, &required)| self.distinct_tag_values(key) >= required)
    }

    /// Configured election timeout in milliseconds.
    #[inline]
    pub fn election_timeout_ms(&self) -> u64 {
        self.settings.election_timeout_millis
    }

    /// Configured heartbeat interval in milliseconds.
    #[inline]
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.settings.heartbeat_interval_millis
    }
}
