//! Wire payloads exchanged between replica-set members: heartbeats, vote
//! requests, position updates, and the replica-set metadata block piggied
//! onto command replies.

use std::collections::HashMap;

use crate::config::{HostAndPort, MemberId, ReplicaSetConfig};
use crate::repl::{MemberState, OpTime, Timestamp};
use crate::utils::{ErrorCode, ReplSetError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Heartbeat command payload (protocol v1).
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct HeartbeatArgs {
    pub set_name: String,
    pub protocol_version: i64,
    pub config_version: i64,
    pub sender_host: HostAndPort,
    pub sender_id: MemberId,
    #[serde(default)]
    pub check_empty: bool,
}

impl HeartbeatArgs {
    /// Renders the on-the-wire command document.
    pub fn to_doc(&self) -> Value {
        let mut doc = json!({
            "replSetHeartbeat": self.set_name,
            "protocolVersion": self.protocol_version,
            "configVersion": self.config_version,
            "senderHost": self.sender_host.to_string(),
            "senderId": self.sender_id,
        });
        if self.check_empty {
            doc["checkEmpty"] = Value::Bool(true);
        }
        doc
    }
}

/// Heartbeat command response.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub set_name: Option<String>,
    pub state: Option<MemberState>,
    pub term: Option<i64>,
    pub config_version: Option<i64>,
    pub op_time: Option<OpTime>,
    pub election_time: Option<Timestamp>,
    /// Included when the sender's config version trails the responder's.
    pub config: Option<ReplicaSetConfig>,
    pub syncing_to: Option<HostAndPort>,
}

/// Vote request payload of the election path (dry-run and real).
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct VoteRequestArgs {
    pub set_name: String,
    pub dry_run: bool,
    pub term: i64,
    pub candidate_id: MemberId,
    pub config_version: i64,
    pub last_applied: OpTime,
}

/// Vote request response.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: i64,
    pub vote_granted: bool,
    pub reason: String,
}

/// One entry of a `replSetUpdatePosition` command.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct UpdatePositionEntry {
    #[serde(rename = "cfgver")]
    pub config_version: i64,

    #[serde(rename = "memberId")]
    pub member_id: MemberId,

    #[serde(rename = "optime")]
    pub op_time: OpTime,
}

/// Parsed `replSetUpdatePosition` command payload.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePositionArgs {
    pub entries: Vec<UpdatePositionEntry>,
}

// Accepts an optime field either as a full `{ts, t}` object or as a bare
// timestamp (pre-election senders), which reads as term 0.
fn optime_from_doc(v: &Value) -> Result<OpTime, ReplSetError> {
    if let (Some(ts), Some(t)) = (v.get("ts"), v.get("t").and_then(Value::as_i64))
    {
        let ts: Timestamp = serde_json::from_value(ts.clone())?;
        return Ok(OpTime::new(ts, t));
    }
    let ts: Timestamp = serde_json::from_value(v.clone())?;
    Ok(OpTime::new(ts, 0))
}

impl UpdatePositionArgs {
    /// Parses the command document.
    pub fn from_doc(doc: &Value) -> Result<UpdatePositionArgs, ReplSetError> {
        if doc.get("replSetUpdatePosition").is_none() {
            return logged_err!(
                ErrorCode::BadValue;
                "Missing expected field \"replSetUpdatePosition\""
            );
        }
        let optimes = doc
            .get("optimes")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ReplSetError(
                    ErrorCode::BadValue,
                    "Missing expected field \"optimes\"".into(),
                )
            })?;
        let mut entries = Vec::with_capacity(optimes.len());
        for entry in optimes {
            let config_version =
                entry.get("cfgver").and_then(Value::as_i64).ok_or_else(|| {
                    ReplSetError(
                        ErrorCode::BadValue,
                        "Missing expected field \"cfgver\"".into(),
                    )
                })?;
            let member_id =
                entry.get("memberId").and_then(Value::as_i64).ok_or_else(
                    || {
                        ReplSetError(
                            ErrorCode::BadValue,
                            "Missing expected field \"memberId\"".into(),
                        )
                    },
                )?;
            let op_time = optime_from_doc(entry.get("optime").ok_or_else(
                || {
                    ReplSetError(
                        ErrorCode::BadValue,
                        "Missing expected field \"optime\"".into(),
                    )
                },
            )?)?;
            entries.push(UpdatePositionEntry {
                config_version,
                member_id,
                op_time,
            });
        }
        Ok(UpdatePositionArgs { entries })
    }

    /// Renders the on-the-wire command document.
    pub fn to_doc(&self) -> Value {
        json!({
            "replSetUpdatePosition": 1,
            "optimes": self
                .entries
                .iter()
                .map(|e| {
                    json!({
                        "memberId": e.member_id,
                        "optime": { "ts": e.op_time.ts, "t": e.op_time.term },
                        "cfgver": e.config_version,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

/// Replica-set metadata block attachable to any command reply.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ReplSetMetadata {
    pub last_op_committed: OpTime,
    pub last_op_visible: OpTime,
    pub config_version: i64,
    pub primary_index: i64,
    pub term: i64,
    pub sync_source_index: i64,
}

/// Field name under which the metadata block travels.
pub const REPL_METADATA_FIELD: &str = "$replData";

impl ReplSetMetadata {
    /// Reads the metadata block out of a command reply document.
    pub fn from_metadata_doc(doc: &Value) -> Result<ReplSetMetadata, ReplSetError> {
        let body = doc.get(REPL_METADATA_FIELD).ok_or_else(|| {
            ReplSetError(
                ErrorCode::BadValue,
                format!("Missing expected field \"{}\"", REPL_METADATA_FIELD),
            )
        })?;
        let field = |name: &str| -> Result<i64, ReplSetError> {
            body.get(name).and_then(Value::as_i64).ok_or_else(|| {
                ReplSetError(
                    ErrorCode::BadValue,
                    format!("Missing expected field \"{}\"", name),
                )
            })
        };
        Ok(ReplSetMetadata {
            last_op_committed: optime_from_doc(
                body.get("lastOpCommitted").ok_or_else(|| {
                    ReplSetError(
                        ErrorCode::BadValue,
                        "Missing expected field \"lastOpCommitted\"".into(),
                    )
                })?,
            )?,
            last_op_visible: optime_from_doc(
                body.get("lastOpVisible").ok_or_else(|| {
                    ReplSetError(
                        ErrorCode::BadValue,
                        "Missing expected field \"lastOpVisible\"".into(),
                    )
                })?,
            )?,
            config_version: field("configVersion")?,
            primary_index: field("primaryIndex")?,
            term: field("term")?,
            sync_source_index: field("syncSourceIndex")?,
        })
    }

    /// Renders the metadata block for attachment to a reply document.
    pub fn to_metadata_doc(&self) -> Value {
        json!({
            REPL_METADATA_FIELD: {
                "lastOpCommitted": {
                    "ts": self.last_op_committed.ts,
                    "t": self.last_op_committed.term,
                },
                "lastOpVisible": {
                    "ts": self.last_op_visible.ts,
                    "t": self.last_op_visible.term,
                },
                "configVersion": self.config_version,
                "primaryIndex": self.primary_index,
                "term": self.term,
                "syncSourceIndex": self.sync_source_index,
            }
        })
    }
}

/// The `isMaster` reply a node builds for clients.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct IsMasterResponse {
    pub is_master: bool,
    pub secondary: bool,
    /// True only when no valid config is installed.
    pub is_replica_set: bool,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    pub hosts: Vec<HostAndPort>,
    pub passives: Vec<HostAndPort>,
    pub arbiters: Vec<HostAndPort>,
    pub primary: Option<HostAndPort>,
    pub me: Option<HostAndPort>,
    pub arbiter_only: bool,
    pub passive: bool,
    pub hidden: bool,
    pub build_indexes: bool,
    pub slave_delay_secs: u64,
    pub tags: HashMap<String, String>,
    /// Diagnostic string present only when no valid config is installed.
    pub info: Option<String>,
}

impl IsMasterResponse {
    /// Renders the client-facing reply document.
    pub fn to_doc(&self) -> Value {
        let mut doc = json!({
            "ismaster": self.is_master,
            "secondary": self.secondary,
        });
        if self.is_replica_set {
            doc["isreplicaset"] = Value::Bool(true);
        }
        if let Some(name) = &self.set_name {
            doc["setName"] = json!(name);
        }
        if let Some(version) = self.set_version {
            doc["setVersion"] = json!(version);
        }
        if !self.hosts.is_empty() {
            doc["hosts"] = json!(self.hosts);
        }
        if !self.passives.is_empty() {
            doc["passives"] = json!(self.passives);
        }
        if !self.arbiters.is_empty() {
            doc["arbiters"] = json!(self.arbiters);
        }
        if let Some(primary) = &self.primary {
            doc["primary"] = json!(primary);
        }
        if let Some(me) = &self.me {
            doc["me"] = json!(me);
        }
        if self.arbiter_only {
            doc["arbiterOnly"] = Value::Bool(true);
        }
        if self.passive {
            doc["passive"] = Value::Bool(true);
        }
        if self.hidden {
            doc["hidden"] = Value::Bool(true);
        }
        if !self.build_indexes {
            doc["buildIndexes"] = Value::Bool(false);
        }
        if self.slave_delay_secs > 0 {
            doc["slaveDelay"] = json!(self.slave_delay_secs);
        }
        if !self.tags.is_empty() {
            doc["tags"] = json!(self.tags);
        }
        if let Some(info) = &self.info {
            doc["info"] = json!(info);
        }
        doc
    }
}

/// Outbound remote command payloads the coordinator emits.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum RemoteCommand {
    Heartbeat(HeartbeatArgs),
    RequestVotes(VoteRequestArgs),
}

/// Body of a successful remote command response.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    Heartbeat(HeartbeatResponse),
    Votes(VoteResponse),
}

/// A remote command outcome: the response body, or the failure status the
/// transport (or remote node) reported.
pub type RemoteResponse = Result<ResponseBody, ReplSetError>;
