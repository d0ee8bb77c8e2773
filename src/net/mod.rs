//! Abstract outbound command channel and the wire payloads it carries.

pub mod command;

mod dispatcher;
mod mock;

pub use command::{
    HeartbeatArgs, HeartbeatResponse, IsMasterResponse, RemoteCommand,
    RemoteResponse, ReplSetMetadata, ResponseBody, UpdatePositionArgs,
    UpdatePositionEntry, VoteRequestArgs, VoteResponse, REPL_METADATA_FIELD,
};
pub use dispatcher::{CommandDispatcher, OutboundRequest, RequestId};
pub use mock::MockNetwork;
