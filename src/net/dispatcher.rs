//! Abstract outbound command channel.

use crate::config::HostAndPort;
use crate::net::RemoteCommand;

/// Tag identifying one outstanding remote command.
pub type RequestId = u64;

/// One outbound command, addressed and tagged.
#[derive(Debug, PartialEq, Clone)]
pub struct OutboundRequest {
    pub id: RequestId,
    pub target: HostAndPort,
    pub cmd: RemoteCommand,
}

/// Abstract outbound command channel. The coordinator pushes a tagged
/// command at a target host; whatever transport sits behind the trait
/// eventually feeds the tagged response back into the coordinator's event
/// loop (`ReplCoordinator::handle_response`). The transport owns timeout
/// duty: every dispatched command must eventually come back as either a
/// response or a failure status.
pub trait CommandDispatcher: Send + Sync {
    /// Hands one command to the transport. Must not block.
    fn dispatch(&self, req: OutboundRequest);
}
