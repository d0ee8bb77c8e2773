//! External collaborators of the coordinator: durable storage of the local
//! config document, the cluster-wide operation-mode lock, and applier
//! hooks. Production wires these to the storage engine; tests use the
//! in-memory implementation below.

use std::sync::Mutex;

use crate::config::HostAndPort;
use crate::utils::ReplSetError;

use async_trait::async_trait;

use serde_json::Value;

/// Callbacks into the node's storage and locking environment.
#[async_trait]
pub trait ExternalState: Send + Sync {
    /// Loads the locally persisted replica-set config document, if any.
    async fn load_local_config(&self) -> Result<Option<Value>, ReplSetError>;

    /// Persists the replica-set config document. May fail with
    /// `OutOfDiskSpace`, in which case the caller must not install the
    /// config.
    async fn store_local_config(&self, doc: &Value) -> Result<(), ReplSetError>;

    /// Starts the steady-state replication machinery (appliers, fetchers).
    /// Called once a data-bearing config is installed.
    fn start_threads(&self);

    /// Asks the applier to cancel its fetcher; called on member-state
    /// changes that invalidate the current sync source.
    fn signal_applier_to_cancel_fetcher(&self);

    /// Network name of the connected client, for master/slave handshakes.
    fn client_host_and_port(&self) -> Option<HostAndPort>;

    /// Tries to take the cluster-wide operation-mode lock in shared mode
    /// within the given budget. Returns true if acquired.
    fn try_acquire_global_shared(&self, timeout_ms: u64) -> bool;

    /// Releases a previously acquired shared lock.
    fn release_global_shared(&self);
}

/// In-memory `ExternalState`, with failure injection for tests.
#[derive(Default)]
pub struct InMemExternalState {
    inner: Mutex<InMemInner>,
}

#[derive(Default)]
struct InMemInner {
    local_config: Option<Value>,
    store_status: Option<ReplSetError>,
    threads_started: bool,
    applier_signaled: bool,
    client_host: Option<HostAndPort>,
    global_locked_exclusively: bool,
    shared_holders: usize,
}

impl InMemExternalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a failure status returned by the next `store_local_config`.
    pub fn set_store_local_config_status(&self, status: ReplSetError) {
        self.inner.lock().unwrap().store_status = Some(status);
    }

    /// Pre-seeds the locally persisted config document.
    pub fn set_local_config(&self, doc: Value) {
        self.inner.lock().unwrap().local_config = Some(doc);
    }

    /// Sets the client host reported for master/slave handshakes.
    pub fn set_client_host_and_port(&self, host: HostAndPort) {
        self.inner.lock().unwrap().client_host = Some(host);
    }

    /// Simulates another operation holding the global lock exclusively.
    pub fn set_global_locked_exclusively(&self, locked: bool) {
        self.inner.lock().unwrap().global_locked_exclusively = locked;
    }

    /// True once `start_threads` has been called.
    pub fn threads_started(&self) -> bool {
        self.inner.lock().unwrap().threads_started
    }

    /// True once the applier was signaled to cancel its fetcher.
    pub fn is_applier_signaled_to_cancel_fetcher(&self) -> bool {
        self.inner.lock().unwrap().applier_signaled
    }

    /// Number of shared holders currently on the global lock.
    pub fn shared_holders(&self) -> usize {
        self.inner.lock().unwrap().shared_holders
    }
}

#[async_trait]
impl ExternalState for InMemExternalState {
    async fn load_local_config(&self) -> Result<Option<Value>, ReplSetError> {
        Ok(self.inner.lock().unwrap().local_config.clone())
    }

    async fn store_local_config(&self, doc: &Value) -> Result<(), ReplSetError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(status) = inner.store_status.take() {
            return Err(status);
        }
        inner.local_config = Some(doc.clone());
        Ok(())
    }

    fn start_threads(&self) {
        self.inner.lock().unwrap().threads_started = true;
    }

    fn signal_applier_to_cancel_fetcher(&self) {
        self.inner.lock().unwrap().applier_signaled = true;
    }

    fn client_host_and_port(&self) -> Option<HostAndPort> {
        self.inner.lock().unwrap().client_host.clone()
    }

    fn try_acquire_global_shared(&self, _timeout_ms: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.global_locked_exclusively {
            false
        } else {
            inner.shared_holders += 1;
            true
        }
    }

    fn release_global_shared(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.shared_holders > 0);
        inner.shared_holders = inner.shared_holders.saturating_sub(1);
    }
}
