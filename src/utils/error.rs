//! Customized unified error type carrying a replication error code.

use std::fmt;
use std::io;
use std::net;

use serde::{Deserialize, Serialize};

/// Error code space surfaced by replica-set coordination operations.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NoReplicationEnabled,
    NotYetInitialized,
    AlreadyInitialized,
    InvalidReplicaSetConfig,
    NodeNotFound,
    NotMaster,
    NotSecondary,
    OperationFailed,
    WriteConcernFailed,
    UnknownReplWriteConcern,
    CannotSatisfyWriteConcern,
    ExceededTimeLimit,
    ShutdownInProgress,
    Interrupted,
    NotAReplicaSet,
    ReadConcernMajorityNotEnabled,
    StaleTerm,
    BadValue,
    OutOfDiskSpace,
}

/// Customized error type for replset: an error code plus a diagnostic
/// string suitable for surfacing to clients.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ReplSetError(pub ErrorCode, pub String);

impl ReplSetError {
    /// Creates an error with the given code and message.
    pub fn msg(code: ErrorCode, m: impl ToString) -> Self {
        ReplSetError(code, m.to_string())
    }

    /// Returns the error code.
    #[inline]
    pub fn code(&self) -> ErrorCode {
        self.0
    }

    /// Returns the diagnostic message.
    #[inline]
    pub fn reason(&self) -> &str {
        &self.1
    }
}

impl fmt::Display for ReplSetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.0, self.1)
    }
}

impl std::error::Error for ReplSetError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ReplSetError`, each mapped
// onto a fixed error code.
macro_rules! impl_from_error {
    ($error:ty, $code:expr) => {
        impl From<$error> for ReplSetError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ReplSetError($code, e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error, ErrorCode::OperationFailed);
impl_from_error!(net::AddrParseError, ErrorCode::BadValue);
impl_from_error!(toml::de::Error, ErrorCode::BadValue);
impl_from_error!(serde_json::Error, ErrorCode::BadValue);
impl_from_error!(
    tokio::sync::oneshot::error::RecvError,
    ErrorCode::ShutdownInProgress
);
