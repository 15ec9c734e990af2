//! Error taxonomy shared by every command and terminal event.

/// Command-level failure. Returned on the result of the single call that failed;
/// never terminates the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NearbyError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("already advertising")]
    AlreadyAdvertising,
    #[error("already discovering")]
    AlreadyDiscovering,
    #[error("strategy {requested:?} is incompatible with active strategy {active:?}")]
    IncompatibleStrategy {
        requested: crate::Strategy,
        active: crate::Strategy,
    },
    #[error("endpoint {0} is unknown")]
    EndpointUnknown(crate::EndpointId),
    #[error("connection to {0} already in progress")]
    ConnectionInProgress(crate::EndpointId),
    #[error("strategy {0:?} does not allow another connection")]
    TopologyLimit(crate::Strategy),
    #[error("endpoint {0} is not connected")]
    NotConnected(crate::EndpointId),
    #[error("connection rejected")]
    Rejected,
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("payload corrupt")]
    PayloadCorrupt,
    #[error("internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, NearbyError>;
