//! Caller-facing events. Emitted at most once per occurrence, in order per
//! endpoint and per payload.

use crate::identity::{AuthToken, EndpointId};
use crate::payload::{PayloadId, PayloadStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    EndpointFound {
        endpoint_id: EndpointId,
        display_name: String,
    },
    EndpointLost {
        endpoint_id: EndpointId,
    },
    /// Handshake done; the caller compares `auth_token` out of band and then
    /// accepts or rejects.
    ConnectionInitiated {
        endpoint_id: EndpointId,
        display_name: String,
        auth_token: AuthToken,
        incoming: bool,
    },
    ConnectionResult {
        endpoint_id: EndpointId,
        status: ConnectionStatus,
    },
    /// Only for connections that reached `Active`.
    ConnectionDisconnected {
        endpoint_id: EndpointId,
    },
    PayloadReceived {
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        bytes: Vec<u8>,
    },
    PayloadTransferUpdate {
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        bytes_transferred: u64,
        total_bytes: u64,
        status: PayloadStatus,
    },
}

/// Outcome of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    Rejected,
    Timeout,
    TransportError,
    /// Negotiation abandoned with `disconnect` before a decision, by either side.
    Aborted,
}
