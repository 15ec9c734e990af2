//! Frame transport boundary. The coordinator only sees opaque frames addressed by endpoint id.

use async_trait::async_trait;
use nearby_core::EndpointId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} unreachable")]
    Unreachable(EndpointId),
    #[error("transport closed")]
    Closed,
}

/// Delivered by the transport on the inbound channel handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    FrameReceived { from: EndpointId, bytes: Vec<u8> },
    /// The link to `endpoint_id` failed outside of any send.
    Error { endpoint_id: EndpointId, reason: String },
}

/// Send side of a transport. Must allow concurrent sends to different endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> EndpointId;

    async fn send_frame(&self, to: &EndpointId, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Best effort delivery to every reachable endpoint (advertisements).
    async fn broadcast_frame(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}
