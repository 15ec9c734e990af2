//! In-process transport: every member of a hub can reach every other member.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nearby_core::EndpointId;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::transport::{Transport, TransportError, TransportEvent};

type Members = HashMap<EndpointId, mpsc::UnboundedSender<TransportEvent>>;

/// Shared medium. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryHub {
    members: Arc<Mutex<Members>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint. Rejoining with the same id replaces the old member.
    pub async fn join(
        &self,
        id: impl Into<EndpointId>,
    ) -> (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.members.lock().await.insert(id.clone(), tx);
        debug!(endpoint = %id, "joined memory hub");
        let transport = Arc::new(MemoryTransport {
            id,
            hub: self.clone(),
        });
        (transport, rx)
    }

    /// Detach an endpoint; frames to it fail from now on.
    pub async fn leave(&self, id: &EndpointId) {
        if self.members.lock().await.remove(id).is_some() {
            debug!(endpoint = %id, "left memory hub");
        }
    }

    /// Report a link failure to `at` about `about`, as a radio stack would.
    pub async fn inject_error(&self, at: &EndpointId, about: &EndpointId, reason: &str) {
        if let Some(tx) = self.members.lock().await.get(at) {
            let _ = tx.send(TransportEvent::Error {
                endpoint_id: about.clone(),
                reason: reason.to_owned(),
            });
        }
    }

}

pub struct MemoryTransport {
    id: EndpointId,
    hub: MemoryHub,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> EndpointId {
        self.id.clone()
    }

    async fn send_frame(&self, to: &EndpointId, frame: Vec<u8>) -> Result<(), TransportError> {
        let members = self.hub.members.lock().await;
        if !members.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        let tx = members
            .get(to)
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        tx.send(TransportEvent::FrameReceived {
            from: self.id.clone(),
            bytes: frame,
        })
        .map_err(|_| TransportError::Unreachable(to.clone()))
    }

    async fn broadcast_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let members = self.hub.members.lock().await;
        if !members.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        for (id, tx) in members.iter() {
            if *id != self.id {
                let _ = tx.send(TransportEvent::FrameReceived {
                    from: self.id.clone(),
                    bytes: frame.clone(),
                });
            }
        }
        Ok(())
    }
}
