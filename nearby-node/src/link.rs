//! Outbound links: one task and queue per endpoint, so a slow endpoint never
//! holds up another and frames to one endpoint keep their order. A released
//! link finishes its queue before any new link to the same endpoint starts.

use std::collections::HashMap;
use std::sync::Arc;

use nearby_core::EndpointId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::Transport;

/// A send that failed on a link: (endpoint, reason).
pub(crate) type LinkFailure = (EndpointId, String);

struct Link {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

pub(crate) struct Links<T: Transport> {
    transport: Arc<T>,
    links: HashMap<EndpointId, Link>,
    /// Released links still flushing their queue.
    draining: HashMap<EndpointId, JoinHandle<()>>,
    broadcast: mpsc::UnboundedSender<Vec<u8>>,
    failures: mpsc::UnboundedSender<LinkFailure>,
}

impl<T: Transport> Links<T> {
    pub(crate) fn new(transport: Arc<T>, failures: mpsc::UnboundedSender<LinkFailure>) -> Self {
        let (broadcast, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_broadcast_link(transport.clone(), rx));
        Self {
            transport,
            links: HashMap::new(),
            draining: HashMap::new(),
            broadcast,
            failures,
        }
    }

    pub(crate) fn send(&mut self, to: &EndpointId, frame: Vec<u8>) {
        let frame = match self.links.get(to) {
            Some(link) => match link.queue.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => frame,
            },
            None => frame,
        };
        let (queue, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(
            self.transport.clone(),
            to.clone(),
            self.draining.remove(to),
            rx,
            self.failures.clone(),
        ));
        let _ = queue.send(frame);
        self.links.insert(to.clone(), Link { queue, task });
    }

    pub(crate) fn broadcast(&mut self, frame: Vec<u8>) {
        let _ = self.broadcast.send(frame);
    }

    /// Drop the link to `endpoint_id`. Its task sends what is queued, then ends.
    pub(crate) fn release(&mut self, endpoint_id: &EndpointId) {
        self.draining.retain(|_, task| !task.is_finished());
        if let Some(link) = self.links.remove(endpoint_id) {
            debug!(endpoint = %endpoint_id, "link released");
            self.draining.insert(endpoint_id.clone(), link.task);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.links.len() + self.draining.len()
    }
}

async fn run_link<T: Transport>(
    transport: Arc<T>,
    endpoint_id: EndpointId,
    previous: Option<JoinHandle<()>>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    failures: mpsc::UnboundedSender<LinkFailure>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    while let Some(frame) = rx.recv().await {
        if let Err(e) = transport.send_frame(&endpoint_id, frame).await {
            debug!(endpoint = %endpoint_id, "send failed: {e}");
            let _ = failures.send((endpoint_id.clone(), e.to_string()));
        }
    }
}

async fn run_broadcast_link<T: Transport>(transport: Arc<T>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = transport.broadcast_frame(frame).await {
            debug!("broadcast failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use crate::transport::TransportEvent;

    #[tokio::test]
    async fn frames_keep_order_per_endpoint() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.join("a").await;
        let (_b, mut b_rx) = hub.join("b").await;
        let (failures, _failures_rx) = mpsc::unbounded_channel();
        let mut links = Links::new(a, failures);
        for i in 0..50u8 {
            links.send(&"b".into(), vec![i]);
        }
        for i in 0..50u8 {
            match b_rx.recv().await {
                Some(TransportEvent::FrameReceived { bytes, .. }) => assert_eq!(bytes, vec![i]),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn failed_send_is_reported() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.join("a").await;
        let (failures, mut failures_rx) = mpsc::unbounded_channel();
        let mut links = Links::new(a, failures);
        links.send(&"ghost".into(), vec![1]);
        let (endpoint_id, reason) = failures_rx.recv().await.unwrap();
        assert_eq!(endpoint_id, EndpointId::from("ghost"));
        assert!(reason.contains("unreachable"));
    }

    #[tokio::test]
    async fn released_link_flushes_then_goes_away() {
        let hub = MemoryHub::new();
        let (a, _a_rx) = hub.join("a").await;
        let (_b, mut b_rx) = hub.join("b").await;
        let (failures, _failures_rx) = mpsc::unbounded_channel();
        let mut links = Links::new(a, failures);
        let b: EndpointId = "b".into();

        for i in 0..20u8 {
            links.send(&b, vec![i]);
        }
        links.release(&b);
        // A new link waits for the released one, so order holds across the gap.
        for i in 20..40u8 {
            links.send(&b, vec![i]);
        }
        for i in 0..40u8 {
            match b_rx.recv().await {
                Some(TransportEvent::FrameReceived { bytes, .. }) => assert_eq!(bytes, vec![i]),
                other => panic!("unexpected {other:?}"),
            }
        }

        links.release(&b);
        for peer in ["c", "d", "e"] {
            links.send(&peer.into(), vec![0]);
            links.release(&peer.into());
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        links.release(&"f".into());
        assert_eq!(links.len(), 0);
    }
}
