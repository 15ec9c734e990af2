//! What the core asks its host to do.

use tracing::warn;

use crate::event::Event;
use crate::identity::EndpointId;
use crate::protocol::Message;
use crate::wire;

/// Action for host to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver an encoded frame to one endpoint.
    Send(EndpointId, Vec<u8>),
    /// Deliver an encoded frame to every reachable endpoint.
    Broadcast(Vec<u8>),
    /// Hand an event to the caller.
    Emit(Event),
    /// The endpoint has no connection left. Per-endpoint host resources can go
    /// once the frames queued before this action are out.
    Release(EndpointId),
}

/// Collects actions while a component handles one input.
#[derive(Debug, Default)]
pub struct Outbox {
    actions: Vec<Action>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: &EndpointId, msg: &Message) {
        match wire::encode_frame(msg) {
            Ok(frame) => self.actions.push(Action::Send(to.clone(), frame)),
            Err(e) => warn!(endpoint = %to, kind = msg.kind(), "dropping unencodable frame: {e}"),
        }
    }

    pub fn broadcast(&mut self, msg: &Message) {
        match wire::encode_frame(msg) {
            Ok(frame) => self.actions.push(Action::Broadcast(frame)),
            Err(e) => warn!(kind = msg.kind(), "dropping unencodable broadcast: {e}"),
        }
    }

    pub fn emit(&mut self, event: Event) {
        self.actions.push(Action::Emit(event));
    }

    pub fn release(&mut self, endpoint_id: &EndpointId) {
        self.actions.push(Action::Release(endpoint_id.clone()));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn into_actions(self) -> Vec<Action> {
        self.actions
    }
}
