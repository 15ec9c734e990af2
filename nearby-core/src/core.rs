//! Host-driven API: NearbyCore receives commands, frames and ticks from the host, returns actions.

use std::time::Instant;

use tracing::{debug, warn};

use crate::action::{Action, Outbox};
use crate::config::CoreConfig;
use crate::connection::{ConnectionSnapshot, ConnectionState, Negotiator, Teardown};
use crate::discovery::{DiscoveryEngine, EndpointSnapshot};
use crate::error::{NearbyError, Result};
use crate::identity::EndpointId;
use crate::payload::{PayloadId, PayloadManager, PayloadSnapshot, PayloadStatus};
use crate::protocol::Message;
use crate::strategy::Strategy;
use crate::wire;

/// Main coordinator. Owns the endpoint, connection and payload tables.
pub struct NearbyCore {
    local_id: EndpointId,
    discovery: DiscoveryEngine,
    negotiator: Negotiator,
    payloads: PayloadManager,
}

impl NearbyCore {
    pub fn new(local_id: EndpointId, config: CoreConfig) -> Self {
        Self {
            discovery: DiscoveryEngine::new(local_id.clone(), &config),
            negotiator: Negotiator::new(config.handshake_timeout()),
            payloads: PayloadManager::new(&config),
            local_id,
        }
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    pub fn start_advertising(
        &mut self,
        strategy: Strategy,
        display_name: &str,
        now: Instant,
    ) -> Result<Vec<Action>> {
        let mut out = Outbox::new();
        self.discovery
            .start_advertising(strategy, display_name, now, &mut out)?;
        Ok(out.into_actions())
    }

    pub fn start_discovery(&mut self, strategy: Strategy) -> Result<Vec<Action>> {
        self.discovery.start_discovery(strategy)?;
        Ok(Vec::new())
    }

    pub fn stop_advertising(&mut self) -> Vec<Action> {
        let mut out = Outbox::new();
        self.discovery.stop_advertising(&mut out);
        out.into_actions()
    }

    pub fn stop_discovery(&mut self) -> Vec<Action> {
        self.discovery.stop_discovery();
        Vec::new()
    }

    /// Stop advertising and discovery and drop every connection.
    pub fn stop_all(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Outbox::new();
        self.discovery.stop_advertising(&mut out);
        self.discovery.stop_discovery();
        for endpoint_id in self.negotiator.endpoint_ids() {
            if let Ok(teardown) = self.negotiator.disconnect(&endpoint_id, &mut out) {
                self.after_teardown(&endpoint_id, teardown, now, &mut out);
            }
        }
        out.into_actions()
    }

    /// Ask a discovered endpoint for a connection, announcing ourselves as `display_name`.
    pub fn request_connection(
        &mut self,
        endpoint_id: &EndpointId,
        display_name: &str,
        now: Instant,
    ) -> Result<Vec<Action>> {
        if display_name.trim().is_empty() {
            return Err(NearbyError::InvalidArgument(
                "display name must not be empty".into(),
            ));
        }
        let (Some(strategy), Some(remote_name)) = (
            self.discovery.discovery_strategy(),
            self.discovery.display_name(endpoint_id),
        ) else {
            return Err(NearbyError::EndpointUnknown(endpoint_id.clone()));
        };
        let remote_name = remote_name.to_owned();
        let mut out = Outbox::new();
        self.negotiator
            .request(endpoint_id, &remote_name, display_name, strategy, now, &mut out)?;
        Ok(out.into_actions())
    }

    pub fn accept_connection(&mut self, endpoint_id: &EndpointId) -> Result<Vec<Action>> {
        let mut out = Outbox::new();
        self.negotiator.accept(endpoint_id, &mut out)?;
        Ok(out.into_actions())
    }

    pub fn reject_connection(&mut self, endpoint_id: &EndpointId) -> Result<Vec<Action>> {
        let mut out = Outbox::new();
        self.negotiator.reject(endpoint_id, &mut out)?;
        Ok(out.into_actions())
    }

    /// Start sending `bytes` over an active connection. Fails without touching
    /// any state when the endpoint is not connected.
    pub fn send_payload(
        &mut self,
        endpoint_id: &EndpointId,
        bytes: Vec<u8>,
        now: Instant,
    ) -> Result<(PayloadId, Vec<Action>)> {
        if !self.negotiator.is_active(endpoint_id) {
            return Err(NearbyError::NotConnected(endpoint_id.clone()));
        }
        let mut out = Outbox::new();
        let payload_id = self.payloads.send(endpoint_id, bytes, now, &mut out)?;
        Ok((payload_id, out.into_actions()))
    }

    pub fn cancel_payload(&mut self, payload_id: PayloadId, now: Instant) -> Result<Vec<Action>> {
        let mut out = Outbox::new();
        self.payloads.cancel(payload_id, now, &mut out)?;
        Ok(out.into_actions())
    }

    pub fn disconnect(&mut self, endpoint_id: &EndpointId, now: Instant) -> Result<Vec<Action>> {
        let mut out = Outbox::new();
        let teardown = self.negotiator.disconnect(endpoint_id, &mut out)?;
        self.after_teardown(endpoint_id, teardown, now, &mut out);
        Ok(out.into_actions())
    }

    /// Process one inbound frame from `from`. Undecodable frames are dropped.
    pub fn on_frame_received(&mut self, from: &EndpointId, bytes: &[u8], now: Instant) -> Vec<Action> {
        let msg = match wire::decode_datagram(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(endpoint = %from, len = bytes.len(), "dropping undecodable frame: {e}");
                return Vec::new();
            }
        };
        let mut out = Outbox::new();
        match msg {
            Message::Advertisement {
                protocol_version,
                service_id,
                strategy,
                display_name,
            } => {
                self.discovery.on_advertisement(
                    from,
                    protocol_version,
                    &service_id,
                    strategy,
                    &display_name,
                    now,
                    &mut out,
                );
            }
            Message::AdvertisementWithdrawn { service_id } => {
                self.discovery.on_withdrawn(from, &service_id, &mut out);
            }
            Message::ConnectionRequest {
                protocol_version,
                strategy,
                display_name,
                public_key,
            } => {
                let advertising = self.discovery.advertising_strategy();
                let teardown = self.negotiator.on_request(
                    from,
                    protocol_version,
                    strategy,
                    &display_name,
                    &public_key,
                    advertising,
                    now,
                    &mut out,
                );
                self.after_teardown(from, teardown, now, &mut out);
            }
            Message::ConnectionHandshake { public_key } => {
                self.negotiator.on_handshake(from, &public_key, &mut out);
            }
            Message::ConnectionDecision { accepted } => {
                self.negotiator.on_decision(from, accepted, &mut out);
            }
            Message::Disconnect => {
                let teardown = self.negotiator.on_remote_disconnect(from, &mut out);
                self.after_teardown(from, teardown, now, &mut out);
            }
            msg @ (Message::PayloadChunk { .. }
            | Message::ChunkAck { .. }
            | Message::PayloadCancel { .. }
            | Message::PayloadAbort { .. }) => {
                if !self.negotiator.is_active(from) {
                    debug!(endpoint = %from, kind = msg.kind(), "payload frame without active connection");
                    return Vec::new();
                }
                self.route_payload_frame(from, msg, now, &mut out);
            }
        }
        out.into_actions()
    }

    /// The transport lost `endpoint_id`: its connection and payloads fail.
    pub fn on_transport_error(&mut self, endpoint_id: &EndpointId, reason: &str, now: Instant) -> Vec<Action> {
        warn!(endpoint = %endpoint_id, reason, "transport error");
        let mut out = Outbox::new();
        let teardown = self.negotiator.on_transport_error(endpoint_id, &mut out);
        self.after_teardown(endpoint_id, teardown, now, &mut out);
        if teardown == Teardown::None {
            // Nothing negotiated, but the host may still hold a link from a one-off send.
            out.release(endpoint_id);
        }
        out.into_actions()
    }

    /// Drive every timer: advertisement and staleness, handshake timeout,
    /// retransmission and dedup expiry.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Outbox::new();
        self.discovery.tick(now, &mut out);
        self.negotiator.tick(now, &mut out);
        self.payloads.tick(now, &mut out);
        out.into_actions()
    }

    /// Stop everything; same as `stop_all`. The core stays usable afterwards.
    pub fn shutdown(&mut self, now: Instant) -> Vec<Action> {
        self.stop_all(now)
    }

    pub fn has_connection(&self, endpoint_id: &EndpointId) -> bool {
        self.negotiator.is_active(endpoint_id)
    }

    pub fn connection_state(&self, endpoint_id: &EndpointId) -> Option<ConnectionState> {
        self.negotiator.state(endpoint_id)
    }

    pub fn payload_status(&self, payload_id: &PayloadId) -> Option<PayloadStatus> {
        self.payloads.status(payload_id)
    }

    pub fn advertising_strategy(&self) -> Option<Strategy> {
        self.discovery.advertising_strategy()
    }

    pub fn discovery_strategy(&self) -> Option<Strategy> {
        self.discovery.discovery_strategy()
    }

    pub fn endpoints(&self) -> Vec<EndpointSnapshot> {
        self.discovery.snapshots()
    }

    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.negotiator.snapshots()
    }

    pub fn payloads(&self) -> Vec<PayloadSnapshot> {
        self.payloads.snapshots()
    }

    fn route_payload_frame(&mut self, from: &EndpointId, msg: Message, now: Instant, out: &mut Outbox) {
        match msg {
            Message::PayloadChunk {
                payload_id,
                seq,
                chunk_count,
                total_bytes,
                hash,
                data,
            } => self
                .payloads
                .on_chunk(from, payload_id, seq, chunk_count, total_bytes, hash, data, now, out),
            Message::ChunkAck {
                payload_id,
                next_expected,
            } => self.payloads.on_ack(from, payload_id, next_expected, now, out),
            Message::PayloadCancel { payload_id } => self.payloads.on_cancel(from, payload_id, now, out),
            Message::PayloadAbort { payload_id } => self.payloads.on_abort(from, payload_id, now, out),
            _ => {}
        }
    }

    fn after_teardown(&mut self, endpoint_id: &EndpointId, teardown: Teardown, now: Instant, out: &mut Outbox) {
        if teardown == Teardown::Active {
            self.payloads.fail_endpoint(endpoint_id, now, out);
        }
    }
}
