//! Connection negotiator: one handshake state machine per endpoint.
//!
//! ```text
//! Initiated --(handshake)--> Authenticating --(local accept)--> Accepted --(remote accept)--> Active
//!                            Authenticating --(remote accept, local accept)-----------------> Active
//! Initiated | Authenticating | Accepted --(either side rejects)--> Rejected --> removed
//! Active --(disconnect or transport failure)--> Disconnected --> removed
//! ```
//!
//! Terminal connections leave the table immediately, so a new request to the
//! same endpoint succeeds right after.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::action::Outbox;
use crate::error::{NearbyError, Result};
use crate::event::{ConnectionStatus, Event};
use crate::identity::{derive_auth_token, AuthToken, EndpointId, HandshakeKey, PublicKey};
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::strategy::{Role, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initiated,
    Authenticating,
    Accepted,
    Rejected,
    Active,
    Disconnected,
}

impl ConnectionState {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ConnectionState::Initiated | ConnectionState::Authenticating | ConnectionState::Accepted
        )
    }
}

/// Immutable view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub endpoint_id: EndpointId,
    pub display_name: String,
    pub state: ConnectionState,
    pub role: Role,
    pub strategy: Strategy,
    pub auth_token: Option<AuthToken>,
}

struct Connection {
    role: Role,
    strategy: Strategy,
    state: ConnectionState,
    remote_name: String,
    key: HandshakeKey,
    auth_token: Option<AuthToken>,
    local_accepted: bool,
    remote_accepted: bool,
    started_at: Instant,
}

/// What a terminating transition left behind, so the caller can fail payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    None,
    Pending,
    Active,
}

pub struct Negotiator {
    handshake_timeout: Duration,
    connections: HashMap<EndpointId, Connection>,
}

impl Negotiator {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self {
            handshake_timeout,
            connections: HashMap::new(),
        }
    }

    /// Outgoing request. `remote_name` is the name the endpoint advertised.
    pub fn request(
        &mut self,
        endpoint_id: &EndpointId,
        remote_name: &str,
        local_name: &str,
        strategy: Strategy,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<()> {
        if self.connections.contains_key(endpoint_id) {
            return Err(NearbyError::ConnectionInProgress(endpoint_id.clone()));
        }
        if !self.topology_allows(strategy, Role::Requester) {
            return Err(NearbyError::TopologyLimit(strategy));
        }
        let key = HandshakeKey::generate();
        out.send(
            endpoint_id,
            &Message::ConnectionRequest {
                protocol_version: PROTOCOL_VERSION,
                strategy,
                display_name: local_name.to_owned(),
                public_key: key.public_key().clone(),
            },
        );
        self.connections.insert(
            endpoint_id.clone(),
            Connection {
                role: Role::Requester,
                strategy,
                state: ConnectionState::Initiated,
                remote_name: remote_name.to_owned(),
                key,
                auth_token: None,
                local_accepted: false,
                remote_accepted: false,
                started_at: now,
            },
        );
        info!(endpoint = %endpoint_id, "connection requested");
        Ok(())
    }

    /// Incoming request. `advertising` is our advertising strategy, if any.
    /// Returns what had to be torn down: a request on top of an active
    /// connection means the peer lost its side.
    #[allow(clippy::too_many_arguments)]
    pub fn on_request(
        &mut self,
        from: &EndpointId,
        protocol_version: u8,
        strategy: Strategy,
        remote_name: &str,
        remote_key: &PublicKey,
        advertising: Option<Strategy>,
        now: Instant,
        out: &mut Outbox,
    ) -> Teardown {
        let mut teardown = Teardown::None;
        match self.connections.get(from).map(|c| c.state) {
            Some(ConnectionState::Active) => {
                warn!(endpoint = %from, "new request over active connection; dropping stale connection");
                self.connections.remove(from);
                out.emit(Event::ConnectionDisconnected {
                    endpoint_id: from.clone(),
                });
                teardown = Teardown::Active;
            }
            Some(_) => {
                // Both sides requested at once: refuse, the peer's request kills ours too.
                debug!(endpoint = %from, "simultaneous connection request");
                out.send(from, &Message::ConnectionDecision { accepted: false });
                self.terminate(from, ConnectionStatus::Rejected, out);
                return Teardown::Pending;
            }
            None => {}
        }

        let acceptable = protocol_version == PROTOCOL_VERSION
            && advertising == Some(strategy)
            && self.topology_allows(strategy, Role::Responder);
        if !acceptable {
            info!(endpoint = %from, ?strategy, ?advertising, "refusing connection request");
            out.send(from, &Message::ConnectionDecision { accepted: false });
            out.release(from);
            return teardown;
        }

        let key = HandshakeKey::generate();
        let token = derive_auth_token(&key.shared_secret(remote_key), remote_key, key.public_key());
        out.send(
            from,
            &Message::ConnectionHandshake {
                public_key: key.public_key().clone(),
            },
        );
        out.emit(Event::ConnectionInitiated {
            endpoint_id: from.clone(),
            display_name: remote_name.to_owned(),
            auth_token: token.clone(),
            incoming: true,
        });
        info!(endpoint = %from, token = %token, "incoming connection initiated");
        self.connections.insert(
            from.clone(),
            Connection {
                role: Role::Responder,
                strategy,
                state: ConnectionState::Authenticating,
                remote_name: remote_name.to_owned(),
                key,
                auth_token: Some(token),
                local_accepted: false,
                remote_accepted: false,
                started_at: now,
            },
        );
        teardown
    }

    pub fn on_handshake(&mut self, from: &EndpointId, remote_key: &PublicKey, out: &mut Outbox) {
        let Some(conn) = self.connections.get_mut(from) else {
            debug!(endpoint = %from, "handshake without connection");
            return;
        };
        if conn.role != Role::Requester || conn.state != ConnectionState::Initiated {
            debug!(endpoint = %from, state = ?conn.state, "unexpected handshake");
            return;
        }
        let token = derive_auth_token(
            &conn.key.shared_secret(remote_key),
            conn.key.public_key(),
            remote_key,
        );
        conn.state = ConnectionState::Authenticating;
        conn.auth_token = Some(token.clone());
        info!(endpoint = %from, token = %token, "outgoing connection initiated");
        out.emit(Event::ConnectionInitiated {
            endpoint_id: from.clone(),
            display_name: conn.remote_name.clone(),
            auth_token: token,
            incoming: false,
        });
    }

    pub fn on_decision(&mut self, from: &EndpointId, accepted: bool, out: &mut Outbox) {
        let Some(conn) = self.connections.get_mut(from) else {
            return;
        };
        if !conn.state.is_pending() {
            return;
        }
        if !accepted {
            info!(endpoint = %from, "connection rejected by remote");
            self.terminate(from, ConnectionStatus::Rejected, out);
            return;
        }
        conn.remote_accepted = true;
        if conn.state == ConnectionState::Accepted {
            self.activate(from, out);
        }
    }

    pub fn accept(&mut self, endpoint_id: &EndpointId, out: &mut Outbox) -> Result<()> {
        let conn = self.awaiting_decision(endpoint_id)?;
        conn.local_accepted = true;
        conn.state = ConnectionState::Accepted;
        let remote_accepted = conn.remote_accepted;
        out.send(endpoint_id, &Message::ConnectionDecision { accepted: true });
        if remote_accepted {
            self.activate(endpoint_id, out);
        }
        Ok(())
    }

    pub fn reject(&mut self, endpoint_id: &EndpointId, out: &mut Outbox) -> Result<()> {
        self.awaiting_decision(endpoint_id)?;
        out.send(endpoint_id, &Message::ConnectionDecision { accepted: false });
        info!(endpoint = %endpoint_id, "connection rejected locally");
        self.terminate(endpoint_id, ConnectionStatus::Rejected, out);
        Ok(())
    }

    /// Local disconnect: active connections close, pending ones are abandoned.
    pub fn disconnect(&mut self, endpoint_id: &EndpointId, out: &mut Outbox) -> Result<Teardown> {
        if !self.connections.contains_key(endpoint_id) {
            return Err(NearbyError::NotConnected(endpoint_id.clone()));
        }
        out.send(endpoint_id, &Message::Disconnect);
        Ok(self.terminate(endpoint_id, ConnectionStatus::Aborted, out))
    }

    pub fn on_remote_disconnect(&mut self, from: &EndpointId, out: &mut Outbox) -> Teardown {
        self.terminate(from, ConnectionStatus::Aborted, out)
    }

    pub fn on_transport_error(&mut self, endpoint_id: &EndpointId, out: &mut Outbox) -> Teardown {
        self.terminate(endpoint_id, ConnectionStatus::TransportError, out)
    }

    /// Abandon negotiations older than the handshake timeout.
    pub fn tick(&mut self, now: Instant, out: &mut Outbox) {
        let mut expired: Vec<EndpointId> = self
            .connections
            .iter()
            .filter(|(_, c)| {
                c.state.is_pending()
                    && now.saturating_duration_since(c.started_at) >= self.handshake_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        for endpoint_id in expired {
            warn!(endpoint = %endpoint_id, "connection handshake timed out");
            out.send(&endpoint_id, &Message::Disconnect);
            self.terminate(&endpoint_id, ConnectionStatus::Timeout, out);
        }
    }

    pub fn is_active(&self, endpoint_id: &EndpointId) -> bool {
        self.state(endpoint_id) == Some(ConnectionState::Active)
    }

    pub fn state(&self, endpoint_id: &EndpointId) -> Option<ConnectionState> {
        self.connections.get(endpoint_id).map(|c| c.state)
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let mut out: Vec<ConnectionSnapshot> = self
            .connections
            .iter()
            .map(|(id, c)| ConnectionSnapshot {
                endpoint_id: id.clone(),
                display_name: c.remote_name.clone(),
                state: c.state,
                role: c.role,
                strategy: c.strategy,
                auth_token: c.auth_token.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        out
    }

    fn awaiting_decision(&mut self, endpoint_id: &EndpointId) -> Result<&mut Connection> {
        let conn = self
            .connections
            .get_mut(endpoint_id)
            .ok_or_else(|| NearbyError::EndpointUnknown(endpoint_id.clone()))?;
        if conn.state != ConnectionState::Authenticating {
            return Err(NearbyError::InvalidArgument(format!(
                "connection to {endpoint_id} is {:?}, not awaiting a decision",
                conn.state
            )));
        }
        Ok(conn)
    }

    fn activate(&mut self, endpoint_id: &EndpointId, out: &mut Outbox) {
        if let Some(conn) = self.connections.get_mut(endpoint_id) {
            conn.state = ConnectionState::Active;
            info!(endpoint = %endpoint_id, "connection active");
            out.emit(Event::ConnectionResult {
                endpoint_id: endpoint_id.clone(),
                status: ConnectionStatus::Ok,
            });
        }
    }

    /// Single exit path. Pending connections pass through `Rejected` (or time out)
    /// and report a `ConnectionResult`; active ones report `ConnectionDisconnected`.
    /// Either way the endpoint's host resources are released last.
    fn terminate(
        &mut self,
        endpoint_id: &EndpointId,
        pending_status: ConnectionStatus,
        out: &mut Outbox,
    ) -> Teardown {
        let Some(mut conn) = self.connections.remove(endpoint_id) else {
            return Teardown::None;
        };
        let teardown = if conn.state == ConnectionState::Active {
            conn.state = ConnectionState::Disconnected;
            info!(endpoint = %endpoint_id, "connection disconnected");
            out.emit(Event::ConnectionDisconnected {
                endpoint_id: endpoint_id.clone(),
            });
            Teardown::Active
        } else {
            if pending_status == ConnectionStatus::Rejected {
                conn.state = ConnectionState::Rejected;
            }
            debug!(endpoint = %endpoint_id, state = ?conn.state, ?pending_status, "negotiation ended");
            out.emit(Event::ConnectionResult {
                endpoint_id: endpoint_id.clone(),
                status: pending_status,
            });
            Teardown::Pending
        };
        out.release(endpoint_id);
        teardown
    }

    fn topology_allows(&self, strategy: Strategy, role: Role) -> bool {
        let requesters = self
            .connections
            .values()
            .filter(|c| c.role == Role::Requester)
            .count();
        let responders = self.connections.len() - requesters;
        strategy.allows_connection(role, requesters, responders)
    }
}
