//! Async facade over `NearbyCore`. One actor task owns the core; callers talk to
//! it through a cloneable handle and receive every event on one channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nearby_core::{
    Action, ConnectionSnapshot, CoreConfig, EndpointId, EndpointSnapshot, Event, NearbyCore,
    NearbyError, PayloadId, PayloadSnapshot, Result, Strategy,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::link::{LinkFailure, Links};
use crate::transport::{Transport, TransportEvent};

enum Command {
    StartAdvertising {
        strategy: Strategy,
        display_name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StartDiscovery {
        strategy: Strategy,
        reply: oneshot::Sender<Result<()>>,
    },
    StopAdvertising {
        reply: oneshot::Sender<()>,
    },
    StopDiscovery {
        reply: oneshot::Sender<()>,
    },
    StopAll {
        reply: oneshot::Sender<()>,
    },
    RequestConnection {
        endpoint_id: EndpointId,
        display_name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AcceptConnection {
        endpoint_id: EndpointId,
        reply: oneshot::Sender<Result<()>>,
    },
    RejectConnection {
        endpoint_id: EndpointId,
        reply: oneshot::Sender<Result<()>>,
    },
    SendPayload {
        endpoint_id: EndpointId,
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<PayloadId>>,
    },
    CancelPayload {
        payload_id: PayloadId,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        endpoint_id: EndpointId,
        reply: oneshot::Sender<Result<()>>,
    },
    Endpoints {
        reply: oneshot::Sender<Vec<EndpointSnapshot>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionSnapshot>>,
    },
    Payloads {
        reply: oneshot::Sender<Vec<PayloadSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running coordinator. Cheap to clone; every method returns once
/// the actor has applied the command, never waiting on transport I/O.
#[derive(Clone)]
pub struct Coordinator {
    local_id: EndpointId,
    commands: mpsc::UnboundedSender<Command>,
}

impl Coordinator {
    /// Start the actor. `inbound` is the transport's receive side; the returned
    /// receiver carries every event in emission order.
    pub fn spawn<T: Transport>(
        config: CoreConfig,
        tick_interval: Duration,
        transport: Arc<T>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Coordinator, mpsc::UnboundedReceiver<Event>) {
        let local_id = transport.local_id();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            core: NearbyCore::new(local_id.clone(), config),
            links: Links::new(transport, failures),
            events,
        };
        tokio::spawn(actor.run(commands_rx, inbound, failures_rx, tick_interval));
        info!(endpoint = %local_id, "coordinator started");
        (Coordinator { local_id, commands }, events_rx)
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    pub async fn start_advertising(&self, strategy: Strategy, display_name: &str) -> Result<()> {
        let display_name = display_name.to_owned();
        self.call(|reply| Command::StartAdvertising {
            strategy,
            display_name,
            reply,
        })
        .await?
    }

    pub async fn start_discovery(&self, strategy: Strategy) -> Result<()> {
        self.call(|reply| Command::StartDiscovery { strategy, reply })
            .await?
    }

    pub async fn stop_advertising(&self) -> Result<()> {
        self.call(|reply| Command::StopAdvertising { reply }).await
    }

    pub async fn stop_discovery(&self) -> Result<()> {
        self.call(|reply| Command::StopDiscovery { reply }).await
    }

    pub async fn stop_all(&self) -> Result<()> {
        self.call(|reply| Command::StopAll { reply }).await
    }

    pub async fn request_connection(&self, endpoint_id: &EndpointId, display_name: &str) -> Result<()> {
        let (endpoint_id, display_name) = (endpoint_id.clone(), display_name.to_owned());
        self.call(|reply| Command::RequestConnection {
            endpoint_id,
            display_name,
            reply,
        })
        .await?
    }

    pub async fn accept_connection(&self, endpoint_id: &EndpointId) -> Result<()> {
        let endpoint_id = endpoint_id.clone();
        self.call(|reply| Command::AcceptConnection { endpoint_id, reply })
            .await?
    }

    pub async fn reject_connection(&self, endpoint_id: &EndpointId) -> Result<()> {
        let endpoint_id = endpoint_id.clone();
        self.call(|reply| Command::RejectConnection { endpoint_id, reply })
            .await?
    }

    /// Returns as soon as the transfer is registered; progress arrives as events.
    pub async fn send_payload(&self, endpoint_id: &EndpointId, bytes: Vec<u8>) -> Result<PayloadId> {
        let endpoint_id = endpoint_id.clone();
        self.call(|reply| Command::SendPayload {
            endpoint_id,
            bytes,
            reply,
        })
        .await?
    }

    pub async fn cancel_payload(&self, payload_id: PayloadId) -> Result<()> {
        self.call(|reply| Command::CancelPayload { payload_id, reply })
            .await?
    }

    pub async fn disconnect(&self, endpoint_id: &EndpointId) -> Result<()> {
        let endpoint_id = endpoint_id.clone();
        self.call(|reply| Command::Disconnect { endpoint_id, reply })
            .await?
    }

    pub async fn endpoints(&self) -> Result<Vec<EndpointSnapshot>> {
        self.call(|reply| Command::Endpoints { reply }).await
    }

    pub async fn connections(&self) -> Result<Vec<ConnectionSnapshot>> {
        self.call(|reply| Command::Connections { reply }).await
    }

    pub async fn payloads(&self) -> Result<Vec<PayloadSnapshot>> {
        self.call(|reply| Command::Payloads { reply }).await
    }

    /// Stop everything, flush outbound frames and end the actor. The event
    /// stream closes afterwards; later commands fail with `InternalError`.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    async fn call<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

fn stopped() -> NearbyError {
    NearbyError::InternalError("coordinator stopped".into())
}

struct Actor<T: Transport> {
    core: NearbyCore,
    links: Links<T>,
    events: mpsc::UnboundedSender<Event>,
}

impl<T: Transport> Actor<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
        mut failures: mpsc::UnboundedReceiver<LinkFailure>,
        tick_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = inbound.recv(), if inbound_open => match event {
                    Some(TransportEvent::FrameReceived { from, bytes }) => {
                        let actions = self.core.on_frame_received(&from, &bytes, Instant::now());
                        self.apply(actions);
                    }
                    Some(TransportEvent::Error { endpoint_id, reason }) => {
                        let actions = self.core.on_transport_error(&endpoint_id, &reason, Instant::now());
                        self.apply(actions);
                    }
                    None => {
                        debug!(endpoint = %self.core.local_id(), "transport inbound closed");
                        inbound_open = false;
                    }
                },
                Some((endpoint_id, reason)) = failures.recv() => {
                    let actions = self.core.on_transport_error(&endpoint_id, &reason, Instant::now());
                    self.apply(actions);
                }
                _ = ticker.tick() => {
                    let actions = self.core.tick(Instant::now());
                    self.apply(actions);
                }
            }
        }
        info!(endpoint = %self.core.local_id(), "coordinator stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::StartAdvertising {
                strategy,
                display_name,
                reply,
            } => {
                let result = self.core.start_advertising(strategy, &display_name, now);
                let _ = reply.send(self.finish(result));
            }
            Command::StartDiscovery { strategy, reply } => {
                let result = self.core.start_discovery(strategy);
                let _ = reply.send(self.finish(result));
            }
            Command::StopAdvertising { reply } => {
                let actions = self.core.stop_advertising();
                self.apply(actions);
                let _ = reply.send(());
            }
            Command::StopDiscovery { reply } => {
                let actions = self.core.stop_discovery();
                self.apply(actions);
                let _ = reply.send(());
            }
            Command::StopAll { reply } => {
                let actions = self.core.stop_all(now);
                self.apply(actions);
                let _ = reply.send(());
            }
            Command::RequestConnection {
                endpoint_id,
                display_name,
                reply,
            } => {
                let result = self.core.request_connection(&endpoint_id, &display_name, now);
                let _ = reply.send(self.finish(result));
            }
            Command::AcceptConnection { endpoint_id, reply } => {
                let result = self.core.accept_connection(&endpoint_id);
                let _ = reply.send(self.finish(result));
            }
            Command::RejectConnection { endpoint_id, reply } => {
                let result = self.core.reject_connection(&endpoint_id);
                let _ = reply.send(self.finish(result));
            }
            Command::SendPayload {
                endpoint_id,
                bytes,
                reply,
            } => {
                let result = match self.core.send_payload(&endpoint_id, bytes, now) {
                    Ok((payload_id, actions)) => {
                        self.apply(actions);
                        Ok(payload_id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::CancelPayload { payload_id, reply } => {
                let result = self.core.cancel_payload(payload_id, now);
                let _ = reply.send(self.finish(result));
            }
            Command::Disconnect { endpoint_id, reply } => {
                let result = self.core.disconnect(&endpoint_id, now);
                let _ = reply.send(self.finish(result));
            }
            Command::Endpoints { reply } => {
                let _ = reply.send(self.core.endpoints());
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.core.connections());
            }
            Command::Payloads { reply } => {
                let _ = reply.send(self.core.payloads());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    /// Apply a command's actions; what is left is the caller's reply.
    fn finish(&mut self, result: Result<Vec<Action>>) -> Result<()> {
        let actions = result?;
        self.apply(actions);
        Ok(())
    }

    fn shutdown(&mut self) {
        let actions = self.core.shutdown(Instant::now());
        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(to, frame) => self.links.send(&to, frame),
                Action::Broadcast(frame) => self.links.broadcast(frame),
                Action::Release(endpoint_id) => self.links.release(&endpoint_id),
                Action::Emit(event) => {
                    // Nobody listening is fine; the core keeps running.
                    let _ = self.events.send(event);
                }
            }
        }
    }
}
