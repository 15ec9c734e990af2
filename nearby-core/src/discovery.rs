//! Discovery engine: advertise presence, track discovered endpoints, evict stale ones.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::action::Outbox;
use crate::config::CoreConfig;
use crate::error::{NearbyError, Result};
use crate::event::Event;
use crate::identity::EndpointId;
use crate::protocol::{Message, PROTOCOL_VERSION};
use crate::strategy::Strategy;

/// A discovered remote peer.
#[derive(Debug, Clone)]
struct Endpoint {
    display_name: String,
    strategy: Strategy,
    last_seen_at: Instant,
}

/// Immutable view of a discovered endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub endpoint_id: EndpointId,
    pub display_name: String,
    pub strategy: Strategy,
    pub last_seen_at: Instant,
}

struct Advertising {
    strategy: Strategy,
    display_name: String,
    next_broadcast_at: Instant,
}

pub struct DiscoveryEngine {
    local_id: EndpointId,
    service_id: String,
    staleness_timeout: Duration,
    advertise_interval: Duration,
    advertising: Option<Advertising>,
    discovering: Option<Strategy>,
    endpoints: HashMap<EndpointId, Endpoint>,
}

impl DiscoveryEngine {
    pub fn new(local_id: EndpointId, config: &CoreConfig) -> Self {
        Self {
            local_id,
            service_id: config.service_id.clone(),
            staleness_timeout: config.staleness_timeout(),
            advertise_interval: config.advertise_interval(),
            advertising: None,
            discovering: None,
            endpoints: HashMap::new(),
        }
    }

    /// Start advertising. The first advertisement goes out immediately.
    pub fn start_advertising(
        &mut self,
        strategy: Strategy,
        display_name: &str,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<()> {
        if display_name.trim().is_empty() {
            return Err(NearbyError::InvalidArgument(
                "display name must not be empty".into(),
            ));
        }
        if self.advertising.is_some() {
            return Err(NearbyError::AlreadyAdvertising);
        }
        if let Some(active) = self.discovering {
            if active != strategy {
                return Err(NearbyError::IncompatibleStrategy {
                    requested: strategy,
                    active,
                });
            }
        }
        self.advertising = Some(Advertising {
            strategy,
            display_name: display_name.to_owned(),
            next_broadcast_at: now + self.advertise_interval,
        });
        out.broadcast(&self.advertisement(strategy, display_name));
        info!(?strategy, display_name, "advertising started");
        Ok(())
    }

    pub fn start_discovery(&mut self, strategy: Strategy) -> Result<()> {
        if self.discovering.is_some() {
            return Err(NearbyError::AlreadyDiscovering);
        }
        if let Some(adv) = &self.advertising {
            if adv.strategy != strategy {
                return Err(NearbyError::IncompatibleStrategy {
                    requested: strategy,
                    active: adv.strategy,
                });
            }
        }
        self.discovering = Some(strategy);
        info!(?strategy, "discovery started");
        Ok(())
    }

    /// Idempotent. Tells discoverers to drop us right away.
    pub fn stop_advertising(&mut self, out: &mut Outbox) {
        if self.advertising.take().is_some() {
            out.broadcast(&Message::AdvertisementWithdrawn {
                service_id: self.service_id.clone(),
            });
            info!("advertising stopped");
        }
    }

    /// Idempotent. Forgets every discovered endpoint without emitting `EndpointLost`.
    pub fn stop_discovery(&mut self) {
        if self.discovering.take().is_some() {
            self.endpoints.clear();
            info!("discovery stopped");
        }
    }

    pub fn advertising_strategy(&self) -> Option<Strategy> {
        self.advertising.as_ref().map(|a| a.strategy)
    }

    pub fn discovery_strategy(&self) -> Option<Strategy> {
        self.discovering
    }

    pub fn display_name(&self, endpoint_id: &EndpointId) -> Option<&str> {
        self.endpoints
            .get(endpoint_id)
            .map(|e| e.display_name.as_str())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_advertisement(
        &mut self,
        from: &EndpointId,
        protocol_version: u8,
        service_id: &str,
        strategy: Strategy,
        display_name: &str,
        now: Instant,
        out: &mut Outbox,
    ) {
        let Some(local_strategy) = self.discovering else {
            return;
        };
        if *from == self.local_id || service_id != self.service_id {
            return;
        }
        if protocol_version != PROTOCOL_VERSION || strategy != local_strategy {
            debug!(endpoint = %from, protocol_version, ?strategy, "ignoring incompatible advertisement");
            return;
        }
        match self.endpoints.get_mut(from) {
            Some(endpoint) => {
                endpoint.last_seen_at = now;
                endpoint.display_name = display_name.to_owned();
            }
            None => {
                self.endpoints.insert(
                    from.clone(),
                    Endpoint {
                        display_name: display_name.to_owned(),
                        strategy,
                        last_seen_at: now,
                    },
                );
                info!(endpoint = %from, display_name, "endpoint found");
                out.emit(Event::EndpointFound {
                    endpoint_id: from.clone(),
                    display_name: display_name.to_owned(),
                });
            }
        }
    }

    pub fn on_withdrawn(&mut self, from: &EndpointId, service_id: &str, out: &mut Outbox) {
        if service_id != self.service_id {
            return;
        }
        if self.endpoints.remove(from).is_some() {
            info!(endpoint = %from, "endpoint withdrew");
            out.emit(Event::EndpointLost {
                endpoint_id: from.clone(),
            });
        }
    }

    /// Re-broadcast when due; evict endpoints past the staleness timeout.
    pub fn tick(&mut self, now: Instant, out: &mut Outbox) {
        let due = match &mut self.advertising {
            Some(adv) if now >= adv.next_broadcast_at => {
                adv.next_broadcast_at = now + self.advertise_interval;
                Some((adv.strategy, adv.display_name.clone()))
            }
            _ => None,
        };
        if let Some((strategy, display_name)) = due {
            out.broadcast(&self.advertisement(strategy, &display_name));
        }

        let mut stale: Vec<EndpointId> = self
            .endpoints
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen_at) >= self.staleness_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        for endpoint_id in stale {
            self.endpoints.remove(&endpoint_id);
            info!(endpoint = %endpoint_id, "endpoint lost (stale)");
            out.emit(Event::EndpointLost { endpoint_id });
        }
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        let mut out: Vec<EndpointSnapshot> = self
            .endpoints
            .iter()
            .map(|(id, e)| EndpointSnapshot {
                endpoint_id: id.clone(),
                display_name: e.display_name.clone(),
                strategy: e.strategy,
                last_seen_at: e.last_seen_at,
            })
            .collect();
        out.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        out
    }

    fn advertisement(&self, strategy: Strategy, display_name: &str) -> Message {
        Message::Advertisement {
            protocol_version: PROTOCOL_VERSION,
            service_id: self.service_id.clone(),
            strategy,
            display_name: display_name.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;

    fn engine() -> DiscoveryEngine {
        DiscoveryEngine::new(EndpointId::from("local"), &CoreConfig::default())
    }

    fn events(out: Outbox) -> Vec<Event> {
        out.into_actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Emit(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn advertise(engine: &mut DiscoveryEngine, from: &str, now: Instant) -> Vec<Event> {
        let mut out = Outbox::new();
        engine.on_advertisement(
            &EndpointId::from(from),
            PROTOCOL_VERSION,
            "nearby",
            Strategy::Cluster,
            "peer",
            now,
            &mut out,
        );
        events(out)
    }

    #[test]
    fn second_start_fails_with_already() {
        let mut e = engine();
        let now = Instant::now();
        let mut out = Outbox::new();
        e.start_advertising(Strategy::Cluster, "me", now, &mut out).unwrap();
        assert!(matches!(out.into_actions()[0], Action::Broadcast(_)));
        assert_eq!(
            e.start_advertising(Strategy::Cluster, "me", now, &mut Outbox::new()),
            Err(NearbyError::AlreadyAdvertising)
        );
        e.start_discovery(Strategy::Cluster).unwrap();
        assert_eq!(
            e.start_discovery(Strategy::Cluster),
            Err(NearbyError::AlreadyDiscovering)
        );
    }

    #[test]
    fn restart_after_stop() {
        let mut e = engine();
        let now = Instant::now();
        e.start_advertising(Strategy::Star, "me", now, &mut Outbox::new()).unwrap();
        let mut out = Outbox::new();
        e.stop_advertising(&mut out);
        assert_eq!(out.into_actions().len(), 1);
        let mut out = Outbox::new();
        e.stop_advertising(&mut out);
        assert!(out.is_empty());
        e.start_advertising(Strategy::Star, "me", now, &mut Outbox::new()).unwrap();
    }

    #[test]
    fn mismatched_local_strategies_fail() {
        let mut e = engine();
        e.start_discovery(Strategy::Star).unwrap();
        let err = e
            .start_advertising(Strategy::Cluster, "me", Instant::now(), &mut Outbox::new())
            .unwrap_err();
        assert!(matches!(err, NearbyError::IncompatibleStrategy { .. }));
    }

    #[test]
    fn empty_name_is_invalid() {
        let mut e = engine();
        assert!(matches!(
            e.start_advertising(Strategy::Cluster, "  ", Instant::now(), &mut Outbox::new()),
            Err(NearbyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn found_once_then_refreshed_silently() {
        let mut e = engine();
        e.start_discovery(Strategy::Cluster).unwrap();
        let t0 = Instant::now();
        assert_eq!(advertise(&mut e, "peer-1", t0).len(), 1);
        assert!(advertise(&mut e, "peer-1", t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(e.display_name(&"peer-1".into()), Some("peer"));
    }

    #[test]
    fn ignores_advertisements_when_not_discovering() {
        let mut e = engine();
        assert!(advertise(&mut e, "peer-1", Instant::now()).is_empty());
        assert!(e.snapshots().is_empty());
    }

    #[test]
    fn ignores_other_strategy_service_and_self() {
        let mut e = engine();
        e.start_discovery(Strategy::Cluster).unwrap();
        let now = Instant::now();
        let mut out = Outbox::new();
        e.on_advertisement(&"p".into(), PROTOCOL_VERSION, "nearby", Strategy::Star, "p", now, &mut out);
        e.on_advertisement(&"q".into(), PROTOCOL_VERSION, "other", Strategy::Cluster, "q", now, &mut out);
        e.on_advertisement(&"r".into(), PROTOCOL_VERSION + 1, "nearby", Strategy::Cluster, "r", now, &mut out);
        e.on_advertisement(&"local".into(), PROTOCOL_VERSION, "nearby", Strategy::Cluster, "me", now, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn stale_endpoint_lost_exactly_once() {
        let mut e = engine();
        e.start_discovery(Strategy::Cluster).unwrap();
        let t0 = Instant::now();
        advertise(&mut e, "peer-1", t0);
        advertise(&mut e, "peer-2", t0 + Duration::from_secs(8));

        let mut out = Outbox::new();
        e.tick(t0 + Duration::from_secs(9), &mut out);
        assert!(events(out).is_empty());

        let mut out = Outbox::new();
        e.tick(t0 + Duration::from_secs(10), &mut out);
        assert_eq!(
            events(out),
            vec![Event::EndpointLost {
                endpoint_id: "peer-1".into()
            }]
        );
        assert_eq!(e.display_name(&"peer-1".into()), None);

        let mut out = Outbox::new();
        e.tick(t0 + Duration::from_secs(11), &mut out);
        assert!(events(out).is_empty());
        assert!(e.display_name(&"peer-2".into()).is_some());
    }

    #[test]
    fn withdrawal_emits_lost() {
        let mut e = engine();
        e.start_discovery(Strategy::Cluster).unwrap();
        advertise(&mut e, "peer-1", Instant::now());
        let mut out = Outbox::new();
        e.on_withdrawn(&"peer-1".into(), "nearby", &mut out);
        assert_eq!(events(out).len(), 1);
        let mut out = Outbox::new();
        e.on_withdrawn(&"peer-1".into(), "nearby", &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn advertising_rebroadcasts_on_interval() {
        let mut e = engine();
        let t0 = Instant::now();
        e.start_advertising(Strategy::Cluster, "me", t0, &mut Outbox::new()).unwrap();
        let mut out = Outbox::new();
        e.tick(t0 + Duration::from_millis(500), &mut out);
        assert!(out.is_empty());
        let mut out = Outbox::new();
        e.tick(t0 + Duration::from_secs(2), &mut out);
        assert!(matches!(out.into_actions().as_slice(), [Action::Broadcast(_)]));
    }

    #[test]
    fn stop_discovery_clears_endpoints() {
        let mut e = engine();
        e.start_discovery(Strategy::Cluster).unwrap();
        advertise(&mut e, "peer-1", Instant::now());
        e.stop_discovery();
        assert!(e.snapshots().is_empty());
        e.start_discovery(Strategy::Cluster).unwrap();
    }
}
