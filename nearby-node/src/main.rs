// Nearby demo node: two coordinators on an in-memory hub discover each other,
// connect and move one payload.

use std::time::Duration;

use anyhow::{bail, Context};
use nearby_core::{ConnectionStatus, Event, PayloadStatus};
use nearby_node::{config, Coordinator, MemoryHub};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEMO_PAYLOAD_BYTES: usize = 100_000;
const DEMO_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("nearby-node {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nearby_node=info,nearby_core=info".into()),
        )
        .init();

    let cfg = config::load();
    tokio::select! {
        result = tokio::time::timeout(DEMO_TIMEOUT, run_demo(&cfg)) => {
            result.context("demo timed out")??;
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}

async fn run_demo(cfg: &config::NodeConfig) -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let (t, rx) = hub.join(format!("{}-adv", cfg.endpoint_name)).await;
    let (advertiser, mut adv_events) = Coordinator::spawn(cfg.core.clone(), cfg.tick_interval(), t, rx);
    let (t, rx) = hub.join(format!("{}-disc", cfg.endpoint_name)).await;
    let (discoverer, mut disc_events) = Coordinator::spawn(cfg.core.clone(), cfg.tick_interval(), t, rx);
    let (adv_id, disc_id) = (advertiser.local_id().clone(), discoverer.local_id().clone());

    let strategy = cfg.strategy()?;
    info!(?strategy, "starting demo");
    discoverer.start_discovery(strategy).await?;
    advertiser.start_advertising(strategy, &cfg.endpoint_name).await?;
    next_event(&mut disc_events, |e| matches!(e, Event::EndpointFound { .. })).await?;

    discoverer.request_connection(&adv_id, "discoverer").await?;
    for (node, events, peer) in [
        (&advertiser, &mut adv_events, &disc_id),
        (&discoverer, &mut disc_events, &adv_id),
    ] {
        let initiated = next_event(events, |e| matches!(e, Event::ConnectionInitiated { .. })).await?;
        if let Event::ConnectionInitiated { auth_token, .. } = initiated {
            info!(endpoint = %node.local_id(), peer = %peer, token = %auth_token, "accepting");
        }
        node.accept_connection(peer).await?;
    }
    for events in [&mut adv_events, &mut disc_events] {
        match next_event(events, |e| matches!(e, Event::ConnectionResult { .. })).await? {
            Event::ConnectionResult {
                status: ConnectionStatus::Ok,
                ..
            } => {}
            other => bail!("connection failed: {other:?}"),
        }
    }

    let data: Vec<u8> = (0..DEMO_PAYLOAD_BYTES).map(|i| (i % 251) as u8).collect();
    let payload_id = discoverer.send_payload(&adv_id, data.clone()).await?;
    match next_event(&mut adv_events, |e| matches!(e, Event::PayloadReceived { .. })).await? {
        Event::PayloadReceived { bytes, .. } if bytes == data => {}
        other => bail!("payload mismatch: {other:?}"),
    }
    let done = next_event(&mut disc_events, |e| {
        matches!(e, Event::PayloadTransferUpdate { status, .. } if status.is_terminal())
    })
    .await?;
    if let Event::PayloadTransferUpdate {
        status,
        bytes_transferred,
        ..
    } = done
    {
        if status != PayloadStatus::Success {
            bail!("payload {payload_id} ended {status:?}");
        }
        info!(payload = %payload_id, bytes_transferred, "payload delivered");
    }

    discoverer.shutdown().await?;
    advertiser.shutdown().await?;
    Ok(())
}

/// Next event matching `pred`, logging the ones skipped.
async fn next_event(
    events: &mut UnboundedReceiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> anyhow::Result<Event> {
    while let Some(event) = events.recv().await {
        if pred(&event) {
            return Ok(event);
        }
        info!(?event, "event");
    }
    bail!("event stream closed")
}
