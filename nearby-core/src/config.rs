//! Tunables for discovery, negotiation and payload transfer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Core configuration. Every field has a default so partial config files work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Only advertisements for this service are surfaced (default "nearby").
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Endpoint evicted when not refreshed for this long (default 10s).
    #[serde(default = "default_staleness_timeout_ms")]
    pub staleness_timeout_ms: u64,
    /// Re-broadcast period while advertising (default 2s).
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    /// Pending connection abandoned after this long (default 30s).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Payload chunk size in bytes (default 32 KiB). Clamped so one chunk
    /// frame stays under the frame limit.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Unacked chunks in flight per outgoing payload (default 8).
    #[serde(default = "default_send_window")]
    pub send_window: u32,
    /// Out-of-order chunks buffered per incoming payload (default 16).
    #[serde(default = "default_receive_window")]
    pub receive_window: u32,
    /// Resend unacked chunks after this long without progress (default 2s).
    #[serde(default = "default_retransmit_after_ms")]
    pub retransmit_after_ms: u64,
    /// Retransmission rounds before an outgoing payload fails (default 5).
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,
    /// Terminal sessions kept for duplicate suppression (default 5s).
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// Incoming payload fails after this long without a chunk (default 30s).
    #[serde(default = "default_payload_idle_timeout_ms")]
    pub payload_idle_timeout_ms: u64,
    /// Largest accepted payload (default 64 MiB).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
    /// Unfinished incoming payloads one endpoint may have open (default 8).
    #[serde(default = "default_max_incoming_payloads")]
    pub max_incoming_payloads: u32,
}

fn default_service_id() -> String {
    "nearby".to_owned()
}
fn default_staleness_timeout_ms() -> u64 {
    10_000
}
fn default_advertise_interval_ms() -> u64 {
    2_000
}
fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_chunk_size() -> u32 {
    32 * 1024
}
fn default_send_window() -> u32 {
    8
}
fn default_receive_window() -> u32 {
    16
}
fn default_retransmit_after_ms() -> u64 {
    2_000
}
fn default_max_retransmits() -> u32 {
    5
}
fn default_dedup_window_ms() -> u64 {
    5_000
}
fn default_payload_idle_timeout_ms() -> u64 {
    30_000
}
fn default_max_payload_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_max_incoming_payloads() -> u32 {
    8
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            staleness_timeout_ms: default_staleness_timeout_ms(),
            advertise_interval_ms: default_advertise_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            chunk_size: default_chunk_size(),
            send_window: default_send_window(),
            receive_window: default_receive_window(),
            retransmit_after_ms: default_retransmit_after_ms(),
            max_retransmits: default_max_retransmits(),
            dedup_window_ms: default_dedup_window_ms(),
            payload_idle_timeout_ms: default_payload_idle_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            max_incoming_payloads: default_max_incoming_payloads(),
        }
    }
}

impl CoreConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms)
    }

    pub fn advertise_interval(&self) -> Duration {
        Duration::from_millis(self.advertise_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn retransmit_after(&self) -> Duration {
        Duration::from_millis(self.retransmit_after_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn payload_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.payload_idle_timeout_ms)
    }
}
