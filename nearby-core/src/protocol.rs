//! Nearby wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;
use crate::payload::PayloadId;
use crate::strategy::Strategy;

/// Current protocol version. Carried in advertisements and connection requests.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
/// The sending endpoint is never encoded: the transport reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Discovery: advertise presence, repeated while advertising.
    Advertisement {
        protocol_version: u8,
        service_id: String,
        strategy: Strategy,
        display_name: String,
    },
    /// Advertiser stopped; discoverers drop the endpoint right away.
    AdvertisementWithdrawn { service_id: String },
    /// Open a negotiation with the requester's handshake key.
    ConnectionRequest {
        protocol_version: u8,
        strategy: Strategy,
        display_name: String,
        public_key: PublicKey,
    },
    /// Responder's half of the key exchange.
    ConnectionHandshake { public_key: PublicKey },
    /// Accept or reject. A reject may arrive before any handshake.
    ConnectionDecision { accepted: bool },
    /// Tear down the connection (or abandon a pending one).
    Disconnect,
    /// One chunk of a payload. Every chunk carries the payload shape so the
    /// receiver can open a session from whichever chunk arrives first.
    PayloadChunk {
        payload_id: PayloadId,
        seq: u32,
        chunk_count: u32,
        total_bytes: u64,
        hash: [u8; 32],
        data: Vec<u8>,
    },
    /// Cumulative ack: every chunk below `next_expected` is held by the receiver.
    ChunkAck {
        payload_id: PayloadId,
        next_expected: u32,
    },
    /// Either side canceled the payload.
    PayloadCancel { payload_id: PayloadId },
    /// Either side gave up on the payload (corrupt data or no progress).
    PayloadAbort { payload_id: PayloadId },
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Advertisement { .. } => "advertisement",
            Message::AdvertisementWithdrawn { .. } => "advertisement-withdrawn",
            Message::ConnectionRequest { .. } => "connection-request",
            Message::ConnectionHandshake { .. } => "connection-handshake",
            Message::ConnectionDecision { .. } => "connection-decision",
            Message::Disconnect => "disconnect",
            Message::PayloadChunk { .. } => "payload-chunk",
            Message::ChunkAck { .. } => "chunk-ack",
            Message::PayloadCancel { .. } => "payload-cancel",
            Message::PayloadAbort { .. } => "payload-abort",
        }
    }
}
