//! Payload transfer manager: split outgoing payloads into chunks, pace them
//! with a sliding window, reassemble incoming chunks in sequence order.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::action::Outbox;
use crate::config::CoreConfig;
use crate::error::{NearbyError, Result};
use crate::event::Event;
use crate::identity::EndpointId;
use crate::protocol::Message;
use crate::wire::MAX_FRAME_LEN;

/// Room left in a frame for the chunk header around the data.
const CHUNK_HEADER_RESERVE: u32 = 1024;

/// Largest chunk whose frame still encodes.
pub const MAX_CHUNK_SIZE: u32 = MAX_FRAME_LEN - CHUNK_HEADER_RESERVE;

/// Payload identifier (UUID v4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PayloadId([u8; 16]);

impl PayloadId {
    pub fn random() -> Self {
        PayloadId(uuid::Uuid::new_v4().into_bytes())
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        uuid::Uuid::from_bytes(self.0).fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

impl PayloadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PayloadStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Immutable view of a payload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSnapshot {
    pub payload_id: PayloadId,
    pub endpoint_id: EndpointId,
    pub direction: Direction,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub status: PayloadStatus,
}

/// Byte range of one chunk within a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub seq: u32,
    pub start: usize,
    pub end: usize,
}

/// Split `total_len` bytes into fixed-size chunks. A zero chunk size means the
/// default; an empty payload still gets one (empty) chunk so the receiver hears of it.
pub fn split_into_chunks(total_len: usize, chunk_size: usize) -> Vec<ChunkRange> {
    let size = if chunk_size == 0 {
        default_chunk_size()
    } else {
        chunk_size
    };
    if total_len == 0 {
        return vec![ChunkRange {
            seq: 0,
            start: 0,
            end: 0,
        }];
    }
    let mut out = Vec::with_capacity(total_len.div_ceil(size));
    let mut start = 0usize;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkRange {
            seq: out.len() as u32,
            start,
            end,
        });
        start = end;
    }
    out
}

fn default_chunk_size() -> usize {
    CoreConfig::default().chunk_size as usize
}

/// SHA-256 of a chunk body.
pub fn hash_chunk(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

struct Outgoing {
    data: Vec<u8>,
    chunks: Vec<ChunkRange>,
    /// Next chunk never sent so far.
    next_to_send: u32,
    /// Every chunk below this is acknowledged.
    acked: u32,
    last_progress: Instant,
    retransmits: u32,
}

impl Outgoing {
    fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    fn acked_bytes(&self) -> u64 {
        match self.acked.checked_sub(1) {
            Some(last) => self.chunks[last as usize].end as u64,
            None => 0,
        }
    }

    fn chunk_message(&self, payload_id: PayloadId, seq: u32) -> Message {
        let range = self.chunks[seq as usize];
        let data = self.data[range.start..range.end].to_vec();
        Message::PayloadChunk {
            payload_id,
            seq,
            chunk_count: self.chunk_count(),
            total_bytes: self.data.len() as u64,
            hash: hash_chunk(&data),
            data,
        }
    }
}

struct Incoming {
    total_bytes: u64,
    chunk_count: u32,
    next_expected: u32,
    assembled: Vec<u8>,
    /// Out-of-order chunks waiting for the gap below them to fill.
    pending: BTreeMap<u32, Vec<u8>>,
    last_activity: Instant,
}

enum Transfer {
    Outgoing(Outgoing),
    Incoming(Incoming),
}

struct Session {
    endpoint_id: EndpointId,
    direction: Direction,
    total_bytes: u64,
    bytes_transferred: u64,
    status: PayloadStatus,
    /// Buffers; dropped as soon as the session is terminal.
    transfer: Option<Transfer>,
    finished_at: Option<Instant>,
}

impl Session {
    fn update_event(&self, payload_id: PayloadId) -> Event {
        Event::PayloadTransferUpdate {
            endpoint_id: self.endpoint_id.clone(),
            payload_id,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            status: self.status,
        }
    }

    fn finish(&mut self, status: PayloadStatus, now: Instant) {
        self.status = status;
        self.transfer = None;
        self.finished_at = Some(now);
    }
}

/// Why an incoming chunk was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
enum ChunkFault {
    #[error("hash mismatch")]
    HashMismatch,
    #[error("sequence number out of range")]
    SeqOutOfRange,
    #[error("chunk beyond receive window")]
    BeyondWindow,
    #[error("payload shape changed mid-transfer")]
    ShapeMismatch,
    #[error("reassembled length does not match total")]
    LengthMismatch,
}

pub struct PayloadManager {
    chunk_size: usize,
    send_window: u32,
    receive_window: u32,
    retransmit_after: Duration,
    max_retransmits: u32,
    dedup_window: Duration,
    idle_timeout: Duration,
    max_payload_bytes: u64,
    max_incoming: usize,
    sessions: HashMap<PayloadId, Session>,
}

impl PayloadManager {
    pub fn new(config: &CoreConfig) -> Self {
        let chunk_size = config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        if chunk_size != config.chunk_size {
            warn!(
                configured = config.chunk_size,
                using = chunk_size,
                "chunk size out of range"
            );
        }
        Self {
            chunk_size: chunk_size as usize,
            send_window: config.send_window.max(1),
            receive_window: config.receive_window.max(1),
            retransmit_after: config.retransmit_after(),
            max_retransmits: config.max_retransmits,
            dedup_window: config.dedup_window(),
            idle_timeout: config.payload_idle_timeout(),
            max_payload_bytes: config.max_payload_bytes,
            max_incoming: config.max_incoming_payloads.max(1) as usize,
            sessions: HashMap::new(),
        }
    }

    /// Start an outgoing transfer. Returns at once; chunks flow as acks arrive.
    pub fn send(
        &mut self,
        endpoint_id: &EndpointId,
        data: Vec<u8>,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<PayloadId> {
        if data.len() as u64 > self.max_payload_bytes {
            return Err(NearbyError::InvalidArgument(format!(
                "payload of {} bytes exceeds limit of {}",
                data.len(),
                self.max_payload_bytes
            )));
        }
        let payload_id = PayloadId::random();
        let chunks = split_into_chunks(data.len(), self.chunk_size);
        let session = Session {
            endpoint_id: endpoint_id.clone(),
            direction: Direction::Outgoing,
            total_bytes: data.len() as u64,
            bytes_transferred: 0,
            status: PayloadStatus::InProgress,
            transfer: Some(Transfer::Outgoing(Outgoing {
                data,
                chunks,
                next_to_send: 0,
                acked: 0,
                last_progress: now,
                retransmits: 0,
            })),
            finished_at: None,
        };
        out.emit(session.update_event(payload_id));
        info!(
            endpoint = %endpoint_id,
            payload = %payload_id,
            bytes = session.total_bytes,
            "sending payload"
        );
        self.sessions.insert(payload_id, session);
        self.pump(payload_id, out);
        Ok(payload_id)
    }

    /// Cancel either direction. Terminal sessions are a successful no-op.
    pub fn cancel(&mut self, payload_id: PayloadId, now: Instant, out: &mut Outbox) -> Result<()> {
        let session = self.sessions.get_mut(&payload_id).ok_or_else(|| {
            NearbyError::InvalidArgument(format!("unknown payload {payload_id}"))
        })?;
        if session.status.is_terminal() {
            return Ok(());
        }
        session.finish(PayloadStatus::Canceled, now);
        out.send(&session.endpoint_id, &Message::PayloadCancel { payload_id });
        out.emit(session.update_event(payload_id));
        info!(payload = %payload_id, "payload canceled");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_chunk(
        &mut self,
        from: &EndpointId,
        payload_id: PayloadId,
        seq: u32,
        chunk_count: u32,
        total_bytes: u64,
        hash: [u8; 32],
        data: Vec<u8>,
        now: Instant,
        out: &mut Outbox,
    ) {
        if !self.sessions.contains_key(&payload_id) {
            if let Err(reason) = self
                .validate_shape(chunk_count, total_bytes)
                .and_then(|()| self.check_incoming_limit(from))
            {
                warn!(endpoint = %from, payload = %payload_id, "refusing payload: {reason}");
                out.send(from, &Message::PayloadAbort { payload_id });
                return;
            }
            let session = Session {
                endpoint_id: from.clone(),
                direction: Direction::Incoming,
                total_bytes,
                bytes_transferred: 0,
                status: PayloadStatus::InProgress,
                transfer: Some(Transfer::Incoming(Incoming {
                    total_bytes,
                    chunk_count,
                    next_expected: 0,
                    // Grows with verified chunks; the claimed total is not trusted up front.
                    assembled: Vec::new(),
                    pending: BTreeMap::new(),
                    last_activity: now,
                })),
                finished_at: None,
            };
            out.emit(session.update_event(payload_id));
            info!(endpoint = %from, payload = %payload_id, bytes = total_bytes, "receiving payload");
            self.sessions.insert(payload_id, session);
        }

        let receive_window = self.receive_window;
        let Some(session) = self.sessions.get_mut(&payload_id) else {
            return;
        };
        if session.endpoint_id != *from || session.direction != Direction::Incoming {
            warn!(endpoint = %from, payload = %payload_id, "chunk for foreign payload ignored");
            return;
        }
        let incoming = match &mut session.transfer {
            Some(Transfer::Incoming(incoming)) => incoming,
            _ => {
                // Terminal: a retransmission after we finished. Re-ack success so the
                // sender can finish too; otherwise stay silent.
                if session.status == PayloadStatus::Success {
                    out.send(
                        from,
                        &Message::ChunkAck {
                            payload_id,
                            next_expected: chunk_count,
                        },
                    );
                }
                return;
            }
        };
        incoming.last_activity = now;

        let result = accept_chunk(incoming, receive_window, seq, chunk_count, total_bytes, &hash, data);
        match result {
            Ok(progressed) => {
                let next_expected = incoming.next_expected;
                let complete = next_expected == incoming.chunk_count;
                let assembled_len = incoming.assembled.len() as u64;
                out.send(
                    from,
                    &Message::ChunkAck {
                        payload_id,
                        next_expected,
                    },
                );
                if !complete {
                    if progressed {
                        session.bytes_transferred = assembled_len;
                        out.emit(session.update_event(payload_id));
                    }
                    return;
                }
                let bytes = match session.transfer.take() {
                    Some(Transfer::Incoming(incoming)) => incoming.assembled,
                    _ => Vec::new(),
                };
                session.bytes_transferred = bytes.len() as u64;
                session.finish(PayloadStatus::Success, now);
                info!(endpoint = %from, payload = %payload_id, bytes = bytes.len(), "payload received");
                out.emit(Event::PayloadReceived {
                    endpoint_id: from.clone(),
                    payload_id,
                    bytes,
                });
                out.emit(session.update_event(payload_id));
            }
            Err(fault) => {
                warn!(endpoint = %from, payload = %payload_id, seq, "payload corrupt: {fault}");
                session.finish(PayloadStatus::Failure, now);
                out.send(from, &Message::PayloadAbort { payload_id });
                out.emit(session.update_event(payload_id));
            }
        }
    }

    pub fn on_ack(
        &mut self,
        from: &EndpointId,
        payload_id: PayloadId,
        next_expected: u32,
        now: Instant,
        out: &mut Outbox,
    ) {
        let Some(session) = self.sessions.get_mut(&payload_id) else {
            return;
        };
        if session.endpoint_id != *from {
            return;
        }
        let Some(Transfer::Outgoing(outgoing)) = &mut session.transfer else {
            return;
        };
        // Never trust an ack for chunks we have not sent yet.
        let acked = next_expected.min(outgoing.next_to_send);
        if acked <= outgoing.acked {
            return;
        }
        outgoing.acked = acked;
        outgoing.last_progress = now;
        outgoing.retransmits = 0;
        session.bytes_transferred = outgoing.acked_bytes();
        if acked == outgoing.chunk_count() {
            session.finish(PayloadStatus::Success, now);
            info!(endpoint = %from, payload = %payload_id, "payload delivered");
            out.emit(session.update_event(payload_id));
            return;
        }
        out.emit(session.update_event(payload_id));
        self.pump(payload_id, out);
    }

    /// Peer canceled. Unknown ids leave a silent tombstone so chunks that
    /// overtook the cancel cannot resurrect the payload.
    pub fn on_cancel(&mut self, from: &EndpointId, payload_id: PayloadId, now: Instant, out: &mut Outbox) {
        self.on_peer_stop(from, payload_id, PayloadStatus::Canceled, now, out);
    }

    /// Peer gave up (corrupt data or timeout on its side).
    pub fn on_abort(&mut self, from: &EndpointId, payload_id: PayloadId, now: Instant, out: &mut Outbox) {
        self.on_peer_stop(from, payload_id, PayloadStatus::Failure, now, out);
    }

    /// Connection gone: fail everything still running for the endpoint.
    pub fn fail_endpoint(&mut self, endpoint_id: &EndpointId, now: Instant, out: &mut Outbox) {
        let mut ids: Vec<PayloadId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.endpoint_id == *endpoint_id && !s.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        for payload_id in ids {
            if let Some(session) = self.sessions.get_mut(&payload_id) {
                session.finish(PayloadStatus::Failure, now);
                debug!(endpoint = %endpoint_id, payload = %payload_id, "payload failed with connection");
                out.emit(session.update_event(payload_id));
            }
        }
    }

    /// Retransmit stalled sends, fail idle receives, forget old terminal sessions.
    pub fn tick(&mut self, now: Instant, out: &mut Outbox) {
        let mut ids: Vec<PayloadId> = self.sessions.keys().copied().collect();
        ids.sort();
        let mut resend = Vec::new();
        for payload_id in ids {
            let Some(session) = self.sessions.get_mut(&payload_id) else {
                continue;
            };
            match &mut session.transfer {
                Some(Transfer::Outgoing(outgoing)) => {
                    if now.saturating_duration_since(outgoing.last_progress) < self.retransmit_after {
                        continue;
                    }
                    if outgoing.retransmits >= self.max_retransmits {
                        warn!(payload = %payload_id, "no ack progress, giving up");
                        session.finish(PayloadStatus::Failure, now);
                        out.send(&session.endpoint_id, &Message::PayloadAbort { payload_id });
                        out.emit(session.update_event(payload_id));
                        continue;
                    }
                    outgoing.retransmits += 1;
                    outgoing.last_progress = now;
                    debug!(payload = %payload_id, from_seq = outgoing.acked, round = outgoing.retransmits, "retransmitting");
                    resend.push(payload_id);
                }
                Some(Transfer::Incoming(incoming)) => {
                    if now.saturating_duration_since(incoming.last_activity) >= self.idle_timeout {
                        warn!(payload = %payload_id, "incoming payload idle, giving up");
                        session.finish(PayloadStatus::Failure, now);
                        out.send(&session.endpoint_id, &Message::PayloadAbort { payload_id });
                        out.emit(session.update_event(payload_id));
                    }
                }
                None => {}
            }
        }
        for payload_id in resend {
            self.resend_unacked(payload_id, out);
        }

        let dedup_window = self.dedup_window;
        self.sessions.retain(|_, s| match s.finished_at {
            Some(at) => now.saturating_duration_since(at) < dedup_window,
            None => true,
        });
    }

    pub fn status(&self, payload_id: &PayloadId) -> Option<PayloadStatus> {
        self.sessions.get(payload_id).map(|s| s.status)
    }

    pub fn snapshots(&self) -> Vec<PayloadSnapshot> {
        let mut out: Vec<PayloadSnapshot> = self
            .sessions
            .iter()
            .map(|(id, s)| PayloadSnapshot {
                payload_id: *id,
                endpoint_id: s.endpoint_id.clone(),
                direction: s.direction,
                total_bytes: s.total_bytes,
                bytes_transferred: s.bytes_transferred,
                status: s.status,
            })
            .collect();
        out.sort_by_key(|s| s.payload_id);
        out
    }

    /// Send new chunks while the window has room.
    fn pump(&mut self, payload_id: PayloadId, out: &mut Outbox) {
        let send_window = self.send_window;
        let Some(session) = self.sessions.get_mut(&payload_id) else {
            return;
        };
        let Some(Transfer::Outgoing(outgoing)) = &mut session.transfer else {
            return;
        };
        let limit = outgoing
            .acked
            .saturating_add(send_window)
            .min(outgoing.chunk_count());
        while outgoing.next_to_send < limit {
            let msg = outgoing.chunk_message(payload_id, outgoing.next_to_send);
            out.send(&session.endpoint_id, &msg);
            outgoing.next_to_send += 1;
        }
    }

    fn resend_unacked(&self, payload_id: PayloadId, out: &mut Outbox) {
        let Some(session) = self.sessions.get(&payload_id) else {
            return;
        };
        let Some(Transfer::Outgoing(outgoing)) = &session.transfer else {
            return;
        };
        for seq in outgoing.acked..outgoing.next_to_send {
            out.send(&session.endpoint_id, &outgoing.chunk_message(payload_id, seq));
        }
    }

    fn on_peer_stop(
        &mut self,
        from: &EndpointId,
        payload_id: PayloadId,
        status: PayloadStatus,
        now: Instant,
        out: &mut Outbox,
    ) {
        match self.sessions.get_mut(&payload_id) {
            Some(session) => {
                if session.endpoint_id != *from || session.status.is_terminal() {
                    return;
                }
                session.finish(status, now);
                info!(endpoint = %from, payload = %payload_id, ?status, "payload stopped by peer");
                out.emit(session.update_event(payload_id));
            }
            None => {
                self.sessions.insert(
                    payload_id,
                    Session {
                        endpoint_id: from.clone(),
                        direction: Direction::Incoming,
                        total_bytes: 0,
                        bytes_transferred: 0,
                        status,
                        transfer: None,
                        finished_at: Some(now),
                    },
                );
            }
        }
    }

    fn check_incoming_limit(&self, from: &EndpointId) -> std::result::Result<(), String> {
        let open = self
            .sessions
            .values()
            .filter(|s| {
                s.endpoint_id == *from && s.direction == Direction::Incoming && !s.status.is_terminal()
            })
            .count();
        if open >= self.max_incoming {
            return Err(format!("{open} incoming payloads already open"));
        }
        Ok(())
    }

    fn validate_shape(&self, chunk_count: u32, total_bytes: u64) -> std::result::Result<(), String> {
        if total_bytes > self.max_payload_bytes {
            return Err(format!("{total_bytes} bytes exceeds limit"));
        }
        if chunk_count == 0 || (total_bytes == 0 && chunk_count != 1) {
            return Err(format!("{chunk_count} chunks for {total_bytes} bytes"));
        }
        if u64::from(chunk_count) > total_bytes.max(1) {
            return Err(format!("{chunk_count} chunks for {total_bytes} bytes"));
        }
        Ok(())
    }
}

/// Store one chunk; move every contiguous chunk into the assembled buffer.
/// Returns whether `next_expected` advanced. Duplicates are accepted silently.
#[allow(clippy::too_many_arguments)]
fn accept_chunk(
    incoming: &mut Incoming,
    receive_window: u32,
    seq: u32,
    chunk_count: u32,
    total_bytes: u64,
    hash: &[u8; 32],
    data: Vec<u8>,
) -> std::result::Result<bool, ChunkFault> {
    if chunk_count != incoming.chunk_count || total_bytes != incoming.total_bytes {
        return Err(ChunkFault::ShapeMismatch);
    }
    if seq >= incoming.chunk_count {
        return Err(ChunkFault::SeqOutOfRange);
    }
    if hash_chunk(&data) != *hash {
        return Err(ChunkFault::HashMismatch);
    }
    if seq < incoming.next_expected || incoming.pending.contains_key(&seq) {
        return Ok(false);
    }
    if seq >= incoming.next_expected.saturating_add(receive_window) {
        return Err(ChunkFault::BeyondWindow);
    }
    incoming.pending.insert(seq, data);

    let before = incoming.next_expected;
    while let Some(data) = incoming.pending.remove(&incoming.next_expected) {
        if incoming.assembled.len() as u64 + data.len() as u64 > total_bytes {
            return Err(ChunkFault::LengthMismatch);
        }
        incoming.assembled.extend_from_slice(&data);
        incoming.next_expected += 1;
    }
    if incoming.next_expected == incoming.chunk_count && incoming.assembled.len() as u64 != total_bytes {
        return Err(ChunkFault::LengthMismatch);
    }
    Ok(incoming.next_expected > before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::wire::decode_datagram;

    fn sender() -> EndpointId {
        "sender".into()
    }

    fn receiver() -> EndpointId {
        "receiver".into()
    }

    fn small_chunks() -> CoreConfig {
        CoreConfig {
            chunk_size: 3,
            ..CoreConfig::default()
        }
    }

    /// Split an outbox into decoded frames and events.
    fn drain(out: Outbox) -> (Vec<Message>, Vec<Event>) {
        let mut frames = Vec::new();
        let mut events = Vec::new();
        for action in out.into_actions() {
            match action {
                Action::Send(_, bytes) => frames.push(decode_datagram(&bytes).unwrap()),
                Action::Emit(e) => events.push(e),
                Action::Broadcast(_) | Action::Release(_) => {}
            }
        }
        (frames, events)
    }

    fn deliver(
        to: &mut PayloadManager,
        from: &EndpointId,
        msg: Message,
        now: Instant,
    ) -> (Vec<Message>, Vec<Event>) {
        let mut out = Outbox::new();
        match msg {
            Message::PayloadChunk {
                payload_id,
                seq,
                chunk_count,
                total_bytes,
                hash,
                data,
            } => to.on_chunk(from, payload_id, seq, chunk_count, total_bytes, hash, data, now, &mut out),
            Message::ChunkAck {
                payload_id,
                next_expected,
            } => to.on_ack(from, payload_id, next_expected, now, &mut out),
            Message::PayloadCancel { payload_id } => to.on_cancel(from, payload_id, now, &mut out),
            Message::PayloadAbort { payload_id } => to.on_abort(from, payload_id, now, &mut out),
            other => panic!("unexpected {}", other.kind()),
        }
        drain(out)
    }

    fn start(tx: &mut PayloadManager, data: Vec<u8>, now: Instant) -> (PayloadId, Vec<Message>) {
        let mut out = Outbox::new();
        let id = tx.send(&receiver(), data, now, &mut out).unwrap();
        let (frames, events) = drain(out);
        assert!(matches!(
            events.as_slice(),
            [Event::PayloadTransferUpdate {
                status: PayloadStatus::InProgress,
                bytes_transferred: 0,
                ..
            }]
        ));
        (id, frames)
    }

    fn received(events: &[Event]) -> Option<&Vec<u8>> {
        events.iter().find_map(|e| match e {
            Event::PayloadReceived { bytes, .. } => Some(bytes),
            _ => None,
        })
    }

    fn last_update(events: &[Event]) -> Option<(u64, PayloadStatus)> {
        events.iter().rev().find_map(|e| match e {
            Event::PayloadTransferUpdate {
                bytes_transferred,
                status,
                ..
            } => Some((*bytes_transferred, *status)),
            _ => None,
        })
    }

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 30));
        assert_eq!((chunks[3].seq, chunks[3].start, chunks[3].end), (3, 90, 100));
        assert_eq!(split_into_chunks(90, 30).len(), 3);
        assert_eq!(split_into_chunks(10, 100).len(), 1);
    }

    #[test]
    fn split_empty_payload_is_one_empty_chunk() {
        let chunks = split_into_chunks(0, 30);
        assert_eq!(chunks, vec![ChunkRange { seq: 0, start: 0, end: 0 }]);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let size = default_chunk_size();
        assert_eq!(split_into_chunks(size * 2, 0).len(), 2);
    }

    #[test]
    fn every_reordering_reassembles() {
        let data: Vec<u8> = (0..10u8).collect();
        let orders: [[usize; 4]; 24] = [
            [0, 1, 2, 3], [0, 1, 3, 2], [0, 2, 1, 3], [0, 2, 3, 1], [0, 3, 1, 2], [0, 3, 2, 1],
            [1, 0, 2, 3], [1, 0, 3, 2], [1, 2, 0, 3], [1, 2, 3, 0], [1, 3, 0, 2], [1, 3, 2, 0],
            [2, 0, 1, 3], [2, 0, 3, 1], [2, 1, 0, 3], [2, 1, 3, 0], [2, 3, 0, 1], [2, 3, 1, 0],
            [3, 0, 1, 2], [3, 0, 2, 1], [3, 1, 0, 2], [3, 1, 2, 0], [3, 2, 0, 1], [3, 2, 1, 0],
        ];
        for order in orders {
            let now = Instant::now();
            let mut tx = PayloadManager::new(&small_chunks());
            let mut rx = PayloadManager::new(&small_chunks());
            let (id, frames) = start(&mut tx, data.clone(), now);
            assert_eq!(frames.len(), 4);

            let mut events = Vec::new();
            let mut acks = Vec::new();
            for i in order {
                let (f, e) = deliver(&mut rx, &sender(), frames[i].clone(), now);
                acks.extend(f);
                events.extend(e);
            }
            assert_eq!(received(&events), Some(&data), "order {order:?}");
            assert_eq!(last_update(&events), Some((10, PayloadStatus::Success)));
            let pieces = events
                .iter()
                .filter(|e| matches!(e, Event::PayloadReceived { .. }))
                .count();
            assert_eq!(pieces, 1);

            let mut sender_events = Vec::new();
            for ack in acks {
                let (_, e) = deliver(&mut tx, &receiver(), ack, now);
                sender_events.extend(e);
            }
            assert_eq!(last_update(&sender_events), Some((10, PayloadStatus::Success)));
            assert_eq!(tx.status(&id), Some(PayloadStatus::Success));
        }
    }

    #[test]
    fn window_paces_outgoing_chunks() {
        let now = Instant::now();
        let config = CoreConfig {
            chunk_size: 1,
            send_window: 4,
            ..CoreConfig::default()
        };
        let mut tx = PayloadManager::new(&config);
        let (id, frames) = start(&mut tx, vec![7u8; 10], now);
        assert_eq!(frames.len(), 4);

        let (frames, events) = deliver(
            &mut tx,
            &receiver(),
            Message::ChunkAck {
                payload_id: id,
                next_expected: 2,
            },
            now,
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(last_update(&events), Some((2, PayloadStatus::InProgress)));

        // Acks beyond what was sent are clamped.
        let (frames, _) = deliver(
            &mut tx,
            &receiver(),
            Message::ChunkAck {
                payload_id: id,
                next_expected: 9,
            },
            now,
        );
        assert_eq!(frames.len(), 4);
        assert_eq!(tx.status(&id), Some(PayloadStatus::InProgress));
    }

    #[test]
    fn gap_beyond_window_is_corrupt() {
        let now = Instant::now();
        let config = CoreConfig {
            chunk_size: 1,
            receive_window: 2,
            send_window: 16,
            ..CoreConfig::default()
        };
        let mut tx = PayloadManager::new(&config);
        let mut rx = PayloadManager::new(&config);
        let (_, frames) = start(&mut tx, vec![1u8; 8], now);

        let (_, events) = deliver(&mut rx, &sender(), frames[1].clone(), now);
        assert_eq!(last_update(&events), Some((0, PayloadStatus::InProgress)));

        let (reply, events) = deliver(&mut rx, &sender(), frames[5].clone(), now);
        assert!(matches!(reply.as_slice(), [Message::PayloadAbort { .. }]));
        assert_eq!(last_update(&events), Some((0, PayloadStatus::Failure)));

        // Nothing else completes it.
        for f in frames {
            let (_, events) = deliver(&mut rx, &sender(), f, now);
            assert!(received(&events).is_none());
        }
    }

    #[test]
    fn hash_mismatch_is_corrupt_and_fails_sender() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let mut rx = PayloadManager::new(&small_chunks());
        let (id, mut frames) = start(&mut tx, b"hello world".to_vec(), now);
        if let Message::PayloadChunk { data, .. } = &mut frames[0] {
            data[0] ^= 0xff;
        }
        let (reply, events) = deliver(&mut rx, &sender(), frames[0].clone(), now);
        assert_eq!(last_update(&events), Some((0, PayloadStatus::Failure)));

        let (_, events) = deliver(&mut tx, &receiver(), reply[0].clone(), now);
        assert_eq!(last_update(&events), Some((0, PayloadStatus::Failure)));
        assert_eq!(tx.status(&id), Some(PayloadStatus::Failure));
    }

    #[test]
    fn cancel_mid_transfer_never_completes() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let mut rx = PayloadManager::new(&small_chunks());
        let (id, frames) = start(&mut tx, (0..12u8).collect(), now);

        let mut events = Vec::new();
        for f in &frames[..2] {
            events.extend(deliver(&mut rx, &sender(), f.clone(), now).1);
        }

        let mut out = Outbox::new();
        tx.cancel(id, now, &mut out).unwrap();
        let (cancel, sender_events) = drain(out);
        assert_eq!(last_update(&sender_events), Some((0, PayloadStatus::Canceled)));

        events.extend(deliver(&mut rx, &sender(), cancel[0].clone(), now).1);
        for f in &frames[2..] {
            events.extend(deliver(&mut rx, &sender(), f.clone(), now).1);
        }
        assert!(received(&events).is_none());
        assert_eq!(last_update(&events).map(|(_, s)| s), Some(PayloadStatus::Canceled));
        assert_eq!(rx.status(&id), Some(PayloadStatus::Canceled));

        // Idempotent, and late acks change nothing.
        let mut out = Outbox::new();
        tx.cancel(id, now, &mut out).unwrap();
        assert!(out.is_empty());
        let (_, events) = deliver(
            &mut tx,
            &receiver(),
            Message::ChunkAck {
                payload_id: id,
                next_expected: 4,
            },
            now,
        );
        assert!(events.is_empty());
        assert_eq!(tx.status(&id), Some(PayloadStatus::Canceled));
    }

    #[test]
    fn cancel_overtaking_chunks_leaves_tombstone() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let mut rx = PayloadManager::new(&small_chunks());
        let (id, frames) = start(&mut tx, vec![9u8; 6], now);
        let mut out = Outbox::new();
        tx.cancel(id, now, &mut out).unwrap();
        let (cancel, _) = drain(out);

        let (_, events) = deliver(&mut rx, &sender(), cancel[0].clone(), now);
        assert!(events.is_empty());
        for f in frames {
            let (_, events) = deliver(&mut rx, &sender(), f, now);
            assert!(events.is_empty());
        }
    }

    #[test]
    fn duplicate_after_success_reacks_without_second_delivery() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let mut rx = PayloadManager::new(&small_chunks());
        let (_, frames) = start(&mut tx, vec![5u8; 3], now);
        let (_, events) = deliver(&mut rx, &sender(), frames[0].clone(), now);
        assert!(received(&events).is_some());

        let (reply, events) = deliver(&mut rx, &sender(), frames[0].clone(), now);
        assert!(events.is_empty());
        assert!(matches!(
            reply.as_slice(),
            [Message::ChunkAck {
                next_expected: 1,
                ..
            }]
        ));
    }

    #[test]
    fn terminal_sessions_purged_after_dedup_window() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let (id, _) = start(&mut tx, vec![1u8; 3], now);
        tx.cancel(id, now, &mut Outbox::new()).unwrap();

        tx.tick(now + Duration::from_secs(4), &mut Outbox::new());
        assert_eq!(tx.status(&id), Some(PayloadStatus::Canceled));
        tx.tick(now + Duration::from_secs(5), &mut Outbox::new());
        assert_eq!(tx.status(&id), None);
        assert!(matches!(
            tx.cancel(id, now, &mut Outbox::new()),
            Err(NearbyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn stalled_send_retransmits_then_fails() {
        let now = Instant::now();
        let config = CoreConfig {
            chunk_size: 3,
            max_retransmits: 2,
            ..CoreConfig::default()
        };
        let mut tx = PayloadManager::new(&config);
        let (id, frames) = start(&mut tx, vec![1u8; 6], now);
        assert_eq!(frames.len(), 2);

        let step = Duration::from_millis(config.retransmit_after_ms);
        let mut out = Outbox::new();
        tx.tick(now + step / 2, &mut out);
        assert!(out.is_empty());

        for round in 1..=2u32 {
            let mut out = Outbox::new();
            tx.tick(now + step * round, &mut out);
            let (frames, events) = drain(out);
            assert_eq!(frames.len(), 2, "round {round}");
            assert!(events.is_empty());
        }

        let mut out = Outbox::new();
        tx.tick(now + step * 3, &mut out);
        let (frames, events) = drain(out);
        assert!(matches!(frames.as_slice(), [Message::PayloadAbort { .. }]));
        assert_eq!(last_update(&events), Some((0, PayloadStatus::Failure)));
        assert_eq!(tx.status(&id), Some(PayloadStatus::Failure));
    }

    #[test]
    fn idle_incoming_payload_fails() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let mut rx = PayloadManager::new(&small_chunks());
        let (id, frames) = start(&mut tx, vec![1u8; 6], now);
        deliver(&mut rx, &sender(), frames[1].clone(), now);

        let mut out = Outbox::new();
        rx.tick(now + Duration::from_secs(30), &mut out);
        let (frames, events) = drain(out);
        assert!(matches!(frames.as_slice(), [Message::PayloadAbort { .. }]));
        assert_eq!(last_update(&events), Some((0, PayloadStatus::Failure)));
        assert_eq!(rx.status(&id), Some(PayloadStatus::Failure));
    }

    #[test]
    fn connection_loss_fails_only_that_endpoint() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let (a, _) = start(&mut tx, vec![1u8; 6], now);
        let mut out = Outbox::new();
        let b = tx.send(&"other".into(), vec![2u8; 6], now, &mut out).unwrap();

        let mut out = Outbox::new();
        tx.fail_endpoint(&receiver(), now, &mut out);
        let (_, events) = drain(out);
        assert_eq!(events.len(), 1);
        assert_eq!(tx.status(&a), Some(PayloadStatus::Failure));
        assert_eq!(tx.status(&b), Some(PayloadStatus::InProgress));
    }

    #[test]
    fn oversized_payload_rejected() {
        let config = CoreConfig {
            max_payload_bytes: 4,
            ..CoreConfig::default()
        };
        let mut tx = PayloadManager::new(&config);
        let mut out = Outbox::new();
        assert!(matches!(
            tx.send(&receiver(), vec![0u8; 5], Instant::now(), &mut out),
            Err(NearbyError::InvalidArgument(_))
        ));
        assert!(out.is_empty());
        assert!(tx.snapshots().is_empty());
    }

    /// First chunk of a payload that claims `total_bytes`, carrying one byte at `seq` 1.
    fn claim(rx: &mut PayloadManager, payload_id: PayloadId, total_bytes: u64, now: Instant) -> Vec<Message> {
        let data = vec![1u8];
        let mut out = Outbox::new();
        rx.on_chunk(
            &sender(),
            payload_id,
            1,
            2048,
            total_bytes,
            hash_chunk(&data),
            data,
            now,
            &mut out,
        );
        drain(out).0
    }

    #[test]
    fn claimed_total_is_not_reserved_up_front() {
        let now = Instant::now();
        let config = CoreConfig::default();
        let mut rx = PayloadManager::new(&config);
        for _ in 0..4 {
            claim(&mut rx, PayloadId::random(), config.max_payload_bytes, now);
        }
        let reserved: usize = rx
            .sessions
            .values()
            .filter_map(|s| match &s.transfer {
                Some(Transfer::Incoming(incoming)) => Some(incoming.assembled.capacity()),
                _ => None,
            })
            .sum();
        assert_eq!(reserved, 0);
        assert_eq!(rx.snapshots().len(), 4);
    }

    #[test]
    fn incoming_payloads_capped_per_endpoint() {
        let now = Instant::now();
        let config = CoreConfig {
            max_incoming_payloads: 2,
            ..CoreConfig::default()
        };
        let mut rx = PayloadManager::new(&config);
        let (first, second, third) = (PayloadId::random(), PayloadId::random(), PayloadId::random());
        assert!(matches!(claim(&mut rx, first, 4096, now).as_slice(), [Message::ChunkAck { .. }]));
        claim(&mut rx, second, 4096, now);

        let refused = claim(&mut rx, third, 4096, now);
        assert!(matches!(
            refused.as_slice(),
            [Message::PayloadAbort { payload_id }] if *payload_id == third
        ));
        assert_eq!(rx.status(&third), None);

        // Another endpoint has its own allowance.
        let data = vec![1u8];
        let mut out = Outbox::new();
        let other = PayloadId::random();
        rx.on_chunk(&"other".into(), other, 0, 2, 2, hash_chunk(&data), data, now, &mut out);
        assert_eq!(rx.status(&other), Some(PayloadStatus::InProgress));

        // A finished session frees its slot.
        rx.on_cancel(&sender(), first, now, &mut Outbox::new());
        claim(&mut rx, third, 4096, now);
        assert_eq!(rx.status(&third), Some(PayloadStatus::InProgress));
    }

    #[test]
    fn oversized_chunk_size_clamped_to_frame_limit() {
        let now = Instant::now();
        let config = CoreConfig {
            chunk_size: 17 * 1024 * 1024,
            max_payload_bytes: 32 * 1024 * 1024,
            ..CoreConfig::default()
        };
        let mut tx = PayloadManager::new(&config);
        assert_eq!(tx.chunk_size, MAX_CHUNK_SIZE as usize);

        let mut out = Outbox::new();
        tx.send(&receiver(), vec![4u8; 17 * 1024 * 1024], now, &mut out)
            .unwrap();
        let frames: Vec<usize> = out
            .into_actions()
            .into_iter()
            .filter_map(|action| match action {
                Action::Send(_, bytes) => Some(bytes.len()),
                _ => None,
            })
            .collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|len| *len <= MAX_FRAME_LEN as usize + 4));
    }

    #[test]
    fn empty_payload_round_trip() {
        let now = Instant::now();
        let mut tx = PayloadManager::new(&small_chunks());
        let mut rx = PayloadManager::new(&small_chunks());
        let (_, frames) = start(&mut tx, Vec::new(), now);
        let (_, events) = deliver(&mut rx, &sender(), frames[0].clone(), now);
        assert_eq!(received(&events), Some(&Vec::new()));
        assert_eq!(last_update(&events), Some((0, PayloadStatus::Success)));
    }
}
