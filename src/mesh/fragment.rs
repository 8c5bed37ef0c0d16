//! Fragmentation and Reassembly
//!
//! Splits message bytes into frame-sized chunks and rebuilds them on the
//! receiving side, tolerating duplicates and arbitrary arrival order.

use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::protocol::MeshPacket;

/// Split `bytes` into packets of at most `chunk_size` payload bytes.
///
/// Sequence numbers start at 0 and the final packet carries the last
/// flag. Empty input produces no packets.
pub fn fragment(message_id: Uuid, origin: &str, bytes: &[u8], chunk_size: usize, ttl: u8) -> Vec<MeshPacket> {
    let chunk_size = chunk_size.max(1);
    let count = bytes.len().div_ceil(chunk_size);

    bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            MeshPacket::new(
                message_id,
                origin.to_string(),
                index as u64,
                ttl,
                index + 1 == count,
                chunk.to_vec(),
            )
        })
        .collect()
}

/// Accumulates the fragments of one message
#[derive(Debug, Clone)]
pub struct FragmentReassembler {
    parts: BTreeMap<u64, Vec<u8>>,
    last_seq: Option<u64>,
    started_at: Instant,
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self {
            parts: BTreeMap::new(),
            last_seq: None,
            started_at: Instant::now(),
        }
    }

    /// Store a fragment. A repeated sequence number overwrites.
    pub fn add_fragment(&mut self, seq: u64, data: Vec<u8>, is_last: bool) {
        self.parts.insert(seq, data);
        if is_last {
            self.last_seq = Some(self.last_seq.map_or(seq, |last| last.max(seq)));
        }
    }

    /// Terminal fragment seen and every sequence up to it collected
    pub fn is_complete(&self) -> bool {
        match self.last_seq {
            Some(last) => self.parts.range(..=last).count() as u64 == last.saturating_add(1),
            None => false,
        }
    }

    /// Concatenate sequences `0..=terminal` in order. Missing sequences
    /// contribute nothing; without a terminal fragment every collected
    /// chunk is used.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.parts.values().map(Vec::len).sum());
        let upper = self.last_seq.unwrap_or(u64::MAX);
        for chunk in self.parts.range(..=upper).map(|(_, chunk)| chunk) {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn fragment_count(&self) -> usize {
        self.parts.len()
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for FragmentReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct PendingMessages {
    entries: HashMap<Uuid, FragmentReassembler>,
    order: VecDeque<Uuid>,
}

impl PendingMessages {
    fn forget(&mut self, message_id: &Uuid) {
        self.entries.remove(message_id);
        self.order.retain(|id| id != message_id);
    }
}

/// Pending reassemblies keyed by message id, bounded by count and age
#[derive(Debug)]
pub struct ReassemblyTable {
    pending: Mutex<PendingMessages>,
    capacity: usize,
    timeout: Duration,
}

impl ReassemblyTable {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(PendingMessages::default()),
            capacity: capacity.max(1),
            timeout,
        }
    }

    /// Feed one fragment. Returns the message bytes when this fragment
    /// completes it; the entry is removed at that point.
    pub fn accept(&self, packet: &MeshPacket) -> Option<Vec<u8>> {
        let mut pending = self.pending.lock();
        self.expire(&mut pending);

        if !pending.entries.contains_key(&packet.message_id) {
            while pending.entries.len() >= self.capacity {
                let Some(oldest) = pending.order.pop_front() else { break };
                pending.entries.remove(&oldest);
                debug!("Evicted incomplete message {} from reassembly", oldest);
            }
            pending.order.push_back(packet.message_id);
        }

        let reassembler = pending.entries.entry(packet.message_id).or_default();
        reassembler.add_fragment(packet.seq, packet.payload.clone(), packet.is_last);

        if !reassembler.is_complete() {
            return None;
        }

        let bytes = reassembler.assemble();
        pending.forget(&packet.message_id);
        Some(bytes)
    }

    /// Drop pending messages older than the timeout
    pub fn sweep(&self) -> usize {
        let mut pending = self.pending.lock();
        self.expire(&mut pending)
    }

    fn expire(&self, pending: &mut PendingMessages) -> usize {
        let mut expired = 0;
        while let Some(oldest) = pending.order.front().copied() {
            let stale = pending
                .entries
                .get(&oldest)
                .map_or(true, |r| r.age() >= self.timeout);
            if !stale {
                break;
            }
            pending.order.pop_front();
            pending.entries.remove(&oldest);
            expired += 1;
        }
        if expired > 0 {
            debug!("Expired {} stale reassemblies", expired);
        }
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().entries.len()
    }

    pub fn is_pending(&self, message_id: &Uuid) -> bool {
        self.pending.lock().entries.contains_key(message_id)
    }

    pub fn clear(&self) {
        let mut pending = self.pending.lock();
        pending.entries.clear();
        pending.order.clear();
    }
}
