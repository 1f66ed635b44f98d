// src/transport/reorder.rs

//! Sequence-number reordering for RTP streams.
//!
//! Packets are released in sequence order. Packets that arrive ahead of the
//! next expected sequence number are held back in a small bounded map until
//! the gap fills. When the map is full the engine stops waiting: it emits
//! what it holds in order, treats the remaining gaps as lost and jumps to the
//! packet that overflowed it.

use log::{debug, warn};
use std::collections::HashMap;

use super::packet::Packet;

/// Held-back packets allowed while gaps are outstanding.
pub const MAX_PENDING: usize = 16;

/// Forward distances at or beyond this mark a packet as behind.
const HALF_SEQUENCE_SPACE: u16 = 0x8000;

/// Counters kept by [`Reorderer`] over a session's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStats {
    /// Packets handed to the output.
    pub emitted: u64,
    /// Packets that were held back before being emitted.
    pub reordered: u64,
    /// Sequence numbers given up on, plus held packets discarded on overflow.
    pub skipped: u64,
    /// Packets dropped because their sequence was already passed.
    pub late: u64,
    /// Times the engine resynchronised to a restarted sequence.
    pub resyncs: u64,
}

pub struct Reorderer {
    expected: Option<u16>,
    pending: HashMap<u16, Packet>,
    max_pending: usize,
    late_run: usize,
    stats: ReorderStats,
}

impl Reorderer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            expected: None,
            pending: HashMap::with_capacity(max_pending),
            max_pending,
            late_run: 0,
            stats: ReorderStats::default(),
        }
    }

    /// Next sequence number due, `None` before the first packet.
    pub fn expected(&self) -> Option<u16> {
        self.expected
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Feeds one stripped packet; appends zero or more packets, in sequence
    /// order, to `out`.
    pub fn push(&mut self, pkt: Packet, out: &mut Vec<Packet>) {
        let seq = pkt.sequence();
        let expected = match self.expected {
            Some(expected) => expected,
            None => {
                self.expected = Some(seq.wrapping_add(1));
                self.emit(pkt, out);
                return;
            }
        };

        if seq == expected {
            self.late_run = 0;
            self.emit(pkt, out);
            let mut next = seq.wrapping_add(1);
            while let Some(held) = self.pending.remove(&next) {
                self.stats.reordered += 1;
                self.emit(held, out);
                next = next.wrapping_add(1);
            }
            self.expected = Some(next);
            return;
        }

        if seq.wrapping_sub(expected) >= HALF_SEQUENCE_SPACE {
            self.late(pkt, expected, out);
            return;
        }
        self.late_run = 0;

        if self.pending.len() < self.max_pending || self.pending.contains_key(&seq) {
            // A duplicate replaces the held copy; the old one goes back to the pool.
            self.pending.insert(seq, pkt);
            return;
        }

        self.catch_up(pkt, expected, out);
    }

    fn late(&mut self, pkt: Packet, expected: u16, out: &mut Vec<Packet>) {
        self.stats.late += 1;
        self.late_run += 1;
        if self.late_run < self.max_pending {
            debug!(
                "dropping late packet {} (expected {})",
                pkt.sequence(),
                expected
            );
            return;
        }

        // A run of packets all behind us: the sender restarted its sequence.
        let seq = pkt.sequence();
        warn!(
            "sequence restarted at {} (expected {}), resynchronising",
            seq, expected
        );
        self.stats.resyncs += 1;
        self.stats.skipped += self.pending.len() as u64;
        self.pending.clear();
        self.late_run = 0;
        self.expected = Some(seq.wrapping_add(1));
        self.emit(pkt, out);
    }

    fn catch_up(&mut self, pkt: Packet, mut expected: u16, out: &mut Vec<Packet>) {
        let seq = pkt.sequence();
        debug!(
            "reorder buffer full, skipping from {} to {}",
            expected, seq
        );
        while expected != seq {
            match self.pending.remove(&expected) {
                Some(held) => {
                    self.stats.reordered += 1;
                    self.emit(held, out);
                }
                None => self.stats.skipped += 1,
            }
            expected = expected.wrapping_add(1);
        }
        self.stats.skipped += self.pending.len() as u64;
        self.pending.clear();
        self.expected = Some(seq.wrapping_add(1));
        self.emit(pkt, out);
    }

    fn emit(&mut self, pkt: Packet, out: &mut Vec<Packet>) {
        self.stats.emitted += 1;
        out.push(pkt);
    }
}

impl Default for Reorderer {
    fn default() -> Self {
        Self::new()
    }
}
