// src/transport/packet.rs

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;

/// Size of every packet buffer: one Ethernet MTU.
pub const PACKET_MTU: usize = 1500;

/// Idle buffers a pool keeps around before letting released ones go.
pub const POOL_CAPACITY: usize = 64;

/// A datagram buffer with a valid-data window `[offset, length)`.
///
/// Only the bytes inside the window are exposed through [`Packet::payload`].
/// Dropping a packet (or calling [`Packet::release`]) hands its buffer back to
/// the pool it came from; the buffer contents are left as-is, only the window
/// is reset when the buffer is handed out again.
pub struct Packet {
    data: BytesMut,
    offset: usize,
    length: usize,
    sequence: u16,
    pool: PacketPool,
}

impl Packet {
    /// The consumer-visible bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.length]
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// End of the valid window (not the payload size).
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// RTP sequence number. Zero for raw transport-stream packets.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.length
    }

    /// Returns the buffer to its pool. The work happens in `Drop`, so
    /// letting a packet go out of scope releases it just the same.
    pub fn release(self) {}

    /// Whole buffer, used as the target of a socket read.
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Marks `n` bytes as freshly read. Anything past the capacity was
    /// truncated by the read itself.
    pub(crate) fn set_filled(&mut self, n: usize) {
        self.offset = 0;
        self.length = n.min(self.data.len());
    }

    /// Bytes `[0, length)`, header included.
    pub(crate) fn datagram(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// Rewrites the window. Out-of-range values collapse to an empty window
    /// at `length` so the invariant `offset <= length <= capacity` always holds.
    pub(crate) fn set_window(&mut self, offset: usize, length: usize) {
        let length = length.min(self.data.len());
        self.length = length;
        self.offset = offset.min(length);
    }

    pub(crate) fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.recycle(data);
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Free-list of packet buffers shared by one session's producer and consumer.
///
/// `acquire` never fails: when no recycled buffer is available a new one is
/// allocated. The pool bounds allocation churn, not memory.
#[derive(Clone)]
pub struct PacketPool {
    free_tx: Sender<BytesMut>,
    free_rx: Receiver<BytesMut>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self::with_capacity(POOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
        Self { free_tx, free_rx }
    }

    /// Returns an empty-window packet, reusing a released buffer if one is idle.
    pub fn acquire(&self) -> Packet {
        let data = self
            .free_rx
            .try_recv()
            .unwrap_or_else(|_| BytesMut::zeroed(PACKET_MTU));
        Packet {
            data,
            offset: 0,
            length: 0,
            sequence: 0,
            pool: self.clone(),
        }
    }

    /// Number of buffers waiting to be reused.
    pub fn idle(&self) -> usize {
        self.free_rx.len()
    }

    fn recycle(&self, data: BytesMut) {
        if data.len() != PACKET_MTU {
            return;
        }
        // A full free-list just lets the buffer drop.
        let _ = self.free_tx.try_send(data);
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}
