//! Packet buffer: a fixed-capacity byte region with headroom and a
//! metadata trailer carrying per-packet pipeline state.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::PortId;
use crate::actions::ActionSet;
use crate::packet::FlowKey;

/// Default data capacity of a pool buffer, enough for an untagged MTU-1500
/// frame plus a pushed VLAN tag.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// Headroom reserved in front of the frame for header pushes.
pub const DEFAULT_HEADROOM: usize = 128;

/// Where a buffer came from, selecting its release path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Carved from the pool segment on `socket`.
    Pool { socket: u32 },
    /// Heap fallback, used when running without the high-speed driver.
    Heap,
}

/// Per-packet pipeline state, reset on every allocation.
#[derive(Debug, Default, Clone)]
pub struct Metadata {
    /// Ingress port identity, set by the I/O-RX path.
    pub in_port: Option<PortId>,
    /// Parsed header offsets relative to the frame start. `l3`/`l4` are
    /// `None` until the lazy parser has reached that layer.
    pub l3_offset: Option<u16>,
    pub l4_offset: Option<u16>,
    /// Cached match key, filled by the first full parse.
    pub flow_key: Option<FlowKey>,
    /// Table currently executing this packet.
    pub table_id: u8,
    /// Accumulated write-actions, applied at pipeline exit.
    pub action_set: ActionSet,
    /// Output queue selected by a set-queue action.
    pub queue_id: Option<u32>,
    /// OpenFlow metadata register written by write-metadata.
    pub of_metadata: u64,
}

/// A reference-counted, fixed-capacity frame buffer.
///
/// The frame occupies `[head, head + len)` of the backing storage; the
/// space before `head` is headroom consumed by header pushes.
#[derive(Debug)]
pub struct PacketBuffer {
    storage: Box<[u8]>,
    head: usize,
    len: usize,
    refcnt: AtomicU32,
    kind: BufferKind,
    pub meta: Metadata,
}

impl PacketBuffer {
    pub fn new(capacity: usize, headroom: usize, kind: BufferKind) -> Self {
        debug_assert!(headroom < capacity);
        PacketBuffer {
            storage: vec![0u8; capacity].into_boxed_slice(),
            head: headroom,
            len: 0,
            refcnt: AtomicU32::new(0),
            kind,
            meta: Metadata::default(),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Bytes usable for frame data after the headroom.
    pub fn tailroom_capacity(&self) -> usize {
        self.storage.len() - self.head
    }

    pub fn frame(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.head + self.len]
    }

    pub fn frame_len(&self) -> usize {
        self.len
    }

    /// Copy a received frame in. Fails when the frame exceeds the tailroom.
    pub fn set_frame(&mut self, frame: &[u8]) -> Result<(), usize> {
        if frame.len() > self.tailroom_capacity() {
            return Err(frame.len());
        }
        self.storage[self.head..self.head + frame.len()].copy_from_slice(frame);
        self.len = frame.len();
        Ok(())
    }

    /// Grow the frame at the front by `n` bytes out of the headroom
    /// (VLAN push). Returns false when the headroom is exhausted.
    pub fn push_head(&mut self, n: usize) -> bool {
        if n > self.head {
            return false;
        }
        self.head -= n;
        self.len += n;
        true
    }

    /// Shrink the frame at the front by `n` bytes (VLAN pop).
    pub fn pull_head(&mut self, n: usize) -> bool {
        if n > self.len {
            return false;
        }
        self.head += n;
        self.len -= n;
        true
    }

    /// Clear metadata and rewind the write pointer; refcount is set for a
    /// fresh single owner.
    pub fn reset(&mut self, headroom: usize) {
        self.head = headroom;
        self.len = 0;
        self.meta = Metadata::default();
        self.refcnt.store(1, Ordering::Relaxed);
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// Decrement; returns true when this was the last reference.
    pub(crate) fn ref_dec(&self) -> bool {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "packet buffer refcount went negative");
        prev == 1
    }
}
