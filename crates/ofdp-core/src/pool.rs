//! NUMA-segmented packet buffer pool.
//!
//! One lock-free free list per CPU socket. `alloc` prefers the caller's
//! socket, falls back to the first segment with a free buffer, and, when
//! the pool was built with heap fallback (no high-speed driver), to a heap
//! allocation whose layout matches pool buffers bit for bit; the kind tag in
//! the buffer selects the release path.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::buffer::{BufferKind, DEFAULT_BUFFER_CAPACITY, DEFAULT_HEADROOM, PacketBuffer};
use crate::error::{DpError, DpResult};

struct Segment {
    socket: u32,
    free: ArrayQueue<Box<PacketBuffer>>,
}

/// Pool of fixed-size packet buffers, segmented by socket.
pub struct BufferPool {
    segments: Vec<Segment>,
    buf_capacity: usize,
    headroom: usize,
    heap_fallback: bool,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Build a pool with `(socket, n_buffers)` segments.
    pub fn new(
        segments: &[(u32, usize)],
        buf_capacity: usize,
        headroom: usize,
        heap_fallback: bool,
    ) -> DpResult<Arc<Self>> {
        if segments.is_empty() && !heap_fallback {
            return Err(DpError::InvalidArgs("pool needs at least one segment".into()));
        }
        if headroom >= buf_capacity {
            return Err(DpError::InvalidArgs(format!(
                "headroom {headroom} >= capacity {buf_capacity}"
            )));
        }
        let mut segs = Vec::with_capacity(segments.len());
        for &(socket, n) in segments {
            if n == 0 {
                return Err(DpError::InvalidArgs(format!("empty segment for socket {socket}")));
            }
            let free = ArrayQueue::new(n);
            for _ in 0..n {
                let buf = Box::new(PacketBuffer::new(
                    buf_capacity,
                    headroom,
                    BufferKind::Pool { socket },
                ));
                // Queue was sized for exactly n buffers.
                let _ = free.push(buf);
            }
            segs.push(Segment { socket, free });
        }
        Ok(Arc::new(BufferPool {
            segments: segs,
            buf_capacity,
            headroom,
            heap_fallback,
            outstanding: AtomicUsize::new(0),
        }))
    }

    /// Pool with a single segment on socket 0, heap fallback enabled.
    /// This is the standalone (raw-socket) configuration.
    pub fn standalone(n_buffers: usize) -> DpResult<Arc<Self>> {
        BufferPool::new(&[(0, n_buffers)], DEFAULT_BUFFER_CAPACITY, DEFAULT_HEADROOM, true)
    }

    /// Allocate a buffer, preferring `socket_hint`.
    pub fn alloc(self: &Arc<Self>, socket_hint: u32) -> DpResult<Packet> {
        let hit = self
            .segments
            .iter()
            .find(|s| s.socket == socket_hint)
            .and_then(|s| s.free.pop())
            .or_else(|| self.segments.iter().find_map(|s| s.free.pop()));

        let mut buf = match hit {
            Some(buf) => buf,
            None if self.heap_fallback => Box::new(PacketBuffer::new(
                self.buf_capacity,
                self.headroom,
                BufferKind::Heap,
            )),
            None => return Err(DpError::NoMemory),
        };
        buf.reset(self.headroom);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(Packet {
            buf: Some(buf),
            pool: Some(self.clone()),
        })
    }

    /// Allocate and fill with a received frame.
    pub fn alloc_frame(self: &Arc<Self>, socket_hint: u32, frame: &[u8]) -> DpResult<Packet> {
        let mut pkt = self.alloc(socket_hint)?;
        pkt.set_frame(frame)
            .map_err(|n| DpError::TooLong(format!("frame of {n} bytes")))?;
        Ok(pkt)
    }

    /// Buffers currently held by packets (in flight across all rings).
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn release(&self, buf: Box<PacketBuffer>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        match buf.kind() {
            BufferKind::Heap => drop(buf),
            BufferKind::Pool { socket } => {
                if let Some(seg) = self.segments.iter().find(|s| s.socket == socket) {
                    // Push only fails if the segment somehow over-filled;
                    // dropping the box is then the correct release.
                    let _ = seg.free.push(buf);
                }
            }
        }
    }
}

/// Owning handle to a packet buffer.
///
/// Exactly one handle exists per in-flight buffer; replication for
/// flood/group output deep-copies through the pool. Dropping the handle
/// returns the buffer to its pool (or frees a heap fallback).
pub struct Packet {
    buf: Option<Box<PacketBuffer>>,
    pool: Option<Arc<BufferPool>>,
}

impl Packet {
    /// A free-standing heap packet, used by tests and the loop driver.
    pub fn heap(frame: &[u8]) -> Packet {
        let mut buf = Box::new(PacketBuffer::new(
            DEFAULT_BUFFER_CAPACITY,
            DEFAULT_HEADROOM,
            BufferKind::Heap,
        ));
        buf.reset(DEFAULT_HEADROOM);
        buf.set_frame(frame).expect("frame exceeds default capacity");
        Packet { buf: Some(buf), pool: None }
    }

    /// Deep copy for replication; allocated from the same pool when one is
    /// attached, otherwise from the heap.
    pub fn replicate(&self) -> DpResult<Packet> {
        let src = self.buffer();
        let mut copy = match (&self.pool, src.kind()) {
            (Some(pool), BufferKind::Pool { socket }) => pool.alloc(socket)?,
            (Some(pool), BufferKind::Heap) => pool.alloc(0)?,
            (None, _) => Packet::heap(&[]),
        };
        copy.set_frame(src.frame())
            .map_err(|n| DpError::TooLong(format!("frame of {n} bytes")))?;
        copy.meta = src.meta.clone();
        Ok(copy)
    }

    pub fn buffer(&self) -> &PacketBuffer {
        self.buf.as_ref().expect("packet buffer already released")
    }

    pub fn buffer_mut(&mut self) -> &mut PacketBuffer {
        self.buf.as_mut().expect("packet buffer already released")
    }
}

impl Deref for Packet {
    type Target = PacketBuffer;

    fn deref(&self) -> &PacketBuffer {
        self.buffer()
    }
}

impl DerefMut for Packet {
    fn deref_mut(&mut self) -> &mut PacketBuffer {
        self.buffer_mut()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            if buf.ref_dec() {
                if let Some(pool) = self.pool.take() {
                    pool.release(buf);
                }
            }
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.buffer().frame_len())
            .field("kind", &self.buffer().kind())
            .finish()
    }
}
