//! Bounded single-producer single-consumer ring.
//!
//! The packet path between lcores is wired exclusively with these: one
//! producer thread, one consumer thread, power-of-two capacity, failure on
//! full (the caller counts a drop and releases the packet). Indices are
//! free-running; `tail - head` is the occupancy.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{DpError, DpResult};

struct RingInner<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// One producer and one consumer, each on its own thread; the split handles
// below are the only way in.
unsafe impl<T: Send> Send for RingInner<T> {}
unsafe impl<T: Send> Sync for RingInner<T> {}

impl<T> Drop for RingInner<T> {
    fn drop(&mut self) {
        // Both handles are gone; drop whatever is still queued so pool
        // buffers stranded at shutdown find their way back.
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut i = head;
        while i != tail {
            unsafe {
                (*self.buf[i & self.mask].get()).assume_init_drop();
            }
            i = i.wrapping_add(1);
        }
    }
}

/// Producer half of an SPSC ring.
pub struct RingProducer<T> {
    inner: Arc<RingInner<T>>,
}

/// Consumer half of an SPSC ring.
pub struct RingConsumer<T> {
    inner: Arc<RingInner<T>>,
}

/// Create an SPSC ring. `capacity` must be a power of two and at least 2.
pub fn ring<T: Send>(capacity: usize) -> DpResult<(RingProducer<T>, RingConsumer<T>)> {
    if capacity < 2 || !capacity.is_power_of_two() {
        return Err(DpError::InvalidArgs(format!(
            "ring capacity {capacity} is not a power of two >= 2"
        )));
    }
    let buf = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(RingInner {
        buf,
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    Ok((
        RingProducer { inner: inner.clone() },
        RingConsumer { inner },
    ))
}

impl<T> RingProducer<T> {
    /// Enqueue one item. Returns the item back on a full ring.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        let inner = &self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > inner.mask {
            return Err(item);
        }
        unsafe {
            (*inner.buf[tail & inner.mask].get()).write(item);
        }
        inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Enqueue a burst; items that do not fit are returned to the caller.
    pub fn enqueue_burst(&mut self, items: impl Iterator<Item = T>) -> Vec<T> {
        let mut rejected = Vec::new();
        for item in items {
            if let Err(item) = self.enqueue(item) {
                rejected.push(item);
            }
        }
        rejected
    }

    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }
}

impl<T> RingConsumer<T> {
    /// Dequeue up to `max` items into `out`. Returns the count dequeued.
    pub fn dequeue_burst(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        let avail = tail.wrapping_sub(head);
        let n = avail.min(max);
        for i in 0..n {
            let slot = inner.buf[(head.wrapping_add(i)) & inner.mask].get();
            out.push(unsafe { (*slot).assume_init_read() });
        }
        inner.head.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// Dequeue a single item.
    pub fn dequeue(&mut self) -> Option<T> {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let item = unsafe { (*inner.buf[head & inner.mask].get()).assume_init_read() };
        inner.head.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Occupancy snapshot; exact only from the consumer thread.
    pub fn len(&self) -> usize {
        self.inner
            .tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.inner.head.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for RingConsumer<T> {
    fn drop(&mut self) {
        // Drain whatever the producer left behind so pool buffers return.
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(ring::<u32>(0).is_err());
        assert!(ring::<u32>(3).is_err());
        assert!(ring::<u32>(100).is_err());
        assert!(ring::<u32>(128).is_ok());
    }

    #[test]
    fn fifo_order_preserved() {
        let (mut tx, mut rx) = ring::<u32>(8).unwrap();
        for i in 0..5 {
            tx.enqueue(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.dequeue_burst(&mut out, 16), 5);
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_ring_rejects() {
        let (mut tx, mut rx) = ring::<u32>(4).unwrap();
        for i in 0..4 {
            tx.enqueue(i).unwrap();
        }
        assert_eq!(tx.enqueue(99), Err(99));
        assert_eq!(rx.dequeue(), Some(0));
        assert!(tx.enqueue(99).is_ok());
    }

    #[test]
    fn burst_caps_at_requested_max() {
        let (mut tx, mut rx) = ring::<u32>(16).unwrap();
        for i in 0..10 {
            tx.enqueue(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.dequeue_burst(&mut out, 4), 4);
        assert_eq!(rx.len(), 6);
    }

    #[test]
    fn cross_thread_fifo() {
        let (mut tx, mut rx) = ring::<u64>(1024).unwrap();
        let producer = std::thread::spawn(move || {
            for i in 0..100_000u64 {
                loop {
                    match tx.enqueue(i) {
                        Ok(()) => break,
                        Err(_) => std::hint::spin_loop(),
                    }
                }
            }
        });
        let mut expect = 0u64;
        let mut out = Vec::with_capacity(256);
        while expect < 100_000 {
            out.clear();
            rx.dequeue_burst(&mut out, 256);
            for &v in &out {
                assert_eq!(v, expect);
                expect += 1;
            }
        }
        producer.join().unwrap();
    }
}
