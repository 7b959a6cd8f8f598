//! Thin interface to the NIC drivers.
//!
//! The real PMD and raw-socket drivers live outside the core; everything
//! the pipeline needs from them is frame bursts and link state. The
//! channel-backed [`LoopDriver`] implements the same trait for tests and
//! the standalone mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::RwLock;

use crate::{PortId, QueueId};

/// Frame-level driver surface the I/O lcores poll.
pub trait PortDriver: Send + Sync {
    /// Pull up to `max` frames from `(port, queue)`.
    fn rx_burst(&self, port: PortId, queue: QueueId, max: usize) -> Vec<Vec<u8>>;

    /// Push frames out of `port`; returns how many the driver accepted.
    fn tx_burst(&self, port: PortId, frames: Vec<Vec<u8>>) -> usize;

    /// Current physical link state.
    fn link_up(&self, port: PortId) -> bool;

    /// Ports the driver exposes, in attach order.
    fn ports(&self) -> Vec<PortId>;
}

struct LoopPort {
    rx_in: Sender<Vec<u8>>,
    rx_out: Receiver<Vec<u8>>,
    tx_in: Sender<Vec<u8>>,
    tx_out: Receiver<Vec<u8>>,
    link_up: AtomicBool,
}

/// In-memory driver: injected frames come back out of `rx_burst`, and
/// transmitted frames are captured for inspection.
#[derive(Default)]
pub struct LoopDriver {
    ports: RwLock<HashMap<PortId, LoopPort>>,
    order: RwLock<Vec<PortId>>,
}

impl LoopDriver {
    pub fn new() -> Self {
        LoopDriver::default()
    }

    pub fn add_port(&self, port: PortId) {
        let (rx_in, rx_out) = unbounded();
        let (tx_in, tx_out) = unbounded();
        self.ports.write().insert(
            port,
            LoopPort {
                rx_in,
                rx_out,
                tx_in,
                tx_out,
                link_up: AtomicBool::new(true),
            },
        );
        self.order.write().push(port);
    }

    /// Feed a frame into a port's receive side.
    pub fn inject(&self, port: PortId, frame: Vec<u8>) {
        if let Some(p) = self.ports.read().get(&port) {
            let _ = p.rx_in.send(frame);
        }
    }

    /// Take everything the dataplane transmitted on `port` so far.
    pub fn drain_tx(&self, port: PortId) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(p) = self.ports.read().get(&port) {
            while let Ok(frame) = p.tx_out.try_recv() {
                out.push(frame);
            }
        }
        out
    }

    pub fn set_link(&self, port: PortId, up: bool) {
        if let Some(p) = self.ports.read().get(&port) {
            p.link_up.store(up, Ordering::Relaxed);
        }
    }
}

impl PortDriver for LoopDriver {
    fn rx_burst(&self, port: PortId, _queue: QueueId, max: usize) -> Vec<Vec<u8>> {
        let ports = self.ports.read();
        let Some(p) = ports.get(&port) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while out.len() < max {
            match p.rx_out.try_recv() {
                Ok(frame) => out.push(frame),
                Err(_) => break,
            }
        }
        out
    }

    fn tx_burst(&self, port: PortId, frames: Vec<Vec<u8>>) -> usize {
        let ports = self.ports.read();
        let Some(p) = ports.get(&port) else {
            return 0;
        };
        let mut sent = 0;
        for frame in frames {
            if p.tx_in.send(frame).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn link_up(&self, port: PortId) -> bool {
        self.ports
            .read()
            .get(&port)
            .map(|p| p.link_up.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn ports(&self) -> Vec<PortId> {
        self.order.read().clone()
    }
}
