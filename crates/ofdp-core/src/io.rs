//! I/O lcore loops: NIC RX bursts dispatched onto worker rings, and
//! worker output rings drained back to the NIC.
//!
//! Dispatch obeys the FIFO-ness policy: under `flow` (the default) the
//! 5-tuple hash pins every packet of a flow to one worker, under `port`
//! the ingress port does, and under `none` packets round-robin. Full rings
//! are drops, never back-pressure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::config::{BurstSizes, Fifoness};
use crate::driver::PortDriver;
use crate::error::DpResult;
use crate::hash::{HashType, fingerprint64};
use crate::lcore::pin_current_thread;
use crate::module::ThreadCtl;
use crate::packet::FlowKey;
use crate::pool::{BufferPool, Packet};
use crate::port::PortTable;
use crate::ring::{RingConsumer, RingProducer};
use crate::{LcoreId, PortId, QueueId};

/// Counters one I/O lcore exposes to the stats surface.
#[derive(Debug, Default)]
pub struct IoStats {
    pub rx_packets: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_dropped: AtomicU64,
}

/// Worker output rings feeding one TX port.
pub struct TxDrain {
    pub port: PortId,
    pub rings: Vec<RingConsumer<Packet>>,
}

/// One I/O lcore: its RX queue set, the worker rings it feeds, and the TX
/// drains it owns.
pub struct IoLcore {
    pub lcore: LcoreId,
    pub socket: u32,
    rx_queues: Vec<(PortId, QueueId)>,
    workers: Vec<RingProducer<Packet>>,
    tx: Vec<TxDrain>,
    driver: Arc<dyn PortDriver>,
    pool: Arc<BufferPool>,
    ports: Arc<PortTable>,
    bursts: BurstSizes,
    fifoness: Fifoness,
    rr_next: usize,
    stats: Arc<IoStats>,
    // Per-worker staging for the RX write burst.
    staging: Vec<Vec<Packet>>,
    drain_buf: Vec<Packet>,
}

impl IoLcore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lcore: LcoreId,
        socket: u32,
        rx_queues: Vec<(PortId, QueueId)>,
        workers: Vec<RingProducer<Packet>>,
        tx: Vec<TxDrain>,
        driver: Arc<dyn PortDriver>,
        pool: Arc<BufferPool>,
        ports: Arc<PortTable>,
        bursts: BurstSizes,
        fifoness: Fifoness,
        stats: Arc<IoStats>,
    ) -> IoLcore {
        let staging = (0..workers.len()).map(|_| Vec::new()).collect();
        // Random initial offset so simultaneously started I/O lcores do
        // not all hit worker 0 first under round-robin dispatch.
        let rr_next = if workers.is_empty() {
            0
        } else {
            rand::rng().random_range(0..workers.len())
        };
        IoLcore {
            lcore,
            socket,
            rx_queues,
            workers,
            tx,
            driver,
            pool,
            ports,
            bursts,
            fifoness,
            rr_next,
            stats,
            staging,
            drain_buf: Vec::new(),
        }
    }

    pub fn stats(&self) -> Arc<IoStats> {
        self.stats.clone()
    }

    /// Busy-poll until shutdown; the supervised thread body.
    pub fn run(mut self, ctl: ThreadCtl) -> DpResult<()> {
        ctl.gate.wait_started()?;
        let _ = pin_current_thread(self.lcore);
        log::info!("lcore {} (I/O) main loop", self.lcore);
        while !ctl.should_stop() {
            let moved = self.poll_once();
            if moved == 0 {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// One RX pass and one TX pass. Returns the number of packets moved.
    pub fn poll_once(&mut self) -> usize {
        self.rx_once() + self.tx_once()
    }

    /// Pull RX bursts, pick workers, stage, then flush every partially
    /// filled staging buffer.
    fn rx_once(&mut self) -> usize {
        let mut moved = 0;
        for qi in 0..self.rx_queues.len() {
            let (port_id, queue) = self.rx_queues[qi];
            let frames = self.driver.rx_burst(port_id, queue, self.bursts.io_rx_read);
            if frames.is_empty() {
                continue;
            }
            let port = self.ports.get(port_id);
            for frame in frames {
                if let Some(p) = &port {
                    p.counters.count_rx(frame.len());
                    if !p.is_forwarding() {
                        self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
                let mut pkt = match self.pool.alloc_frame(self.socket, &frame) {
                    Ok(pkt) => pkt,
                    Err(_) => {
                        self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                        if let Some(p) = &port {
                            p.counters.rx_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        continue;
                    }
                };
                pkt.buffer_mut().meta.in_port = Some(port_id);
                let widx = self.select_worker(&mut pkt);
                self.staging[widx].push(pkt);
                moved += 1;
                self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
                if self.staging[widx].len() >= self.bursts.io_rx_write {
                    self.flush_worker(widx);
                }
            }
        }
        // Periodic flush of whatever the burst left behind.
        for widx in 0..self.staging.len() {
            if !self.staging[widx].is_empty() {
                self.flush_worker(widx);
            }
        }
        moved
    }

    fn flush_worker(&mut self, widx: usize) {
        let staged = std::mem::take(&mut self.staging[widx]);
        for pkt in staged {
            if self.workers[widx].enqueue(pkt).is_err() {
                // Ring full: the returned packet drops here and its buffer
                // goes back to the pool.
                self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Worker index per the FIFO-ness policy.
    fn select_worker(&mut self, pkt: &mut Packet) -> usize {
        let n = self.workers.len();
        if n <= 1 {
            return 0;
        }
        match self.fifoness {
            Fifoness::Flow => match FlowKey::classify(pkt.buffer_mut()) {
                Some(key) => (key.dispatch_hash() % n as u64) as usize,
                None => {
                    // Unparseable frames have no flow; spread them.
                    self.rr_next = (self.rr_next + 1) % n;
                    self.rr_next
                }
            },
            Fifoness::Port => {
                let in_port = pkt.buffer().meta.in_port.unwrap_or(0);
                (fingerprint64(&in_port.to_be_bytes(), HashType::City64) % n as u64) as usize
            }
            Fifoness::None => {
                self.rr_next = (self.rr_next + 1) % n;
                self.rr_next
            }
        }
    }

    /// Drain every worker ring bound to this lcore's TX ports and hand the
    /// frames to the driver in write-sized bursts.
    fn tx_once(&mut self) -> usize {
        let mut moved = 0;
        for ti in 0..self.tx.len() {
            let port_id = self.tx[ti].port;
            self.drain_buf.clear();
            for ring in &mut self.tx[ti].rings {
                ring.dequeue_burst(&mut self.drain_buf, self.bursts.io_tx_read);
            }
            if self.drain_buf.is_empty() {
                continue;
            }
            let port = self.ports.get(port_id);
            let pending: Vec<Packet> = self.drain_buf.drain(..).collect();
            for chunk in pending.chunks(self.bursts.io_tx_write.max(1)) {
                let frames: Vec<Vec<u8>> = chunk.iter().map(|p| p.frame().to_vec()).collect();
                let total = frames.len();
                let sent = self.driver.tx_burst(port_id, frames);
                moved += sent;
                self.stats.tx_packets.fetch_add(sent as u64, Ordering::Relaxed);
                if sent < total {
                    self.stats
                        .tx_dropped
                        .fetch_add((total - sent) as u64, Ordering::Relaxed);
                }
                if let Some(p) = &port {
                    for pkt in chunk.iter().take(sent) {
                        p.counters.count_tx(pkt.frame_len());
                    }
                    if sent < total {
                        p.counters
                            .tx_dropped
                            .fetch_add((total - sent) as u64, Ordering::Relaxed);
                    }
                }
            }
        }
        moved
    }
}
