//! Worker lcore: the match-action pipeline.
//!
//! Per packet: lazy header classification, an optional flow-cache probe
//! (generation-checked), the table walk from table 0, six-slot instruction
//! execution, and finally the accumulated action set. Everything that goes
//! wrong inside the pipeline is a counted drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::bridge::{Bridge, LookupResult};
use crate::cache::FlowCache;
use crate::config::BurstSizes;
use crate::actions::{
    self, Emission, OutputTarget, PipelineControl,
};
use crate::error::{DpError, DpResult};
use crate::events::{DpEvent, EventHub};
use crate::hash::HashType;
use crate::lcore::pin_current_thread;
use crate::module::ThreadCtl;
use crate::packet::FlowKey;
use crate::pool::Packet;
use crate::port::PortTable;
use crate::ring::{RingConsumer, RingProducer};
use crate::table::TableMissBehavior;
use crate::timer::now_secs;
use crate::{LcoreId, PortId};

/// Counters one worker exposes to the stats surface.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub dropped: AtomicU64,
    pub sent: AtomicU64,
    pub punted: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

/// One worker lcore.
pub struct Worker {
    pub worker_id: usize,
    pub lcore: LcoreId,
    inputs: Vec<RingConsumer<Packet>>,
    outputs: HashMap<PortId, RingProducer<Packet>>,
    /// Ingress port → owning bridge, frozen at spawn.
    bridges: Arc<HashMap<PortId, Arc<Bridge>>>,
    cache: Option<FlowCache>,
    hash_type: HashType,
    ports: Arc<PortTable>,
    events: Arc<EventHub>,
    bursts: BurstSizes,
    stats: Arc<WorkerStats>,
    rx_buf: Vec<Packet>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        lcore: LcoreId,
        inputs: Vec<RingConsumer<Packet>>,
        outputs: HashMap<PortId, RingProducer<Packet>>,
        bridges: Arc<HashMap<PortId, Arc<Bridge>>>,
        cache: Option<FlowCache>,
        hash_type: HashType,
        ports: Arc<PortTable>,
        events: Arc<EventHub>,
        bursts: BurstSizes,
        stats: Arc<WorkerStats>,
    ) -> Worker {
        Worker {
            worker_id,
            lcore,
            inputs,
            outputs,
            bridges,
            cache,
            hash_type,
            ports,
            events,
            bursts,
            stats,
            rx_buf: Vec::new(),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Busy-poll until shutdown; the supervised thread body.
    pub fn run(mut self, ctl: ThreadCtl) -> DpResult<()> {
        ctl.gate.wait_started()?;
        let _ = pin_current_thread(self.lcore);
        log::info!("lcore {} (worker {}) main loop", self.lcore, self.worker_id);
        while !ctl.should_stop() {
            if self.poll_once() == 0 {
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Dequeue one fair round of bursts across the input rings and process
    /// them. Returns the number of packets handled.
    pub fn poll_once(&mut self) -> usize {
        let mut handled = 0;
        let now = now_secs();
        for ri in 0..self.inputs.len() {
            self.rx_buf.clear();
            self.inputs[ri].dequeue_burst(&mut self.rx_buf, self.bursts.worker_read);
            if self.rx_buf.is_empty() {
                continue;
            }
            for pkt in std::mem::take(&mut self.rx_buf) {
                self.process_packet(pkt, now);
                handled += 1;
            }
        }
        handled
    }

    fn drop_packet(&self, pkt: Packet) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        drop(pkt);
    }

    /// The match-action pipeline for one packet.
    fn process_packet(&mut self, mut pkt: Packet, now: u64) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        let Some(key) = FlowKey::classify(pkt.buffer_mut()) else {
            return self.drop_packet(pkt);
        };
        let in_port = key.in_port;
        let Some(bridge) = self.bridges.get(&in_port).cloned() else {
            return self.drop_packet(pkt);
        };

        let generation = bridge.generation();
        let mut emissions: Vec<Emission> = Vec::new();
        let mut table_id = 0u8;
        let mut cached_flow = None;

        // Step 2: cache probe keyed by the header fingerprint.
        let fingerprint = key.fingerprint(self.hash_type);
        if let Some(cache) = self.cache.as_mut() {
            cached_flow = cache.lookup(fingerprint, generation);
            if cached_flow.is_some() {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Steps 3-6: walk the pipeline. A cache hit enters at the cached
        // flow's instructions with table 0's lookup skipped.
        loop {
            let flow = match cached_flow.take() {
                Some(flow) => flow,
                None => match bridge.lookup(table_id, &key) {
                    LookupResult::Match(flow) => {
                        if table_id == 0 {
                            if let Some(cache) = self.cache.as_mut() {
                                cache.insert(fingerprint, flow.clone(), generation);
                            }
                        }
                        flow
                    }
                    LookupResult::Miss(TableMissBehavior::Drop) => {
                        // Outputs already emitted by earlier tables stand.
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        drop(pkt);
                        break;
                    }
                    LookupResult::Miss(TableMissBehavior::Controller) => {
                        self.punt_to_controller(pkt, table_id, in_port);
                        break;
                    }
                    LookupResult::Miss(TableMissBehavior::NextTable) => {
                        if table_id as usize + 1 >= bridge.n_tables() as usize {
                            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            drop(pkt);
                            break;
                        }
                        table_id += 1;
                        continue;
                    }
                },
            };

            flow.touch(now, pkt.buffer().frame_len());
            let control = {
                let instructions = flow.instructions();
                bridge.with_exec_env(|env| {
                    actions::execute_instruction_set(&mut pkt, &instructions, env, &mut emissions)
                })
            };
            match control {
                Ok(PipelineControl::Goto(next)) => {
                    table_id = next;
                }
                Ok(PipelineControl::Finish) => {
                    // Step 7: the accumulated action set decides the fate.
                    let finished = bridge.with_exec_env(|env| {
                        actions::apply_action_set(pkt, env, &mut emissions)
                    });
                    if let Err(e) = finished {
                        if e != DpError::NoMoreAction {
                            log::debug!("worker {}: action set failed: {e}", self.worker_id);
                        }
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
                Err(_) => {
                    // Meter drop or explicit termination.
                    self.drop_packet(pkt);
                    break;
                }
            }
        }

        self.route_emissions(emissions, in_port, table_id);
    }

    fn punt_to_controller(&self, pkt: Packet, table_id: u8, in_port: PortId) {
        self.stats.punted.fetch_add(1, Ordering::Relaxed);
        self.events.publish(DpEvent::PacketIn {
            port_id: in_port,
            table_id,
            frame: pkt.frame().to_vec(),
        });
    }

    /// Send each emission to its output ring, expanding flood targets.
    fn route_emissions(&mut self, emissions: Vec<Emission>, in_port: PortId, table_id: u8) {
        for emission in emissions {
            match emission.target {
                OutputTarget::Port(port) => self.output_to(port, emission.packet),
                OutputTarget::InPort => self.output_to(in_port, emission.packet),
                OutputTarget::Controller => {
                    self.punt_to_controller(emission.packet, table_id, in_port)
                }
                OutputTarget::All => {
                    let targets: Vec<PortId> = self
                        .outputs
                        .keys()
                        .copied()
                        .filter(|p| *p != in_port)
                        .collect();
                    let mut remaining = targets.len();
                    for port in targets {
                        remaining -= 1;
                        if remaining == 0 {
                            self.output_to(port, emission.packet);
                            break;
                        }
                        match emission.packet.replicate() {
                            Ok(copy) => self.output_to(port, copy),
                            Err(_) => {
                                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    if self.outputs.keys().all(|p| *p == in_port) {
                        // Nowhere to flood.
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn output_to(&mut self, port: PortId, pkt: Packet) {
        let forwarding = self
            .ports
            .get(port)
            .map(|p| p.is_forwarding())
            .unwrap_or(false);
        if !forwarding {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.outputs.get_mut(&port) {
            Some(ring) => match ring.enqueue(pkt) {
                Ok(()) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            None => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
