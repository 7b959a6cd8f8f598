//! The engine: one explicit value constructed in `main` that owns the
//! port table, bridges, buffer pools, ring mesh and lcore threads, and
//! plugs the dataplane into the module supervisor.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::bridge::{Bridge, process_expired};
use crate::cache::{FlowCache, KvsType};
use crate::config::{DEFAULT_MEMPOOL_BUFFERS, ResolvedConfig};
use crate::driver::PortDriver;
use crate::error::{DpError, DpResult};
use crate::events::{DpEvent, EventHub};
use crate::io::{IoLcore, IoStats, TxDrain};
use crate::lcore::{LcoreRole, RoleTable};
use crate::module::{
    DpModule, ShutdownLevel, SpawnedThread, StateGate, ThreadCtl, spawn_module_thread,
};
use crate::monitor::PortMonitor;
use crate::pool::BufferPool;
use crate::port::{Port, PortTable};
use crate::ring::{RingConsumer, RingProducer, ring};
use crate::stats::{
    BridgeStatSnapshot, PipelineStatSnapshot, PortStatSnapshot, bridge_stats, pipeline_stats,
    port_stats,
};
use crate::timer::TimerWheel;
use crate::worker::{Worker, WorkerStats};
use crate::{LcoreId, PortId};

/// OpenFlow 1.3 table-id space per bridge.
const DEFAULT_FLOW_TABLES: u8 = 255;

/// The dataplane engine.
pub struct Engine {
    config: ResolvedConfig,
    topology: crate::lcore::CpuTopology,
    driver: Arc<dyn PortDriver>,
    ports: Arc<PortTable>,
    bridges: Vec<Arc<Bridge>>,
    port_bridge: Arc<HashMap<PortId, Arc<Bridge>>>,
    pool: Arc<BufferPool>,
    wheel: Arc<Mutex<TimerWheel>>,
    events: Arc<EventHub>,
    io_stats: Mutex<Vec<Arc<IoStats>>>,
    worker_stats: Mutex<Vec<Arc<WorkerStats>>>,
}

impl Engine {
    pub fn new(
        config: ResolvedConfig,
        topology: crate::lcore::CpuTopology,
        driver: Arc<dyn PortDriver>,
    ) -> DpResult<Arc<Engine>> {
        Engine::with_pool_buffers(config, topology, driver, DEFAULT_MEMPOOL_BUFFERS)
    }

    /// Like [`Engine::new`] with an explicit per-socket pool size; tests
    /// use small pools.
    pub fn with_pool_buffers(
        config: ResolvedConfig,
        topology: crate::lcore::CpuTopology,
        driver: Arc<dyn PortDriver>,
        pool_buffers: usize,
    ) -> DpResult<Arc<Engine>> {
        if config.roles.worker_lcores().is_empty() {
            return Err(DpError::InvalidArgs("no worker lcores in the layout".into()));
        }
        if config.roles.io_lcores().is_empty() {
            return Err(DpError::InvalidArgs("no I/O lcores in the layout".into()));
        }

        let segments: Vec<(u32, usize)> = topology
            .sockets()
            .into_iter()
            .map(|s| (s, pool_buffers))
            .collect();
        let pool = BufferPool::new(
            &segments,
            crate::buffer::DEFAULT_BUFFER_CAPACITY,
            crate::buffer::DEFAULT_HEADROOM,
            true,
        )?;

        let events = Arc::new(EventHub::new());
        let wheel = Arc::new(Mutex::new(TimerWheel::new()));

        let ports = Arc::new(PortTable::new());
        let bridge = Bridge::new(
            "br0",
            0x1,
            DEFAULT_FLOW_TABLES,
            wheel.clone(),
            events.clone(),
        );
        let mut port_bridge = HashMap::new();
        for (i, port_id) in driver.ports().into_iter().enumerate() {
            let mut port = Port::new(port_id, i as u32, format!("port{port_id}"));
            // Single-queue ports in the software configuration.
            port.ingress_queues.push(0);
            port.egress_queues.push(0);
            ports.attach(port)?;
            bridge.add_port(port_id)?;
            port_bridge.insert(port_id, bridge.clone());
        }

        Ok(Arc::new(Engine {
            config,
            topology,
            driver,
            ports,
            bridges: vec![bridge],
            port_bridge: Arc::new(port_bridge),
            pool,
            wheel,
            events,
            io_stats: Mutex::new(Vec::new()),
            worker_stats: Mutex::new(Vec::new()),
        }))
    }

    // -- surface for collaborators --------------------------------------

    pub fn default_bridge(&self) -> Arc<Bridge> {
        self.bridges[0].clone()
    }

    pub fn bridges(&self) -> &[Arc<Bridge>] {
        &self.bridges
    }

    pub fn ports(&self) -> Arc<PortTable> {
        self.ports.clone()
    }

    pub fn pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    pub fn subscribe_events(&self) -> crossbeam_channel::Receiver<DpEvent> {
        self.events.subscribe()
    }

    /// Datastore surface: admin enable/disable of a port.
    pub fn set_port_admin(&self, port_id: PortId, enabled: bool) -> DpResult<()> {
        let port = self.ports.get(port_id).ok_or(DpError::NotFound)?;
        port.set_admin(enabled);
        Ok(())
    }

    pub fn port_stats(&self) -> Vec<PortStatSnapshot> {
        port_stats(&self.ports)
    }

    pub fn bridge_stats(&self) -> Vec<BridgeStatSnapshot> {
        bridge_stats(&self.bridges)
    }

    pub fn pipeline_stats(&self) -> PipelineStatSnapshot {
        pipeline_stats(&self.io_stats.lock(), &self.worker_stats.lock())
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    // -- modules ---------------------------------------------------------

    /// The packet-forwarding module ("dp_core" in the registry).
    pub fn dataplane_module(self: &Arc<Self>) -> DataplaneModule {
        DataplaneModule {
            engine: self.clone(),
            threads: Vec::new(),
        }
    }

    /// The flow-expiry module ("dp_timer" in the registry).
    pub fn timer_module(self: &Arc<Self>) -> TimerModule {
        TimerModule {
            wheel: self.wheel.clone(),
        }
    }

    // -- wiring ----------------------------------------------------------

    /// Final roles with ports wired in: explicit layouts verbatim, auto
    /// layouts with the driver's ports spread round-robin over the I/O
    /// lcores.
    fn wired_roles(&self) -> RoleTable {
        let mut roles = self.config.roles.clone();
        if !self.config.explicit {
            let io = roles.io_lcores();
            for (i, port) in self.driver.ports().into_iter().enumerate() {
                let target = io[i % io.len()];
                if let Some(assign) = roles.io_assignment_mut(target) {
                    assign.rx_queues.push((port, 0));
                    assign.tx_ports.push(port);
                }
            }
        }
        roles
    }

    /// Build the lcore units and the ring mesh between them.
    fn build_units(&self) -> DpResult<Vec<LcoreUnit>> {
        let roles = self.wired_roles();
        let io_lcores = roles.io_lcores();
        let worker_lcores = roles.worker_lcores();
        let n_workers = worker_lcores.len();

        // Worker-input rings: one per (I/O lcore, worker).
        let mut input_producers: HashMap<LcoreId, Vec<RingProducer<crate::pool::Packet>>> =
            HashMap::new();
        let mut input_consumers: Vec<Vec<RingConsumer<crate::pool::Packet>>> =
            (0..n_workers).map(|_| Vec::new()).collect();
        for &io_lcore in &io_lcores {
            let mut producers = Vec::new();
            for consumers in input_consumers.iter_mut() {
                let (tx, rx) = ring(self.config.ring_sizes.worker_in)?;
                producers.push(tx);
                consumers.push(rx);
            }
            input_producers.insert(io_lcore, producers);
        }

        // Worker-output rings: one per (worker, TX port), drained by the
        // I/O lcore owning that port.
        let mut output_producers: Vec<HashMap<PortId, RingProducer<crate::pool::Packet>>> =
            (0..n_workers).map(|_| HashMap::new()).collect();
        let mut drains: HashMap<LcoreId, Vec<TxDrain>> = HashMap::new();
        for &io_lcore in &io_lcores {
            let tx_ports = match roles.role(io_lcore) {
                LcoreRole::Io(io) | LcoreRole::IoWorker(io) => io.tx_ports,
                _ => Vec::new(),
            };
            let mut lcore_drains = Vec::new();
            for port in tx_ports {
                let mut rings = Vec::new();
                for producers in output_producers.iter_mut() {
                    let (tx, rx) = ring(self.config.ring_sizes.worker_out)?;
                    producers.insert(port, tx);
                    rings.push(rx);
                }
                lcore_drains.push(TxDrain { port, rings });
            }
            drains.insert(io_lcore, lcore_drains);
        }

        let mut units = Vec::new();
        let mut worker_iter = worker_lcores.iter().enumerate();
        for (&lcore, role) in roles.iter() {
            match role {
                LcoreRole::Disabled => {}
                LcoreRole::Io(io) => {
                    units.push(LcoreUnit::Io(self.make_io(
                        lcore,
                        io.rx_queues.clone(),
                        input_producers.remove(&lcore).unwrap_or_default(),
                        drains.remove(&lcore).unwrap_or_default(),
                    )));
                }
                LcoreRole::Worker => {
                    let (worker_id, _) = worker_iter
                        .next()
                        .ok_or_else(|| DpError::InvalidArgs("worker list mismatch".into()))?;
                    units.push(LcoreUnit::Worker(self.make_worker(
                        worker_id,
                        lcore,
                        std::mem::take(&mut input_consumers[worker_id]),
                        std::mem::take(&mut output_producers[worker_id]),
                    )));
                }
                LcoreRole::IoWorker(io) => {
                    let (worker_id, _) = worker_iter
                        .next()
                        .ok_or_else(|| DpError::InvalidArgs("worker list mismatch".into()))?;
                    let io_unit = self.make_io(
                        lcore,
                        io.rx_queues.clone(),
                        input_producers.remove(&lcore).unwrap_or_default(),
                        drains.remove(&lcore).unwrap_or_default(),
                    );
                    let worker_unit = self.make_worker(
                        worker_id,
                        lcore,
                        std::mem::take(&mut input_consumers[worker_id]),
                        std::mem::take(&mut output_producers[worker_id]),
                    );
                    units.push(LcoreUnit::Combined(Box::new(io_unit), Box::new(worker_unit)));
                }
            }
        }
        Ok(units)
    }

    fn make_io(
        &self,
        lcore: LcoreId,
        rx_queues: Vec<(PortId, crate::QueueId)>,
        workers: Vec<RingProducer<crate::pool::Packet>>,
        tx: Vec<TxDrain>,
    ) -> IoLcore {
        let stats = Arc::new(IoStats::default());
        self.io_stats.lock().push(stats.clone());
        IoLcore::new(
            lcore,
            self.topology.socket_of(lcore),
            rx_queues,
            workers,
            tx,
            self.driver.clone(),
            self.pool.clone(),
            self.ports.clone(),
            self.config.burst_sizes,
            self.config.fifoness,
            stats,
        )
    }

    fn make_worker(
        &self,
        worker_id: usize,
        lcore: LcoreId,
        inputs: Vec<RingConsumer<crate::pool::Packet>>,
        outputs: HashMap<PortId, RingProducer<crate::pool::Packet>>,
    ) -> Worker {
        let stats = Arc::new(WorkerStats::default());
        self.worker_stats.lock().push(stats.clone());
        let cache = if self.config.cache_enabled {
            let kvs = match self.config.kvs_type {
                KvsType::RteHash => {
                    warn!("kvstype rte_hash needs the accelerated driver; using hashmap_nolock");
                    KvsType::HashmapNolock
                }
                other => other,
            };
            Some(FlowCache::new(kvs))
        } else {
            None
        };
        Worker::new(
            worker_id,
            lcore,
            inputs,
            outputs,
            self.port_bridge.clone(),
            cache,
            self.config.hash_type,
            self.ports.clone(),
            self.events.clone(),
            self.config.burst_sizes,
            stats,
        )
    }
}

/// One pinned thread's duty.
enum LcoreUnit {
    Io(IoLcore),
    Worker(Worker),
    Combined(Box<IoLcore>, Box<Worker>),
}

impl LcoreUnit {
    fn lcore(&self) -> LcoreId {
        match self {
            LcoreUnit::Io(io) => io.lcore,
            LcoreUnit::Worker(w) => w.lcore,
            LcoreUnit::Combined(io, _) => io.lcore,
        }
    }

    fn run(self, ctl: ThreadCtl) -> DpResult<()> {
        match self {
            LcoreUnit::Io(io) => io.run(ctl),
            LcoreUnit::Worker(w) => w.run(ctl),
            LcoreUnit::Combined(mut io, mut w) => {
                ctl.gate.wait_started()?;
                let _ = crate::lcore::pin_current_thread(io.lcore);
                info!("lcore {} (I/O worker) main loop", io.lcore);
                while !ctl.should_stop() {
                    let moved = io.poll_once() + w.poll_once();
                    if moved == 0 {
                        std::hint::spin_loop();
                        std::thread::yield_now();
                    }
                }
                Ok(())
            }
        }
    }
}

/// The forwarding module: spawns the monitor and every lcore thread.
/// Shutdown stops the monitor first, then workers, then I/O lcores.
pub struct DataplaneModule {
    engine: Arc<Engine>,
    threads: Vec<SpawnedThread>,
}

impl DpModule for DataplaneModule {
    fn init(&mut self, gate: &Arc<StateGate>) -> DpResult<Option<SpawnedThread>> {
        let monitor = PortMonitor::new(
            self.engine.driver.clone(),
            self.engine.ports.clone(),
            self.engine.events.clone(),
        );
        self.threads
            .push(spawn_module_thread("dp_monitor", gate.clone(), move |ctl| {
                monitor.run(ctl)
            })?);

        let mut units = self.engine.build_units()?;
        // Workers before I/O in the shutdown walk below; spawn order is
        // monitor, workers, I/O.
        units.sort_by_key(|u| match u {
            LcoreUnit::Worker(_) => 0,
            LcoreUnit::Combined(_, _) => 1,
            LcoreUnit::Io(_) => 2,
        });
        for unit in units {
            let name = format!("dp_lcore{}", unit.lcore());
            self.threads
                .push(spawn_module_thread(&name, gate.clone(), move |ctl| unit.run(ctl))?);
        }
        info!(
            "dataplane: {} threads spawned ({} ports)",
            self.threads.len(),
            self.engine.ports.len()
        );
        Ok(None)
    }

    fn shutdown(&mut self, level: ShutdownLevel) -> DpResult<()> {
        let mut first_err = None;
        for thread in self.threads.iter_mut() {
            if let Err(e) = thread.shutdown(level) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop(&mut self) -> DpResult<()> {
        for thread in &self.threads {
            thread.stop();
        }
        Ok(())
    }

    fn finalize(&mut self) {
        for thread in self.threads.iter_mut() {
            thread.reap();
        }
        self.threads.clear();
    }
}

/// The timer module: one thread ticking the wheel at one-second
/// granularity and expiring due slots.
pub struct TimerModule {
    wheel: Arc<Mutex<TimerWheel>>,
}

impl DpModule for TimerModule {
    fn init(&mut self, gate: &Arc<StateGate>) -> DpResult<Option<SpawnedThread>> {
        let wheel = self.wheel.clone();
        let thread = spawn_module_thread("dp_timer", gate.clone(), move |ctl| {
            ctl.gate.wait_started()?;
            loop {
                if ctl.wait_shutdown(std::time::Duration::from_secs(1)) {
                    return Ok(());
                }
                let due = wheel.lock().advance(1);
                if !due.is_empty() {
                    process_expired(due, &wheel);
                }
            }
        })?;
        Ok(Some(thread))
    }
}
