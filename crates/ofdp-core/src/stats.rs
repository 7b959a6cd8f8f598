//! Read-side statistics surface for the SNMP sub-agent and the datastore.
//!
//! Snapshots are plain serializable values taken at call time; callers get
//! a consistent copy and never hold dataplane locks.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::PortId;
use crate::bridge::Bridge;
use crate::io::IoStats;
use crate::port::{OperState, Port, PortTable};
use crate::worker::WorkerStats;

/// One port's counters and state at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct PortStatSnapshot {
    pub port_id: PortId,
    pub physical_index: u32,
    pub name: String,
    pub admin_enabled: bool,
    pub oper_state: OperState,
    pub last_change: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

impl From<&Port> for PortStatSnapshot {
    fn from(port: &Port) -> Self {
        let c = &port.counters;
        PortStatSnapshot {
            port_id: port.port_id,
            physical_index: port.physical_index,
            name: port.name.clone(),
            admin_enabled: port.admin_enabled(),
            oper_state: port.oper_state(),
            last_change: port.last_change(),
            rx_packets: c.rx_packets.load(Ordering::Relaxed),
            tx_packets: c.tx_packets.load(Ordering::Relaxed),
            rx_bytes: c.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: c.tx_bytes.load(Ordering::Relaxed),
            rx_dropped: c.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: c.tx_dropped.load(Ordering::Relaxed),
            rx_errors: c.rx_errors.load(Ordering::Relaxed),
            tx_errors: c.tx_errors.load(Ordering::Relaxed),
        }
    }
}

/// Per-table entry counts within a bridge snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TableStatSnapshot {
    pub table_id: u8,
    pub flows: usize,
}

/// One bridge's flow-table shape.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatSnapshot {
    pub name: String,
    pub dpid: u64,
    pub generation: u64,
    pub flow_count: usize,
    pub ports: Vec<PortId>,
    pub tables: Vec<TableStatSnapshot>,
}

impl From<&Bridge> for BridgeStatSnapshot {
    fn from(bridge: &Bridge) -> Self {
        BridgeStatSnapshot {
            name: bridge.name.clone(),
            dpid: bridge.dpid,
            generation: bridge.generation(),
            flow_count: bridge.flow_count(),
            ports: bridge.ports(),
            tables: bridge
                .table_sizes()
                .into_iter()
                .map(|(table_id, flows)| TableStatSnapshot { table_id, flows })
                .collect(),
        }
    }
}

/// Aggregated pipeline counters across lcores.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatSnapshot {
    pub rx_packets: u64,
    pub rx_dropped: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
    pub processed: u64,
    pub worker_dropped: u64,
    pub sent: u64,
    pub punted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Snapshot every attached port, in enumeration order.
pub fn port_stats(ports: &PortTable) -> Vec<PortStatSnapshot> {
    ports.list().iter().map(|p| PortStatSnapshot::from(p.as_ref())).collect()
}

/// Snapshot one port by id.
pub fn port_stat(ports: &PortTable, port_id: PortId) -> Option<PortStatSnapshot> {
    ports.get(port_id).map(|p| PortStatSnapshot::from(p.as_ref()))
}

/// Snapshot a set of bridges.
pub fn bridge_stats(bridges: &[Arc<Bridge>]) -> Vec<BridgeStatSnapshot> {
    bridges.iter().map(|b| BridgeStatSnapshot::from(b.as_ref())).collect()
}

/// Fold lcore counters into one pipeline view.
pub fn pipeline_stats(io: &[Arc<IoStats>], workers: &[Arc<WorkerStats>]) -> PipelineStatSnapshot {
    let mut out = PipelineStatSnapshot::default();
    for s in io {
        out.rx_packets += s.rx_packets.load(Ordering::Relaxed);
        out.rx_dropped += s.rx_dropped.load(Ordering::Relaxed);
        out.tx_packets += s.tx_packets.load(Ordering::Relaxed);
        out.tx_dropped += s.tx_dropped.load(Ordering::Relaxed);
    }
    for s in workers {
        out.processed += s.processed.load(Ordering::Relaxed);
        out.worker_dropped += s.dropped.load(Ordering::Relaxed);
        out.sent += s.sent.load(Ordering::Relaxed);
        out.punted += s.punted.load(Ordering::Relaxed);
        out.cache_hits += s.cache_hits.load(Ordering::Relaxed);
        out.cache_misses += s.cache_misses.load(Ordering::Relaxed);
    }
    out
}
