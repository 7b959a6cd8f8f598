//! Port descriptors and the port table.
//!
//! Link and operational state may be written only by the I/O layer and the
//! port monitor; counters are relaxed atomics bumped from the hot path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{DpError, DpResult};
use crate::timer::now_secs;
use crate::{PortId, QueueId};

/// Operational state, following the ifOperStatus vocabulary the SNMP
/// sub-agent exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperState {
    Up,
    Down,
    Testing,
    Unknown,
    Dormant,
    NotPresent,
    LowerLayerDown,
}

impl OperState {
    fn as_u8(self) -> u8 {
        match self {
            OperState::Up => 0,
            OperState::Down => 1,
            OperState::Testing => 2,
            OperState::Unknown => 3,
            OperState::Dormant => 4,
            OperState::NotPresent => 5,
            OperState::LowerLayerDown => 6,
        }
    }

    fn from_u8(v: u8) -> OperState {
        match v {
            0 => OperState::Up,
            1 => OperState::Down,
            2 => OperState::Testing,
            4 => OperState::Dormant,
            5 => OperState::NotPresent,
            6 => OperState::LowerLayerDown,
            _ => OperState::Unknown,
        }
    }
}

/// Monotonic per-port counters.
#[derive(Debug, Default)]
pub struct PortCounters {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub tx_dropped: AtomicU64,
    pub rx_errors: AtomicU64,
    pub tx_errors: AtomicU64,
}

impl PortCounters {
    pub fn count_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// One attached port.
#[derive(Debug)]
pub struct Port {
    pub port_id: PortId,
    /// Driver-level index (ifIndex for the SNMP view).
    pub physical_index: u32,
    pub name: String,
    pub ingress_queues: Vec<QueueId>,
    pub egress_queues: Vec<QueueId>,
    link_up: AtomicBool,
    admin_enabled: AtomicBool,
    oper_state: AtomicU8,
    last_change: AtomicU64,
    pub counters: PortCounters,
}

impl Port {
    pub fn new(port_id: PortId, physical_index: u32, name: impl Into<String>) -> Port {
        Port {
            port_id,
            physical_index,
            name: name.into(),
            ingress_queues: Vec::new(),
            egress_queues: Vec::new(),
            link_up: AtomicBool::new(false),
            admin_enabled: AtomicBool::new(true),
            oper_state: AtomicU8::new(OperState::Unknown.as_u8()),
            last_change: AtomicU64::new(0),
            counters: PortCounters::default(),
        }
    }

    pub fn oper_state(&self) -> OperState {
        OperState::from_u8(self.oper_state.load(Ordering::Relaxed))
    }

    pub fn link_is_up(&self) -> bool {
        self.link_up.load(Ordering::Relaxed)
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_enabled.load(Ordering::Relaxed)
    }

    /// Admin enable/disable from the datastore collaborator.
    pub fn set_admin(&self, enabled: bool) {
        self.admin_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Update link/oper state; returns true when the state changed and
    /// records the change time. I/O layer and monitor only.
    pub fn set_oper_state(&self, state: OperState) -> bool {
        let prev = self.oper_state.swap(state.as_u8(), Ordering::Relaxed);
        self.link_up.store(state == OperState::Up, Ordering::Relaxed);
        let changed = prev != state.as_u8();
        if changed {
            self.last_change.store(now_secs(), Ordering::Relaxed);
        }
        changed
    }

    pub fn last_change(&self) -> u64 {
        self.last_change.load(Ordering::Relaxed)
    }

    /// Forwarding requires both sides: operator intent and link.
    pub fn is_forwarding(&self) -> bool {
        self.admin_enabled() && self.link_is_up()
    }
}

/// The attached-port registry.
#[derive(Default)]
pub struct PortTable {
    ports: RwLock<Vec<Arc<Port>>>,
}

impl PortTable {
    pub fn new() -> Self {
        PortTable::default()
    }

    pub fn attach(&self, port: Port) -> DpResult<Arc<Port>> {
        let mut ports = self.ports.write();
        if ports.iter().any(|p| p.port_id == port.port_id) {
            return Err(DpError::AlreadyExists);
        }
        let port = Arc::new(port);
        ports.push(port.clone());
        Ok(port)
    }

    pub fn detach(&self, port_id: PortId) -> DpResult<Arc<Port>> {
        let mut ports = self.ports.write();
        let idx = ports
            .iter()
            .position(|p| p.port_id == port_id)
            .ok_or(DpError::NotFound)?;
        Ok(ports.remove(idx))
    }

    pub fn get(&self, port_id: PortId) -> Option<Arc<Port>> {
        self.ports.read().iter().find(|p| p.port_id == port_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Port>> {
        self.ports.read().clone()
    }

    pub fn len(&self) -> usize {
        self.ports.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.read().is_empty()
    }

    /// Map a port id to its position in the stable enumeration order, the
    /// index external table walkers use.
    pub fn index_of(&self, port_id: PortId) -> Option<usize> {
        self.ports.read().iter().position(|p| p.port_id == port_id)
    }
}
