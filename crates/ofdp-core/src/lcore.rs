//! Logical-core roles, CPU topology and the core-assignment policies.
//!
//! Explicit `--rx/--tx/--w` assignments land in a [`RoleTable`] under the
//! conflict rules the command line documents; without them,
//! [`auto_assign`] splits the enabled lcores between I/O and worker duty
//! according to the `--core-assign` policy.

use std::collections::BTreeMap;

use crate::config::{MAX_NIC_RX_QUEUES_PER_IO_LCORE, MAX_NIC_TX_PORTS_PER_IO_LCORE};
use crate::error::{DpError, DpResult};
use crate::{LcoreId, PortId, QueueId};

/// Core-assignment policy (`--core-assign`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreAssignPolicy {
    /// Skip hyper-thread siblings, then split I/O / worker. Default.
    #[default]
    Performance,
    /// Use siblings too, same split.
    Balance,
    /// Exactly one combined I/O+worker lcore.
    Minimum,
}

impl CoreAssignPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "performance" => Some(CoreAssignPolicy::Performance),
            "balance" => Some(CoreAssignPolicy::Balance),
            "minimum" => Some(CoreAssignPolicy::Minimum),
            _ => None,
        }
    }
}

/// One logical core as the topology reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LcoreInfo {
    pub lcore: LcoreId,
    pub socket: u32,
    /// Physical core id within the socket; shared by HT siblings.
    pub core: u32,
    pub enabled: bool,
}

/// The machine's logical-core layout.
#[derive(Debug, Clone, Default)]
pub struct CpuTopology {
    pub lcores: Vec<LcoreInfo>,
}

impl CpuTopology {
    /// Read the layout from sysfs on Linux; elsewhere every visible CPU
    /// becomes its own single-threaded core on socket 0.
    pub fn detect() -> CpuTopology {
        #[cfg(target_os = "linux")]
        {
            if let Some(topo) = Self::from_sysfs() {
                return topo;
            }
        }
        let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        CpuTopology {
            lcores: (0..n as u32)
                .map(|i| LcoreInfo { lcore: i, socket: 0, core: i, enabled: true })
                .collect(),
        }
    }

    #[cfg(target_os = "linux")]
    fn from_sysfs() -> Option<CpuTopology> {
        let mut lcores = Vec::new();
        let entries = std::fs::read_dir("/sys/devices/system/cpu").ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(idx) = name
                .strip_prefix("cpu")
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            let base = entry.path().join("topology");
            let read_u32 = |p: &std::path::Path| -> Option<u32> {
                std::fs::read_to_string(p).ok()?.trim().parse().ok()
            };
            let socket = read_u32(&base.join("physical_package_id")).unwrap_or(0);
            let core = read_u32(&base.join("core_id")).unwrap_or(idx);
            lcores.push(LcoreInfo { lcore: idx, socket, core, enabled: true });
        }
        if lcores.is_empty() {
            return None;
        }
        lcores.sort_by_key(|l| l.lcore);
        Some(CpuTopology { lcores })
    }

    /// Hand-built topology for tests and `--show-core-config` dry runs.
    pub fn synthetic(lcores: impl IntoIterator<Item = (LcoreId, u32, u32)>) -> CpuTopology {
        CpuTopology {
            lcores: lcores
                .into_iter()
                .map(|(lcore, socket, core)| LcoreInfo { lcore, socket, core, enabled: true })
                .collect(),
        }
    }

    pub fn info(&self, lcore: LcoreId) -> Option<&LcoreInfo> {
        self.lcores.iter().find(|l| l.lcore == lcore)
    }

    pub fn is_enabled(&self, lcore: LcoreId) -> bool {
        self.info(lcore).map(|l| l.enabled).unwrap_or(false)
    }

    pub fn socket_of(&self, lcore: LcoreId) -> u32 {
        self.info(lcore).map(|l| l.socket).unwrap_or(0)
    }

    /// Distinct sockets carrying enabled lcores.
    pub fn sockets(&self) -> Vec<u32> {
        let mut sockets: Vec<u32> =
            self.lcores.iter().filter(|l| l.enabled).map(|l| l.socket).collect();
        sockets.sort_unstable();
        sockets.dedup();
        sockets
    }
}

/// I/O duty of one lcore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoAssignment {
    pub rx_queues: Vec<(PortId, QueueId)>,
    pub tx_ports: Vec<PortId>,
}

/// Role of one lcore.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LcoreRole {
    #[default]
    Disabled,
    Io(IoAssignment),
    Worker,
    /// Combined duty, used when only one lcore is available.
    IoWorker(IoAssignment),
}

impl LcoreRole {
    pub fn is_io(&self) -> bool {
        matches!(self, LcoreRole::Io(_) | LcoreRole::IoWorker(_))
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, LcoreRole::Worker | LcoreRole::IoWorker(_))
    }
}

/// The lcore → role map under construction.
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    roles: BTreeMap<LcoreId, LcoreRole>,
}

impl RoleTable {
    pub fn new() -> Self {
        RoleTable::default()
    }

    pub fn role(&self, lcore: LcoreId) -> LcoreRole {
        self.roles.get(&lcore).cloned().unwrap_or_default()
    }

    /// Bind `(port, queue)` RX to an I/O lcore.
    pub fn add_rx(&mut self, lcore: LcoreId, port: PortId, queue: QueueId) -> DpResult<()> {
        let role = self.roles.entry(lcore).or_default();
        let io = match role {
            LcoreRole::Worker => {
                return Err(DpError::InvalidArgs(format!(
                    "lcore {lcore}: already assigned as worker"
                )));
            }
            LcoreRole::Disabled => {
                *role = LcoreRole::Io(IoAssignment::default());
                match role {
                    LcoreRole::Io(io) => io,
                    _ => unreachable!(),
                }
            }
            LcoreRole::Io(io) | LcoreRole::IoWorker(io) => io,
        };
        if io.rx_queues.contains(&(port, queue)) {
            return Err(DpError::InvalidArgs(format!(
                "port {port} queue {queue}: duplicate RX binding"
            )));
        }
        if io.rx_queues.len() >= MAX_NIC_RX_QUEUES_PER_IO_LCORE {
            return Err(DpError::OutOfRange(format!(
                "lcore {lcore}: more than {MAX_NIC_RX_QUEUES_PER_IO_LCORE} RX queues"
            )));
        }
        io.rx_queues.push((port, queue));
        Ok(())
    }

    /// Bind a TX port to an I/O lcore.
    pub fn add_tx(&mut self, lcore: LcoreId, port: PortId) -> DpResult<()> {
        let role = self.roles.entry(lcore).or_default();
        let io = match role {
            LcoreRole::Worker => {
                return Err(DpError::InvalidArgs(format!(
                    "lcore {lcore}: already assigned as worker"
                )));
            }
            LcoreRole::Disabled => {
                *role = LcoreRole::Io(IoAssignment::default());
                match role {
                    LcoreRole::Io(io) => io,
                    _ => unreachable!(),
                }
            }
            LcoreRole::Io(io) | LcoreRole::IoWorker(io) => io,
        };
        if io.tx_ports.contains(&port) {
            return Err(DpError::InvalidArgs(format!("port {port}: duplicate TX binding")));
        }
        if io.tx_ports.len() >= MAX_NIC_TX_PORTS_PER_IO_LCORE {
            return Err(DpError::OutOfRange(format!(
                "lcore {lcore}: more than {MAX_NIC_TX_PORTS_PER_IO_LCORE} TX ports"
            )));
        }
        io.tx_ports.push(port);
        Ok(())
    }

    /// Mark an lcore as a worker.
    pub fn add_worker(&mut self, lcore: LcoreId) -> DpResult<()> {
        let role = self.roles.entry(lcore).or_default();
        match role {
            LcoreRole::Io(_) | LcoreRole::IoWorker(_) => Err(DpError::InvalidArgs(format!(
                "lcore {lcore}: already assigned as I/O"
            ))),
            LcoreRole::Worker => Err(DpError::InvalidArgs(format!(
                "lcore {lcore}: duplicate worker assignment"
            ))),
            LcoreRole::Disabled => {
                *role = LcoreRole::Worker;
                Ok(())
            }
        }
    }

    pub fn set_combined(&mut self, lcore: LcoreId) {
        self.roles.insert(lcore, LcoreRole::IoWorker(IoAssignment::default()));
    }

    /// Mark an lcore as I/O with ports to be wired later.
    pub fn set_io(&mut self, lcore: LcoreId) {
        self.roles.insert(lcore, LcoreRole::Io(IoAssignment::default()));
    }

    pub fn io_lcores(&self) -> Vec<LcoreId> {
        self.roles
            .iter()
            .filter(|(_, r)| r.is_io())
            .map(|(l, _)| *l)
            .collect()
    }

    pub fn worker_lcores(&self) -> Vec<LcoreId> {
        self.roles
            .iter()
            .filter(|(_, r)| r.is_worker())
            .map(|(l, _)| *l)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LcoreId, &LcoreRole)> {
        self.roles.iter()
    }

    /// Mutable access to an I/O assignment, for port wiring.
    pub fn io_assignment_mut(&mut self, lcore: LcoreId) -> Option<&mut IoAssignment> {
        match self.roles.get_mut(&lcore) {
            Some(LcoreRole::Io(io)) | Some(LcoreRole::IoWorker(io)) => Some(io),
            _ => None,
        }
    }
}

/// Split the enabled non-master lcores into roles per `policy`.
///
/// Under `performance`, an lcore sharing its physical core with any
/// lower-numbered enabled lcore (the HT sibling) is excluded. The surviving
/// list is split in half: first half I/O, second half workers. A single
/// survivor (or `minimum` policy) becomes a combined lcore.
pub fn auto_assign(
    topology: &CpuTopology,
    master: LcoreId,
    policy: CoreAssignPolicy,
) -> DpResult<RoleTable> {
    let mut selected: Vec<LcoreId> = Vec::new();
    for info in topology.lcores.iter().filter(|l| l.enabled) {
        if info.lcore == master {
            continue;
        }
        if policy == CoreAssignPolicy::Performance {
            let sibling = topology
                .lcores
                .iter()
                .filter(|h| h.enabled && h.lcore < info.lcore)
                .any(|h| h.socket == info.socket && h.core == info.core);
            if sibling {
                continue;
            }
        }
        selected.push(info.lcore);
    }

    if selected.is_empty() {
        return Err(DpError::InvalidArgs(match policy {
            CoreAssignPolicy::Performance => {
                "not enough active cores (need at least 2 active cores except for HT cores)".into()
            }
            _ => "not enough active cores (need at least 2 active cores)".into(),
        }));
    }
    if policy == CoreAssignPolicy::Minimum {
        selected.truncate(1);
    }

    let mut roles = RoleTable::new();
    if selected.len() == 1 {
        roles.set_combined(selected[0]);
        return Ok(roles);
    }
    let (io_half, worker_half) = selected.split_at(selected.len() / 2);
    for &lcore in io_half {
        roles.roles.insert(lcore, LcoreRole::Io(IoAssignment::default()));
    }
    for &lcore in worker_half {
        roles.roles.insert(lcore, LcoreRole::Worker);
    }
    Ok(roles)
}

/// Pin the calling thread to `lcore`. Best-effort off Linux.
pub fn pin_current_thread(lcore: LcoreId) -> DpResult<()> {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(lcore as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(DpError::NotOperational);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = lcore;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four lcores, one socket, no HT siblings: the reference scenario.
    fn flat_topology() -> CpuTopology {
        CpuTopology::synthetic([(0, 0, 0), (1, 0, 1), (2, 0, 2), (3, 0, 3), (4, 0, 4)])
    }

    #[test]
    fn performance_split_half_io_half_worker() {
        let roles = auto_assign(&flat_topology(), 0, CoreAssignPolicy::Performance).unwrap();
        assert_eq!(roles.io_lcores(), vec![1, 2]);
        assert_eq!(roles.worker_lcores(), vec![3, 4]);
    }

    #[test]
    fn performance_skips_ht_siblings() {
        // lcores 4..7 are HT siblings of 0..3.
        let topo = CpuTopology::synthetic([
            (0, 0, 0),
            (1, 0, 1),
            (2, 0, 2),
            (3, 0, 3),
            (4, 0, 0),
            (5, 0, 1),
            (6, 0, 2),
            (7, 0, 3),
        ]);
        let roles = auto_assign(&topo, 0, CoreAssignPolicy::Performance).unwrap();
        assert_eq!(roles.io_lcores(), vec![1]);
        assert_eq!(roles.worker_lcores(), vec![2, 3]);
        // No selected pair shares a physical core.
        for &a in roles.io_lcores().iter().chain(&roles.worker_lcores()) {
            for &b in roles.io_lcores().iter().chain(&roles.worker_lcores()) {
                if a != b {
                    let (ia, ib) = (topo.info(a).unwrap(), topo.info(b).unwrap());
                    assert!(!(ia.socket == ib.socket && ia.core == ib.core));
                }
            }
        }
    }

    #[test]
    fn balance_includes_siblings() {
        let topo = CpuTopology::synthetic([(0, 0, 0), (1, 0, 1), (2, 0, 0), (3, 0, 1)]);
        let roles = auto_assign(&topo, 0, CoreAssignPolicy::Balance).unwrap();
        assert_eq!(roles.io_lcores().len() + roles.worker_lcores().len(), 3);
    }

    #[test]
    fn minimum_selects_one_combined() {
        let roles = auto_assign(&flat_topology(), 0, CoreAssignPolicy::Minimum).unwrap();
        assert_eq!(roles.role(1), LcoreRole::IoWorker(IoAssignment::default()));
        assert!(roles.worker_lcores() == vec![1] && roles.io_lcores() == vec![1]);
    }

    #[test]
    fn single_survivor_is_combined() {
        let topo = CpuTopology::synthetic([(0, 0, 0), (1, 0, 1)]);
        let roles = auto_assign(&topo, 0, CoreAssignPolicy::Performance).unwrap();
        assert!(matches!(roles.role(1), LcoreRole::IoWorker(_)));
    }

    #[test]
    fn no_survivors_is_an_error() {
        let topo = CpuTopology::synthetic([(0, 0, 0)]);
        assert!(auto_assign(&topo, 0, CoreAssignPolicy::Performance).is_err());
    }

    #[test]
    fn role_conflicts_are_rejected() {
        let mut roles = RoleTable::new();
        roles.add_rx(1, 0, 0).unwrap();
        let err = roles.add_worker(1).unwrap_err();
        assert!(err.to_string().contains("already assigned as I/O"));

        let mut roles = RoleTable::new();
        roles.add_worker(2).unwrap();
        let err = roles.add_rx(2, 0, 0).unwrap_err();
        assert!(err.to_string().contains("already assigned as worker"));
    }

    #[test]
    fn duplicate_queue_binding_rejected() {
        let mut roles = RoleTable::new();
        roles.add_rx(1, 0, 0).unwrap();
        assert!(roles.add_rx(1, 0, 0).is_err());
        roles.add_rx(1, 0, 1).unwrap();
        assert_eq!(roles.io_lcores(), vec![1]);
    }

    #[test]
    fn every_lcore_has_exactly_one_role() {
        let roles = auto_assign(&flat_topology(), 0, CoreAssignPolicy::Performance).unwrap();
        for lcore in 1..=4u32 {
            let role = roles.role(lcore);
            let io = role.is_io();
            let worker = role.is_worker();
            assert!(io ^ worker, "lcore {lcore} must be exactly one of I/O or worker");
        }
    }
}
