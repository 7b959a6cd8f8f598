//! Dataplane configuration: build-time constants, the `--rx/--tx/--w/
//! --rsz/--bsz` argument grammars, and resolution into a runnable layout.
//!
//! The string grammars live here rather than in the CLI crate so their
//! validation rules (and the distinct errors they produce) are testable
//! without spawning a process.

use crate::cache::KvsType;
use crate::error::{DpError, DpResult};
use crate::hash::HashType;
use crate::lcore::{CoreAssignPolicy, CpuTopology, LcoreRole, RoleTable, auto_assign};
use crate::{LcoreId, PortId, QueueId};

// Build-time limits of the lcore and port fabric.
pub const MAX_LCORES: u32 = 128;
pub const MAX_NIC_PORTS: u32 = 32;
pub const MAX_RX_QUEUES_PER_NIC_PORT: u16 = 128;
pub const MAX_IO_LCORES: usize = 32;
pub const MAX_WORKER_LCORES: usize = 32;
pub const MAX_NIC_RX_QUEUES_PER_IO_LCORE: usize = 32;
pub const MAX_NIC_TX_PORTS_PER_IO_LCORE: usize = 32;

/// Capacity of the per-loop packet arrays; no burst may exceed it.
pub const BUFFER_ARRAY_CAPACITY: usize = 1024;

// Default ring and burst geometry.
pub const DEFAULT_NIC_RX_RING_SIZE: usize = 1024;
pub const DEFAULT_NIC_TX_RING_SIZE: usize = 1024;
pub const DEFAULT_RING_RX_SIZE: usize = 1024;
pub const DEFAULT_RING_TX_SIZE: usize = 1024;
pub const DEFAULT_BURST_SIZE: usize = 144;

/// Buffers per pool socket segment.
pub const DEFAULT_MEMPOOL_BUFFERS: usize = 8192 * 4;

const MAX_ARG_CHARS: usize = 4096;
const MAX_ARG_TUPLES: usize = 128;
const MAX_SIZE_ARG_CHARS: usize = 63;

/// Packet-order preservation granularity (`--fifoness`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fifoness {
    /// No ordering promise; round-robin dispatch.
    None,
    /// Order preserved per ingress port.
    Port,
    /// Order preserved per flow (5-tuple hash dispatch). Default.
    #[default]
    Flow,
}

impl Fifoness {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Fifoness::None),
            "port" => Some(Fifoness::Port),
            "flow" => Some(Fifoness::Flow),
            _ => None,
        }
    }
}

impl std::fmt::Display for Fifoness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fifoness::None => write!(f, "none"),
            Fifoness::Port => write!(f, "port"),
            Fifoness::Flow => write!(f, "flow"),
        }
    }
}

/// The four software/NIC ring sizes (`--rsz "A,B,C,D"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSizes {
    pub nic_rx: usize,
    pub worker_in: usize,
    pub worker_out: usize,
    pub nic_tx: usize,
}

impl Default for RingSizes {
    fn default() -> Self {
        RingSizes {
            nic_rx: DEFAULT_NIC_RX_RING_SIZE,
            worker_in: DEFAULT_RING_RX_SIZE,
            worker_out: DEFAULT_RING_TX_SIZE,
            nic_tx: DEFAULT_NIC_TX_RING_SIZE,
        }
    }
}

impl RingSizes {
    pub fn validate(&self) -> DpResult<()> {
        for (name, v) in [
            ("nic-rx", self.nic_rx),
            ("worker-in", self.worker_in),
            ("worker-out", self.worker_out),
            ("nic-tx", self.nic_tx),
        ] {
            if v == 0 {
                return Err(DpError::OutOfRange(format!("{name} ring size is zero")));
            }
            if !v.is_power_of_two() {
                return Err(DpError::OutOfRange(format!(
                    "{name} ring size {v} is not a power of two"
                )));
            }
        }
        Ok(())
    }
}

/// The six burst sizes (`--bsz "(A,B),(C,D),(E,F)"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstSizes {
    pub io_rx_read: usize,
    pub io_rx_write: usize,
    pub worker_read: usize,
    pub worker_write: usize,
    pub io_tx_read: usize,
    pub io_tx_write: usize,
}

impl Default for BurstSizes {
    fn default() -> Self {
        BurstSizes {
            io_rx_read: DEFAULT_BURST_SIZE,
            io_rx_write: DEFAULT_BURST_SIZE,
            worker_read: DEFAULT_BURST_SIZE,
            worker_write: DEFAULT_BURST_SIZE,
            io_tx_read: DEFAULT_BURST_SIZE,
            io_tx_write: DEFAULT_BURST_SIZE,
        }
    }
}

impl BurstSizes {
    pub fn validate(&self) -> DpResult<()> {
        for (name, v) in [
            ("io-rx-read", self.io_rx_read),
            ("io-rx-write", self.io_rx_write),
            ("worker-read", self.worker_read),
            ("worker-write", self.worker_write),
            ("io-tx-read", self.io_tx_read),
            ("io-tx-write", self.io_tx_write),
        ] {
            if v == 0 {
                return Err(DpError::OutOfRange(format!("{name} burst size is zero")));
            }
            if v > BUFFER_ARRAY_CAPACITY {
                return Err(DpError::OutOfRange(format!(
                    "{name} burst size {v} exceeds the buffer array capacity {BUFFER_ARRAY_CAPACITY}"
                )));
            }
        }
        if 2 * self.io_tx_read > BUFFER_ARRAY_CAPACITY {
            return Err(DpError::OutOfRange(format!(
                "io-tx-read burst {} leaves no drain slack in the buffer array",
                self.io_tx_read
            )));
        }
        Ok(())
    }
}

/// Raw operator input, straight off the command line.
#[derive(Debug, Clone, Default)]
pub struct DpConfig {
    pub rx: Option<String>,
    pub tx: Option<String>,
    pub workers: Option<String>,
    /// `-w N`: worker count hint for auto-assignment.
    pub n_workers: Option<usize>,
    pub core_assign: CoreAssignPolicy,
    pub rsz: Option<String>,
    pub bsz: Option<String>,
    pub no_cache: bool,
    pub kvs_type: KvsType,
    pub hash_type: HashType,
    pub fifoness: Fifoness,
}

/// A validated, runnable layout.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub roles: RoleTable,
    pub ring_sizes: RingSizes,
    pub burst_sizes: BurstSizes,
    pub cache_enabled: bool,
    pub kvs_type: KvsType,
    pub hash_type: HashType,
    pub fifoness: Fifoness,
    /// True when `--rx/--tx/--w` pinned the layout by hand.
    pub explicit: bool,
}

/// Validate `cfg` against the machine and produce the layout.
pub fn resolve(cfg: &DpConfig, topology: &CpuTopology, master: LcoreId) -> DpResult<ResolvedConfig> {
    let ring_sizes = match &cfg.rsz {
        Some(s) => parse_rsz_arg(s)?,
        None => RingSizes::default(),
    };
    ring_sizes.validate()?;
    let burst_sizes = match &cfg.bsz {
        Some(s) => parse_bsz_arg(s)?,
        None => BurstSizes::default(),
    };
    burst_sizes.validate()?;

    let given = [cfg.rx.is_some(), cfg.tx.is_some(), cfg.workers.is_some()];
    let n_given = given.iter().filter(|g| **g).count();
    let (roles, explicit) = if n_given == 0 {
        let mut roles = auto_assign(topology, master, cfg.core_assign)?;
        if let Some(n) = cfg.n_workers {
            roles = resplit_workers(roles, n)?;
        }
        (roles, false)
    } else {
        // Bind whatever was given first, so an lcore claimed for both I/O
        // and worker duty is diagnosed as the conflict it is, even when
        // the rest of the triple is missing.
        let mut roles = RoleTable::new();
        if let Some(rx) = &cfg.rx {
            parse_rx_arg(rx, &mut roles, topology)?;
        }
        if let Some(tx) = &cfg.tx {
            parse_tx_arg(tx, &mut roles, topology)?;
        }
        if let Some(w) = &cfg.workers {
            parse_w_arg(w, &mut roles, topology)?;
        }
        if n_given != 3 {
            return Err(DpError::InvalidArgs(
                "not all mandatory arguments are present (--rx, --tx and --w go together)".into(),
            ));
        }
        check_global_bindings(&roles)?;
        check_rx_ports_have_tx(&roles)?;
        (roles, true)
    };

    let n_io = roles.io_lcores().len();
    let n_workers = roles.worker_lcores().len();
    if n_io > MAX_IO_LCORES {
        return Err(DpError::OutOfRange(format!("{n_io} I/O lcores exceed {MAX_IO_LCORES}")));
    }
    if n_workers > MAX_WORKER_LCORES {
        return Err(DpError::OutOfRange(format!(
            "{n_workers} worker lcores exceed {MAX_WORKER_LCORES}"
        )));
    }

    Ok(ResolvedConfig {
        roles,
        ring_sizes,
        burst_sizes,
        cache_enabled: !cfg.no_cache,
        kvs_type: cfg.kvs_type,
        hash_type: cfg.hash_type,
        fifoness: cfg.fifoness,
        explicit,
    })
}

impl ResolvedConfig {
    /// Human-readable layout listing for `--show-core-config`.
    pub fn describe(&self, topology: &CpuTopology) -> String {
        use std::fmt::Write;
        let mut out = String::from("core assign:\n");
        for info in &topology.lcores {
            let _ = writeln!(out, "  lcore {}:", info.lcore);
            match self.roles.role(info.lcore) {
                LcoreRole::Disabled => {
                    let _ = writeln!(out, "    type: not used");
                }
                LcoreRole::Worker => {
                    let _ = writeln!(out, "    type: WORKER");
                }
                LcoreRole::Io(io) => {
                    let _ = writeln!(out, "    type: I/O");
                    for (port, queue) in &io.rx_queues {
                        let _ = writeln!(out, "    RX port {port} (queue {queue})");
                    }
                    for port in &io.tx_ports {
                        let _ = writeln!(out, "    TX port {port}");
                    }
                }
                LcoreRole::IoWorker(io) => {
                    let _ = writeln!(out, "    type: I/O WORKER");
                    for (port, queue) in &io.rx_queues {
                        let _ = writeln!(out, "    RX port {port} (queue {queue})");
                    }
                    for port in &io.tx_ports {
                        let _ = writeln!(out, "    TX port {port}");
                    }
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Argument grammars
// ---------------------------------------------------------------------------

/// Split `"(a,b),(c,d)"` into the parenthesized bodies.
fn tuple_bodies(s: &str) -> DpResult<Vec<&str>> {
    if s.len() > MAX_ARG_CHARS {
        return Err(DpError::TooLong(format!("argument exceeds {MAX_ARG_CHARS} characters")));
    }
    let mut out = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find('(') {
        let Some(len) = rest[start..].find(')') else {
            return Err(DpError::InvalidArgs("unbalanced parentheses".into()));
        };
        out.push(&rest[start + 1..start + len]);
        rest = &rest[start + len + 1..];
        if out.len() > MAX_ARG_TUPLES {
            return Err(DpError::OutOfRange(format!("more than {MAX_ARG_TUPLES} tuples")));
        }
    }
    if out.is_empty() {
        return Err(DpError::InvalidArgs("no (..) tuples found".into()));
    }
    Ok(out)
}

fn parse_num(s: &str) -> DpResult<u32> {
    s.trim()
        .parse::<u32>()
        .map_err(|_| DpError::InvalidArgs(format!("not a number: {s:?}")))
}

/// `--rx "(P,Q,L),…"`, `Q` optionally a `Qmin-Qmax` range.
pub fn parse_rx_arg(s: &str, roles: &mut RoleTable, topology: &CpuTopology) -> DpResult<()> {
    for body in tuple_bodies(s)? {
        let parts: Vec<&str> = body.split(',').collect();
        if parts.len() != 3 {
            return Err(DpError::InvalidArgs(format!("--rx tuple needs (port,queue,lcore): {body:?}")));
        }
        let port = parse_num(parts[0])? as PortId;
        let lcore = parse_num(parts[2])? as LcoreId;
        let (queue_min, queue_max) = match parts[1].split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_num(lo)? as QueueId;
                let hi = parse_num(hi)? as QueueId;
                if lo > hi {
                    return Err(DpError::InvalidArgs(format!("queue range {lo}-{hi} is inverted")));
                }
                (lo, hi)
            }
            None => {
                let q = parse_num(parts[1])? as QueueId;
                (q, q)
            }
        };
        if port >= MAX_NIC_PORTS {
            return Err(DpError::OutOfRange(format!("port {port} >= {MAX_NIC_PORTS}")));
        }
        if queue_max >= MAX_RX_QUEUES_PER_NIC_PORT {
            return Err(DpError::OutOfRange(format!(
                "queue {queue_max} >= {MAX_RX_QUEUES_PER_NIC_PORT}"
            )));
        }
        check_lcore(lcore, topology)?;
        for queue in queue_min..=queue_max {
            roles.add_rx(lcore, port, queue)?;
        }
    }
    Ok(())
}

/// `--tx "(P,L),…"`.
pub fn parse_tx_arg(s: &str, roles: &mut RoleTable, topology: &CpuTopology) -> DpResult<()> {
    for body in tuple_bodies(s)? {
        let parts: Vec<&str> = body.split(',').collect();
        if parts.len() != 2 {
            return Err(DpError::InvalidArgs(format!("--tx tuple needs (port,lcore): {body:?}")));
        }
        let port = parse_num(parts[0])? as PortId;
        let lcore = parse_num(parts[1])? as LcoreId;
        if port >= MAX_NIC_PORTS {
            return Err(DpError::OutOfRange(format!("port {port} >= {MAX_NIC_PORTS}")));
        }
        check_lcore(lcore, topology)?;
        roles.add_tx(lcore, port)?;
    }
    Ok(())
}

/// `--w "L,…"`.
pub fn parse_w_arg(s: &str, roles: &mut RoleTable, topology: &CpuTopology) -> DpResult<()> {
    if s.len() > MAX_ARG_CHARS {
        return Err(DpError::TooLong(format!("argument exceeds {MAX_ARG_CHARS} characters")));
    }
    let mut any = false;
    for part in s.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let lcore = parse_num(part)? as LcoreId;
        check_lcore(lcore, topology)?;
        roles.add_worker(lcore)?;
        any = true;
    }
    if !any {
        return Err(DpError::InvalidArgs("--w names no lcores".into()));
    }
    Ok(())
}

/// `--rsz "A,B,C,D"`.
pub fn parse_rsz_arg(s: &str) -> DpResult<RingSizes> {
    if s.len() > MAX_SIZE_ARG_CHARS {
        return Err(DpError::TooLong(format!("--rsz exceeds {MAX_SIZE_ARG_CHARS} characters")));
    }
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 4 {
        return Err(DpError::InvalidArgs("--rsz needs exactly four sizes".into()));
    }
    Ok(RingSizes {
        nic_rx: parse_num(parts[0])? as usize,
        worker_in: parse_num(parts[1])? as usize,
        worker_out: parse_num(parts[2])? as usize,
        nic_tx: parse_num(parts[3])? as usize,
    })
}

/// `--bsz "(A,B),(C,D),(E,F)"`.
pub fn parse_bsz_arg(s: &str) -> DpResult<BurstSizes> {
    if s.len() > MAX_SIZE_ARG_CHARS {
        return Err(DpError::TooLong(format!("--bsz exceeds {MAX_SIZE_ARG_CHARS} characters")));
    }
    let bodies = tuple_bodies(s)?;
    if bodies.len() != 3 {
        return Err(DpError::InvalidArgs("--bsz needs three (read,write) pairs".into()));
    }
    let mut pairs = [(0usize, 0usize); 3];
    for (i, body) in bodies.iter().enumerate() {
        let parts: Vec<&str> = body.split(',').collect();
        if parts.len() != 2 {
            return Err(DpError::InvalidArgs(format!("--bsz pair needs (read,write): {body:?}")));
        }
        pairs[i] = (parse_num(parts[0])? as usize, parse_num(parts[1])? as usize);
    }
    Ok(BurstSizes {
        io_rx_read: pairs[0].0,
        io_rx_write: pairs[0].1,
        worker_read: pairs[1].0,
        worker_write: pairs[1].1,
        io_tx_read: pairs[2].0,
        io_tx_write: pairs[2].1,
    })
}

/// Re-split an auto-assigned table so exactly `n` lcores work (`-w N`).
fn resplit_workers(roles: RoleTable, n: usize) -> DpResult<RoleTable> {
    let mut all: Vec<LcoreId> = roles.io_lcores();
    for w in roles.worker_lcores() {
        if !all.contains(&w) {
            all.push(w);
        }
    }
    all.sort_unstable();
    if all.len() == 1 {
        // A single combined lcore ignores the hint.
        return Ok(roles);
    }
    if n == 0 || n >= all.len() {
        return Err(DpError::OutOfRange(format!(
            "-w {n} does not leave both I/O and worker lcores out of {}",
            all.len()
        )));
    }
    let mut out = RoleTable::new();
    let (io_part, worker_part) = all.split_at(all.len() - n);
    for &lcore in io_part {
        out.set_io(lcore);
    }
    for &lcore in worker_part {
        out.add_worker(lcore)?;
    }
    Ok(out)
}

fn check_lcore(lcore: LcoreId, topology: &CpuTopology) -> DpResult<()> {
    if lcore >= MAX_LCORES {
        return Err(DpError::OutOfRange(format!("lcore {lcore} >= {MAX_LCORES}")));
    }
    if !topology.is_enabled(lcore) {
        return Err(DpError::InvalidArgs(format!("lcore {lcore} is not enabled")));
    }
    Ok(())
}

/// A `(port, queue)` RX binding and a TX port each belong to exactly one
/// I/O lcore across the whole layout.
fn check_global_bindings(roles: &RoleTable) -> DpResult<()> {
    let mut rx_seen: Vec<(PortId, QueueId)> = Vec::new();
    let mut tx_seen: Vec<PortId> = Vec::new();
    for (lcore, role) in roles.iter() {
        if let LcoreRole::Io(io) | LcoreRole::IoWorker(io) = role {
            for rq in &io.rx_queues {
                if rx_seen.contains(rq) {
                    return Err(DpError::InvalidArgs(format!(
                        "port {} queue {} is bound to more than one lcore (lcore {lcore})",
                        rq.0, rq.1
                    )));
                }
                rx_seen.push(*rq);
            }
            for port in &io.tx_ports {
                if tx_seen.contains(port) {
                    return Err(DpError::InvalidArgs(format!(
                        "TX port {port} is bound to more than one lcore (lcore {lcore})"
                    )));
                }
                tx_seen.push(*port);
            }
        }
    }
    Ok(())
}

/// Every port bound for RX must also be bound for TX somewhere.
fn check_rx_ports_have_tx(roles: &RoleTable) -> DpResult<()> {
    let mut tx_ports: Vec<PortId> = Vec::new();
    let mut rx_ports: Vec<PortId> = Vec::new();
    for (_, role) in roles.iter() {
        if let LcoreRole::Io(io) | LcoreRole::IoWorker(io) = role {
            tx_ports.extend(&io.tx_ports);
            rx_ports.extend(io.rx_queues.iter().map(|(p, _)| *p));
        }
    }
    for port in rx_ports {
        if !tx_ports.contains(&port) {
            return Err(DpError::InvalidArgs(format!(
                "port {port} is bound for RX but not enabled for TX"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo() -> CpuTopology {
        CpuTopology::synthetic([(0, 0, 0), (1, 0, 1), (2, 0, 2), (3, 0, 3), (4, 0, 4)])
    }

    #[test]
    fn auto_resolution_splits_roles() {
        let cfg = DpConfig::default();
        let resolved = resolve(&cfg, &topo(), 0).unwrap();
        assert!(!resolved.explicit);
        assert_eq!(resolved.roles.io_lcores(), vec![1, 2]);
        assert_eq!(resolved.roles.worker_lcores(), vec![3, 4]);
        assert_eq!(resolved.ring_sizes, RingSizes::default());
        assert!(resolved.cache_enabled);
    }

    #[test]
    fn explicit_assignment_honored_verbatim() {
        let cfg = DpConfig {
            rx: Some("(0,0,1)".into()),
            tx: Some("(0,2)".into()),
            workers: Some("3".into()),
            ..DpConfig::default()
        };
        let resolved = resolve(&cfg, &topo(), 0).unwrap();
        assert!(resolved.explicit);
        match resolved.roles.role(1) {
            LcoreRole::Io(io) => assert_eq!(io.rx_queues, vec![(0, 0)]),
            other => panic!("lcore 1 should be I/O, got {other:?}"),
        }
        match resolved.roles.role(2) {
            LcoreRole::Io(io) => assert_eq!(io.tx_ports, vec![0]),
            other => panic!("lcore 2 should be I/O, got {other:?}"),
        }
        assert_eq!(resolved.roles.role(3), LcoreRole::Worker);
    }

    #[test]
    fn worker_count_hint_reshapes_split() {
        let cfg = DpConfig { n_workers: Some(3), ..DpConfig::default() };
        let resolved = resolve(&cfg, &topo(), 0).unwrap();
        assert_eq!(resolved.roles.io_lcores(), vec![1]);
        assert_eq!(resolved.roles.worker_lcores(), vec![2, 3, 4]);

        let cfg = DpConfig { n_workers: Some(4), ..DpConfig::default() };
        assert!(matches!(resolve(&cfg, &topo(), 0).unwrap_err(), DpError::OutOfRange(_)));
    }

    #[test]
    fn partial_explicit_args_are_an_error() {
        let cfg = DpConfig { rx: Some("(0,0,1)".into()), ..DpConfig::default() };
        let err = resolve(&cfg, &topo(), 0).unwrap_err();
        assert!(err.to_string().contains("mandatory"));
    }

    #[test]
    fn io_worker_conflict_is_rejected() {
        // The conflict must surface even with --tx absent.
        let cfg = DpConfig {
            rx: Some("(0,0,1)".into()),
            workers: Some("1".into()),
            ..DpConfig::default()
        };
        let err = resolve(&cfg, &topo(), 0).unwrap_err();
        assert!(err.to_string().contains("already assigned as I/O"));
    }

    #[test]
    fn rx_queue_ranges_expand() {
        let mut roles = RoleTable::new();
        parse_rx_arg("(0,0-3,1)", &mut roles, &topo()).unwrap();
        match roles.role(1) {
            LcoreRole::Io(io) => {
                assert_eq!(io.rx_queues, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_rx_arg("(0,3-1,1)", &mut RoleTable::new(), &topo()).is_err());
    }

    #[test]
    fn tx_port_on_two_lcores_is_rejected() {
        let cfg = DpConfig {
            rx: Some("(0,0,1)".into()),
            tx: Some("(0,1),(0,2)".into()),
            workers: Some("3".into()),
            ..DpConfig::default()
        };
        let err = resolve(&cfg, &topo(), 0).unwrap_err();
        assert!(err.to_string().contains("more than one lcore"));
    }

    #[test]
    fn rx_without_tx_port_is_rejected() {
        let cfg = DpConfig {
            rx: Some("(0,0,1)".into()),
            tx: Some("(1,2)".into()),
            workers: Some("3".into()),
            ..DpConfig::default()
        };
        let err = resolve(&cfg, &topo(), 0).unwrap_err();
        assert!(err.to_string().contains("not enabled for TX"));
    }

    #[test]
    fn disabled_lcore_is_rejected() {
        let mut roles = RoleTable::new();
        let err = parse_rx_arg("(0,0,9)", &mut roles, &topo()).unwrap_err();
        assert!(err.to_string().contains("not enabled"));
    }

    #[test]
    fn port_and_queue_ranges_enforced() {
        let mut roles = RoleTable::new();
        assert!(matches!(
            parse_rx_arg("(99,0,1)", &mut roles, &topo()).unwrap_err(),
            DpError::OutOfRange(_)
        ));
        assert!(matches!(
            parse_rx_arg("(0,200,1)", &mut roles, &topo()).unwrap_err(),
            DpError::OutOfRange(_)
        ));
    }

    #[test]
    fn rsz_grammar() {
        let sizes = parse_rsz_arg("512,256,256,512").unwrap();
        assert_eq!(sizes.nic_rx, 512);
        assert_eq!(sizes.worker_in, 256);
        assert!(parse_rsz_arg("1,2,3").is_err());
        assert!(parse_rsz_arg("a,b,c,d").is_err());
        // Zero sizes fail validation.
        assert!(parse_rsz_arg("0,1,1,1").unwrap().validate().is_err());
    }

    #[test]
    fn bsz_grammar_and_limits() {
        let b = parse_bsz_arg("(16,16),(32,32),(64,64)").unwrap();
        assert_eq!(b.worker_read, 32);
        assert_eq!(b.io_tx_write, 64);
        assert!(b.validate().is_ok());

        // Scenario: a burst above the array capacity is out of range.
        let oversize = parse_bsz_arg("(2048,16),(16,16),(16,16)").unwrap();
        assert!(matches!(oversize.validate().unwrap_err(), DpError::OutOfRange(_)));

        // The TX drain reads double; half the capacity is the limit.
        let tx_heavy = parse_bsz_arg("(16,16),(16,16),(513,16)").unwrap();
        assert!(tx_heavy.validate().is_err());
        let tx_ok = parse_bsz_arg("(16,16),(16,16),(512,16)").unwrap();
        assert!(tx_ok.validate().is_ok());
    }

    #[test]
    fn describe_lists_every_lcore() {
        let cfg = DpConfig::default();
        let resolved = resolve(&cfg, &topo(), 0).unwrap();
        let text = resolved.describe(&topo());
        assert!(text.contains("lcore 0:"));
        assert!(text.contains("not used"));
        assert!(text.contains("type: I/O"));
        assert!(text.contains("type: WORKER"));
    }
}
