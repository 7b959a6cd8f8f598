//! ofdpd — the software OpenFlow 1.3 switch daemon.

mod modules;

use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use ofdp_core::cache::KvsType;
use ofdp_core::config::{DpConfig, Fifoness, resolve};
use ofdp_core::driver::LoopDriver;
use ofdp_core::engine::Engine;
use ofdp_core::error::DpError;
use ofdp_core::hash::HashType;
use ofdp_core::lcore::{CoreAssignPolicy, CpuTopology};
use ofdp_core::module::{ModuleRegistry, ShutdownLevel};

/// Argument validation failed on a numeric range.
const EXIT_OUT_OF_RANGE: i32 = 65;
/// Argument validation failed on conflicts or missing pieces.
const EXIT_BAD_CONFIG: i32 = 66;
/// A module failed to initialize or start.
const EXIT_LIFECYCLE: i32 = 70;

#[derive(Parser)]
#[command(name = "ofdpd")]
#[command(about = "ofdpd — software OpenFlow 1.3 switch")]
#[command(version = ofdp_core::VERSION)]
struct Cli {
    /// Number of worker lcores when auto-assigning
    #[arg(short = 'w', value_name = "N")]
    n_workers: Option<usize>,

    /// Explicit RX assignments "(PORT,QUEUE,LCORE),…"; QUEUE may be a
    /// range MIN-MAX
    #[arg(long, value_name = "TUPLES")]
    rx: Option<String>,

    /// Explicit TX assignments "(PORT,LCORE),…"
    #[arg(long, value_name = "TUPLES")]
    tx: Option<String>,

    /// Explicit worker lcore list "L,…"
    #[arg(long = "w", value_name = "LCORES")]
    worker_list: Option<String>,

    /// Core assignment policy for automatic distribution
    #[arg(long, default_value = "performance", value_parser = ["performance", "balance", "minimum"])]
    core_assign: String,

    /// Print the resolved lcore assignment and exit
    #[arg(long)]
    show_core_config: bool,

    /// Disable the per-worker flow cache
    #[arg(long)]
    no_cache: bool,

    /// Flow cache backend
    #[arg(long, default_value = "hashmap_nolock", value_parser = ["hashmap_nolock", "hashmap", "rte_hash"])]
    kvstype: String,

    /// Fingerprint hash family
    #[arg(long, default_value = "city64", value_parser = ["city64", "intel64", "murmur3"])]
    hashtype: String,

    /// Packet-order preservation granularity
    #[arg(long, default_value = "flow", value_parser = ["none", "port", "flow"])]
    fifoness: String,

    /// Ring sizes "NIC-RX,WORKER-IN,WORKER-OUT,NIC-TX"
    #[arg(long, value_name = "A,B,C,D")]
    rsz: Option<String>,

    /// Burst sizes "(IO-RX-RD,IO-RX-WR),(WK-RD,WK-WR),(IO-TX-RD,IO-TX-WR)"
    #[arg(long, value_name = "(A,B),(C,D),(E,F)")]
    bsz: Option<String>,

    /// Loopback port count for standalone operation (no NIC driver)
    #[arg(long, default_value_t = 2, value_name = "N")]
    loop_ports: u32,

    /// Master lcore kept out of dataplane duty
    #[arg(long, default_value_t = 0, value_name = "LCORE")]
    master_lcore: u32,

    /// Register the SNMP stats agent
    #[arg(long)]
    enable_snmp: bool,
}

fn exit_code_for(err: &DpError) -> i32 {
    match err {
        DpError::OutOfRange(_) | DpError::TooLong(_) | DpError::TooShort(_) => EXIT_OUT_OF_RANGE,
        _ => EXIT_BAD_CONFIG,
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let cfg = DpConfig {
        rx: cli.rx.clone(),
        tx: cli.tx.clone(),
        workers: cli.worker_list.clone(),
        n_workers: cli.n_workers,
        core_assign: CoreAssignPolicy::parse(&cli.core_assign).unwrap_or_default(),
        rsz: cli.rsz.clone(),
        bsz: cli.bsz.clone(),
        no_cache: cli.no_cache,
        kvs_type: KvsType::parse(&cli.kvstype).unwrap_or_default(),
        hash_type: HashType::parse(&cli.hashtype).unwrap_or_default(),
        fifoness: Fifoness::parse(&cli.fifoness).unwrap_or_default(),
    };

    let topology = CpuTopology::detect();
    let resolved = match resolve(&cfg, &topology, cli.master_lcore) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("ofdpd: {e}");
            return exit_code_for(&e);
        }
    };

    if cli.show_core_config {
        print!("{}", resolved.describe(&topology));
        return 0;
    }

    // Standalone operation: a loopback driver in place of the NIC PMDs.
    let driver = Arc::new(LoopDriver::new());
    for port in 0..cli.loop_ports {
        driver.add_port(port);
    }

    let engine = match Engine::new(resolved, topology, driver) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("ofdpd: {e}");
            return exit_code_for(&e);
        }
    };

    let mut registry = ModuleRegistry::new();
    if let Err(e) = modules::register_all(&mut registry, &engine, cli.enable_snmp) {
        eprintln!("ofdpd: module registration failed: {e}");
        return EXIT_LIFECYCLE;
    }

    if let Err(e) = registry.init_all() {
        error!("initialization failed: {e}");
        return EXIT_LIFECYCLE;
    }
    if let Err(e) = registry.start_all() {
        error!("startup failed: {e}");
        registry.stop_all();
        registry.finalize_all();
        return EXIT_LIFECYCLE;
    }
    info!("ofdpd {} started ({} ports)", ofdp_core::VERSION, cli.loop_ports);

    // Block until SIGINT/SIGTERM.
    let (sig_tx, sig_rx) = crossbeam_channel::bounded(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = sig_tx.try_send(());
    }) {
        error!("cannot install signal handler: {e}");
        return EXIT_LIFECYCLE;
    }
    let _ = sig_rx.recv();
    info!("shutdown requested");

    match registry.shutdown_all(ShutdownLevel::Gracefully) {
        Ok(()) => {}
        Err(DpError::TimedOut) => {
            warn!("graceful shutdown missed its deadline; cancelling");
            registry.stop_all();
        }
        Err(e) => warn!("shutdown: {e}"),
    }
    registry.finalize_all();
    info!("ofdpd stopped");
    0
}
