//! # ofdp-core
//!
//! **A software OpenFlow 1.3 switch dataplane.**
//!
//! `ofdp-core` is the match-action engine behind `ofdpd`: frames come off
//! the NIC on I/O lcores, cross lock-free SPSC rings to worker lcores that
//! run the flow-table pipeline (cache probe → priority match → six-slot
//! instruction execution), and leave through per-port output rings back to
//! the NIC.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ofdp_core::config::{DpConfig, resolve};
//! use ofdp_core::driver::LoopDriver;
//! use ofdp_core::engine::Engine;
//! use ofdp_core::lcore::CpuTopology;
//! use ofdp_core::module::{ModuleRegistry, ShutdownLevel};
//!
//! let driver = Arc::new(LoopDriver::new());
//! driver.add_port(0);
//! driver.add_port(1);
//!
//! let topology = CpuTopology::detect();
//! let resolved = resolve(&DpConfig::default(), &topology, 0).unwrap();
//! let engine = Engine::new(resolved, topology, driver).unwrap();
//!
//! let mut registry = ModuleRegistry::new();
//! registry.register("dp_core", Box::new(engine.dataplane_module())).unwrap();
//! registry.register("dp_timer", Box::new(engine.timer_module())).unwrap();
//! registry.init_all().unwrap();
//! registry.start_all().unwrap();
//! // ... traffic flows ...
//! registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
//! registry.finalize_all();
//! ```
//!
//! ## Architecture
//!
//! NIC RX → I/O-RX lcore → worker ring (FIFO-ness hash) → worker
//! (cache → tables → actions) → per-(port, worker) ring → I/O-TX → NIC.
//!
//! Control state lives in [`bridge::Bridge`]: priority-ordered flow
//! tables behind one writer lock, with a generation counter that
//! invalidates every worker's flow cache without cross-thread chatter.
//! Flow expiry runs on a delta-list [`timer::TimerWheel`]; lifecycle is
//! driven by the ordered [`module::ModuleRegistry`] with bounded
//! shutdown grace.

pub mod actions;
pub mod bridge;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
pub mod hash;
pub mod io;
pub mod lcore;
pub mod module;
pub mod monitor;
pub mod packet;
pub mod pool;
pub mod port;
pub mod ring;
pub mod stats;
pub mod table;
pub mod timer;
pub mod worker;

/// OpenFlow port number.
pub type PortId = u32;
/// NIC queue index within a port.
pub type QueueId = u16;
/// Logical-core identity, the pinned-thread unit.
pub type LcoreId = u32;

pub use bridge::Bridge;
pub use engine::Engine;
pub use error::{DpError, DpResult, FlowModError};
pub use events::DpEvent;
pub use flow::{FieldMatch, FlowEntry, FlowMod, FlowRemovedReason};
pub use module::{ModuleRegistry, ShutdownLevel};
pub use pool::{BufferPool, Packet};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
