//! Module registration for ofdpd.
//!
//! Startup order: datastore, dataplane
//! driver, timer, queue manager, protocol agent, protocol handler,
//! optional stats agent, config loader. The protocol/management modules
//! are boundary stubs here (the wire agent, datastore and SNMP sub-agent
//! are external collaborators), but they hold their place in the
//! lifecycle ordering and consume the event surface the core exposes.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use ofdp_core::engine::Engine;
use ofdp_core::error::DpResult;
use ofdp_core::module::{
    DpModule, ModuleRegistry, SpawnedThread, StateGate, spawn_module_thread,
};

/// Register every module in startup order.
pub fn register_all(
    registry: &mut ModuleRegistry,
    engine: &Arc<Engine>,
    enable_snmp: bool,
) -> DpResult<()> {
    registry.register("datastore", Box::new(Stub::new("datastore")))?;
    registry.register("dp_core", Box::new(engine.dataplane_module()))?;
    registry.register("dp_timer", Box::new(engine.timer_module()))?;
    registry.register("dpqueuemgr", Box::new(Stub::new("dpqueuemgr")))?;
    registry.register("agent", Box::new(AgentStub { engine: engine.clone() }))?;
    registry.register("ofp_handler", Box::new(Stub::new("ofp_handler")))?;
    if enable_snmp {
        registry.register("snmpmgr", Box::new(SnmpStub { engine: engine.clone() }))?;
    }
    registry.register("load_conf", Box::new(Stub::new("load_conf")))?;
    Ok(())
}

/// A synchronous placeholder holding an external collaborator's slot in
/// the lifecycle order.
struct Stub {
    name: &'static str,
}

impl Stub {
    fn new(name: &'static str) -> Stub {
        Stub { name }
    }
}

impl DpModule for Stub {
    fn init(&mut self, _gate: &Arc<StateGate>) -> DpResult<Option<SpawnedThread>> {
        debug!("{}: standalone stub", self.name);
        Ok(None)
    }
}

/// Protocol-agent stand-in: drains the core's notification channel so
/// flow-removed and port-status events are visible in the log.
struct AgentStub {
    engine: Arc<Engine>,
}

impl DpModule for AgentStub {
    fn init(&mut self, gate: &Arc<StateGate>) -> DpResult<Option<SpawnedThread>> {
        let events = self.engine.subscribe_events();
        let thread = spawn_module_thread("agent", gate.clone(), move |ctl| {
            ctl.gate.wait_started()?;
            loop {
                if ctl.should_stop() {
                    return Ok(());
                }
                if let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
                    info!("agent: {event:?}");
                }
            }
        })?;
        Ok(Some(thread))
    }
}

/// Stats-agent stand-in: logs the read-side surface once at startup.
struct SnmpStub {
    engine: Arc<Engine>,
}

impl DpModule for SnmpStub {
    fn init(&mut self, _gate: &Arc<StateGate>) -> DpResult<Option<SpawnedThread>> {
        Ok(None)
    }

    fn start(&mut self) -> DpResult<()> {
        for port in self.engine.port_stats() {
            info!(
                "snmpmgr: ifIndex {} ({}) oper {:?}",
                port.physical_index, port.name, port.oper_state
            );
        }
        Ok(())
    }
}
