//! Integration tests for ofdp-core.
//!
//! These drive the whole engine through its public surface: resolve a
//! layout, spawn the lcore threads, push frames through the loop driver,
//! and watch flows match, caches invalidate and timers expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ofdp_core::actions::{Action, Instruction, OutputTarget};
use ofdp_core::config::{DpConfig, resolve};
use ofdp_core::driver::LoopDriver;
use ofdp_core::engine::Engine;
use ofdp_core::flow::{FieldMatch, FlowMod, FlowRemovedReason};
use ofdp_core::lcore::CpuTopology;
use ofdp_core::module::ModuleRegistry;
use ofdp_core::packet::{ETHERTYPE_IPV4, IPPROTO_TCP};
use ofdp_core::{DpEvent, ShutdownLevel};

fn tcp_frame(dst: [u8; 4], sport: u16) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    f.extend_from_slice(&[0x45, 0, 0, 40, 0, 0, 0, 0, 64, IPPROTO_TCP, 0, 0]);
    f.extend_from_slice(&[10, 0, 0, 1]);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&80u16.to_be_bytes());
    f.extend_from_slice(&[0; 16]);
    f
}

fn dst_flow(dst: [u8; 4], priority: u16, out: u32) -> FlowMod {
    FlowMod {
        priority,
        match_list: vec![
            FieldMatch::EthType(ETHERTYPE_IPV4),
            FieldMatch::IpDst { addr: dst.into(), prefix: 32 },
        ],
        instructions: vec![Instruction::ApplyActions(vec![Action::Output(
            OutputTarget::Port(out),
        )])],
        ..FlowMod::default()
    }
}

struct Harness {
    engine: Arc<Engine>,
    driver: Arc<LoopDriver>,
    registry: ModuleRegistry,
}

fn start_engine() -> Harness {
    let driver = Arc::new(LoopDriver::new());
    driver.add_port(0);
    driver.add_port(1);
    driver.add_port(2);
    let topology = CpuTopology::synthetic([(0, 0, 0), (1, 0, 1), (2, 0, 2), (3, 0, 3), (4, 0, 4)]);
    let resolved = resolve(&DpConfig::default(), &topology, 0).unwrap();
    let engine = Engine::with_pool_buffers(resolved, topology, driver.clone(), 1024).unwrap();
    let mut registry = ModuleRegistry::new();
    registry
        .register("dp_core", Box::new(engine.dataplane_module()))
        .unwrap();
    registry
        .register("dp_timer", Box::new(engine.timer_module()))
        .unwrap();
    registry.init_all().unwrap();
    registry.start_all().unwrap();

    // Wait for the monitor to bring the loop ports up.
    let begun = Instant::now();
    while begun.elapsed() < Duration::from_secs(5) {
        if engine
            .port_stats()
            .iter()
            .all(|p| p.oper_state == ofdp_core::port::OperState::Up)
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Harness { engine, driver, registry }
}

fn await_tx(driver: &LoopDriver, port: u32, want: usize) -> Vec<Vec<u8>> {
    let begun = Instant::now();
    let mut got = Vec::new();
    while begun.elapsed() < Duration::from_secs(5) {
        got.extend(driver.drain_tx(port));
        if got.len() >= want {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    got
}

#[test]
fn forwards_matching_traffic() {
    let mut h = start_engine();
    h.engine.default_bridge().flow_add(&dst_flow([10, 0, 0, 2], 100, 1)).unwrap();
    for _ in 0..20 {
        h.driver.inject(0, tcp_frame([10, 0, 0, 2], 5000));
    }
    let sent = await_tx(&h.driver, 1, 20);
    assert_eq!(sent.len(), 20);
    h.registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
    h.registry.finalize_all();
}

#[test]
fn per_flow_order_is_preserved() {
    let mut h = start_engine();
    h.engine.default_bridge().flow_add(&dst_flow([10, 0, 0, 2], 100, 1)).unwrap();
    // Distinguish packets of one flow by payload byte.
    for i in 0..50u8 {
        let mut frame = tcp_frame([10, 0, 0, 2], 6000);
        frame[53] = i;
        h.driver.inject(0, frame);
    }
    let sent = await_tx(&h.driver, 1, 50);
    assert_eq!(sent.len(), 50);
    let order: Vec<u8> = sent.iter().map(|f| f[53]).collect();
    let expect: Vec<u8> = (0..50).collect();
    assert_eq!(order, expect, "same-flow packets must leave in arrival order");
    h.registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
    h.registry.finalize_all();
}

#[test]
fn cache_invalidation_after_table_mutation() {
    // Scenario S6: F1 at priority 100, packet hits F1; F2 at priority 200
    // over the same match; the same packet must now hit F2.
    let mut h = start_engine();
    let bridge = h.engine.default_bridge();
    bridge.flow_add(&dst_flow([10, 0, 0, 1], 100, 1)).unwrap();
    h.driver.inject(0, tcp_frame([10, 0, 0, 1], 7000));
    assert_eq!(await_tx(&h.driver, 1, 1).len(), 1);

    bridge.flow_add(&dst_flow([10, 0, 0, 1], 200, 2)).unwrap();
    h.driver.inject(0, tcp_frame([10, 0, 0, 1], 7000));
    assert_eq!(await_tx(&h.driver, 2, 1).len(), 1, "second packet must match F2");
    assert!(h.driver.drain_tx(1).is_empty(), "stale cached F1 must not be used");
    h.registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
    h.registry.finalize_all();
}

#[test]
fn idle_timeout_removes_flow_with_reason() {
    // Scenario S5: idle_timeout=2, one packet at t=0, silence after.
    let mut h = start_engine();
    let events = h.engine.subscribe_events();
    let mut m = dst_flow([10, 0, 0, 2], 100, 1);
    m.idle_timeout = 2;
    m.send_flow_removed = true;
    let bridge = h.engine.default_bridge();
    bridge.flow_add(&m).unwrap();

    h.driver.inject(0, tcp_frame([10, 0, 0, 2], 8000));
    assert_eq!(await_tx(&h.driver, 1, 1).len(), 1);

    let begun = Instant::now();
    let removed = loop {
        match events.recv_timeout(Duration::from_secs(6)) {
            Ok(DpEvent::FlowRemoved { reason, .. }) => break reason,
            Ok(_) => continue,
            Err(_) => panic!("no flow-removed event within 6 s"),
        }
    };
    let elapsed = begun.elapsed();
    assert_eq!(removed, FlowRemovedReason::IdleTimeout);
    // Removal lands within [T, T + slot granularity + scheduling slack].
    assert!(elapsed >= Duration::from_millis(900), "fired early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(4), "fired late: {elapsed:?}");
    assert_eq!(bridge.flow_count(), 0);
    h.registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
    h.registry.finalize_all();
}

#[test]
fn buffer_conservation_under_load() {
    let mut h = start_engine();
    h.engine.default_bridge().flow_add(&dst_flow([10, 0, 0, 2], 100, 1)).unwrap();
    // A mix of matching and missing traffic, some of it unparseable.
    for i in 0..200u16 {
        match i % 4 {
            0 => h.driver.inject(0, tcp_frame([10, 0, 0, 2], 9000 + i)),
            1 => h.driver.inject(0, tcp_frame([10, 9, 9, 9], 9000 + i)),
            2 => h.driver.inject(0, vec![0xde; 10]), // runt frame
            _ => h.driver.inject(2, tcp_frame([10, 0, 0, 2], 9000 + i)),
        }
    }
    let _ = await_tx(&h.driver, 1, 100);
    h.registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
    h.registry.finalize_all();
    assert_eq!(
        h.engine.pool().outstanding(),
        0,
        "every buffer must return to the pool after shutdown"
    );
}

#[test]
fn shutdown_within_grace_bounds() {
    let mut h = start_engine();
    let begun = Instant::now();
    h.registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
    // Five dataplane threads, a monitor and a timer; every join is
    // bounded by the 1.5 s grace and healthy loops exit in milliseconds.
    assert!(begun.elapsed() < Duration::from_secs(3));
    h.registry.finalize_all();
}

#[test]
fn link_down_stops_forwarding_and_notifies() {
    let mut h = start_engine();
    let events = h.engine.subscribe_events();
    h.engine.default_bridge().flow_add(&dst_flow([10, 0, 0, 2], 100, 1)).unwrap();

    h.driver.set_link(0, false);
    let begun = Instant::now();
    let state = loop {
        match events.recv_timeout(Duration::from_secs(3)) {
            Ok(DpEvent::PortStatus { port_id: 0, state })
                if state == ofdp_core::port::OperState::Down =>
            {
                break state;
            }
            Ok(_) => continue,
            Err(_) => panic!("no port-status event"),
        }
    };
    assert_eq!(state, ofdp_core::port::OperState::Down);
    assert!(begun.elapsed() < Duration::from_secs(2));

    // Ingress on the downed port drops instead of forwarding.
    h.driver.inject(0, tcp_frame([10, 0, 0, 2], 1000));
    std::thread::sleep(Duration::from_millis(100));
    assert!(h.driver.drain_tx(1).is_empty());
    h.registry.shutdown_all(ShutdownLevel::Gracefully).unwrap();
    h.registry.finalize_all();
}
