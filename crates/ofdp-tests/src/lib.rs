//! Test support for the ofdp dataplane: Ethernet frame builders and a
//! single-process switch harness.
//!
//! The harness runs the real engine (pinned lcore threads, rings, timer
//! wheel) against the loopback driver, so end-to-end scenarios exercise
//! exactly the code the daemon runs.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ofdp_core::config::{DpConfig, resolve};
use ofdp_core::driver::LoopDriver;
use ofdp_core::engine::Engine;
use ofdp_core::lcore::CpuTopology;
use ofdp_core::module::ModuleRegistry;
use ofdp_core::packet::{
    ETHERTYPE_IPV4, ETHERTYPE_VLAN, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};
use ofdp_core::port::OperState;
use ofdp_core::{DpEvent, PortId, ShutdownLevel};

/// Builder for well-formed test frames.
///
/// ```
/// use ofdp_tests::FrameBuilder;
///
/// let frame = FrameBuilder::new()
///     .ipv4([10, 0, 0, 1], [10, 0, 0, 2])
///     .tcp(40000, 80)
///     .build();
/// assert_eq!(frame.len(), 54);
/// ```
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    vlan: Option<(u16, u8)>,
    l3: L3,
    l4: L4,
    padding: usize,
}

#[derive(Debug, Clone)]
enum L3 {
    None(u16),
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr },
}

#[derive(Debug, Clone)]
enum L4 {
    None,
    Tcp { sport: u16, dport: u16 },
    Udp { sport: u16, dport: u16 },
    Icmp { icmp_type: u8, code: u8 },
}

impl Default for FrameBuilder {
    fn default() -> Self {
        FrameBuilder::new()
    }
}

impl FrameBuilder {
    pub fn new() -> FrameBuilder {
        FrameBuilder {
            dst_mac: [0x02, 0, 0, 0, 0, 2],
            src_mac: [0x02, 0, 0, 0, 0, 1],
            vlan: None,
            l3: L3::None(0x0000),
            l4: L4::None,
            padding: 0,
        }
    }

    pub fn macs(mut self, src: [u8; 6], dst: [u8; 6]) -> Self {
        self.src_mac = src;
        self.dst_mac = dst;
        self
    }

    pub fn ethertype(mut self, ethertype: u16) -> Self {
        self.l3 = L3::None(ethertype);
        self
    }

    pub fn vlan(mut self, vid: u16, pcp: u8) -> Self {
        self.vlan = Some((vid, pcp));
        self
    }

    pub fn ipv4(mut self, src: impl Into<Ipv4Addr>, dst: impl Into<Ipv4Addr>) -> Self {
        self.l3 = L3::Ipv4 { src: src.into(), dst: dst.into() };
        self
    }

    pub fn tcp(mut self, sport: u16, dport: u16) -> Self {
        self.l4 = L4::Tcp { sport, dport };
        self
    }

    pub fn udp(mut self, sport: u16, dport: u16) -> Self {
        self.l4 = L4::Udp { sport, dport };
        self
    }

    pub fn icmp(mut self, icmp_type: u8, code: u8) -> Self {
        self.l4 = L4::Icmp { icmp_type, code };
        self
    }

    /// Trailing payload bytes after the headers.
    pub fn padding(mut self, n: usize) -> Self {
        self.padding = n;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut f = Vec::with_capacity(64 + self.padding);
        f.extend_from_slice(&self.dst_mac);
        f.extend_from_slice(&self.src_mac);
        if let Some((vid, pcp)) = self.vlan {
            f.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
            let tci = ((pcp as u16) << 13) | (vid & 0x0fff);
            f.extend_from_slice(&tci.to_be_bytes());
        }
        match &self.l3 {
            L3::None(ethertype) => {
                f.extend_from_slice(&ethertype.to_be_bytes());
            }
            L3::Ipv4 { src, dst } => {
                f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
                let proto = match self.l4 {
                    L4::Tcp { .. } => IPPROTO_TCP,
                    L4::Udp { .. } => IPPROTO_UDP,
                    L4::Icmp { .. } => IPPROTO_ICMP,
                    L4::None => 0xfd,
                };
                let l4_len = match self.l4 {
                    L4::None => 0,
                    _ => 20,
                };
                let total: u16 = (20 + l4_len + self.padding) as u16;
                let header_start = f.len();
                f.push(0x45);
                f.push(0);
                f.extend_from_slice(&total.to_be_bytes());
                f.extend_from_slice(&[0, 0, 0, 0]); // id, flags
                f.push(64);
                f.push(proto);
                f.extend_from_slice(&[0, 0]); // checksum, fixed below
                f.extend_from_slice(&src.octets());
                f.extend_from_slice(&dst.octets());
                let csum = ipv4_checksum(&f[header_start..header_start + 20]);
                f[header_start + 10..header_start + 12].copy_from_slice(&csum.to_be_bytes());
                match self.l4 {
                    L4::None => {}
                    L4::Tcp { sport, dport } | L4::Udp { sport, dport } => {
                        f.extend_from_slice(&sport.to_be_bytes());
                        f.extend_from_slice(&dport.to_be_bytes());
                        f.extend_from_slice(&[0; 16]);
                    }
                    L4::Icmp { icmp_type, code } => {
                        f.push(icmp_type);
                        f.push(code);
                        f.extend_from_slice(&[0; 18]);
                    }
                }
            }
        }
        f.extend(std::iter::repeat_n(0u8, self.padding));
        f
    }
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A running switch instance over the loopback driver.
pub struct TestSwitch {
    pub engine: Arc<Engine>,
    pub driver: Arc<LoopDriver>,
    registry: ModuleRegistry,
    stopped: bool,
}

impl TestSwitch {
    /// Start with `n_ports` loop ports on a five-lcore synthetic topology
    /// (two I/O, two workers, master excluded).
    pub fn start(n_ports: u32) -> TestSwitch {
        TestSwitch::start_with_config(n_ports, DpConfig::default())
    }

    pub fn start_with_config(n_ports: u32, cfg: DpConfig) -> TestSwitch {
        let driver = Arc::new(LoopDriver::new());
        for port in 0..n_ports {
            driver.add_port(port);
        }
        let topology =
            CpuTopology::synthetic([(0, 0, 0), (1, 0, 1), (2, 0, 2), (3, 0, 3), (4, 0, 4)]);
        let resolved = resolve(&cfg, &topology, 0).expect("harness layout resolves");
        let engine = Engine::with_pool_buffers(resolved, topology, driver.clone(), 1024)
            .expect("harness engine builds");
        let mut registry = ModuleRegistry::new();
        registry
            .register("dp_core", Box::new(engine.dataplane_module()))
            .expect("register dp_core");
        registry
            .register("dp_timer", Box::new(engine.timer_module()))
            .expect("register dp_timer");
        registry.init_all().expect("init");
        registry.start_all().expect("start");

        let sw = TestSwitch { engine, driver, registry, stopped: false };
        sw.await_ports_up();
        sw
    }

    fn await_ports_up(&self) {
        let begun = Instant::now();
        while begun.elapsed() < Duration::from_secs(5) {
            if self
                .engine
                .port_stats()
                .iter()
                .all(|p| p.oper_state == OperState::Up)
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("harness ports never came up");
    }

    pub fn inject(&self, port: PortId, frame: Vec<u8>) {
        self.driver.inject(port, frame);
    }

    /// Collect at least `want` frames from a port's TX side, waiting up
    /// to five seconds.
    pub fn await_tx(&self, port: PortId, want: usize) -> Vec<Vec<u8>> {
        let begun = Instant::now();
        let mut got = Vec::new();
        while begun.elapsed() < Duration::from_secs(5) {
            got.extend(self.driver.drain_tx(port));
            if got.len() >= want {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        got
    }

    pub fn subscribe_events(&self) -> crossbeam_channel::Receiver<DpEvent> {
        self.engine.subscribe_events()
    }

    /// Graceful shutdown; panics if the grace deadline is missed.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.registry
            .shutdown_all(ShutdownLevel::Gracefully)
            .expect("graceful shutdown");
        self.registry.finalize_all();
        self.stopped = true;
    }
}

impl Drop for TestSwitch {
    fn drop(&mut self) {
        if !self.stopped {
            self.registry.stop_all();
            self.registry.finalize_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofdp_core::packet::FlowKey;

    #[test]
    fn builder_produces_parseable_tcp() {
        let frame = FrameBuilder::new()
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2])
            .tcp(40000, 80)
            .build();
        let key = FlowKey::parse(&frame, 7).unwrap();
        assert_eq!(key.eth_type, ETHERTYPE_IPV4);
        assert_eq!(key.ip_proto, Some(IPPROTO_TCP));
        assert_eq!(key.tp_src, Some(40000));
        assert_eq!(key.tp_dst, Some(80));
    }

    #[test]
    fn builder_vlan_tag_parses() {
        let frame = FrameBuilder::new()
            .vlan(300, 5)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2])
            .udp(53, 53)
            .build();
        let key = FlowKey::parse(&frame, 0).unwrap();
        assert_eq!(key.vlan_vid, Some(300));
        assert_eq!(key.vlan_pcp, Some(5));
        assert_eq!(key.ip_proto, Some(IPPROTO_UDP));
    }

    #[test]
    fn builder_checksum_is_valid() {
        let frame = FrameBuilder::new()
            .ipv4([192, 168, 1, 1], [192, 168, 1, 2])
            .tcp(1, 2)
            .build();
        let mut sum = 0u32;
        for chunk in frame[14..34].chunks(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xffff);
    }

    #[test]
    fn builder_icmp_maps_type_code() {
        let frame = FrameBuilder::new()
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2])
            .icmp(8, 0)
            .build();
        let key = FlowKey::parse(&frame, 0).unwrap();
        assert_eq!(key.ip_proto, Some(IPPROTO_ICMP));
        assert_eq!(key.tp_src, Some(8));
        assert_eq!(key.tp_dst, Some(0));
    }

    #[test]
    fn padding_extends_frame() {
        let bare = FrameBuilder::new().ipv4([1, 1, 1, 1], [2, 2, 2, 2]).tcp(1, 2);
        let short = bare.clone().build();
        let long = bare.padding(100).build();
        assert_eq!(long.len(), short.len() + 100);
    }
}
