//! Port status monitor: a periodic task that diffs driver link state
//! against the port table and notifies subscribers on change.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::driver::PortDriver;
use crate::error::DpResult;
use crate::events::{DpEvent, EventHub};
use crate::module::ThreadCtl;
use crate::port::{OperState, PortTable};

/// Default poll cadence.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

pub struct PortMonitor {
    driver: Arc<dyn PortDriver>,
    ports: Arc<PortTable>,
    events: Arc<EventHub>,
    interval: Duration,
}

impl PortMonitor {
    pub fn new(
        driver: Arc<dyn PortDriver>,
        ports: Arc<PortTable>,
        events: Arc<EventHub>,
    ) -> PortMonitor {
        PortMonitor {
            driver,
            ports,
            events,
            interval: MONITOR_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> PortMonitor {
        self.interval = interval;
        self
    }

    /// One poll pass; returns how many ports changed state.
    pub fn poll_once(&self) -> usize {
        let known = self.driver.ports();
        let mut changed = 0;
        for port in self.ports.list() {
            let next = if !known.contains(&port.port_id) {
                OperState::NotPresent
            } else if self.driver.link_up(port.port_id) {
                OperState::Up
            } else {
                OperState::Down
            };
            if port.set_oper_state(next) {
                changed += 1;
                info!("port {}: link {:?}", port.port_id, next);
                self.events.publish(DpEvent::PortStatus {
                    port_id: port.port_id,
                    state: next,
                });
            }
        }
        changed
    }

    /// The supervised thread body. Polls once immediately so ports leave
    /// `Unknown` as soon as forwarding starts.
    pub fn run(self, ctl: ThreadCtl) -> DpResult<()> {
        ctl.gate.wait_started()?;
        self.poll_once();
        loop {
            if ctl.wait_shutdown(self.interval) {
                return Ok(());
            }
            self.poll_once();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LoopDriver;
    use crate::port::Port;

    fn fixture() -> (PortMonitor, Arc<LoopDriver>, Arc<PortTable>, crossbeam_channel::Receiver<DpEvent>) {
        let driver = Arc::new(LoopDriver::new());
        driver.add_port(1);
        let ports = Arc::new(PortTable::new());
        ports.attach(Port::new(1, 1, "p1")).unwrap();
        ports.attach(Port::new(2, 2, "p2")).unwrap(); // not in the driver
        let events = Arc::new(EventHub::new());
        let rx = events.subscribe();
        let monitor = PortMonitor::new(driver.clone(), ports.clone(), events)
            .with_interval(Duration::from_millis(5));
        (monitor, driver, ports, rx)
    }

    #[test]
    fn first_pass_reports_initial_states() {
        let (monitor, _driver, ports, rx) = fixture();
        assert_eq!(monitor.poll_once(), 2);
        assert_eq!(ports.get(1).unwrap().oper_state(), OperState::Up);
        assert_eq!(ports.get(2).unwrap().oper_state(), OperState::NotPresent);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn link_flap_emits_one_event_per_edge() {
        let (monitor, driver, _ports, rx) = fixture();
        monitor.poll_once();
        let _ = rx.try_iter().count();

        driver.set_link(1, false);
        assert_eq!(monitor.poll_once(), 1);
        // Steady state: no further events.
        assert_eq!(monitor.poll_once(), 0);
        driver.set_link(1, true);
        assert_eq!(monitor.poll_once(), 1);

        let states: Vec<OperState> = rx
            .try_iter()
            .map(|e| match e {
                DpEvent::PortStatus { state, .. } => state,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(states, vec![OperState::Down, OperState::Up]);
    }

    #[test]
    fn last_change_tracks_flaps() {
        let (monitor, driver, ports, _rx) = fixture();
        monitor.poll_once();
        let t1 = ports.get(1).unwrap().last_change();
        assert!(t1 > 0);
        driver.set_link(1, false);
        monitor.poll_once();
        assert!(ports.get(1).unwrap().last_change() >= t1);
    }
}
