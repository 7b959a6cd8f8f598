//! Notification hub toward the external protocol agent.
//!
//! The core publishes flow-removed, port-status and packet-in events;
//! collaborators subscribe with an unbounded channel and consume at their
//! own pace. Disconnected subscribers are dropped on the next publish.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::PortId;
use crate::flow::FlowRemovedReason;
use crate::port::OperState;

/// Events crossing the core boundary.
#[derive(Debug, Clone)]
pub enum DpEvent {
    FlowRemoved {
        bridge: String,
        table_id: u8,
        priority: u16,
        cookie: u64,
        reason: FlowRemovedReason,
        duration_sec: u64,
        packet_count: u64,
        byte_count: u64,
    },
    PortStatus {
        port_id: PortId,
        state: OperState,
    },
    PacketIn {
        port_id: PortId,
        table_id: u8,
        frame: Vec<u8>,
    },
}

/// Fan-out registry of event subscribers.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<DpEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    /// Register a listener; the receiver sees every event published after
    /// this call.
    pub fn subscribe(&self) -> Receiver<DpEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: DpEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_see_events_in_order() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        hub.publish(DpEvent::PortStatus { port_id: 1, state: OperState::Up });
        hub.publish(DpEvent::PortStatus { port_id: 1, state: OperState::Down });
        let first = rx.recv().unwrap();
        assert!(matches!(first, DpEvent::PortStatus { state: OperState::Up, .. }));
        let second = rx.recv().unwrap();
        assert!(matches!(second, DpEvent::PortStatus { state: OperState::Down, .. }));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        drop(rx);
        hub.publish(DpEvent::PortStatus { port_id: 0, state: OperState::Unknown });
        assert_eq!(hub.subscriber_count(), 0);
    }
}
