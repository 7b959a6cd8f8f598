//! Delta-list timer wheel for flow expiry and match-index rebuilds.
//!
//! Slots are kept in insertion order with each slot's `delta` relative to
//! its predecessor, so the head dequeue is O(1) and a one-second tick only
//! touches the head. A slot groups up to [`MAX_TIMER_ENTRIES`] expirees
//! sharing the same absolute deadline and kind. Back-references from flow
//! entries are `(slot id, position)` pairs; cancelling writes a vacant
//! sentinel the expiry pass skips.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bridge::Bridge;
use crate::flow::FlowEntry;

/// Entries per slot before a same-deadline insertion opens a new slot.
pub const MAX_TIMER_ENTRIES: usize = 256;

/// Wall clock in whole seconds; the granularity of every flow timeout.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Back-reference from a flow entry into the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRef {
    pub slot: u64,
    pub pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Flow,
    IndexRebuild,
}

/// What a slot position expires into.
pub enum TimerPayload {
    Flow {
        bridge: Weak<Bridge>,
        entry: Arc<FlowEntry>,
    },
    IndexRebuild {
        bridge: Weak<Bridge>,
        table_id: u8,
    },
    /// Cancelled before expiry; skipped by the expiry pass.
    Vacant,
}

struct TimerSlot {
    id: u64,
    /// Seconds after the predecessor slot (absolute for the head).
    delta: u64,
    kind: TimerKind,
    entries: Vec<TimerPayload>,
}

/// A slot that reached its deadline.
pub struct ExpiredSlot {
    pub kind: TimerKind,
    pub entries: Vec<TimerPayload>,
}

/// The wheel. Shared behind a mutex between the timer thread and the
/// flow-mutation path.
#[derive(Default)]
pub struct TimerWheel {
    slots: VecDeque<TimerSlot>,
    next_id: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Seconds until the head slot fires.
    pub fn head_delay(&self) -> Option<u64> {
        self.slots.front().map(|s| s.delta)
    }

    /// Schedule a flow entry at its next deadline and store the
    /// back-reference. Entries without timeouts are left alone.
    pub fn schedule_flow(&mut self, bridge: &Arc<Bridge>, entry: &Arc<FlowEntry>, now: u64) {
        let Some(timeout) = entry.next_deadline_in(now) else {
            return;
        };
        let r = self.insert(
            timeout.max(1),
            TimerKind::Flow,
            TimerPayload::Flow {
                bridge: Arc::downgrade(bridge),
                entry: entry.clone(),
            },
        );
        *entry.timer_ref.lock() = Some(r);
    }

    /// Schedule a match-index rebuild for one table.
    pub fn schedule_rebuild(&mut self, bridge: &Arc<Bridge>, table_id: u8, timeout: u64) {
        self.insert(
            timeout.max(1),
            TimerKind::IndexRebuild,
            TimerPayload::IndexRebuild {
                bridge: Arc::downgrade(bridge),
                table_id,
            },
        );
    }

    /// Cancel a scheduled expiry by back-reference. The position is left as
    /// a sentinel; the slot itself stays in the chain.
    pub fn cancel(&mut self, r: TimerRef) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == r.slot) {
            if let Some(entry) = slot.entries.get_mut(r.pos) {
                *entry = TimerPayload::Vacant;
            }
        }
    }

    /// Walk the chain accumulating predecessor deltas; append to an
    /// exact-deadline slot of the same kind with room, else splice a new
    /// slot and shrink the successor's delta so absolute deadlines hold.
    fn insert(&mut self, timeout: u64, kind: TimerKind, payload: TimerPayload) -> TimerRef {
        let mut prev_time = 0u64;
        let mut insert_at = self.slots.len();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if prev_time + slot.delta == timeout
                && slot.kind == kind
                && slot.entries.len() < MAX_TIMER_ENTRIES
            {
                let pos = slot.entries.len();
                slot.entries.push(payload);
                return TimerRef { slot: slot.id, pos };
            }
            if prev_time + slot.delta > timeout {
                insert_at = i;
                break;
            }
            prev_time += slot.delta;
        }

        let id = self.next_id;
        self.next_id += 1;
        let delta = timeout - prev_time;
        if let Some(next) = self.slots.get_mut(insert_at) {
            next.delta -= delta;
        }
        self.slots.insert(
            insert_at,
            TimerSlot {
                id,
                delta,
                kind,
                entries: vec![payload],
            },
        );
        TimerRef { slot: id, pos: 0 }
    }

    /// Advance the head by `elapsed` seconds; return every slot whose
    /// deadline passed, in deadline order.
    pub fn advance(&mut self, elapsed: u64) -> Vec<ExpiredSlot> {
        let mut due = Vec::new();
        let mut remaining = elapsed;
        while let Some(head) = self.slots.front_mut() {
            if head.delta > remaining {
                head.delta -= remaining;
                break;
            }
            remaining -= head.delta;
            let slot = self.slots.pop_front().expect("head exists");
            due.push(ExpiredSlot {
                kind: slot.kind,
                entries: slot.entries,
            });
        }
        due
    }

    /// Total scheduled (non-vacant) entries, for tests and stats.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| !matches!(e, TimerPayload::Vacant))
                    .count()
            })
            .sum()
    }

    /// Pending entries of one kind.
    pub fn pending_kind(&self, kind: TimerKind) -> usize {
        self.slots
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|e| !matches!(e, TimerPayload::Vacant))
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> TimerPayload {
        // A dangling bridge is fine for wheel mechanics.
        TimerPayload::IndexRebuild {
            bridge: Weak::new(),
            table_id: 0,
        }
    }

    fn insert(wheel: &mut TimerWheel, timeout: u64, kind: TimerKind) -> TimerRef {
        wheel.insert(timeout, kind, payload())
    }

    #[test]
    fn deltas_accumulate_along_the_chain() {
        let mut w = TimerWheel::new();
        insert(&mut w, 10, TimerKind::Flow);
        insert(&mut w, 3, TimerKind::Flow);
        insert(&mut w, 7, TimerKind::Flow);
        // Chain must be 3, 7, 10 with deltas 3, 4, 3.
        assert_eq!(w.head_delay(), Some(3));
        let due = w.advance(3);
        assert_eq!(due.len(), 1);
        assert_eq!(w.head_delay(), Some(4));
        let due = w.advance(4);
        assert_eq!(due.len(), 1);
        assert_eq!(w.head_delay(), Some(3));
    }

    #[test]
    fn same_deadline_same_kind_shares_slot() {
        let mut w = TimerWheel::new();
        let a = insert(&mut w, 5, TimerKind::Flow);
        let b = insert(&mut w, 5, TimerKind::Flow);
        assert_eq!(a.slot, b.slot);
        assert_eq!(b.pos, 1);
        // A different kind at the same deadline gets its own slot with a
        // zero delta behind the first.
        let c = insert(&mut w, 5, TimerKind::IndexRebuild);
        assert_ne!(c.slot, a.slot);
        let due = w.advance(5);
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn slot_capacity_opens_sibling_slot() {
        let mut w = TimerWheel::new();
        let first = insert(&mut w, 4, TimerKind::Flow);
        for _ in 1..MAX_TIMER_ENTRIES {
            insert(&mut w, 4, TimerKind::Flow);
        }
        let overflow = insert(&mut w, 4, TimerKind::Flow);
        assert_ne!(overflow.slot, first.slot);
        assert_eq!(w.pending(), MAX_TIMER_ENTRIES + 1);
    }

    #[test]
    fn cancel_leaves_vacant_sentinel() {
        let mut w = TimerWheel::new();
        let r = insert(&mut w, 2, TimerKind::Flow);
        insert(&mut w, 2, TimerKind::Flow);
        w.cancel(r);
        assert_eq!(w.pending(), 1);
        let due = w.advance(2);
        let vacant = due[0]
            .entries
            .iter()
            .filter(|e| matches!(e, TimerPayload::Vacant))
            .count();
        assert_eq!(vacant, 1);
        assert_eq!(due[0].entries.len(), 2);
    }

    #[test]
    fn advance_crosses_multiple_slots() {
        let mut w = TimerWheel::new();
        insert(&mut w, 1, TimerKind::Flow);
        insert(&mut w, 2, TimerKind::Flow);
        insert(&mut w, 9, TimerKind::Flow);
        let due = w.advance(5);
        assert_eq!(due.len(), 2);
        // 9s entry has 4s left after a 5s advance.
        assert_eq!(w.head_delay(), Some(4));
    }

    #[test]
    fn splice_preserves_successor_deadline() {
        let mut w = TimerWheel::new();
        insert(&mut w, 10, TimerKind::Flow);
        insert(&mut w, 4, TimerKind::Flow);
        // 10s slot must still fire 10s out: 4 + 6.
        assert_eq!(w.head_delay(), Some(4));
        w.advance(4);
        assert_eq!(w.head_delay(), Some(6));
    }
}
