//! Flow tables: priority-ordered entry lists with a secondary match index.
//!
//! The index buckets entries by their ethertype constraint so a lookup only
//! scans candidates that can possibly match. Mutations mark it stale rather
//! than rebuilding inline; an index-rebuild timer slot (or the next
//! mutation-side rebuild request) restores it. While stale, lookups fall
//! back to the full priority scan, so results are always current; only the
//! shortcut lags.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DpResult, FlowModError};
use crate::flow::{FieldMatch, FlowEntry};
use crate::packet::FlowKey;

/// What happens to a packet that matches nothing in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableMissBehavior {
    /// OpenFlow 1.3 default.
    #[default]
    Drop,
    /// Punt to the protocol agent.
    Controller,
    /// Continue at the next table.
    NextTable,
}

/// Default per-table entry limit.
pub const DEFAULT_TABLE_CAPACITY: usize = 65_536;

struct Slot {
    seq: u64,
    entry: Arc<FlowEntry>,
}

#[derive(Default)]
struct MatchIndex {
    by_ethertype: HashMap<u16, Vec<(u64, Arc<FlowEntry>)>>,
    wildcard: Vec<(u64, Arc<FlowEntry>)>,
}

/// A single flow table.
pub struct FlowTable {
    pub id: u8,
    pub miss: TableMissBehavior,
    max_entries: usize,
    entries: Vec<Slot>,
    index: MatchIndex,
    index_stale: AtomicBool,
    rebuild_scheduled: AtomicBool,
    next_seq: u64,
}

impl FlowTable {
    pub fn new(id: u8) -> Self {
        FlowTable {
            id,
            miss: TableMissBehavior::default(),
            max_entries: DEFAULT_TABLE_CAPACITY,
            entries: Vec::new(),
            index: MatchIndex::default(),
            index_stale: AtomicBool::new(false),
            rebuild_scheduled: AtomicBool::new(false),
            next_seq: 0,
        }
    }

    #[cfg(test)]
    pub fn with_capacity(id: u8, max_entries: usize) -> Self {
        let mut t = FlowTable::new(id);
        t.max_entries = max_entries;
        t
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<FlowEntry>> {
        self.entries.iter().map(|s| &s.entry)
    }

    /// Install an entry, replacing an identical (priority, match) one per
    /// OpenFlow add semantics. Returns the replaced entry, if any.
    pub fn add(&mut self, entry: Arc<FlowEntry>) -> DpResult<Option<Arc<FlowEntry>>> {
        let replaced = if let Some(pos) = self
            .entries
            .iter()
            .position(|s| s.entry.same_match(entry.priority, &entry.match_list))
        {
            Some(self.entries.remove(pos).entry)
        } else {
            None
        };
        if replaced.is_none() && self.entries.len() >= self.max_entries {
            return Err(FlowModError::TableFull.into());
        }
        // Priority descending; equal priorities keep insertion order.
        let at = self
            .entries
            .partition_point(|s| s.entry.priority >= entry.priority);
        self.entries.insert(at, Slot { seq: self.next_seq, entry });
        self.next_seq += 1;
        self.mark_stale();
        Ok(replaced)
    }

    /// Find the entry with an identical (priority, match).
    pub fn find_exact(&self, priority: u16, list: &[FieldMatch]) -> Option<Arc<FlowEntry>> {
        self.entries
            .iter()
            .find(|s| s.entry.same_match(priority, list))
            .map(|s| s.entry.clone())
    }

    /// Remove entries. Strict removes the identical (priority, match)
    /// entry; non-strict removes every entry whose match includes the
    /// request's fields. Returns the removed entries.
    pub fn remove(&mut self, priority: u16, list: &[FieldMatch], strict: bool) -> Vec<Arc<FlowEntry>> {
        let mut removed = Vec::new();
        self.entries.retain(|s| {
            let hit = if strict {
                s.entry.same_match(priority, list)
            } else {
                match_is_subset(list, &s.entry.match_list)
            };
            if hit {
                removed.push(s.entry.clone());
            }
            !hit
        });
        if !removed.is_empty() {
            self.mark_stale();
        }
        removed
    }

    /// Remove one specific entry (timer expiry path).
    pub fn remove_entry(&mut self, entry: &Arc<FlowEntry>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| !Arc::ptr_eq(&s.entry, entry));
        let hit = self.entries.len() != before;
        if hit {
            self.mark_stale();
        }
        hit
    }

    /// Entries selected by a non-strict match, for modify.
    pub fn select(&self, priority: u16, list: &[FieldMatch], strict: bool) -> Vec<Arc<FlowEntry>> {
        self.entries
            .iter()
            .filter(|s| {
                if strict {
                    s.entry.same_match(priority, list)
                } else {
                    match_is_subset(list, &s.entry.match_list)
                }
            })
            .map(|s| s.entry.clone())
            .collect()
    }

    /// Highest-priority entry matching `key`. Uses the index when fresh.
    pub fn lookup(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        if self.index_stale.load(Ordering::Acquire) {
            return self
                .entries
                .iter()
                .find(|s| s.entry.matches(key))
                .map(|s| s.entry.clone());
        }
        let empty = Vec::new();
        let bucket = self.index.by_ethertype.get(&key.eth_type).unwrap_or(&empty);
        // Two-way merge over the bucket and the wildcard list, both sorted
        // by (priority desc, seq asc).
        let mut a = bucket.iter().peekable();
        let mut b = self.index.wildcard.iter().peekable();
        loop {
            let pick_a = match (a.peek(), b.peek()) {
                (None, None) => return None,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some((sa, ea)), Some((sb, eb))) => {
                    (ea.priority, std::cmp::Reverse(*sa)) > (eb.priority, std::cmp::Reverse(*sb))
                }
            };
            let (_, entry) = if pick_a { a.next().unwrap() } else { b.next().unwrap() };
            if entry.matches(key) {
                return Some(entry.clone());
            }
        }
    }

    pub fn index_is_stale(&self) -> bool {
        self.index_stale.load(Ordering::Acquire)
    }

    /// Claim the right to schedule a rebuild timer; false when one is
    /// already pending.
    pub fn mark_rebuild_scheduled(&self) -> bool {
        !self.rebuild_scheduled.swap(true, Ordering::AcqRel)
    }

    fn mark_stale(&self) {
        self.index_stale.store(true, Ordering::Release);
    }

    /// Rebuild the ethertype buckets from the current entries.
    pub fn rebuild_index(&mut self) {
        let mut index = MatchIndex::default();
        for slot in &self.entries {
            let eth_type = slot.entry.match_list.iter().find_map(|m| match m {
                FieldMatch::EthType(t) => Some(*t),
                _ => None,
            });
            let item = (slot.seq, slot.entry.clone());
            match eth_type {
                Some(t) => index.by_ethertype.entry(t).or_default().push(item),
                None => index.wildcard.push(item),
            }
        }
        self.index = index;
        self.index_stale.store(false, Ordering::Release);
        self.rebuild_scheduled.store(false, Ordering::Release);
    }
}

/// Is every field of `subset` present with a compatible value in `superset`?
/// This is the OpenFlow non-strict delete/modify selection rule.
fn match_is_subset(subset: &[FieldMatch], superset: &[FieldMatch]) -> bool {
    subset.iter().all(|want| {
        superset.iter().any(|have| fields_overlap(want, have))
    })
}

fn fields_overlap(want: &FieldMatch, have: &FieldMatch) -> bool {
    use FieldMatch::*;
    match (want, have) {
        // An entry's narrower prefix is covered by the request's wider one.
        (IpSrc { addr: wa, prefix: wp }, IpSrc { addr: ha, prefix: hp }) => {
            hp >= wp && prefix_contains(*wa, *wp, *ha)
        }
        (IpDst { addr: wa, prefix: wp }, IpDst { addr: ha, prefix: hp }) => {
            hp >= wp && prefix_contains(*wa, *wp, *ha)
        }
        _ => want == have,
    }
}

fn prefix_contains(net: std::net::IpAddr, prefix: u8, addr: std::net::IpAddr) -> bool {
    use std::net::IpAddr;
    match (net, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            let bits = prefix.min(32) as u32;
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            (u32::from(a) & mask) == (u32::from(n) & mask)
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            let bits = prefix.min(128) as u32;
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            (u128::from(a) & mask) == (u128::from(n) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowMod;
    use crate::packet::{ETHERTYPE_ARP, ETHERTYPE_IPV4};
    use std::net::IpAddr;

    fn entry(priority: u16, list: Vec<FieldMatch>) -> Arc<FlowEntry> {
        Arc::new(
            FlowEntry::from_mod(
                &FlowMod { priority, match_list: list, ..FlowMod::default() },
                0,
            )
            .unwrap(),
        )
    }

    fn ipv4_key(dst: [u8; 4]) -> FlowKey {
        FlowKey {
            eth_type: ETHERTYPE_IPV4,
            ip_dst: Some(IpAddr::from(dst)),
            ip_src: Some(IpAddr::from([10, 0, 0, 99])),
            ..FlowKey::default()
        }
    }

    fn dst_match(dst: [u8; 4], prefix: u8) -> Vec<FieldMatch> {
        vec![
            FieldMatch::EthType(ETHERTYPE_IPV4),
            FieldMatch::IpDst { addr: IpAddr::from(dst), prefix },
        ]
    }

    #[test]
    fn lookup_prefers_priority() {
        let mut t = FlowTable::new(0);
        t.add(entry(100, dst_match([10, 0, 0, 0], 24))).unwrap();
        t.add(entry(200, dst_match([10, 0, 0, 1], 32))).unwrap();
        t.rebuild_index();
        let hit = t.lookup(&ipv4_key([10, 0, 0, 1])).unwrap();
        assert_eq!(hit.priority, 200);
        let hit = t.lookup(&ipv4_key([10, 0, 0, 2])).unwrap();
        assert_eq!(hit.priority, 100);
    }

    #[test]
    fn equal_priority_ties_break_by_insertion() {
        let mut t = FlowTable::new(0);
        let first = entry(50, dst_match([10, 0, 0, 0], 8));
        let second = entry(50, dst_match([10, 0, 0, 0], 16));
        t.add(first.clone()).unwrap();
        t.add(second).unwrap();
        t.rebuild_index();
        let hit = t.lookup(&ipv4_key([10, 0, 0, 5])).unwrap();
        assert!(Arc::ptr_eq(&hit, &first));
    }

    #[test]
    fn stale_index_still_finds_new_entries() {
        let mut t = FlowTable::new(0);
        t.add(entry(10, dst_match([10, 0, 0, 0], 24))).unwrap();
        t.rebuild_index();
        t.add(entry(20, dst_match([10, 0, 0, 1], 32))).unwrap();
        assert!(t.index_is_stale());
        // Linear fallback must see the newer, higher-priority entry.
        let hit = t.lookup(&ipv4_key([10, 0, 0, 1])).unwrap();
        assert_eq!(hit.priority, 20);
        t.rebuild_index();
        let hit = t.lookup(&ipv4_key([10, 0, 0, 1])).unwrap();
        assert_eq!(hit.priority, 20);
    }

    #[test]
    fn index_merges_wildcard_entries() {
        let mut t = FlowTable::new(0);
        t.add(entry(300, vec![FieldMatch::InPort(1)])).unwrap(); // no ethertype
        t.add(entry(100, dst_match([10, 0, 0, 0], 8))).unwrap();
        t.rebuild_index();
        let mut key = ipv4_key([10, 0, 0, 1]);
        key.in_port = 1;
        assert_eq!(t.lookup(&key).unwrap().priority, 300);
        key.in_port = 2;
        assert_eq!(t.lookup(&key).unwrap().priority, 100);
    }

    #[test]
    fn add_replaces_identical_match() {
        let mut t = FlowTable::with_capacity(0, 1);
        t.add(entry(100, dst_match([10, 0, 0, 1], 32))).unwrap();
        // Same (priority, match): replaces rather than overflowing.
        let replaced = t.add(entry(100, dst_match([10, 0, 0, 1], 32))).unwrap();
        assert!(replaced.is_some());
        assert_eq!(t.len(), 1);
        // A different match on the full table is TableFull.
        let err = t.add(entry(100, dst_match([10, 0, 0, 2], 32))).unwrap_err();
        assert_eq!(
            err,
            crate::error::DpError::OfpError(FlowModError::TableFull)
        );
    }

    #[test]
    fn non_strict_remove_uses_subset_rule() {
        let mut t = FlowTable::new(0);
        t.add(entry(10, dst_match([10, 0, 0, 1], 32))).unwrap();
        t.add(entry(10, dst_match([10, 0, 1, 1], 32))).unwrap();
        t.add(entry(10, vec![FieldMatch::EthType(ETHERTYPE_ARP)])).unwrap();
        // Wider /24 request removes only the contained /32.
        let removed = t.remove(0, dst_match([10, 0, 0, 0], 24).as_slice(), false);
        assert_eq!(removed.len(), 1);
        assert_eq!(t.len(), 2);
        // Empty request removes everything.
        let removed = t.remove(0, &[], false);
        assert_eq!(removed.len(), 2);
        assert!(t.is_empty());
    }

    #[test]
    fn strict_remove_needs_exact_priority() {
        let mut t = FlowTable::new(0);
        t.add(entry(10, dst_match([10, 0, 0, 1], 32))).unwrap();
        assert!(t.remove(11, dst_match([10, 0, 0, 1], 32).as_slice(), true).is_empty());
        assert_eq!(
            t.remove(10, dst_match([10, 0, 0, 1], 32).as_slice(), true).len(),
            1
        );
    }
}
