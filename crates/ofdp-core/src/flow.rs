//! Flow entries and match fields.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::PortId;
use crate::actions::{Instruction, InstructionSet};
use crate::error::{DpResult, FlowModError};
use crate::packet::{ETHERTYPE_IPV4, ETHERTYPE_IPV6, FlowKey, IPPROTO_TCP, IPPROTO_UDP};
use crate::timer::TimerRef;

/// One match field of a flow entry. IP addresses carry a prefix length;
/// everything else matches exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatch {
    InPort(PortId),
    EthDst([u8; 6]),
    EthSrc([u8; 6]),
    EthType(u16),
    VlanVid(u16),
    VlanPcp(u8),
    IpSrc { addr: IpAddr, prefix: u8 },
    IpDst { addr: IpAddr, prefix: u8 },
    IpProto(u8),
    TpSrc(u16),
    TpDst(u16),
}

impl FieldMatch {
    /// Does `key` satisfy this field?
    pub fn matches(&self, key: &FlowKey) -> bool {
        match self {
            FieldMatch::InPort(p) => key.in_port == *p,
            FieldMatch::EthDst(mac) => key.eth_dst == *mac,
            FieldMatch::EthSrc(mac) => key.eth_src == *mac,
            FieldMatch::EthType(t) => key.eth_type == *t,
            FieldMatch::VlanVid(vid) => key.vlan_vid == Some(*vid),
            FieldMatch::VlanPcp(pcp) => key.vlan_pcp == Some(*pcp),
            FieldMatch::IpSrc { addr, prefix } => ip_prefix_eq(key.ip_src, *addr, *prefix),
            FieldMatch::IpDst { addr, prefix } => ip_prefix_eq(key.ip_dst, *addr, *prefix),
            FieldMatch::IpProto(p) => key.ip_proto == Some(*p),
            FieldMatch::TpSrc(p) => key.tp_src == Some(*p),
            FieldMatch::TpDst(p) => key.tp_dst == Some(*p),
        }
    }
}

fn ip_prefix_eq(actual: Option<IpAddr>, want: IpAddr, prefix: u8) -> bool {
    let Some(actual) = actual else { return false };
    match (actual, want) {
        (IpAddr::V4(a), IpAddr::V4(w)) => {
            let bits = prefix.min(32) as u32;
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            (u32::from(a) & mask) == (u32::from(w) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(w)) => {
            let bits = prefix.min(128) as u32;
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
            (u128::from(a) & mask) == (u128::from(w) & mask)
        }
        _ => false,
    }
}

/// OpenFlow match prerequisites: L3 fields need the matching ethertype,
/// transport ports need a TCP/UDP ip_proto.
pub fn validate_match(list: &[FieldMatch]) -> DpResult<()> {
    let eth_type = list.iter().find_map(|m| match m {
        FieldMatch::EthType(t) => Some(*t),
        _ => None,
    });
    let ip_proto = list.iter().find_map(|m| match m {
        FieldMatch::IpProto(p) => Some(*p),
        _ => None,
    });
    for m in list {
        match m {
            FieldMatch::IpSrc { .. } | FieldMatch::IpDst { .. } | FieldMatch::IpProto(_) => {
                if !matches!(eth_type, Some(ETHERTYPE_IPV4) | Some(ETHERTYPE_IPV6)) {
                    return Err(FlowModError::BadMatch.into());
                }
            }
            FieldMatch::TpSrc(_) | FieldMatch::TpDst(_) => {
                if !matches!(ip_proto, Some(IPPROTO_TCP) | Some(IPPROTO_UDP)) {
                    return Err(FlowModError::BadMatch.into());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Canonical encoding of a match list, independent of field order. Used for
/// identical-match detection on add/modify-strict and for the table's exact
/// index.
pub fn canonical_match_bytes(list: &[FieldMatch]) -> Vec<u8> {
    let mut fields: Vec<Vec<u8>> = list.iter().map(encode_field).collect();
    fields.sort();
    let mut out = Vec::with_capacity(fields.iter().map(Vec::len).sum());
    for f in fields {
        out.extend_from_slice(&f);
    }
    out
}

fn encode_field(m: &FieldMatch) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    match m {
        FieldMatch::InPort(p) => {
            out.push(0);
            out.extend_from_slice(&p.to_be_bytes());
        }
        FieldMatch::EthDst(mac) => {
            out.push(1);
            out.extend_from_slice(mac);
        }
        FieldMatch::EthSrc(mac) => {
            out.push(2);
            out.extend_from_slice(mac);
        }
        FieldMatch::EthType(t) => {
            out.push(3);
            out.extend_from_slice(&t.to_be_bytes());
        }
        FieldMatch::VlanVid(v) => {
            out.push(4);
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldMatch::VlanPcp(p) => {
            out.push(5);
            out.push(*p);
        }
        FieldMatch::IpSrc { addr, prefix } => {
            out.push(6);
            encode_addr(&mut out, addr, *prefix);
        }
        FieldMatch::IpDst { addr, prefix } => {
            out.push(7);
            encode_addr(&mut out, addr, *prefix);
        }
        FieldMatch::IpProto(p) => {
            out.push(8);
            out.push(*p);
        }
        FieldMatch::TpSrc(p) => {
            out.push(9);
            out.extend_from_slice(&p.to_be_bytes());
        }
        FieldMatch::TpDst(p) => {
            out.push(10);
            out.extend_from_slice(&p.to_be_bytes());
        }
    }
    out
}

fn encode_addr(out: &mut Vec<u8>, addr: &IpAddr, prefix: u8) {
    match addr {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.push(prefix);
}

/// Why a flow entry left its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
}

/// A flow-table mutation request from the protocol agent.
#[derive(Debug, Clone, Default)]
pub struct FlowMod {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub send_flow_removed: bool,
    pub match_list: Vec<FieldMatch>,
    pub instructions: Vec<Instruction>,
}

/// One installed flow entry.
///
/// Immutable after installation except for `update_time` and the counters,
/// which workers touch on match, and the timer back-reference.
#[derive(Debug)]
pub struct FlowEntry {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: u64,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub send_flow_removed: bool,
    pub create_time: u64,
    pub match_list: Vec<FieldMatch>,
    /// Replaced wholesale by flow-modify; counters and timers survive.
    instructions: RwLock<InstructionSet>,
    update_time: AtomicU64,
    packets: AtomicU64,
    bytes: AtomicU64,
    pub(crate) timer_ref: Mutex<Option<TimerRef>>,
}

impl FlowEntry {
    pub fn from_mod(m: &FlowMod, now: u64) -> DpResult<FlowEntry> {
        validate_match(&m.match_list)?;
        let instructions = InstructionSet::new(m.instructions.iter().cloned())?;
        Ok(FlowEntry {
            table_id: m.table_id,
            priority: m.priority,
            cookie: m.cookie,
            idle_timeout: m.idle_timeout,
            hard_timeout: m.hard_timeout,
            send_flow_removed: m.send_flow_removed,
            create_time: now,
            match_list: m.match_list.clone(),
            instructions: RwLock::new(instructions),
            update_time: AtomicU64::new(now),
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            timer_ref: Mutex::new(None),
        })
    }

    /// All fields of the match list satisfied by `key`?
    pub fn matches(&self, key: &FlowKey) -> bool {
        self.match_list.iter().all(|m| m.matches(key))
    }

    /// Read access to the instruction slots for execution.
    pub fn instructions(&self) -> RwLockReadGuard<'_, InstructionSet> {
        self.instructions.read()
    }

    /// Swap in a new instruction set (flow-modify).
    pub fn replace_instructions(&self, set: InstructionSet) {
        *self.instructions.write() = set;
    }

    /// Record a match: bump counters and advance `update_time`
    /// monotonically.
    pub fn touch(&self, now: u64, frame_len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame_len as u64, Ordering::Relaxed);
        self.update_time.fetch_max(now, Ordering::Relaxed);
    }

    pub fn update_time(&self) -> u64 {
        self.update_time.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn has_timeout(&self) -> bool {
        self.idle_timeout > 0 || self.hard_timeout > 0
    }

    /// Seconds until the earliest of the two deadlines, measured at `now`.
    /// Zero or negative elapses clamp to zero (expire immediately).
    pub fn next_deadline_in(&self, now: u64) -> Option<u64> {
        let idle = (self.idle_timeout > 0).then(|| {
            (self.update_time().saturating_add(self.idle_timeout as u64)).saturating_sub(now)
        });
        let hard = (self.hard_timeout > 0).then(|| {
            (self.create_time.saturating_add(self.hard_timeout as u64)).saturating_sub(now)
        });
        match (idle, hard) {
            (Some(i), Some(h)) => Some(i.min(h)),
            (Some(i), None) => Some(i),
            (None, Some(h)) => Some(h),
            (None, None) => None,
        }
    }

    /// Which timeout, if any, has fired by `now`? Hard takes precedence
    /// when both have passed in the same pass.
    pub fn expired_reason(&self, now: u64) -> Option<FlowRemovedReason> {
        if self.hard_timeout > 0 && now >= self.create_time + self.hard_timeout as u64 {
            return Some(FlowRemovedReason::HardTimeout);
        }
        if self.idle_timeout > 0 && now >= self.update_time() + self.idle_timeout as u64 {
            return Some(FlowRemovedReason::IdleTimeout);
        }
        None
    }

    /// Identical match as another list at the same priority (the identity
    /// used by add-replace and strict modify/delete).
    pub fn same_match(&self, priority: u16, list: &[FieldMatch]) -> bool {
        self.priority == priority
            && canonical_match_bytes(&self.match_list) == canonical_match_bytes(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ETHERTYPE_ARP;

    fn key() -> FlowKey {
        FlowKey {
            in_port: 1,
            eth_dst: [2, 0, 0, 0, 0, 2],
            eth_src: [2, 0, 0, 0, 0, 1],
            eth_type: ETHERTYPE_IPV4,
            vlan_vid: None,
            vlan_pcp: None,
            ip_src: Some(IpAddr::from([10, 0, 1, 5])),
            ip_dst: Some(IpAddr::from([10, 0, 2, 9])),
            ip_proto: Some(IPPROTO_TCP),
            tp_src: Some(40000),
            tp_dst: Some(443),
        }
    }

    #[test]
    fn prefix_match_on_ipv4() {
        let m = FieldMatch::IpDst { addr: IpAddr::from([10, 0, 2, 0]), prefix: 24 };
        assert!(m.matches(&key()));
        let narrow = FieldMatch::IpDst { addr: IpAddr::from([10, 0, 2, 0]), prefix: 32 };
        assert!(!narrow.matches(&key()));
        let any = FieldMatch::IpDst { addr: IpAddr::from([0, 0, 0, 0]), prefix: 0 };
        assert!(any.matches(&key()));
    }

    #[test]
    fn vlan_match_requires_tag() {
        let m = FieldMatch::VlanVid(100);
        assert!(!m.matches(&key()));
        let mut tagged = key();
        tagged.vlan_vid = Some(100);
        assert!(m.matches(&tagged));
    }

    #[test]
    fn match_prereqs_enforced() {
        // tp_dst without ip_proto is a bad match.
        assert!(validate_match(&[FieldMatch::TpDst(80)]).is_err());
        // ip_dst under an ARP ethertype is a bad match.
        assert!(
            validate_match(&[
                FieldMatch::EthType(ETHERTYPE_ARP),
                FieldMatch::IpDst { addr: IpAddr::from([10, 0, 0, 1]), prefix: 32 },
            ])
            .is_err()
        );
        assert!(
            validate_match(&[
                FieldMatch::EthType(ETHERTYPE_IPV4),
                FieldMatch::IpProto(IPPROTO_TCP),
                FieldMatch::TpDst(80),
            ])
            .is_ok()
        );
    }

    #[test]
    fn canonical_bytes_ignore_field_order() {
        let a = vec![FieldMatch::EthType(ETHERTYPE_IPV4), FieldMatch::InPort(3)];
        let b = vec![FieldMatch::InPort(3), FieldMatch::EthType(ETHERTYPE_IPV4)];
        assert_eq!(canonical_match_bytes(&a), canonical_match_bytes(&b));
        let c = vec![FieldMatch::InPort(4), FieldMatch::EthType(ETHERTYPE_IPV4)];
        assert_ne!(canonical_match_bytes(&a), canonical_match_bytes(&c));
    }

    #[test]
    fn update_time_is_monotonic() {
        let entry = FlowEntry::from_mod(
            &FlowMod { idle_timeout: 10, ..FlowMod::default() },
            100,
        )
        .unwrap();
        entry.touch(105, 64);
        entry.touch(103, 64); // stale clock reading must not rewind
        assert_eq!(entry.update_time(), 105);
        assert_eq!(entry.packet_count(), 2);
    }

    #[test]
    fn hard_timeout_takes_precedence() {
        let entry = FlowEntry::from_mod(
            &FlowMod { idle_timeout: 2, hard_timeout: 5, ..FlowMod::default() },
            100,
        )
        .unwrap();
        // At t=105 both are expired (idle since 102, hard at 105).
        assert_eq!(entry.expired_reason(105), Some(FlowRemovedReason::HardTimeout));
        // At t=103 only idle fired.
        assert_eq!(entry.expired_reason(103), Some(FlowRemovedReason::IdleTimeout));
        assert_eq!(entry.expired_reason(101), None);
    }

    #[test]
    fn next_deadline_tracks_updates() {
        let entry = FlowEntry::from_mod(
            &FlowMod { idle_timeout: 4, hard_timeout: 10, ..FlowMod::default() },
            100,
        )
        .unwrap();
        assert_eq!(entry.next_deadline_in(100), Some(4));
        entry.touch(103, 64);
        assert_eq!(entry.next_deadline_in(103), Some(4));
        // Hard deadline caps the horizon near create_time + 10.
        entry.touch(108, 64);
        assert_eq!(entry.next_deadline_in(108), Some(2));
    }
}
