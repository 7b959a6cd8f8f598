//! OpenFlow 1.3 instruction and action interpreter.
//!
//! Instructions execute in the fixed six-slot order (meter, apply-actions,
//! clear-actions, write-actions, write-metadata, goto-table) regardless of
//! the order the controller listed them. Write-actions accumulate into the
//! packet's action set, which is applied in the 1.3 action-set order once
//! the pipeline leaves its last table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

use crate::PortId;
use crate::error::{DpError, DpResult, FlowModError};
use crate::packet::{ETHERTYPE_VLAN, FlowKey};
use crate::pool::Packet;

/// Where an output action sends a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    /// A physical or logical port.
    Port(PortId),
    /// Back out the ingress port.
    InPort,
    /// Every port except the ingress port.
    All,
    /// Punt to the protocol agent (packet-in).
    Controller,
}

/// Fields a set-field action can rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetField {
    EthDst([u8; 6]),
    EthSrc([u8; 6]),
    VlanVid(u16),
    VlanPcp(u8),
    IpSrc(IpAddr),
    IpDst(IpAddr),
    TpSrc(u16),
    TpDst(u16),
}

/// One OpenFlow action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Output(OutputTarget),
    Group(u32),
    SetQueue(u32),
    PushVlan(u16),
    PopVlan,
    SetField(SetField),
}

/// The per-packet accumulated action set (write-actions target).
///
/// One action of each kind; a later write replaces the earlier one.
#[derive(Debug, Clone, Default)]
pub struct ActionSet {
    pub pop_vlan: bool,
    pub push_vlan: Option<u16>,
    pub set_fields: Vec<SetField>,
    pub queue: Option<u32>,
    pub group: Option<u32>,
    pub output: Option<OutputTarget>,
}

impl ActionSet {
    pub fn clear(&mut self) {
        *self = ActionSet::default();
    }

    pub fn is_empty(&self) -> bool {
        !self.pop_vlan
            && self.push_vlan.is_none()
            && self.set_fields.is_empty()
            && self.queue.is_none()
            && self.group.is_none()
            && self.output.is_none()
    }

    /// Merge one write-action into the set.
    pub fn write(&mut self, action: &Action) {
        match action {
            Action::Output(t) => self.output = Some(*t),
            Action::Group(g) => self.group = Some(*g),
            Action::SetQueue(q) => self.queue = Some(*q),
            Action::PushVlan(tpid) => self.push_vlan = Some(*tpid),
            Action::PopVlan => self.pop_vlan = true,
            Action::SetField(f) => {
                // A second set-field of the same field replaces the first.
                self.set_fields
                    .retain(|prev| std::mem::discriminant(prev) != std::mem::discriminant(f));
                self.set_fields.push(*f);
            }
        }
    }

    /// Flatten into an action list in OpenFlow 1.3 action-set order.
    fn to_list(&self) -> Vec<Action> {
        let mut list = Vec::new();
        if self.pop_vlan {
            list.push(Action::PopVlan);
        }
        if let Some(tpid) = self.push_vlan {
            list.push(Action::PushVlan(tpid));
        }
        for f in &self.set_fields {
            list.push(Action::SetField(*f));
        }
        if let Some(q) = self.queue {
            list.push(Action::SetQueue(q));
        }
        if let Some(g) = self.group {
            list.push(Action::Group(g));
        } else if let Some(t) = self.output {
            // Per 1.3, a group in the set shadows the output action.
            list.push(Action::Output(t));
        }
        list
    }
}

/// One OpenFlow instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Meter(u32),
    ApplyActions(Vec<Action>),
    ClearActions,
    WriteActions(Vec<Action>),
    WriteMetadata { value: u64, mask: u64 },
    GotoTable(u8),
}

/// Slot indices fixing the execution order.
pub const SLOT_METER: usize = 0;
pub const SLOT_APPLY_ACTIONS: usize = 1;
pub const SLOT_CLEAR_ACTIONS: usize = 2;
pub const SLOT_WRITE_ACTIONS: usize = 3;
pub const SLOT_WRITE_METADATA: usize = 4;
pub const SLOT_GOTO_TABLE: usize = 5;

/// The six-slot instruction array of a flow entry. Any slot may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionSet {
    slots: [Option<Instruction>; 6],
}

impl InstructionSet {
    pub fn new(instructions: impl IntoIterator<Item = Instruction>) -> DpResult<Self> {
        let mut set = InstructionSet::default();
        for insn in instructions {
            set.put(insn)?;
        }
        Ok(set)
    }

    /// Place an instruction in its slot. A duplicate kind is a
    /// bad-instruction error.
    pub fn put(&mut self, insn: Instruction) -> DpResult<()> {
        let slot = match insn {
            Instruction::Meter(_) => SLOT_METER,
            Instruction::ApplyActions(_) => SLOT_APPLY_ACTIONS,
            Instruction::ClearActions => SLOT_CLEAR_ACTIONS,
            Instruction::WriteActions(_) => SLOT_WRITE_ACTIONS,
            Instruction::WriteMetadata { .. } => SLOT_WRITE_METADATA,
            Instruction::GotoTable(_) => SLOT_GOTO_TABLE,
        };
        if self.slots[slot].is_some() {
            return Err(FlowModError::BadInstruction.into());
        }
        self.slots[slot] = Some(insn);
        Ok(())
    }

    pub fn get(&self, slot: usize) -> Option<&Instruction> {
        self.slots[slot].as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

// ---------------------------------------------------------------------------
// Groups and meters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    All,
    Select,
    Indirect,
}

#[derive(Debug, Clone)]
pub struct GroupBucket {
    pub weight: u16,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: u32,
    pub kind: GroupKind,
    pub buckets: Vec<GroupBucket>,
}

impl Group {
    /// Deterministic weighted bucket choice for a select group: the same
    /// flow always lands in the same bucket, preserving per-flow order.
    fn select_bucket(&self, hash: u64) -> Option<&GroupBucket> {
        let total: u64 = self.buckets.iter().map(|b| b.weight.max(1) as u64).sum();
        if total == 0 {
            return None;
        }
        let mut point = hash % total;
        for bucket in &self.buckets {
            let w = bucket.weight.max(1) as u64;
            if point < w {
                return Some(bucket);
            }
            point -= w;
        }
        None
    }
}

/// Group table of one bridge; mutated only under the flow-database lock.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: HashMap<u32, Group>,
}

impl GroupTable {
    pub fn add(&mut self, group: Group) -> DpResult<()> {
        if self.groups.contains_key(&group.id) {
            return Err(DpError::AlreadyExists);
        }
        self.groups.insert(group.id, group);
        Ok(())
    }

    pub fn remove(&mut self, id: u32) -> DpResult<Group> {
        self.groups.remove(&id).ok_or(DpError::NotFound)
    }

    pub fn get(&self, id: u32) -> Option<&Group> {
        self.groups.get(&id)
    }
}

/// Drop-band meter: packets beyond `rate_pps` in a one-second window drop.
#[derive(Debug)]
pub struct Meter {
    pub rate_pps: u64,
    state: Mutex<MeterWindow>,
}

#[derive(Debug)]
struct MeterWindow {
    window: Instant,
    passed: u64,
}

impl Meter {
    pub fn new(rate_pps: u64) -> Self {
        Meter {
            rate_pps,
            state: Mutex::new(MeterWindow { window: Instant::now(), passed: 0 }),
        }
    }

    /// True when the packet exceeds the band and must drop.
    pub fn exceeds(&self) -> bool {
        let mut st = self.state.lock();
        if st.window.elapsed().as_secs() >= 1 {
            st.window = Instant::now();
            st.passed = 0;
        }
        st.passed += 1;
        st.passed > self.rate_pps
    }
}

#[derive(Debug, Default)]
pub struct MeterTable {
    meters: HashMap<u32, Meter>,
}

impl MeterTable {
    pub fn add(&mut self, id: u32, rate_pps: u64) -> DpResult<()> {
        if self.meters.contains_key(&id) {
            return Err(DpError::AlreadyExists);
        }
        self.meters.insert(id, Meter::new(rate_pps));
        Ok(())
    }

    pub fn remove(&mut self, id: u32) -> DpResult<()> {
        self.meters.remove(&id).map(|_| ()).ok_or(DpError::NotFound)
    }

    pub fn get(&self, id: u32) -> Option<&Meter> {
        self.meters.get(&id)
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A packet leaving the pipeline toward a target.
#[derive(Debug)]
pub struct Emission {
    pub target: OutputTarget,
    pub queue: Option<u32>,
    pub packet: Packet,
}

/// Group/meter state the interpreter consults; owned by the bridge.
pub struct ExecEnv<'a> {
    pub groups: &'a GroupTable,
    pub meters: &'a MeterTable,
}

/// Pipeline continuation after an instruction set ran.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineControl {
    /// Fall off the pipeline; apply the accumulated action set.
    Finish,
    /// Continue matching at the given table.
    Goto(u8),
}

/// Execute a flow entry's instruction set on a packet.
///
/// Emissions (copies sent by apply-actions outputs, or group fanout) are
/// appended to `out`. A meter drop or an explicitly terminated pipeline
/// returns [`DpError::NoMoreAction`]; the caller counts a drop.
pub fn execute_instruction_set(
    pkt: &mut Packet,
    set: &InstructionSet,
    env: &ExecEnv<'_>,
    out: &mut Vec<Emission>,
) -> DpResult<PipelineControl> {
    if let Some(Instruction::Meter(id)) = set.get(SLOT_METER) {
        match env.meters.get(*id) {
            Some(meter) if meter.exceeds() => return Err(DpError::NoMoreAction),
            Some(_) => {}
            None => return Err(DpError::NoMoreAction),
        }
    }
    if let Some(Instruction::ApplyActions(actions)) = set.get(SLOT_APPLY_ACTIONS) {
        execute_action_list(pkt, actions, env, out)?;
    }
    if let Some(Instruction::ClearActions) = set.get(SLOT_CLEAR_ACTIONS) {
        pkt.buffer_mut().meta.action_set.clear();
    }
    if let Some(Instruction::WriteActions(actions)) = set.get(SLOT_WRITE_ACTIONS) {
        let meta = &mut pkt.buffer_mut().meta;
        for action in actions {
            meta.action_set.write(action);
        }
    }
    if let Some(Instruction::WriteMetadata { value, mask }) = set.get(SLOT_WRITE_METADATA) {
        let meta = &mut pkt.buffer_mut().meta;
        meta.of_metadata = (meta.of_metadata & !mask) | (value & mask);
    }
    if let Some(Instruction::GotoTable(table)) = set.get(SLOT_GOTO_TABLE) {
        return Ok(PipelineControl::Goto(*table));
    }
    Ok(PipelineControl::Finish)
}

/// Apply the accumulated action set at pipeline exit, consuming the packet.
///
/// Returns `NoMoreAction` when the set names no output (the 1.3 default:
/// drop).
pub fn apply_action_set(mut pkt: Packet, env: &ExecEnv<'_>, out: &mut Vec<Emission>) -> DpResult<()> {
    let set = pkt.buffer().meta.action_set.clone();
    if set.output.is_none() && set.group.is_none() {
        return Err(DpError::NoMoreAction);
    }
    let list = set.to_list();
    execute_action_list(&mut pkt, &list, env, out)?;
    Ok(())
}

/// Execute an action list in order, mutating the packet in place and
/// emitting copies for output/group actions.
pub fn execute_action_list(
    pkt: &mut Packet,
    actions: &[Action],
    env: &ExecEnv<'_>,
    out: &mut Vec<Emission>,
) -> DpResult<()> {
    for action in actions {
        match action {
            Action::Output(target) => {
                let copy = pkt.replicate()?;
                out.push(Emission {
                    target: *target,
                    queue: pkt.buffer().meta.queue_id,
                    packet: copy,
                });
            }
            Action::Group(id) => execute_group(pkt, *id, env, out)?,
            Action::SetQueue(q) => pkt.buffer_mut().meta.queue_id = Some(*q),
            Action::PushVlan(tpid) => push_vlan(pkt, *tpid)?,
            Action::PopVlan => pop_vlan(pkt)?,
            Action::SetField(field) => set_field(pkt, field)?,
        }
    }
    Ok(())
}

fn execute_group(
    pkt: &mut Packet,
    id: u32,
    env: &ExecEnv<'_>,
    out: &mut Vec<Emission>,
) -> DpResult<()> {
    let group = env.groups.get(id).ok_or(DpError::NoMoreAction)?;
    match group.kind {
        GroupKind::All => {
            for bucket in &group.buckets {
                let mut copy = pkt.replicate()?;
                execute_action_list(&mut copy, &bucket.actions, env, out)?;
            }
            Ok(())
        }
        GroupKind::Select => {
            let hash = pkt
                .buffer()
                .meta
                .flow_key
                .as_ref()
                .map(FlowKey::dispatch_hash)
                .unwrap_or(0);
            match group.select_bucket(hash) {
                Some(bucket) => execute_action_list(pkt, &bucket.actions.clone(), env, out),
                None => Err(DpError::NoMoreAction),
            }
        }
        GroupKind::Indirect => match group.buckets.first() {
            Some(bucket) => execute_action_list(pkt, &bucket.actions.clone(), env, out),
            None => Err(DpError::NoMoreAction),
        },
    }
}

// ---------------------------------------------------------------------------
// Frame rewriting
// ---------------------------------------------------------------------------

fn push_vlan(pkt: &mut Packet, tpid: u16) -> DpResult<()> {
    // Carry the current vid forward the way 1.3 prescribes for re-push.
    let prev_tci = pkt
        .buffer()
        .meta
        .flow_key
        .as_ref()
        .and_then(|k| k.vlan_vid)
        .unwrap_or(0);
    let buf = pkt.buffer_mut();
    if !buf.push_head(4) {
        return Err(DpError::NoMemory);
    }
    let frame = buf.frame_mut();
    if frame.len() < 18 {
        return Err(DpError::TooShort("frame under VLAN push".into()));
    }
    // Frame grew at the front; slide the MACs back to the new start.
    frame.copy_within(4..16, 0);
    frame[12..14].copy_from_slice(&tpid.to_be_bytes());
    frame[14..16].copy_from_slice(&prev_tci.to_be_bytes());
    refresh_key(pkt);
    Ok(())
}

fn pop_vlan(pkt: &mut Packet) -> DpResult<()> {
    let buf = pkt.buffer_mut();
    let frame = buf.frame_mut();
    if frame.len() < 18 || u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_VLAN {
        // No tag to pop; the action is a no-op on untagged frames.
        return Ok(());
    }
    frame.copy_within(0..12, 4);
    buf.pull_head(4);
    refresh_key(pkt);
    Ok(())
}

fn set_field(pkt: &mut Packet, field: &SetField) -> DpResult<()> {
    // Offsets must be valid; classification happened before execution.
    let l3 = pkt.buffer().meta.l3_offset.map(usize::from);
    let l4 = pkt.buffer().meta.l4_offset.map(usize::from);
    let buf = pkt.buffer_mut();
    let frame = buf.frame_mut();
    match field {
        SetField::EthDst(mac) => {
            if frame.len() < 6 {
                return Err(DpError::TooShort("eth_dst".into()));
            }
            frame[0..6].copy_from_slice(mac);
        }
        SetField::EthSrc(mac) => {
            if frame.len() < 12 {
                return Err(DpError::TooShort("eth_src".into()));
            }
            frame[6..12].copy_from_slice(mac);
        }
        SetField::VlanVid(vid) => {
            if frame.len() < 16 || u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_VLAN {
                return Err(DpError::NotFound);
            }
            let tci = (u16::from_be_bytes([frame[14], frame[15]]) & !0x0fff) | (vid & 0x0fff);
            frame[14..16].copy_from_slice(&tci.to_be_bytes());
        }
        SetField::VlanPcp(pcp) => {
            if frame.len() < 16 || u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_VLAN {
                return Err(DpError::NotFound);
            }
            let tci =
                (u16::from_be_bytes([frame[14], frame[15]]) & 0x1fff) | ((*pcp as u16) << 13);
            frame[14..16].copy_from_slice(&tci.to_be_bytes());
        }
        SetField::IpSrc(addr) => rewrite_ip(frame, l3, addr, true)?,
        SetField::IpDst(addr) => rewrite_ip(frame, l3, addr, false)?,
        SetField::TpSrc(port) => rewrite_tp(frame, l4, *port, true)?,
        SetField::TpDst(port) => rewrite_tp(frame, l4, *port, false)?,
    }
    refresh_key(pkt);
    Ok(())
}

fn rewrite_ip(frame: &mut [u8], l3: Option<usize>, addr: &IpAddr, src: bool) -> DpResult<()> {
    let l3 = l3.ok_or(DpError::NotFound)?;
    match addr {
        IpAddr::V4(v4) => {
            if frame.len() < l3 + 20 {
                return Err(DpError::TooShort("ipv4 header".into()));
            }
            let off = l3 + if src { 12 } else { 16 };
            frame[off..off + 4].copy_from_slice(&v4.octets());
            ipv4_fix_checksum(&mut frame[l3..]);
        }
        IpAddr::V6(v6) => {
            if frame.len() < l3 + 40 {
                return Err(DpError::TooShort("ipv6 header".into()));
            }
            let off = l3 + if src { 8 } else { 24 };
            frame[off..off + 16].copy_from_slice(&v6.octets());
        }
    }
    Ok(())
}

fn rewrite_tp(frame: &mut [u8], l4: Option<usize>, port: u16, src: bool) -> DpResult<()> {
    let l4 = l4.ok_or(DpError::NotFound)?;
    let off = l4 + if src { 0 } else { 2 };
    if frame.len() < off + 2 {
        return Err(DpError::TooShort("l4 ports".into()));
    }
    frame[off..off + 2].copy_from_slice(&port.to_be_bytes());
    Ok(())
}

/// Recompute the IPv4 header checksum in place.
fn ipv4_fix_checksum(l3: &mut [u8]) {
    let ihl = ((l3[0] & 0x0f) as usize) * 4;
    if l3.len() < ihl || ihl < 20 {
        return;
    }
    l3[10] = 0;
    l3[11] = 0;
    let mut sum: u32 = 0;
    for chunk in l3[..ihl].chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let csum = !(sum as u16);
    l3[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Header rewrites invalidate the cached key and offsets; re-classify from
/// the frame so later set-fields in the same list see fresh offsets.
fn refresh_key(pkt: &mut Packet) {
    let buf = pkt.buffer_mut();
    buf.meta.flow_key = None;
    buf.meta.l3_offset = None;
    buf.meta.l4_offset = None;
    let _ = FlowKey::classify(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ETHERTYPE_IPV4, IPPROTO_TCP};

    fn tcp_packet() -> Packet {
        let mut f = Vec::new();
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        f.extend_from_slice(&[0x45, 0, 0, 40, 0, 0, 0, 0, 64, IPPROTO_TCP, 0, 0]);
        f.extend_from_slice(&[10, 0, 0, 1]);
        f.extend_from_slice(&[10, 0, 0, 2]);
        f.extend_from_slice(&1234u16.to_be_bytes());
        f.extend_from_slice(&80u16.to_be_bytes());
        f.extend_from_slice(&[0; 16]);
        let mut pkt = Packet::heap(&f);
        pkt.buffer_mut().meta.in_port = Some(1);
        FlowKey::classify(pkt.buffer_mut()).unwrap();
        pkt
    }

    fn env_with<'a>(groups: &'a GroupTable, meters: &'a MeterTable) -> ExecEnv<'a> {
        ExecEnv { groups, meters }
    }

    #[test]
    fn slots_enforce_fixed_order() {
        // Listed backwards; execution must still goto after apply.
        let set = InstructionSet::new([
            Instruction::GotoTable(2),
            Instruction::ApplyActions(vec![Action::SetQueue(7)]),
        ])
        .unwrap();
        let groups = GroupTable::default();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let mut pkt = tcp_packet();
        let ctl =
            execute_instruction_set(&mut pkt, &set, &env_with(&groups, &meters), &mut out).unwrap();
        assert_eq!(ctl, PipelineControl::Goto(2));
        assert_eq!(pkt.buffer().meta.queue_id, Some(7));
    }

    #[test]
    fn duplicate_slot_is_bad_instruction() {
        let err = InstructionSet::new([
            Instruction::GotoTable(1),
            Instruction::GotoTable(2),
        ])
        .unwrap_err();
        assert_eq!(err, DpError::OfpError(FlowModError::BadInstruction));
    }

    #[test]
    fn apply_output_emits_copy_and_continues() {
        let set = InstructionSet::new([Instruction::ApplyActions(vec![
            Action::Output(OutputTarget::Port(5)),
            Action::SetField(SetField::TpDst(443)),
        ])])
        .unwrap();
        let groups = GroupTable::default();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let mut pkt = tcp_packet();
        execute_instruction_set(&mut pkt, &set, &env_with(&groups, &meters), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        // The emitted copy kept the pre-rewrite destination port.
        let emitted_key = out[0].packet.buffer().meta.flow_key.clone().unwrap();
        assert_eq!(emitted_key.tp_dst, Some(80));
        let live_key = pkt.buffer().meta.flow_key.clone().unwrap();
        assert_eq!(live_key.tp_dst, Some(443));
    }

    #[test]
    fn write_then_clear_empties_action_set() {
        let groups = GroupTable::default();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let mut pkt = tcp_packet();
        let write = InstructionSet::new([Instruction::WriteActions(vec![Action::Output(
            OutputTarget::Port(2),
        )])])
        .unwrap();
        execute_instruction_set(&mut pkt, &write, &env_with(&groups, &meters), &mut out).unwrap();
        assert!(!pkt.buffer().meta.action_set.is_empty());
        let clear = InstructionSet::new([Instruction::ClearActions]).unwrap();
        execute_instruction_set(&mut pkt, &clear, &env_with(&groups, &meters), &mut out).unwrap();
        assert!(pkt.buffer().meta.action_set.is_empty());
    }

    #[test]
    fn write_metadata_respects_mask() {
        let groups = GroupTable::default();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let mut pkt = tcp_packet();
        pkt.buffer_mut().meta.of_metadata = 0xffff_0000_0000_0000;
        let set = InstructionSet::new([Instruction::WriteMetadata {
            value: 0x0000_0000_0000_00aa,
            mask: 0x0000_0000_0000_00ff,
        }])
        .unwrap();
        execute_instruction_set(&mut pkt, &set, &env_with(&groups, &meters), &mut out).unwrap();
        assert_eq!(pkt.buffer().meta.of_metadata, 0xffff_0000_0000_00aa);
    }

    #[test]
    fn action_set_group_shadows_output() {
        let mut set = ActionSet::default();
        set.write(&Action::Output(OutputTarget::Port(1)));
        set.write(&Action::Group(9));
        let list = set.to_list();
        assert!(list.contains(&Action::Group(9)));
        assert!(!list.iter().any(|a| matches!(a, Action::Output(_))));
    }

    #[test]
    fn vlan_push_set_pop_round_trip() {
        let groups = GroupTable::default();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let mut pkt = tcp_packet();
        let orig_len = pkt.buffer().frame_len();
        execute_action_list(
            &mut pkt,
            &[
                Action::PushVlan(ETHERTYPE_VLAN),
                Action::SetField(SetField::VlanVid(300)),
            ],
            &env_with(&groups, &meters),
            &mut out,
        )
        .unwrap();
        let key = pkt.buffer().meta.flow_key.clone().unwrap();
        assert_eq!(key.vlan_vid, Some(300));
        assert_eq!(pkt.buffer().frame_len(), orig_len + 4);
        // Inner headers still parse after the push.
        assert_eq!(key.tp_dst, Some(80));

        execute_action_list(&mut pkt, &[Action::PopVlan], &env_with(&groups, &meters), &mut out)
            .unwrap();
        let key = pkt.buffer().meta.flow_key.clone().unwrap();
        assert_eq!(key.vlan_vid, None);
        assert_eq!(pkt.buffer().frame_len(), orig_len);
    }

    #[test]
    fn ip_rewrite_fixes_checksum() {
        let groups = GroupTable::default();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let mut pkt = tcp_packet();
        execute_action_list(
            &mut pkt,
            &[Action::SetField(SetField::IpDst(IpAddr::from([192, 168, 0, 9])))],
            &env_with(&groups, &meters),
            &mut out,
        )
        .unwrap();
        let frame = pkt.buffer().frame().to_vec();
        // Checksum over the rewritten header must fold to zero.
        let mut sum: u32 = 0;
        for chunk in frame[14..34].chunks(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xffff);
    }

    #[test]
    fn group_all_replicates_per_bucket() {
        let mut groups = GroupTable::default();
        groups
            .add(Group {
                id: 1,
                kind: GroupKind::All,
                buckets: vec![
                    GroupBucket { weight: 0, actions: vec![Action::Output(OutputTarget::Port(2))] },
                    GroupBucket { weight: 0, actions: vec![Action::Output(OutputTarget::Port(3))] },
                ],
            })
            .unwrap();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let mut pkt = tcp_packet();
        execute_group(&mut pkt, 1, &env_with(&groups, &meters), &mut out).unwrap();
        let mut ports: Vec<_> = out
            .iter()
            .map(|e| match e.target {
                OutputTarget::Port(p) => p,
                _ => unreachable!(),
            })
            .collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![2, 3]);
    }

    #[test]
    fn group_select_is_deterministic_per_flow() {
        let mut groups = GroupTable::default();
        groups
            .add(Group {
                id: 1,
                kind: GroupKind::Select,
                buckets: vec![
                    GroupBucket { weight: 1, actions: vec![Action::Output(OutputTarget::Port(2))] },
                    GroupBucket { weight: 3, actions: vec![Action::Output(OutputTarget::Port(3))] },
                ],
            })
            .unwrap();
        let meters = MeterTable::default();
        let first = {
            let mut out = Vec::new();
            let mut pkt = tcp_packet();
            execute_group(&mut pkt, 1, &env_with(&groups, &meters), &mut out).unwrap();
            assert_eq!(out.len(), 1);
            out[0].target
        };
        for _ in 0..10 {
            let mut out = Vec::new();
            let mut pkt = tcp_packet();
            execute_group(&mut pkt, 1, &env_with(&groups, &meters), &mut out).unwrap();
            assert_eq!(out[0].target, first);
        }
    }

    #[test]
    fn meter_band_drops_excess() {
        let groups = GroupTable::default();
        let mut meters = MeterTable::default();
        meters.add(1, 2).unwrap();
        let set = InstructionSet::new([
            Instruction::Meter(1),
            Instruction::ApplyActions(vec![Action::Output(OutputTarget::Port(2))]),
        ])
        .unwrap();
        let mut passed = 0;
        for _ in 0..5 {
            let mut out = Vec::new();
            let mut pkt = tcp_packet();
            match execute_instruction_set(&mut pkt, &set, &env_with(&groups, &meters), &mut out) {
                Ok(_) => passed += 1,
                Err(DpError::NoMoreAction) => {}
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert_eq!(passed, 2);
    }

    #[test]
    fn empty_action_set_drops() {
        let groups = GroupTable::default();
        let meters = MeterTable::default();
        let mut out = Vec::new();
        let pkt = tcp_packet();
        let err = apply_action_set(pkt, &env_with(&groups, &meters), &mut out).unwrap_err();
        assert_eq!(err, DpError::NoMoreAction);
    }
}
