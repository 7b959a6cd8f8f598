//! The flow database of one bridge: table pipeline, group/meter tables,
//! generation counter and the mutation API the protocol agent drives.
//!
//! Writes serialize on the table RwLock; workers read under the shared
//! side and otherwise coordinate only through the generation counter, which
//! every successful mutation bumps (the flow-cache invalidation signal).
//!
//! Lock order is bridge tables → timer wheel; the expiry path therefore
//! drains due slots out of the wheel before touching any bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::actions::{Action, ExecEnv, GroupTable, Instruction, MeterTable};
use crate::error::{DpError, DpResult, FlowModError};
use crate::events::{DpEvent, EventHub};
use crate::flow::{FlowEntry, FlowMod, FlowRemovedReason};
use crate::packet::FlowKey;
use crate::table::{FlowTable, TableMissBehavior};
use crate::timer::{ExpiredSlot, TimerKind, TimerPayload, TimerWheel, now_secs};
use crate::PortId;

/// Seconds a mutated table may serve lookups from the stale index before
/// the scheduled rebuild fires.
pub const INDEX_REBUILD_DELAY_SECS: u64 = 3;

/// Outcome of a table lookup.
pub enum LookupResult {
    Match(Arc<FlowEntry>),
    Miss(TableMissBehavior),
}

pub struct Bridge {
    pub name: String,
    pub dpid: u64,
    tables: RwLock<Vec<FlowTable>>,
    groups: RwLock<GroupTable>,
    meters: RwLock<MeterTable>,
    member_ports: RwLock<Vec<PortId>>,
    generation: AtomicU64,
    wheel: Arc<Mutex<TimerWheel>>,
    events: Arc<EventHub>,
}

impl Bridge {
    pub fn new(
        name: impl Into<String>,
        dpid: u64,
        n_tables: u8,
        wheel: Arc<Mutex<TimerWheel>>,
        events: Arc<EventHub>,
    ) -> Arc<Bridge> {
        let tables = (0..n_tables.max(1)).map(FlowTable::new).collect();
        Arc::new(Bridge {
            name: name.into(),
            dpid,
            tables: RwLock::new(tables),
            groups: RwLock::new(GroupTable::default()),
            meters: RwLock::new(MeterTable::default()),
            member_ports: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            wheel,
            events,
        })
    }

    /// Current cache-invalidation generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn n_tables(&self) -> u8 {
        self.tables.read().len() as u8
    }

    pub fn flow_count(&self) -> usize {
        self.tables.read().iter().map(FlowTable::len).sum()
    }

    // -- port membership -------------------------------------------------

    pub fn add_port(&self, port_id: PortId) -> DpResult<()> {
        let mut ports = self.member_ports.write();
        if ports.contains(&port_id) {
            return Err(DpError::AlreadyExists);
        }
        ports.push(port_id);
        Ok(())
    }

    pub fn remove_port(&self, port_id: PortId) -> DpResult<()> {
        let mut ports = self.member_ports.write();
        let idx = ports.iter().position(|p| *p == port_id).ok_or(DpError::NotFound)?;
        ports.remove(idx);
        Ok(())
    }

    pub fn ports(&self) -> Vec<PortId> {
        self.member_ports.read().clone()
    }

    // -- flow mutation ---------------------------------------------------

    /// Install a flow. An identical (priority, match) entry is replaced,
    /// per OpenFlow 1.3 add semantics.
    pub fn flow_add(self: &Arc<Self>, m: &FlowMod) -> DpResult<()> {
        self.check_table_id(m.table_id)?;
        self.validate_instructions(m.table_id, &m.instructions)?;
        let now = now_secs();
        let entry = Arc::new(FlowEntry::from_mod(m, now)?);

        {
            let mut tables = self.tables.write();
            let table = &mut tables[m.table_id as usize];
            let replaced = table.add(entry.clone())?;
            if let Some(old) = replaced {
                self.cancel_timer(&old);
            }
            self.schedule_index_rebuild(table, m.table_id);
        }
        if entry.has_timeout() {
            self.wheel.lock().schedule_flow(self, &entry, now);
        }
        self.bump_generation();
        debug!(
            "bridge {}: flow added table={} priority={}",
            self.name, m.table_id, m.priority
        );
        Ok(())
    }

    /// Replace the instructions of matching flows. Timers, counters and
    /// create times survive. Matching nothing is a successful no-op.
    pub fn flow_modify(self: &Arc<Self>, m: &FlowMod, strict: bool) -> DpResult<()> {
        self.check_table_id(m.table_id)?;
        self.validate_instructions(m.table_id, &m.instructions)?;
        let selected = {
            let tables = self.tables.read();
            tables[m.table_id as usize].select(m.priority, &m.match_list, strict)
        };
        for entry in &selected {
            let set = crate::actions::InstructionSet::new(m.instructions.iter().cloned())?;
            entry.replace_instructions(set);
        }
        if !selected.is_empty() {
            self.bump_generation();
        }
        Ok(())
    }

    /// Remove matching flows, cancelling their timers and notifying
    /// subscribers for entries that asked for it.
    pub fn flow_remove(self: &Arc<Self>, m: &FlowMod, strict: bool) -> DpResult<()> {
        self.check_table_id(m.table_id)?;
        let removed = {
            let mut tables = self.tables.write();
            let table = &mut tables[m.table_id as usize];
            let removed = table.remove(m.priority, &m.match_list, strict);
            if !removed.is_empty() {
                self.schedule_index_rebuild(table, m.table_id);
            }
            removed
        };
        if removed.is_empty() {
            return Ok(());
        }
        for entry in &removed {
            self.cancel_timer(entry);
            self.notify_removed(entry, FlowRemovedReason::Delete);
        }
        self.bump_generation();
        Ok(())
    }

    /// Remove one expired entry. The timer back-reference was already
    /// cleared by the expiry pass.
    pub fn remove_expired(self: &Arc<Self>, entry: &Arc<FlowEntry>, reason: FlowRemovedReason) {
        let removed = {
            let mut tables = self.tables.write();
            let table = &mut tables[entry.table_id as usize];
            let hit = table.remove_entry(entry);
            if hit {
                self.schedule_index_rebuild(table, entry.table_id);
            }
            hit
        };
        if removed {
            self.notify_removed(entry, reason);
            self.bump_generation();
        }
    }

    fn notify_removed(&self, entry: &Arc<FlowEntry>, reason: FlowRemovedReason) {
        if !entry.send_flow_removed {
            return;
        }
        self.events.publish(DpEvent::FlowRemoved {
            bridge: self.name.clone(),
            table_id: entry.table_id,
            priority: entry.priority,
            cookie: entry.cookie,
            reason,
            duration_sec: now_secs().saturating_sub(entry.create_time),
            packet_count: entry.packet_count(),
            byte_count: entry.byte_count(),
        });
    }

    fn cancel_timer(&self, entry: &Arc<FlowEntry>) {
        if let Some(r) = entry.timer_ref.lock().take() {
            self.wheel.lock().cancel(r);
        }
    }

    /// Schedule at most one pending rebuild per table.
    fn schedule_index_rebuild(self: &Arc<Self>, table: &FlowTable, table_id: u8) {
        if table.mark_rebuild_scheduled() {
            self.wheel
                .lock()
                .schedule_rebuild(self, table_id, INDEX_REBUILD_DELAY_SECS);
        }
    }

    fn check_table_id(&self, table_id: u8) -> DpResult<()> {
        if (table_id as usize) < self.tables.read().len() {
            Ok(())
        } else {
            Err(DpError::OutOfRange(format!("table {table_id}")))
        }
    }

    /// Goto targets must move forward inside the pipeline; group and meter
    /// references must resolve.
    fn validate_instructions(&self, table_id: u8, instructions: &[Instruction]) -> DpResult<()> {
        let n_tables = self.tables.read().len() as u8;
        for insn in instructions {
            match insn {
                Instruction::GotoTable(t) => {
                    if *t <= table_id || *t >= n_tables {
                        return Err(FlowModError::BadInstruction.into());
                    }
                }
                Instruction::Meter(id) => {
                    if self.meters.read().get(*id).is_none() {
                        return Err(FlowModError::BadInstruction.into());
                    }
                }
                Instruction::ApplyActions(actions) | Instruction::WriteActions(actions) => {
                    let groups = self.groups.read();
                    for action in actions {
                        if let Action::Group(id) = action {
                            if groups.get(*id).is_none() {
                                return Err(FlowModError::BadAction.into());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -- group and meter surface ----------------------------------------

    pub fn group_add(&self, group: crate::actions::Group) -> DpResult<()> {
        self.groups.write().add(group)?;
        self.bump_generation();
        Ok(())
    }

    pub fn group_remove(&self, id: u32) -> DpResult<()> {
        self.groups.write().remove(id)?;
        self.bump_generation();
        Ok(())
    }

    pub fn meter_add(&self, id: u32, rate_pps: u64) -> DpResult<()> {
        self.meters.write().add(id, rate_pps)?;
        self.bump_generation();
        Ok(())
    }

    pub fn meter_remove(&self, id: u32) -> DpResult<()> {
        self.meters.write().remove(id)?;
        self.bump_generation();
        Ok(())
    }

    // -- read side -------------------------------------------------------

    /// Match `key` in `table_id`; a miss carries the table's miss behavior.
    pub fn lookup(&self, table_id: u8, key: &FlowKey) -> LookupResult {
        let tables = self.tables.read();
        let Some(table) = tables.get(table_id as usize) else {
            return LookupResult::Miss(TableMissBehavior::Drop);
        };
        match table.lookup(key) {
            Some(entry) => LookupResult::Match(entry),
            None => LookupResult::Miss(table.miss),
        }
    }

    /// Run `f` with group/meter read access for action execution.
    pub fn with_exec_env<R>(&self, f: impl FnOnce(&ExecEnv<'_>) -> R) -> R {
        let groups = self.groups.read();
        let meters = self.meters.read();
        f(&ExecEnv { groups: &groups, meters: &meters })
    }

    pub fn set_table_miss(&self, table_id: u8, miss: TableMissBehavior) -> DpResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_id as usize)
            .ok_or_else(|| DpError::OutOfRange(format!("table {table_id}")))?;
        table.miss = miss;
        Ok(())
    }

    /// Rebuild one table's match index (index-rebuild expiry).
    pub fn rebuild_index(&self, table_id: u8) {
        let mut tables = self.tables.write();
        if let Some(table) = tables.get_mut(table_id as usize) {
            table.rebuild_index();
            debug!("bridge {}: table {} index rebuilt", self.name, table_id);
        }
    }

    /// Exact-match find, for stats and tests.
    pub fn find_flow(
        &self,
        table_id: u8,
        priority: u16,
        list: &[crate::flow::FieldMatch],
    ) -> Option<Arc<FlowEntry>> {
        self.tables
            .read()
            .get(table_id as usize)
            .and_then(|t| t.find_exact(priority, list))
    }

    /// Per-table flow counts, in table order.
    pub fn table_sizes(&self) -> Vec<(u8, usize)> {
        self.tables.read().iter().map(|t| (t.id, t.len())).collect()
    }
}

/// Process slots the timer thread pulled due. Flow entries are re-checked
/// against both deadlines; hard wins when both have passed. Entries whose
/// deadline moved (traffic arrived) are re-scheduled.
pub fn process_expired(slots: Vec<ExpiredSlot>, wheel: &Arc<Mutex<TimerWheel>>) {
    let now = now_secs();
    for slot in slots {
        match slot.kind {
            TimerKind::Flow => {
                for payload in slot.entries {
                    let TimerPayload::Flow { bridge, entry } = payload else {
                        continue;
                    };
                    let Some(bridge) = bridge.upgrade() else {
                        continue;
                    };
                    *entry.timer_ref.lock() = None;
                    match entry.expired_reason(now) {
                        Some(reason) => bridge.remove_expired(&entry, reason),
                        // Matched since scheduling; push the deadline out.
                        None => wheel.lock().schedule_flow(&bridge, &entry, now),
                    }
                }
            }
            TimerKind::IndexRebuild => {
                for payload in slot.entries {
                    let TimerPayload::IndexRebuild { bridge, table_id } = payload else {
                        continue;
                    };
                    if let Some(bridge) = bridge.upgrade() {
                        bridge.rebuild_index(table_id);
                    }
                }
            }
        }
    }
}
