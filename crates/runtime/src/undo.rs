//! The undo log: a bounded circular buffer of per-property deltas.
//!
//! Each ring slot is either a normal record (owning object, an
//! owner-tagged key, and the old value) or a savepoint link record wiring
//! the chain of savepoints together. Savepoint integrity is all or
//! nothing: when the ring fills, whole savepoints are dropped oldest
//! first rather than ever splitting one.
//!
//! The log holds only weak references to record owners; the collector
//! invalidates records whose owner is about to be deleted. Old *values*
//! of live owners, by contrast, are traced strongly so they stay
//! restorable.

use std::any::Any;
use std::fmt;

use tale_core::{ObjId, PropId, Value};
use tracing::debug;

use crate::objtable::ObjTable;

/// Savepoint numbers wrap in their 16-bit space.
pub const SAVEPT_MAX: u16 = u16::MAX;

/// Owner-opaque key payload; the owning metaclass downcasts it back in
/// `apply_undo`.
pub trait UndoExt: Any + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Record key, tag selected by the owner.
#[derive(Debug)]
pub enum UndoKey {
    /// A property id.
    Prop(PropId),
    /// A 32-bit integer key.
    Int(u32),
    /// An opaque owner-defined payload.
    Ext(Box<dyn UndoExt>),
}

/// One undo delta.
#[derive(Debug)]
pub struct UndoRecord {
    /// Owning object; set to `ObjId::INVALID` when the record has been
    /// invalidated by the collector.
    pub obj: ObjId,
    pub key: UndoKey,
    pub old_val: Value,
}

/// One ring slot.
#[derive(Debug)]
pub(crate) enum UndoSlot {
    Unused,
    /// First record of a savepoint: links to the neighboring savepoints'
    /// first records.
    Link {
        prev_first: Option<usize>,
        next_first: Option<usize>,
    },
    Rec(UndoRecord),
}

pub struct UndoLog {
    ring: Vec<UndoSlot>,
    /// First record of the current (newest) savepoint.
    cur_first: Option<usize>,
    /// First record of the oldest savepoint still held.
    oldest_first: Option<usize>,
    /// Next slot to hand out; the ring is circular.
    next_free: usize,
    savept_cnt: usize,
    cur_savept: u16,
    max_savepts: usize,
}

impl UndoLog {
    pub fn new(record_cnt: usize, max_savepts: usize) -> Self {
        assert!(record_cnt >= 2, "undo ring needs room for a link and a record");
        assert!(max_savepts >= 1);
        UndoLog {
            ring: (0..record_cnt).map(|_| UndoSlot::Unused).collect(),
            cur_first: None,
            oldest_first: None,
            next_free: 0,
            savept_cnt: 0,
            cur_savept: 0,
            max_savepts,
        }
    }

    pub fn savepoint_count(&self) -> usize {
        self.savept_cnt
    }

    pub fn current_savepoint(&self) -> u16 {
        self.cur_savept
    }

    fn inc(&self, i: usize) -> usize {
        (i + 1) % self.ring.len()
    }

    fn dec(&self, i: usize) -> usize {
        (i + self.ring.len() - 1) % self.ring.len()
    }

    /// Open a new savepoint. If the ring cannot even hold the link
    /// record, all savepoints are gone and none is created.
    pub fn create_savepoint(&mut self, objs: &mut ObjTable) {
        let Some(idx) = self.alloc_rec(objs) else {
            return;
        };
        if let Some(cf) = self.cur_first {
            if let UndoSlot::Link { next_first, .. } = &mut self.ring[cf] {
                *next_first = Some(idx);
            }
        }
        self.ring[idx] = UndoSlot::Link {
            prev_first: self.cur_first,
            next_first: None,
        };
        self.cur_first = Some(idx);
        if self.oldest_first.is_none() {
            self.oldest_first = Some(idx);
        }

        self.cur_savept = if self.cur_savept == SAVEPT_MAX {
            0
        } else {
            self.cur_savept + 1
        };

        if self.savept_cnt == self.max_savepts {
            self.drop_oldest_savepoint(objs);
        }
        self.savept_cnt += 1;

        objs.notify_new_savepoint();
    }

    /// Record a delta. Does nothing with no open savepoint, or when the
    /// object was created after the newest savepoint (rolling back
    /// discards the object anyway).
    pub fn add_record(&mut self, objs: &mut ObjTable, obj: ObjId, key: UndoKey, old_val: Value) {
        if self.savept_cnt == 0 {
            return;
        }
        if !objs.is_obj_in_undo(obj) {
            return;
        }
        if let Some(idx) = self.alloc_rec(objs) {
            self.ring[idx] = UndoSlot::Rec(UndoRecord { obj, key, old_val });
        }
    }

    /// Allocate one ring slot, dropping savepoints oldest-first when the
    /// ring is full. Returns None when even the last savepoint had to go.
    fn alloc_rec(&mut self, objs: &mut ObjTable) -> Option<usize> {
        loop {
            if self.savept_cnt == 0 || Some(self.next_free) != self.oldest_first {
                let ret = self.next_free;
                self.next_free = self.inc(ret);
                self.ring[ret] = UndoSlot::Unused;
                return Some(ret);
            }
            if self.savept_cnt > 1 {
                self.drop_oldest_savepoint(objs);
            } else {
                // down to the last savepoint and out of room: it can no
                // longer be kept complete, so it goes too
                self.drop_oldest_savepoint(objs);
                return None;
            }
        }
    }

    /// Discard the oldest savepoint, giving each record's owner its
    /// discard hook.
    pub fn drop_oldest_savepoint(&mut self, objs: &mut ObjTable) {
        if self.savept_cnt == 0 {
            return;
        }
        self.savept_cnt -= 1;
        debug!(remaining = self.savept_cnt, "dropping oldest savepoint");

        if let Some(of) = self.oldest_first {
            let next_first = match &self.ring[of] {
                UndoSlot::Link { next_first, .. } => *next_first,
                _ => None,
            };
            let mut i = self.inc(of);
            while Some(i) != next_first && i != self.next_free {
                if let UndoSlot::Rec(rec) = std::mem::replace(&mut self.ring[i], UndoSlot::Unused)
                {
                    if rec.obj.is_valid() && objs.is_obj_id_valid(rec.obj) {
                        if let Some(owner) = objs.try_get_mut(rec.obj) {
                            owner.discard_undo(&rec);
                        }
                    }
                }
                i = self.inc(i);
            }
            self.ring[of] = UndoSlot::Unused;
            self.oldest_first = next_first;
            if let Some(nf) = next_first {
                if let UndoSlot::Link { prev_first, .. } = &mut self.ring[nf] {
                    *prev_first = None;
                }
            }
        }

        if self.oldest_first.is_none() {
            self.cur_first = None;
        }
    }

    /// Close out the newest savepoint, returning its records newest
    /// first for the caller to apply. Returns None (and changes nothing)
    /// with no open savepoint.
    pub(crate) fn pop_savepoint(&mut self) -> Option<Vec<UndoRecord>> {
        if self.savept_cnt == 0 {
            return None;
        }
        let cf = self.cur_first.expect("open savepoint has a link record");

        let mut recs = Vec::new();
        let mut i = self.next_free;
        loop {
            i = self.dec(i);
            if i == cf {
                break;
            }
            if let UndoSlot::Rec(rec) = std::mem::replace(&mut self.ring[i], UndoSlot::Unused) {
                recs.push(rec);
            }
        }

        let prev = match std::mem::replace(&mut self.ring[cf], UndoSlot::Unused) {
            UndoSlot::Link { prev_first, .. } => prev_first,
            _ => unreachable!("cur_first always points at a link record"),
        };
        self.cur_first = prev;
        match prev {
            Some(p) => {
                if let UndoSlot::Link { next_first, .. } = &mut self.ring[p] {
                    *next_first = None;
                }
            }
            None => self.oldest_first = None,
        }
        self.savept_cnt -= 1;
        self.cur_savept = self.cur_savept.wrapping_sub(1);
        if self.cur_savept == 0 {
            self.cur_savept = SAVEPT_MAX;
        }
        self.next_free = cf;
        Some(recs)
    }

    /// Reset to the empty-log state.
    pub fn drop_all(&mut self, objs: &mut ObjTable) {
        while self.savept_cnt != 0 {
            self.drop_oldest_savepoint(objs);
        }
        self.cur_savept = 0;
        self.cur_first = None;
        self.oldest_first = None;
        self.next_free = 0;
        for slot in &mut self.ring {
            *slot = UndoSlot::Unused;
        }
    }

    // --- GC support -------------------------------------------------------

    /// Indices of the live normal records, oldest to newest, skipping
    /// savepoint links.
    pub(crate) fn record_indices(&self) -> Vec<usize> {
        let Some(of) = self.oldest_first else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut next_link = Some(of);
        let mut i = of;
        loop {
            if Some(i) == next_link {
                next_link = match &self.ring[i] {
                    UndoSlot::Link { next_first, .. } => *next_first,
                    _ => None,
                };
            } else if matches!(self.ring[i], UndoSlot::Rec(_)) {
                out.push(i);
            }
            i = self.inc(i);
            if i == self.next_free {
                break;
            }
        }
        out
    }

    pub(crate) fn record(&self, idx: usize) -> Option<&UndoRecord> {
        match &self.ring[idx] {
            UndoSlot::Rec(rec) => Some(rec),
            _ => None,
        }
    }

    pub(crate) fn record_mut(&mut self, idx: usize) -> Option<&mut UndoRecord> {
        match &mut self.ring[idx] {
            UndoSlot::Rec(rec) => Some(rec),
            _ => None,
        }
    }

    /// Invalidate a record whose owner is going away.
    pub(crate) fn invalidate_record(&mut self, idx: usize) {
        if let UndoSlot::Rec(rec) = &mut self.ring[idx] {
            rec.obj = ObjId::INVALID;
        }
    }
}
