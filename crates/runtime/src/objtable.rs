//! The object table: id-to-instance indirection and the mark/sweep
//! collector.
//!
//! Slots live in pages of 4096; an object id encodes
//! `(page << 12) | slot`, so resolving an id is two indexings. Slots
//! never move, and a freed id is not reused until its slot is fully
//! reclaimed and threaded back onto the free list.
//!
//! Collection combines a three-state reachability lattice
//! (`Unreachable < FinalizerReachable < Reachable`) with a three-state
//! finalization lattice (`Unfinalizable < Finalizable < Finalized`).
//! A pass only ever raises reachability. A slot is deletable exactly
//! when it is Unreachable and Finalized; finalizers run outside the
//! collector via [`crate::Vm::run_finalizers`].

use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;
use tale_core::ObjId;
use tracing::debug;

use crate::error::{VmError, VmResult};
use crate::meta::VmObject;

/// log2 of the page size; ids split as `(page << PAGE_BITS) | slot`.
pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlags: u8 {
        /// The slot is on the free list; nothing else is meaningful.
        const FREE = 1 << 0;
        /// Referenced from a static location; never collected.
        const IN_ROOT_SET = 1 << 1;
        /// A savepoint has been created since the object was created.
        const IN_UNDO = 1 << 2;
        /// Not saved, not restored, not undone, unaffected by restart.
        const TRANSIENT = 1 << 3;
        /// The metaclass can ever hold references to other objects.
        const CAN_HAVE_REFS = 1 << 4;
        /// The metaclass can ever hold weak references.
        const CAN_HAVE_WEAK_REFS = 1 << 5;
        /// The object asked for post-load initialization.
        const POST_LOAD_INIT = 1 << 6;
    }
}

/// Reachability, ordered: a pass raises this and never lowers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reach {
    Unreachable = 0,
    FinalizerReachable = 1,
    Reachable = 2,
}

/// Finalization progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Finalize {
    Unfinalizable = 0,
    Finalizable = 1,
    Finalized = 2,
}

/// One object-table slot.
pub struct Slot {
    /// The instance, inline in the slot. `None` while free or while the
    /// VM has temporarily lifted the instance out for a `&mut Vm` call.
    obj: Option<Box<dyn VmObject>>,
    flags: SlotFlags,
    reach: Reach,
    finalize: Finalize,
    /// Work-queue link during GC, forward link on the free list.
    next_obj: ObjId,
    /// Back link on the free list, for O(1) unlinking.
    prev_free: ObjId,
}

impl Slot {
    fn new_free() -> Self {
        Slot {
            obj: None,
            flags: SlotFlags::FREE,
            reach: Reach::Unreachable,
            finalize: Finalize::Unfinalizable,
            next_obj: ObjId::INVALID,
            prev_free: ObjId::INVALID,
        }
    }

    fn is_free(&self) -> bool {
        self.flags.contains(SlotFlags::FREE)
    }

    /// Deletable: unreachable and finalized (or already free).
    fn is_deletable(&self) -> bool {
        self.is_free()
            || (self.reach == Reach::Unreachable && self.finalize == Finalize::Finalized)
    }

    fn is_in_undo(&self) -> bool {
        self.flags.contains(SlotFlags::IN_UNDO) && !self.flags.contains(SlotFlags::TRANSIENT)
    }
}

/// Snapshot of which ids are about to be deleted, taken between the mark
/// phase and the weak-reference sweeps so sweep callbacks can test
/// deletability without touching the table.
pub struct DeadSet {
    bits: Vec<bool>,
}

impl DeadSet {
    /// An invalid or out-of-range id reads as deletable: it is already
    /// gone.
    pub fn is_deletable(&self, id: ObjId) -> bool {
        !id.is_valid() || self.bits.get(id.0 as usize).copied().unwrap_or(true)
    }
}

/// The table itself.
pub struct ObjTable {
    pages: Vec<Box<[Slot]>>,
    first_free: ObjId,
    gc_queue_head: ObjId,
    finalize_queue: Vec<ObjId>,
    gc_in_progress: bool,
    gc_enabled: bool,
    allocs_since_gc: usize,
    bytes_since_gc: usize,
    live_count: usize,
    /// Image payload snapshots for root objects, kept for restart.
    image_snapshots: HashMap<ObjId, Box<[u8]>>,
    /// Objects that requested post-load initialization, in id order.
    post_load_requests: BTreeSet<ObjId>,
}

impl ObjTable {
    pub fn new() -> Self {
        ObjTable {
            pages: Vec::new(),
            first_free: ObjId::INVALID,
            gc_queue_head: ObjId::INVALID,
            finalize_queue: Vec::new(),
            gc_in_progress: false,
            gc_enabled: true,
            allocs_since_gc: 0,
            bytes_since_gc: 0,
            live_count: 0,
            image_snapshots: HashMap::new(),
            post_load_requests: BTreeSet::new(),
        }
    }

    // --- id resolution ----------------------------------------------------

    fn entry(&self, id: ObjId) -> &Slot {
        let page = (id.0 >> PAGE_BITS) as usize;
        let slot = (id.0 as usize) & (PAGE_SIZE - 1);
        &self.pages[page][slot]
    }

    fn entry_mut(&mut self, id: ObjId) -> &mut Slot {
        let page = (id.0 >> PAGE_BITS) as usize;
        let slot = (id.0 as usize) & (PAGE_SIZE - 1);
        &mut self.pages[page][slot]
    }

    /// Highest object id ever allocated, exclusive.
    pub fn max_used_obj_id(&self) -> u32 {
        (self.pages.len() * PAGE_SIZE) as u32
    }

    pub fn is_obj_id_valid(&self, id: ObjId) -> bool {
        id.is_valid() && id.0 < self.max_used_obj_id() && !self.entry(id).is_free()
    }

    /// Packed free/reachability/finalization word, a testing aid for the
    /// VM itself: free ? 0 : 1, reachability << 4, finalization << 8.
    /// Out-of-range ids read as 0xF000.
    pub fn internal_state(&self, id: ObjId) -> u32 {
        if id.0 >= self.max_used_obj_id() {
            return 0xF000;
        }
        let e = self.entry(id);
        (if e.is_free() { 0 } else { 1 }) | ((e.reach as u32) << 4) | ((e.finalize as u32) << 8)
    }

    // --- instance access --------------------------------------------------

    /// The instance for an id. Panics on a freed or out-of-range id;
    /// callers are expected to check `is_obj_id_valid` first.
    pub fn get(&self, id: ObjId) -> &dyn VmObject {
        self.entry(id)
            .obj
            .as_deref()
            .expect("access to freed or empty object slot")
    }

    pub fn get_mut(&mut self, id: ObjId) -> &mut dyn VmObject {
        self.entry_mut(id)
            .obj
            .as_deref_mut()
            .expect("access to freed or empty object slot")
    }

    pub fn try_get(&self, id: ObjId) -> Option<&dyn VmObject> {
        if id.is_valid() && id.0 < self.max_used_obj_id() {
            self.entry(id).obj.as_deref()
        } else {
            None
        }
    }

    pub fn try_get_mut(&mut self, id: ObjId) -> Option<&mut dyn VmObject> {
        if id.is_valid() && id.0 < self.max_used_obj_id() {
            self.entry_mut(id).obj.as_deref_mut()
        } else {
            None
        }
    }

    /// Typed view of an instance.
    pub fn get_as<T: VmObject>(&self, id: ObjId) -> Option<&T> {
        self.try_get(id)?.as_any().downcast_ref::<T>()
    }

    /// Lift the instance out of its slot; pair with `put_obj`.
    pub(crate) fn take_obj(&mut self, id: ObjId) -> Option<Box<dyn VmObject>> {
        if id.is_valid() && id.0 < self.max_used_obj_id() {
            self.entry_mut(id).obj.take()
        } else {
            None
        }
    }

    pub(crate) fn put_obj(&mut self, id: ObjId, obj: Box<dyn VmObject>) {
        let slot = self.entry_mut(id);
        debug_assert!(slot.obj.is_none() && !slot.is_free());
        slot.obj = Some(obj);
    }

    /// Install a freshly created instance into an allocated slot.
    pub fn install(&mut self, id: ObjId, obj: Box<dyn VmObject>) {
        let slot = self.entry_mut(id);
        debug_assert!(!slot.is_free());
        slot.obj = Some(obj);
    }

    // --- free list --------------------------------------------------------

    fn push_free(&mut self, id: ObjId) {
        let head = self.first_free;
        {
            let e = self.entry_mut(id);
            e.next_obj = head;
            e.prev_free = ObjId::INVALID;
        }
        if head.is_valid() {
            self.entry_mut(head).prev_free = id;
        }
        self.first_free = id;
    }

    fn pop_free(&mut self) -> Option<ObjId> {
        let id = self.first_free;
        if !id.is_valid() {
            return None;
        }
        let next = self.entry(id).next_obj;
        self.first_free = next;
        if next.is_valid() {
            self.entry_mut(next).prev_free = ObjId::INVALID;
        }
        Some(id)
    }

    fn unlink_free(&mut self, id: ObjId) {
        let (prev, next) = {
            let e = self.entry(id);
            (e.prev_free, e.next_obj)
        };
        if prev.is_valid() {
            self.entry_mut(prev).next_obj = next;
        } else {
            self.first_free = next;
        }
        if next.is_valid() {
            self.entry_mut(next).prev_free = prev;
        }
    }

    /// Grow the table by one page, threading the new slots onto the free
    /// list lowest-id-first. Slot 0 of page 0 stays off the list so that
    /// id 0 is never handed out.
    fn alloc_new_page(&mut self) {
        let base = self.max_used_obj_id();
        let page: Vec<Slot> = (0..PAGE_SIZE).map(|_| Slot::new_free()).collect();
        self.pages.push(page.into_boxed_slice());
        let first = if base == 0 { 1 } else { 0 };
        for i in (first..PAGE_SIZE).rev() {
            self.push_free(ObjId(base + i as u32));
        }
    }

    // --- allocation -------------------------------------------------------

    fn init_entry(&mut self, id: ObjId, in_root_set: bool, can_refs: bool, can_weak: bool) {
        let e = self.entry_mut(id);
        let mut flags = SlotFlags::empty();
        if in_root_set {
            flags |= SlotFlags::IN_ROOT_SET;
        }
        if can_refs {
            flags |= SlotFlags::CAN_HAVE_REFS;
        }
        if can_weak {
            flags |= SlotFlags::CAN_HAVE_WEAK_REFS;
        }
        e.flags = flags;
        e.reach = if in_root_set { Reach::Reachable } else { Reach::Unreachable };
        e.finalize = Finalize::Unfinalizable;
        e.obj = None;
        self.live_count += 1;
        self.allocs_since_gc += 1;
    }

    /// Claim a slot. The caller installs the instance afterwards.
    pub fn alloc(&mut self, in_root_set: bool, can_refs: bool, can_weak: bool) -> ObjId {
        debug_assert!(!self.gc_in_progress, "allocation during a GC pass");
        let id = match self.pop_free() {
            Some(id) => id,
            None => {
                self.alloc_new_page();
                self.pop_free().expect("fresh page has free slots")
            }
        };
        self.init_entry(id, in_root_set, can_refs, can_weak);
        id
    }

    /// Claim a specific slot, for image and save loading. Fails if the
    /// slot is not free.
    pub fn alloc_with_id(
        &mut self,
        id: ObjId,
        in_root_set: bool,
        can_refs: bool,
        can_weak: bool,
    ) -> VmResult<()> {
        debug_assert!(!self.gc_in_progress, "allocation during a GC pass");
        if !id.is_valid() {
            return Err(VmError::BadObjectRef(id));
        }
        while id.0 >= self.max_used_obj_id() {
            self.alloc_new_page();
        }
        if !self.entry(id).is_free() {
            return Err(VmError::SlotInUse(id));
        }
        self.unlink_free(id);
        self.init_entry(id, in_root_set, can_refs, can_weak);
        Ok(())
    }

    /// Return a slot to the free list, dropping its instance.
    pub(crate) fn free_slot(&mut self, id: ObjId) {
        let e = self.entry_mut(id);
        debug_assert!(!e.is_free());
        e.obj = None;
        e.flags = SlotFlags::FREE;
        e.reach = Reach::Unreachable;
        e.finalize = Finalize::Unfinalizable;
        self.live_count -= 1;
        self.image_snapshots.remove(&id);
        self.post_load_requests.remove(&id);
        self.finalize_queue.retain(|&f| f != id);
        self.push_free(id);
    }

    // --- flags and hints --------------------------------------------------

    pub fn set_gc_hints(&mut self, id: ObjId, can_refs: bool, can_weak: bool) {
        let e = self.entry_mut(id);
        e.flags.set(SlotFlags::CAN_HAVE_REFS, can_refs);
        e.flags.set(SlotFlags::CAN_HAVE_WEAK_REFS, can_weak);
    }

    pub fn set_transient(&mut self, id: ObjId) {
        self.entry_mut(id).flags.insert(SlotFlags::TRANSIENT);
    }

    pub fn is_transient(&self, id: ObjId) -> bool {
        self.is_obj_id_valid(id) && self.entry(id).flags.contains(SlotFlags::TRANSIENT)
    }

    pub fn is_in_root_set(&self, id: ObjId) -> bool {
        self.is_obj_id_valid(id) && self.entry(id).flags.contains(SlotFlags::IN_ROOT_SET)
    }

    pub fn can_have_refs(&self, id: ObjId) -> bool {
        self.is_obj_id_valid(id) && self.entry(id).flags.contains(SlotFlags::CAN_HAVE_REFS)
    }

    pub fn can_have_weak_refs(&self, id: ObjId) -> bool {
        self.is_obj_id_valid(id) && self.entry(id).flags.contains(SlotFlags::CAN_HAVE_WEAK_REFS)
    }

    /// Whether an undo savepoint has been created since the object was
    /// created (and the object is not transient).
    pub fn is_obj_in_undo(&self, id: ObjId) -> bool {
        self.is_obj_id_valid(id) && self.entry(id).is_in_undo()
    }

    pub fn is_obj_deletable(&self, id: ObjId) -> bool {
        !id.is_valid() || id.0 >= self.max_used_obj_id() || self.entry(id).is_deletable()
    }

    /// Saveable: not free, not transient, and either dynamic or changed
    /// since loading.
    pub fn is_obj_saveable(&self, id: ObjId) -> bool {
        if !self.is_obj_id_valid(id) {
            return false;
        }
        let e = self.entry(id);
        if e.flags.contains(SlotFlags::TRANSIENT) {
            return false;
        }
        if !e.flags.contains(SlotFlags::IN_ROOT_SET) {
            return true;
        }
        e.obj.as_ref().is_some_and(|o| o.is_changed_since_load())
    }

    // --- enumeration ------------------------------------------------------

    /// All allocated ids, ascending.
    pub fn used_ids(&self) -> Vec<ObjId> {
        let mut out = Vec::with_capacity(self.live_count);
        for (pi, page) in self.pages.iter().enumerate() {
            for (si, slot) in page.iter().enumerate() {
                if !slot.is_free() {
                    out.push(ObjId(((pi << PAGE_BITS) | si) as u32));
                }
            }
        }
        out
    }

    /// Visit every allocated object id.
    pub fn for_each(&self, mut f: impl FnMut(ObjId, &dyn VmObject)) {
        for id in self.used_ids() {
            if let Some(obj) = self.entry(id).obj.as_deref() {
                f(id, obj);
            }
        }
    }

    pub fn live_object_count(&self) -> usize {
        self.live_count
    }

    pub fn free_slot_count(&self) -> usize {
        self.pages.len() * PAGE_SIZE - self.live_count - usize::from(!self.pages.is_empty())
    }

    // --- savepoint notification ------------------------------------------

    /// A new savepoint is opening: mark every live non-transient slot as
    /// participating in undo, so objects created later skip undo
    /// generation, and give each instance its hook.
    pub fn notify_new_savepoint(&mut self) {
        for id in self.used_ids() {
            let e = self.entry_mut(id);
            if !e.flags.contains(SlotFlags::TRANSIENT) {
                e.flags.insert(SlotFlags::IN_UNDO);
            }
            if let Some(obj) = e.obj.as_deref_mut() {
                obj.notify_new_savepoint();
            }
        }
    }

    // --- allocation pressure ---------------------------------------------

    /// Count heap bytes attached to objects, for the byte-pressure GC
    /// trigger.
    pub fn count_alloc(&mut self, bytes: usize) {
        self.bytes_since_gc = self.bytes_since_gc.saturating_add(bytes);
    }

    pub(crate) fn alloc_pressure(&self) -> (usize, usize) {
        (self.allocs_since_gc, self.bytes_since_gc)
    }

    /// Turn automatic collection on or off; returns the previous state.
    pub fn enable_gc(&mut self, enable: bool) -> bool {
        std::mem::replace(&mut self.gc_enabled, enable)
    }

    pub fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    pub fn gc_in_progress(&self) -> bool {
        self.gc_in_progress
    }

    // --- image snapshots and post-load requests ---------------------------

    /// Remember a root object's image payload for restart reloads.
    pub fn save_image_snapshot(&mut self, id: ObjId, data: &[u8]) {
        self.image_snapshots.insert(id, data.into());
    }

    pub fn image_snapshot(&self, id: ObjId) -> Option<&[u8]> {
        self.image_snapshots.get(&id).map(|b| &b[..])
    }

    pub fn request_post_load_init(&mut self, id: ObjId) {
        self.entry_mut(id).flags.insert(SlotFlags::POST_LOAD_INIT);
        self.post_load_requests.insert(id);
    }

    pub fn remove_post_load_init(&mut self, id: ObjId) {
        self.entry_mut(id).flags.remove(SlotFlags::POST_LOAD_INIT);
        self.post_load_requests.remove(&id);
    }

    pub fn post_load_requests(&self) -> Vec<ObjId> {
        self.post_load_requests.iter().copied().collect()
    }

    // --- garbage collection ----------------------------------------------

    /// Mark an object reachable at the given state and queue it for
    /// tracing. Never lowers a state.
    pub fn mark_all_refs(&mut self, id: ObjId, state: Reach) {
        self.add_to_gc_queue(id, state);
    }

    pub(crate) fn reach_of(&self, id: ObjId) -> Reach {
        if self.is_obj_id_valid(id) {
            self.entry(id).reach
        } else {
            Reach::Unreachable
        }
    }

    pub(crate) fn add_to_gc_queue(&mut self, id: ObjId, state: Reach) {
        if !id.is_valid() || id.0 >= self.max_used_obj_id() {
            return;
        }
        let head = self.gc_queue_head;
        let e = self.entry_mut(id);
        if e.is_free() {
            return;
        }
        if e.flags.contains(SlotFlags::CAN_HAVE_REFS) && e.reach == Reach::Unreachable {
            // unreachable is the bottom state, so `state` is at least as
            // reachable; queue it for tracing
            e.next_obj = head;
            e.reach = state;
            self.gc_queue_head = id;
        } else if state > e.reach {
            e.reach = state;
        }
    }

    /// Step 1 of a pass: reset reachability, queue the root set and the
    /// caller-supplied machine roots. Once this runs, no allocation or
    /// mutation is allowed until the pass finishes.
    pub(crate) fn gc_pass_init(&mut self, extra_roots: impl IntoIterator<Item = ObjId>) {
        assert!(!self.gc_in_progress, "GC pass already open");
        self.gc_in_progress = true;
        self.allocs_since_gc = 0;
        self.bytes_since_gc = 0;
        self.gc_queue_head = ObjId::INVALID;

        let ids = self.used_ids();
        for &id in &ids {
            self.entry_mut(id).reach = Reach::Unreachable;
        }
        for &id in &ids {
            if self.entry(id).flags.contains(SlotFlags::IN_ROOT_SET) {
                self.add_to_gc_queue(id, Reach::Reachable);
            }
        }
        for id in extra_roots {
            self.add_to_gc_queue(id, Reach::Reachable);
        }
    }

    /// Drain up to `limit` work-queue entries; true if work remains.
    pub(crate) fn gc_trace_queue(&mut self, limit: usize) -> bool {
        debug_assert!(self.gc_in_progress);
        let mut scratch: Vec<ObjId> = Vec::new();
        let mut done = 0usize;
        while done < limit && self.gc_queue_head.is_valid() {
            let id = self.gc_queue_head;
            let (next, state, can_refs) = {
                let e = self.entry(id);
                (e.next_obj, e.reach, e.flags.contains(SlotFlags::CAN_HAVE_REFS))
            };
            self.gc_queue_head = next;
            if can_refs {
                scratch.clear();
                if let Some(obj) = self.entry(id).obj.as_deref() {
                    obj.for_each_ref(&mut |r| scratch.push(r));
                }
                for i in 0..scratch.len() {
                    self.add_to_gc_queue(scratch[i], state);
                }
            }
            done += 1;
        }
        self.gc_queue_head.is_valid()
    }

    /// Finalizer detection: requeue still-pending finalizables, promote
    /// newly unreachable objects with finalizers, trace from them at
    /// FinalizerReachable, then trivially finalize the rest.
    pub(crate) fn gc_scan_finalizable(&mut self) {
        debug_assert!(self.gc_in_progress);
        let pending: Vec<ObjId> = self.finalize_queue.clone();
        for id in pending {
            if self.entry(id).finalize == Finalize::Finalizable {
                self.add_to_gc_queue(id, Reach::FinalizerReachable);
            }
        }
        for id in self.used_ids() {
            let e = self.entry(id);
            if e.reach == Reach::Unreachable && e.finalize == Finalize::Unfinalizable {
                let has_fin = e.obj.as_deref().is_some_and(|o| o.has_finalizer());
                if has_fin {
                    self.entry_mut(id).finalize = Finalize::Finalizable;
                    self.finalize_queue.push(id);
                    self.add_to_gc_queue(id, Reach::FinalizerReachable);
                }
            }
        }
        self.gc_trace_queue(usize::MAX);
        for id in self.used_ids() {
            let e = self.entry_mut(id);
            if e.reach == Reach::Unreachable && e.finalize == Finalize::Unfinalizable {
                e.finalize = Finalize::Finalized;
            }
        }
    }

    /// Deletability snapshot for the weak-reference sweeps.
    pub(crate) fn dead_set(&self) -> DeadSet {
        let max = self.max_used_obj_id() as usize;
        let mut bits = vec![true; max];
        for (pi, page) in self.pages.iter().enumerate() {
            for (si, slot) in page.iter().enumerate() {
                bits[(pi << PAGE_BITS) | si] = slot.is_deletable();
            }
        }
        DeadSet { bits }
    }

    /// Ask every slot with the weak-refs hint to drop references to
    /// objects in the dead set.
    pub(crate) fn sweep_weak_refs(&mut self, dead: &DeadSet) {
        for id in self.used_ids() {
            let e = self.entry_mut(id);
            if e.flags.contains(SlotFlags::CAN_HAVE_WEAK_REFS) {
                if let Some(obj) = e.obj.as_deref_mut() {
                    obj.remove_stale_weak_refs(dead);
                }
            }
        }
    }

    /// Delete every Unreachable+Finalized slot; returns the count.
    pub(crate) fn gc_delete_unreachable(&mut self) -> usize {
        let mut n = 0;
        for id in self.used_ids() {
            let e = self.entry(id);
            if !e.is_free() && e.reach == Reach::Unreachable && e.finalize == Finalize::Finalized {
                self.free_slot(id);
                n += 1;
            }
        }
        if n > 0 {
            debug!(reclaimed = n, "gc sweep");
        }
        n
    }

    pub(crate) fn gc_pass_done(&mut self) {
        debug_assert!(self.gc_in_progress);
        self.gc_in_progress = false;
    }

    /// Objects awaiting their finalizer, oldest first; clears the queue.
    pub(crate) fn take_finalize_queue(&mut self) -> Vec<ObjId> {
        std::mem::take(&mut self.finalize_queue)
    }

    pub(crate) fn mark_finalized(&mut self, id: ObjId) {
        self.entry_mut(id).finalize = Finalize::Finalized;
    }
}

impl Default for ObjTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_ascend_and_zero_is_reserved() {
        let mut t = ObjTable::new();
        let a = t.alloc(false, true, true);
        let b = t.alloc(false, true, true);
        assert_eq!(a, ObjId(1));
        assert_eq!(b, ObjId(2));
        assert!(!t.is_obj_id_valid(ObjId::INVALID));
        assert_eq!(t.max_used_obj_id(), PAGE_SIZE as u32);
    }

    #[test]
    fn alloc_with_id_grows_and_rejects_reuse() {
        let mut t = ObjTable::new();
        let far = ObjId(PAGE_SIZE as u32 + 17);
        t.alloc_with_id(far, true, true, true).unwrap();
        assert!(t.is_obj_id_valid(far));
        assert!(matches!(t.alloc_with_id(far, true, true, true), Err(VmError::SlotInUse(_))));
        assert_eq!(t.max_used_obj_id(), 2 * PAGE_SIZE as u32);
    }

    #[test]
    fn freed_slot_returns_to_free_list() {
        let mut t = ObjTable::new();
        let a = t.alloc(false, true, true);
        let before = t.free_slot_count();
        t.free_slot(a);
        assert_eq!(t.free_slot_count(), before + 1);
        assert!(!t.is_obj_id_valid(a));
    }

    #[test]
    fn savepoint_notification_sets_in_undo() {
        let mut t = ObjTable::new();
        let a = t.alloc(false, true, true);
        let b = t.alloc(false, true, true);
        t.set_transient(b);
        t.notify_new_savepoint();
        assert!(t.is_obj_in_undo(a));
        assert!(!t.is_obj_in_undo(b));
        let c = t.alloc(false, true, true);
        assert!(!t.is_obj_in_undo(c));
    }

    #[test]
    fn internal_state_packs_fields() {
        let mut t = ObjTable::new();
        let a = t.alloc(true, true, true);
        assert_eq!(t.internal_state(a) & 0x1, 1);
        assert_eq!(t.internal_state(ObjId(0x7FFF_FFFF)), 0xF000);
    }
}
