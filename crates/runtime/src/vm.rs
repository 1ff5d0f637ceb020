//! The VM context: every process-wide singleton of the core, owned by
//! one struct and passed explicitly.
//!
//! Holding the object table, undo log, metaclass registry and scratch
//! cache in a `Vm` keeps multiple isolated VMs per process possible and
//! gives the cross-subsystem orchestration one home: allocation under
//! GC pressure, property access with undo, savepoint rollback, the
//! collector's undo-log integration, post-load initialization, and the
//! image/save entry points.

use std::collections::{HashMap, HashSet};

use tale_core::{ObjId, PropId, StringComparator, Value};
use tracing::{debug, warn};

use crate::config::VmConfig;
use crate::dict::Dictionary;
use crate::error::{VmError, VmResult};
use crate::gramprod::{AltInfo, GramProdObj, InputToken, ParseResult};
use crate::meta::{MetaRegistry, VmObject};
use crate::objects::{self, ListObject, RecordObject, StrCompObject, StringObject};
use crate::objtable::{DeadSet, ObjTable, Reach};
use crate::regpool::ScratchPool;
use crate::undo::UndoLog;

/// Handle to a machine global variable: a root-set `Value` slot outside
/// the object graph, untouched by undo, restart and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalVarHandle(usize);

#[derive(Default)]
struct GlobalVars {
    slots: Vec<Option<Value>>,
    free: Vec<usize>,
}

impl GlobalVars {
    fn create(&mut self) -> GlobalVarHandle {
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(Value::Nil);
                GlobalVarHandle(i)
            }
            None => {
                self.slots.push(Some(Value::Nil));
                GlobalVarHandle(self.slots.len() - 1)
            }
        }
    }

    fn delete(&mut self, h: GlobalVarHandle) {
        if self.slots.get(h.0).is_some_and(Option::is_some) {
            self.slots[h.0] = None;
            self.free.push(h.0);
        }
    }

    fn roots(&self) -> Vec<ObjId> {
        self.slots
            .iter()
            .flatten()
            .filter_map(Value::as_valid_obj)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PliStatus {
    Pending,
    InProgress,
    Done,
}

pub struct Vm {
    pub objs: ObjTable,
    pub undo: UndoLog,
    pub meta: MetaRegistry,
    pub scratch: ScratchPool,
    cfg: VmConfig,
    globals: GlobalVars,
    /// Present only while a post-load initialization cycle runs.
    pli_status: Option<HashMap<ObjId, PliStatus>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(cfg: VmConfig) -> Self {
        let mut meta = MetaRegistry::new();
        objects::register_builtins(&mut meta);
        Vm {
            objs: ObjTable::new(),
            undo: UndoLog::new(cfg.undo_records, cfg.max_savepoints),
            meta,
            scratch: ScratchPool::new(cfg.scratch_registers, cfg.scratch_register_bytes),
            cfg,
            globals: GlobalVars::default(),
            pli_status: None,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.cfg
    }

    /// Lift an instance out of its slot, run `f` with the instance and
    /// the rest of the VM, and put it back.
    pub(crate) fn with_obj<R>(
        &mut self,
        id: ObjId,
        f: impl FnOnce(&mut Box<dyn VmObject>, &mut Vm) -> R,
    ) -> VmResult<R> {
        let mut obj = self.objs.take_obj(id).ok_or(VmError::BadObjectRef(id))?;
        let r = f(&mut obj, self);
        self.objs.put_obj(id, obj);
        Ok(r)
    }

    // --- allocation -------------------------------------------------------

    /// Claim a slot, collecting first when allocation pressure or the
    /// object cap demand it.
    pub fn alloc_obj(&mut self, in_root_set: bool, can_refs: bool, can_weak: bool) -> VmResult<ObjId> {
        assert!(!self.objs.gc_in_progress(), "allocation during a GC pass");
        self.check_gc_before_alloc();
        if self.objs.live_object_count() >= self.cfg.max_objects {
            self.gc_full();
            self.run_finalizers();
            self.gc_full();
            if self.objs.live_object_count() >= self.cfg.max_objects {
                return Err(VmError::OutOfMemory);
            }
        }
        Ok(self.objs.alloc(in_root_set, can_refs, can_weak))
    }

    fn check_gc_before_alloc(&mut self) {
        if !self.objs.gc_enabled() || self.objs.gc_in_progress() {
            return;
        }
        let (allocs, bytes) = self.objs.alloc_pressure();
        if allocs > self.cfg.gc_max_allocs || bytes > self.cfg.gc_max_bytes {
            debug!(allocs, bytes, "collecting under allocation pressure");
            self.gc_full();
            self.run_finalizers();
        }
    }

    pub fn new_record(&mut self, superclasses: Vec<ObjId>) -> VmResult<ObjId> {
        let id = self.alloc_obj(false, true, false)?;
        self.objs.install(id, Box::new(RecordObject::new(superclasses)));
        Ok(id)
    }

    pub fn new_string(&mut self, text: &str) -> VmResult<ObjId> {
        let id = self.alloc_obj(false, false, false)?;
        self.objs.count_alloc(text.len());
        self.objs.install(id, Box::new(StringObject::new(text)));
        Ok(id)
    }

    pub fn new_list(&mut self, elems: Vec<Value>) -> VmResult<ObjId> {
        let id = self.alloc_obj(false, true, false)?;
        self.objs.count_alloc(elems.len() * std::mem::size_of::<Value>());
        self.objs.install(id, Box::new(ListObject::new(elems)));
        Ok(id)
    }

    pub fn new_dictionary(&mut self) -> VmResult<ObjId> {
        let id = self.alloc_obj(false, true, true)?;
        self.objs.install(id, Box::new(Dictionary::default()));
        Ok(id)
    }

    pub fn new_strcomp(&mut self, cmp: StringComparator) -> VmResult<ObjId> {
        let id = self.alloc_obj(false, false, false)?;
        self.objs.install(id, Box::new(StrCompObject::new(cmp)));
        Ok(id)
    }

    pub fn new_gramprod(&mut self, alts: Vec<AltInfo>) -> VmResult<ObjId> {
        let id = self.alloc_obj(false, false, true)?;
        let mut prod = GramProdObj::new(alts);
        prod.finish(id);
        self.objs.install(id, Box::new(prod));
        Ok(id)
    }

    // --- properties and equality -----------------------------------------

    /// Property lookup with superclass inheritance, depth-first.
    pub fn get_prop(&self, obj: ObjId, prop: PropId) -> VmResult<Option<Value>> {
        if !self.objs.is_obj_id_valid(obj) {
            return Err(VmError::BadObjectRef(obj));
        }
        let mut visited = HashSet::new();
        Ok(self.get_prop_walk(obj, prop, &mut visited))
    }

    fn get_prop_walk(&self, obj: ObjId, prop: PropId, visited: &mut HashSet<ObjId>) -> Option<Value> {
        if !visited.insert(obj) {
            return None;
        }
        let o = self.objs.try_get(obj)?;
        if let Some(v) = o.get_prop(prop) {
            return Some(v);
        }
        let supers: Vec<ObjId> = o.superclasses().to_vec();
        supers
            .into_iter()
            .filter(|sc| sc.is_valid())
            .find_map(|sc| self.get_prop_walk(sc, prop, visited))
    }

    /// Set a property; undoable metaclasses record the old value first.
    pub fn set_prop(&mut self, obj: ObjId, prop: PropId, val: Value) -> VmResult<()> {
        debug_assert!(!self.objs.gc_in_progress(), "mutation during a GC pass");
        self.with_obj(obj, |o, vm| o.set_prop(vm, obj, prop, val))?
    }

    /// Value equality: by tag and payload, with object-overridden
    /// content equality (strings, lists) consulted both ways.
    pub fn equals(&self, a: &Value, b: &Value) -> bool {
        if a == b {
            return true;
        }
        if let Value::Obj(ia) = a {
            if let Some(obj) = self.objs.try_get(*ia) {
                if obj.equals(self, b) {
                    return true;
                }
            }
        }
        if let Value::Obj(ib) = b {
            if let Some(obj) = self.objs.try_get(*ib) {
                if obj.equals(self, a) {
                    return true;
                }
            }
        }
        false
    }

    // --- machine globals --------------------------------------------------

    pub fn create_global_var(&mut self) -> GlobalVarHandle {
        self.globals.create()
    }

    pub fn delete_global_var(&mut self, h: GlobalVarHandle) {
        self.globals.delete(h);
    }

    pub fn global_get(&self, h: GlobalVarHandle) -> Value {
        self.globals.slots.get(h.0).copied().flatten().unwrap_or(Value::Nil)
    }

    pub fn global_set(&mut self, h: GlobalVarHandle, v: Value) {
        debug_assert!(!self.objs.gc_in_progress(), "mutation during a GC pass");
        if let Some(slot) = self.globals.slots.get_mut(h.0) {
            if slot.is_some() {
                *slot = Some(v);
            }
        }
    }

    // --- savepoints and undo ----------------------------------------------

    pub fn create_savepoint(&mut self) {
        debug_assert!(!self.objs.gc_in_progress(), "mutation during a GC pass");
        self.undo.create_savepoint(&mut self.objs);
    }

    /// Roll back to the most recent savepoint. Returns false, with no
    /// state change, when no undo state exists.
    pub fn undo_to_savepoint(&mut self) -> bool {
        debug_assert!(!self.objs.gc_in_progress(), "mutation during a GC pass");
        let Some(recs) = self.undo.pop_savepoint() else {
            return false;
        };
        for rec in recs {
            if !rec.obj.is_valid() || !self.objs.is_obj_id_valid(rec.obj) {
                continue;
            }
            let id = rec.obj;
            match self.with_obj(id, |obj, vm| obj.apply_undo(vm, rec)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => warn!(obj = id.0, error = %e, "undo record failed to apply"),
            }
        }
        self.objs.notify_new_savepoint();
        true
    }

    // --- garbage collection ----------------------------------------------

    /// One full pass: everything from reachability reset through the
    /// final sweep.
    pub fn gc_full(&mut self) {
        self.gc_pass_init();
        self.gc_pass_finish();
    }

    /// Begin an incremental pass. Until `gc_pass_finish` returns, no
    /// allocation, reference mutation, or host execution is permitted.
    pub fn gc_pass_init(&mut self) {
        debug_assert_eq!(
            self.scratch.outstanding(),
            0,
            "scratch registers outstanding at GC"
        );
        let roots = self.globals.roots();
        self.objs.gc_pass_init(roots);
    }

    /// Drain up to `limit` work-queue entries; true if work remains.
    pub fn gc_pass_continue(&mut self, limit: usize) -> bool {
        self.objs.gc_trace_queue(limit)
    }

    /// Finish the pass: final tracing, undo-log marking, finalizer
    /// detection, weak-reference sweeps, deletion.
    pub fn gc_pass_finish(&mut self) {
        self.objs.gc_trace_queue(usize::MAX);
        self.gc_mark_undo_refs();
        self.objs.gc_scan_finalizable();
        let dead = self.objs.dead_set();
        self.objs.sweep_weak_refs(&dead);
        self.gc_sweep_undo_weak_refs(&dead);
        self.objs.gc_delete_unreachable();
        self.objs.gc_pass_done();
    }

    /// Trace undo-record old values for records whose owner is itself
    /// reachable. Owners are weakly referenced, so records of
    /// unreachable owners contribute nothing; tracing can make further
    /// owners reachable, so iterate to a fixpoint.
    fn gc_mark_undo_refs(&mut self) {
        loop {
            let mut raised = false;
            let mut scratch: Vec<ObjId> = Vec::new();
            for idx in self.undo.record_indices() {
                let Some(rec) = self.undo.record(idx) else { continue };
                let owner = rec.obj;
                if !owner.is_valid() || !self.objs.is_obj_id_valid(owner) {
                    continue;
                }
                let state = self.objs.reach_of(owner);
                if state == Reach::Unreachable || !self.objs.can_have_refs(owner) {
                    continue;
                }
                scratch.clear();
                if let Some(owner_obj) = self.objs.try_get(owner) {
                    let rec = self.undo.record(idx).expect("record checked above");
                    owner_obj.mark_undo_ref(rec, &mut |r| scratch.push(r));
                }
                for &r in &scratch {
                    if self.objs.reach_of(r) < state {
                        raised = true;
                    }
                    self.objs.add_to_gc_queue(r, state);
                }
            }
            if !raised {
                break;
            }
            self.objs.gc_trace_queue(usize::MAX);
        }
    }

    /// Invalidate records whose owner is about to be deleted (the log
    /// references its owners weakly), and let surviving owners clean the
    /// weak references inside their records.
    fn gc_sweep_undo_weak_refs(&mut self, dead: &DeadSet) {
        for idx in self.undo.record_indices() {
            let Some(rec) = self.undo.record(idx) else { continue };
            let owner = rec.obj;
            if !owner.is_valid() {
                continue;
            }
            if dead.is_deletable(owner) || !self.objs.is_obj_id_valid(owner) {
                self.undo.invalidate_record(idx);
                continue;
            }
            if self.objs.can_have_weak_refs(owner) {
                if let Some(owner_obj) = self.objs.try_get(owner) {
                    if let Some(rec) = self.undo.record_mut(idx) {
                        owner_obj.remove_stale_undo_weak_ref(rec, dead);
                    }
                }
            }
        }
    }

    /// Run pending finalizers. Never called by the collector itself;
    /// errors are swallowed so one bad finalizer cannot wedge the rest.
    pub fn run_finalizers(&mut self) {
        assert!(!self.objs.gc_in_progress(), "finalizers cannot run inside a GC pass");
        for id in self.objs.take_finalize_queue() {
            if !self.objs.is_obj_id_valid(id) {
                continue;
            }
            match self.with_obj(id, |obj, vm| obj.invoke_finalizer(vm, id)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => warn!(obj = id.0, error = %e, "finalizer failed"),
            }
            self.objs.mark_finalized(id);
        }
    }

    /// Turn automatic collection on or off; returns the previous state.
    pub fn enable_gc(&mut self, enable: bool) -> bool {
        self.objs.enable_gc(enable)
    }

    // --- post-load initialization ----------------------------------------

    pub fn request_post_load_init(&mut self, id: ObjId) {
        self.objs.request_post_load_init(id);
    }

    pub fn remove_post_load_init(&mut self, id: ObjId) {
        self.objs.remove_post_load_init(id);
    }

    /// Run every requested handler exactly once. Called after initial
    /// load, restart, and every restore.
    pub fn do_all_post_load_init(&mut self) -> VmResult<()> {
        let ids = self.objs.post_load_requests();
        self.pli_status = Some(ids.iter().map(|&i| (i, PliStatus::Pending)).collect());
        let result = ids.into_iter().try_for_each(|id| self.run_post_load(id));
        self.pli_status = None;
        result
    }

    /// Force another object's post-load handler to run before the
    /// caller's continues; callable only during a post-load cycle.
    /// Cyclic requests are an error.
    pub fn ensure_post_load_init(&mut self, id: ObjId) -> VmResult<()> {
        if self.pli_status.is_some() {
            self.run_post_load(id)
        } else {
            Ok(())
        }
    }

    fn run_post_load(&mut self, id: ObjId) -> VmResult<()> {
        let status = self.pli_status.as_ref().and_then(|m| m.get(&id)).copied();
        match status {
            None | Some(PliStatus::Done) => Ok(()),
            Some(PliStatus::InProgress) => Err(VmError::CircularInit(id)),
            Some(PliStatus::Pending) => {
                self.pli_status
                    .as_mut()
                    .expect("cycle in progress")
                    .insert(id, PliStatus::InProgress);
                let r = self.with_obj(id, |obj, vm| obj.post_load_init(vm, id))?;
                self.pli_status
                    .as_mut()
                    .expect("cycle in progress")
                    .insert(id, PliStatus::Done);
                r
            }
        }
    }

    // --- dictionary operations -------------------------------------------

    fn with_dict<R>(
        &mut self,
        dict: ObjId,
        f: impl FnOnce(&mut Dictionary, &mut Vm) -> VmResult<R>,
    ) -> VmResult<R> {
        let mut obj = self.objs.take_obj(dict).ok_or(VmError::BadObjectRef(dict))?;
        let r = match obj.as_any_mut().downcast_mut::<Dictionary>() {
            Some(d) => f(d, self),
            None => Err(VmError::TypeMismatch("dictionary")),
        };
        self.objs.put_obj(dict, obj);
        r
    }

    pub fn dict_add_word(&mut self, dict: ObjId, word: &str, obj: ObjId, prop: PropId) -> VmResult<()> {
        self.with_dict(dict, |d, vm| {
            d.add_word(vm, dict, word, obj, prop);
            Ok(())
        })
    }

    pub fn dict_del_word(&mut self, dict: ObjId, word: &str, obj: ObjId, prop: PropId) -> VmResult<bool> {
        self.with_dict(dict, |d, vm| Ok(d.del_word(vm, dict, word, obj, prop)))
    }

    pub fn dict_set_comparator(&mut self, dict: ObjId, cmp: ObjId) -> VmResult<()> {
        self.with_dict(dict, |d, vm| d.set_comparator(vm, dict, cmp))
    }

    pub fn dict_find(&self, dict: ObjId, word: &str) -> VmResult<Vec<(ObjId, PropId)>> {
        let d = self
            .objs
            .get_as::<Dictionary>(dict)
            .ok_or(VmError::TypeMismatch("dictionary"))?;
        Ok(d.find(&self.objs, word))
    }

    pub fn dict_is_defined(&self, dict: ObjId, word: &str, prop: PropId) -> VmResult<bool> {
        let d = self
            .objs
            .get_as::<Dictionary>(dict)
            .ok_or(VmError::TypeMismatch("dictionary"))?;
        Ok(d.is_defined(&self.objs, word, prop))
    }

    pub fn dict_spell_candidates(&self, dict: ObjId, word: &str, max_edits: usize) -> VmResult<Vec<String>> {
        let d = self
            .objs
            .get_as::<Dictionary>(dict)
            .ok_or(VmError::TypeMismatch("dictionary"))?;
        Ok(d.spell_candidates(&self.objs, word, max_edits))
    }

    // --- parsing ----------------------------------------------------------

    /// Match a token list against a root production. `Ok(None)` is the
    /// distinguished no-match result.
    pub fn parse(
        &mut self,
        root: ObjId,
        toks: &[InputToken<'_>],
        dict: ObjId,
    ) -> VmResult<Option<ParseResult>> {
        debug_assert!(!self.objs.gc_in_progress(), "parse during a GC pass");
        crate::gramprod::parse(self, root, toks, dict)
    }

    // --- images and saved states -----------------------------------------

    pub fn load_image(&mut self, data: &[u8]) -> VmResult<()> {
        crate::image::load_image(self, data)
    }

    pub fn rebuild_image(&self) -> VmResult<Vec<u8>> {
        crate::image::rebuild_image(self)
    }

    pub fn save_to_vec(&self) -> VmResult<Vec<u8>> {
        crate::save::save_to_vec(self)
    }

    pub fn save(&self, out: &mut dyn std::io::Write) -> VmResult<()> {
        crate::save::save(self, out)
    }

    pub fn restore(&mut self, input: &mut dyn std::io::Read) -> VmResult<()> {
        crate::save::restore(self, input)
    }

    pub fn restore_from_slice(&mut self, data: &[u8]) -> VmResult<()> {
        crate::save::restore_from_slice(self, data)
    }

    /// Restart: discard everything dynamic (skipping finalizers), reload
    /// root objects from their image payloads, drop all undo, rerun
    /// post-load initialization. Transient objects are unaffected.
    pub fn reset_to_image(&mut self) -> VmResult<()> {
        self.undo.drop_all(&mut self.objs);
        for id in self.objs.used_ids() {
            if !self.objs.is_in_root_set(id) && !self.objs.is_transient(id) {
                self.objs.free_slot(id);
            }
        }
        let roots: Vec<ObjId> = self
            .objs
            .used_ids()
            .into_iter()
            .filter(|&id| self.objs.is_in_root_set(id))
            .collect();
        for id in roots {
            if let Some(snap) = self.objs.image_snapshot(id) {
                let data = snap.to_vec();
                self.with_obj(id, |obj, vm| obj.reload_from_image(vm, id, &data))??;
            }
        }
        self.do_all_post_load_init()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
