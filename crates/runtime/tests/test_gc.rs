//! Collector behavior across whole-VM scenarios: finalizer staging,
//! hint bits, incremental passes, and free-list accounting.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use tale_runtime::vm::Vm;
use tale_runtime::{ObjId, PropId, Value, VmObject, VmResult};

/// Test metaclass whose finalizer bumps a shared counter.
struct FinWidget {
    hits: Rc<Cell<usize>>,
}

impl VmObject for FinWidget {
    fn metaclass_name(&self) -> &'static str {
        "fin-widget/030000"
    }

    fn has_finalizer(&self) -> bool {
        true
    }

    fn invoke_finalizer(&mut self, _vm: &mut Vm, _self_id: ObjId) -> VmResult<()> {
        self.hits.set(self.hits.get() + 1);
        Ok(())
    }

    fn load_from_image(&mut self, _vm: &mut Vm, _self_id: ObjId, _data: &[u8]) -> VmResult<()> {
        Ok(())
    }

    fn rebuild_image(&self, _out: &mut Vec<u8>) -> VmResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn new_fin_widget(vm: &mut Vm, hits: &Rc<Cell<usize>>) -> ObjId {
    let id = vm.alloc_obj(false, false, false).unwrap();
    vm.objs.install(id, Box::new(FinWidget { hits: Rc::clone(hits) }));
    id
}

#[test]
fn finalizers_run_outside_gc_and_slots_free_on_the_next_pass() {
    let mut vm = Vm::new();
    let hits = Rc::new(Cell::new(0));

    let ids: Vec<ObjId> = (0..10).map(|_| new_fin_widget(&mut vm, &hits)).collect();

    // keep exactly one alive through a machine global
    let root = vm.create_global_var();
    vm.global_set(root, Value::Obj(ids[0]));

    let max_used = vm.objs.max_used_obj_id();
    let free_before = vm.objs.free_slot_count();

    // first pass: the nine unreachable widgets become finalizable, not
    // deleted
    vm.gc_full();
    assert_eq!(hits.get(), 0);
    for &id in &ids {
        assert!(vm.objs.is_obj_id_valid(id));
    }

    vm.run_finalizers();
    assert_eq!(hits.get(), 9);

    // second pass deletes the finalized nine
    vm.gc_full();
    assert_eq!(hits.get(), 9);
    assert!(vm.objs.is_obj_id_valid(ids[0]));
    for &id in &ids[1..] {
        assert!(!vm.objs.is_obj_id_valid(id));
    }
    assert_eq!(vm.objs.max_used_obj_id(), max_used);
    assert_eq!(vm.objs.free_slot_count(), free_before + 9);
}

#[test]
fn restart_discards_objects_without_running_finalizers() {
    let mut vm = Vm::new();
    let hits = Rc::new(Cell::new(0));

    // one widget already queued for finalization, one the collector has
    // never seen
    let pending = new_fin_widget(&mut vm, &hits);
    vm.gc_full();
    let fresh = new_fin_widget(&mut vm, &hits);

    vm.reset_to_image().unwrap();

    // both are gone, and neither finalizer ever ran
    assert!(!vm.objs.is_obj_id_valid(pending));
    assert!(!vm.objs.is_obj_id_valid(fresh));
    assert_eq!(hits.get(), 0);

    // the pending queue entry died with its object; nothing fires later
    vm.run_finalizers();
    vm.gc_full();
    vm.run_finalizers();
    assert_eq!(hits.get(), 0);
}

#[test]
fn unreferenced_objects_without_finalizers_die_in_one_pass() {
    let mut vm = Vm::new();
    let a = vm.new_string("doomed").unwrap();
    let b = vm.new_string("kept").unwrap();
    let root = vm.create_global_var();
    vm.global_set(root, Value::Obj(b));

    vm.gc_full();
    assert!(!vm.objs.is_obj_id_valid(a));
    assert!(vm.objs.is_obj_id_valid(b));
}

#[test]
fn object_graphs_and_cycles_are_traced_and_collected() {
    let mut vm = Vm::new();
    let p = PropId(1);

    // a -> b -> c, and a cycle d <-> e
    let c = vm.new_record(vec![]).unwrap();
    let b = vm.new_record(vec![]).unwrap();
    let a = vm.new_record(vec![]).unwrap();
    vm.set_prop(b, p, Value::Obj(c)).unwrap();
    vm.set_prop(a, p, Value::Obj(b)).unwrap();

    let d = vm.new_record(vec![]).unwrap();
    let e = vm.new_record(vec![]).unwrap();
    vm.set_prop(d, p, Value::Obj(e)).unwrap();
    vm.set_prop(e, p, Value::Obj(d)).unwrap();

    let root = vm.create_global_var();
    vm.global_set(root, Value::Obj(a));

    vm.gc_full();
    assert!(vm.objs.is_obj_id_valid(a));
    assert!(vm.objs.is_obj_id_valid(b));
    assert!(vm.objs.is_obj_id_valid(c));
    // the unrooted cycle is collected despite referencing itself
    assert!(!vm.objs.is_obj_id_valid(d));
    assert!(!vm.objs.is_obj_id_valid(e));
}

#[test]
fn can_have_refs_false_skips_outgoing_traversal() {
    let mut vm = Vm::new();
    let p = PropId(1);

    let q = vm.new_record(vec![]).unwrap();
    let holder = vm.new_record(vec![]).unwrap();
    vm.set_prop(holder, p, Value::Obj(q)).unwrap();
    // lie to the collector: this object can never hold references
    vm.objs.set_gc_hints(holder, false, false);

    let root = vm.create_global_var();
    vm.global_set(root, Value::Obj(holder));

    vm.gc_full();
    assert!(vm.objs.is_obj_id_valid(holder));
    // q was only reachable through the untraced slot
    assert!(!vm.objs.is_obj_id_valid(q));
}

#[test]
fn incremental_pass_matches_full_pass() {
    let mut vm = Vm::new();

    let mut keep = Vec::new();
    let mut drop_ids = Vec::new();
    let root = vm.create_global_var();
    let head = vm.new_record(vec![]).unwrap();
    vm.global_set(root, Value::Obj(head));
    let mut prev = head;
    for i in 0..50 {
        let r = vm.new_record(vec![]).unwrap();
        if i % 2 == 0 {
            vm.set_prop(prev, PropId(100 + i as u16), Value::Obj(r)).unwrap();
            prev = r;
            keep.push(r);
        } else {
            drop_ids.push(r);
        }
    }

    vm.gc_pass_init();
    // drain in small increments before finishing
    while vm.gc_pass_continue(3) {}
    vm.gc_pass_finish();

    for id in keep {
        assert!(vm.objs.is_obj_id_valid(id));
    }
    for id in drop_ids {
        assert!(!vm.objs.is_obj_id_valid(id));
    }
}

#[test]
fn root_set_objects_survive_without_references() {
    let mut vm = Vm::new();
    let id = vm.alloc_obj(true, true, true).unwrap();
    vm.objs
        .install(id, Box::new(tale_runtime::RecordObject::new(vec![])));
    vm.gc_full();
    assert!(vm.objs.is_obj_id_valid(id));
}

#[test]
fn allocation_pressure_triggers_collection() {
    let mut vm = Vm::with_config(
        tale_runtime::VmConfig::from_toml("gc_max_allocs = 32\n").unwrap(),
    );
    let root = vm.create_global_var();
    let keep = vm.new_string("kept").unwrap();
    vm.global_set(root, Value::Obj(keep));

    // churn far past the threshold; garbage must not accumulate
    // unboundedly
    for _ in 0..1000 {
        vm.new_string("garbage").unwrap();
    }
    assert!(vm.objs.live_object_count() < 200);
    assert!(vm.objs.is_obj_id_valid(keep));
}
