//! Savepoint and rollback scenarios spanning the undo log, the object
//! table, and the collector's weak-reference handling.

use tale_runtime::vm::Vm;
use tale_runtime::{ObjId, PropId, Value};

const P: PropId = PropId(7);

fn rooted_record(vm: &mut Vm) -> ObjId {
    let id = vm.new_record(vec![]).unwrap();
    let root = vm.create_global_var();
    vm.global_set(root, Value::Obj(id));
    id
}

#[test]
fn nested_savepoints_roll_back_one_at_a_time() {
    let mut vm = Vm::new();
    let o = rooted_record(&mut vm);

    vm.set_prop(o, P, Value::Int(1)).unwrap();
    vm.create_savepoint(); // A
    vm.set_prop(o, P, Value::Int(2)).unwrap();
    vm.create_savepoint(); // B
    vm.set_prop(o, P, Value::Int(3)).unwrap();

    assert!(vm.undo_to_savepoint());
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Int(2)));

    assert!(vm.undo_to_savepoint());
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Int(1)));

    // no undo states left: report it and change nothing
    assert!(!vm.undo_to_savepoint());
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Int(1)));
}

#[test]
fn savepoint_then_undo_is_a_noop() {
    let mut vm = Vm::new();
    let o = rooted_record(&mut vm);
    vm.set_prop(o, P, Value::Int(42)).unwrap();

    vm.create_savepoint();
    assert!(vm.undo_to_savepoint());
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Int(42)));
}

#[test]
fn first_time_assignment_rolls_back_to_absent() {
    let mut vm = Vm::new();
    let o = rooted_record(&mut vm);

    vm.create_savepoint();
    vm.set_prop(o, P, Value::Int(5)).unwrap();
    assert!(vm.undo_to_savepoint());
    // not nil: the property does not exist again
    assert_eq!(vm.get_prop(o, P).unwrap(), None);
}

#[test]
fn transient_objects_never_generate_undo() {
    let mut vm = Vm::new();
    let t = rooted_record(&mut vm);
    vm.objs.set_transient(t);

    vm.set_prop(t, P, Value::Int(1)).unwrap();
    vm.create_savepoint();
    vm.set_prop(t, P, Value::Int(2)).unwrap();

    assert!(vm.undo_to_savepoint());
    // the transient object's change sticks
    assert_eq!(vm.get_prop(t, P).unwrap(), Some(Value::Int(2)));
}

#[test]
fn objects_created_after_the_savepoint_skip_undo() {
    let mut vm = Vm::new();
    let _anchor = rooted_record(&mut vm);
    vm.create_savepoint();

    let fresh = rooted_record(&mut vm);
    vm.set_prop(fresh, P, Value::Int(1)).unwrap();
    vm.set_prop(fresh, P, Value::Int(2)).unwrap();

    // rolling back discards nothing on the fresh object (it would not
    // even exist at the savepoint)
    assert!(vm.undo_to_savepoint());
    assert_eq!(vm.get_prop(fresh, P).unwrap(), Some(Value::Int(2)));
}

#[test]
fn undo_record_is_a_weak_reference_to_its_owner() {
    let mut vm = Vm::new();
    let _anchor = rooted_record(&mut vm);

    // o references q; after the savepoint the old value (q) lives only
    // in the undo record, and o itself is unreachable
    let q = vm.new_record(vec![]).unwrap();
    let o = vm.new_record(vec![]).unwrap();
    vm.set_prop(o, P, Value::Obj(q)).unwrap();
    vm.create_savepoint();
    vm.set_prop(o, P, Value::Nil).unwrap();

    vm.gc_full();

    // the log's owner reference is weak: both objects are gone and the
    // record was invalidated rather than keeping them alive
    assert!(!vm.objs.is_obj_id_valid(o));
    assert!(!vm.objs.is_obj_id_valid(q));

    // rolling back must not touch the dead pair
    assert!(vm.undo_to_savepoint());
}

#[test]
fn undo_old_values_of_live_owners_survive_gc() {
    let mut vm = Vm::new();
    let o = rooted_record(&mut vm);

    let q = vm.new_record(vec![]).unwrap();
    vm.set_prop(o, P, Value::Obj(q)).unwrap();
    vm.create_savepoint();
    vm.set_prop(o, P, Value::Nil).unwrap();

    // q is now referenced only by o's undo record, but o is alive, so
    // the old value must stay restorable
    vm.gc_full();
    assert!(vm.objs.is_obj_id_valid(q));

    assert!(vm.undo_to_savepoint());
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Obj(q)));
}

#[test]
fn dictionary_mutations_roll_back() {
    let mut vm = Vm::new();
    let noun = PropId(50);
    let thing = rooted_record(&mut vm);

    let dict = vm.new_dictionary().unwrap();
    let droot = vm.create_global_var();
    vm.global_set(droot, Value::Obj(dict));

    vm.dict_add_word(dict, "gold", thing, noun).unwrap();
    vm.create_savepoint();
    vm.dict_add_word(dict, "silver", thing, noun).unwrap();
    assert!(vm.dict_is_defined(dict, "silver", noun).unwrap());

    assert!(vm.undo_to_savepoint());
    assert!(!vm.dict_is_defined(dict, "silver", noun).unwrap());
    assert!(vm.dict_is_defined(dict, "gold", noun).unwrap());

    // deletion rolls back the other way
    vm.create_savepoint();
    assert!(vm.dict_del_word(dict, "gold", thing, noun).unwrap());
    assert!(!vm.dict_is_defined(dict, "gold", noun).unwrap());
    assert!(vm.undo_to_savepoint());
    assert!(vm.dict_is_defined(dict, "gold", noun).unwrap());
}

#[test]
fn every_live_object_is_in_undo_after_a_savepoint() {
    let mut vm = Vm::new();
    let a = rooted_record(&mut vm);
    let b = vm.new_string("word").unwrap();
    vm.create_savepoint();
    assert!(vm.objs.is_obj_in_undo(a));
    assert!(vm.objs.is_obj_in_undo(b));
}
