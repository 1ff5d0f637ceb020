//! Saved-state and image round trips.

use tale_runtime::vm::Vm;
use tale_runtime::{PropId, StringComparator, Value};

const P: PropId = PropId(9);

#[test]
fn save_then_restore_reproduces_state() {
    let mut vm = Vm::new();

    // one plain object, one string, one list
    let o = vm.new_record(vec![]).unwrap();
    vm.set_prop(o, P, Value::Int(11)).unwrap();
    let s = vm.new_string("hello").unwrap();
    let l = vm
        .new_list(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        .unwrap();

    let saved = vm.save_to_vec().unwrap();

    // allocated after the save; restore must discard it
    let w = vm.new_string("world").unwrap();

    vm.restore_from_slice(&saved).unwrap();

    assert!(!vm.objs.is_obj_id_valid(w));
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Int(11)));

    let fresh_s = vm.new_string("hello").unwrap();
    let fresh_l = vm
        .new_list(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        .unwrap();
    assert!(vm.equals(&Value::Obj(s), &Value::Obj(fresh_s)));
    assert!(vm.equals(&Value::Obj(l), &Value::Obj(fresh_l)));

    // the table never shrank below its post-load extent
    assert_eq!(vm.objs.max_used_obj_id(), tale_runtime::PAGE_SIZE as u32);
}

#[test]
fn save_restore_through_a_real_file() {
    let mut vm = Vm::new();
    let o = vm.new_record(vec![]).unwrap();
    vm.set_prop(o, P, Value::Int(5)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("game.sav");
    {
        let mut f = std::fs::File::create(&path).unwrap();
        vm.save(&mut f).unwrap();
    }

    vm.set_prop(o, P, Value::Int(99)).unwrap();

    let mut f = std::fs::File::open(&path).unwrap();
    vm.restore(&mut f).unwrap();
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Int(5)));
}

#[test]
fn object_references_survive_restore() {
    let mut vm = Vm::new();
    let inner = vm.new_string("treasure").unwrap();
    let outer = vm.new_record(vec![]).unwrap();
    vm.set_prop(outer, P, Value::Obj(inner)).unwrap();

    let saved = vm.save_to_vec().unwrap();
    vm.restore_from_slice(&saved).unwrap();

    let v = vm.get_prop(outer, P).unwrap().unwrap();
    let id = v.as_obj().unwrap();
    let fresh = vm.new_string("treasure").unwrap();
    assert!(vm.equals(&Value::Obj(id), &Value::Obj(fresh)));
}

#[test]
fn transient_objects_are_not_saved_and_not_restored_over() {
    let mut vm = Vm::new();
    let t = vm.new_record(vec![]).unwrap();
    vm.objs.set_transient(t);
    vm.set_prop(t, P, Value::Int(1)).unwrap();

    let saved = vm.save_to_vec().unwrap();
    vm.set_prop(t, P, Value::Int(2)).unwrap();
    vm.restore_from_slice(&saved).unwrap();

    // unaffected by the restore
    assert_eq!(vm.get_prop(t, P).unwrap(), Some(Value::Int(2)));
}

#[test]
fn failed_restore_rolls_back_to_the_pre_restore_state() {
    let mut vm = Vm::new();
    let o = vm.new_record(vec![]).unwrap();
    vm.set_prop(o, P, Value::Int(7)).unwrap();

    let mut corrupt = vm.save_to_vec().unwrap();
    // truncate the body region
    corrupt.truncate(corrupt.len() - 3);

    vm.set_prop(o, P, Value::Int(8)).unwrap();
    let err = vm.restore_from_slice(&corrupt);
    assert!(err.is_err());
    // no user-visible effect from the failed restore
    assert_eq!(vm.get_prop(o, P).unwrap(), Some(Value::Int(8)));
}

#[test]
fn restore_rejects_unknown_save_files() {
    let mut vm = Vm::new();
    assert!(vm.restore_from_slice(b"not a save file at all").is_err());
}

#[test]
fn rebuilt_image_round_trips_immutable_metaclasses() {
    let mut vm = Vm::new();

    let cmp = StringComparator::new(4, false, Vec::new()).unwrap();
    let cmp_id = vm.new_strcomp(cmp).unwrap();

    let dict = vm.new_dictionary().unwrap();
    let target = vm.new_record(vec![]).unwrap();
    vm.dict_set_comparator(dict, cmp_id).unwrap();
    vm.dict_add_word(dict, "lamp", target, PropId(60)).unwrap();

    let noun = PropId(60);
    let proc = vm.new_record(vec![]).unwrap();
    let _prod = vm
        .new_gramprod(vec![tale_runtime::AltInfo {
            score: 100,
            badness: 0,
            proc_obj: proc,
            toks: vec![tale_runtime::TokInfo {
                prop: PropId(1),
                kind: tale_runtime::TokKind::Speech(noun),
            }],
            circular: false,
        }])
        .unwrap();

    let image = vm.rebuild_image().unwrap();

    let mut vm2 = Vm::new();
    vm2.load_image(&image).unwrap();
    let image2 = vm2.rebuild_image().unwrap();
    assert_eq!(image, image2);

    // the reloaded dictionary still resolves words through its
    // comparator
    assert!(vm2.dict_is_defined(dict, "LAMP", noun).unwrap());
}

#[test]
fn restart_resets_to_image_state() {
    let mut vm = Vm::new();
    let r = vm.new_record(vec![]).unwrap();
    vm.set_prop(r, P, Value::Int(1)).unwrap();
    let image = vm.rebuild_image().unwrap();

    let mut vm2 = Vm::new();
    vm2.load_image(&image).unwrap();
    vm2.set_prop(r, P, Value::Int(2)).unwrap();
    let extra = vm2.new_string("scratch").unwrap();

    vm2.reset_to_image().unwrap();
    assert_eq!(vm2.get_prop(r, P).unwrap(), Some(Value::Int(1)));
    assert!(!vm2.objs.is_obj_id_valid(extra));
}

#[test]
fn saved_root_objects_only_when_changed() {
    let mut vm = Vm::new();
    let r = vm.new_record(vec![]).unwrap();
    vm.set_prop(r, P, Value::Int(1)).unwrap();
    let image = vm.rebuild_image().unwrap();

    let mut vm2 = Vm::new();
    vm2.load_image(&image).unwrap();

    // untouched root objects contribute nothing to a save
    let clean = vm2.save_to_vec().unwrap();
    vm2.set_prop(r, P, Value::Int(2)).unwrap();
    let dirty = vm2.save_to_vec().unwrap();
    assert!(dirty.len() > clean.len());

    // and restoring the clean save puts the image state back
    vm2.restore_from_slice(&clean).unwrap();
    assert_eq!(vm2.get_prop(r, P).unwrap(), Some(Value::Int(1)));
}
