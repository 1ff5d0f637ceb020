//! Cross-cutting VM behavior: comparator flag arithmetic, post-load
//! initialization ordering, machine globals, and resource limits.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use tale_runtime::vm::Vm;
use tale_runtime::{
    EquivMapping, ObjId, PropId, StringComparator, Value, VmError, VmObject, VmResult, RF_CASEFOLD,
    RF_MATCH, RF_TRUNC,
};

#[test]
fn comparator_flag_arithmetic() {
    let cmp = StringComparator::new(
        4,
        false,
        vec![(
            'é',
            EquivMapping { val_ch: vec!['e'], uc_result_flags: 0x100, lc_result_flags: 0x200 },
        )],
    )
    .unwrap();

    assert_eq!(cmp.match_strings("eleph", "elephant"), RF_MATCH | RF_TRUNC);
    assert_eq!(
        cmp.match_strings("Éléphant", "elephant"),
        RF_MATCH | RF_CASEFOLD | 0x100 | 0x200
    );
    assert_eq!(cmp.match_strings("ele", "elephant"), 0);
}

/// Object whose post-load handler records its order and optionally asks
/// for another object to initialize first.
struct Staged {
    name: &'static str,
    needs: Option<ObjId>,
    order: Rc<RefCell<Vec<&'static str>>>,
}

impl VmObject for Staged {
    fn metaclass_name(&self) -> &'static str {
        "staged-widget/030000"
    }

    fn post_load_init(&mut self, vm: &mut Vm, _self_id: ObjId) -> VmResult<()> {
        if let Some(dep) = self.needs {
            vm.ensure_post_load_init(dep)?;
        }
        self.order.borrow_mut().push(self.name);
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

fn staged(vm: &mut Vm, name: &'static str, needs: Option<ObjId>, order: &Rc<RefCell<Vec<&'static str>>>) -> ObjId {
    let id = vm.alloc_obj(false, false, false).unwrap();
    vm.objs.install(
        id,
        Box::new(Staged { name, needs, order: Rc::clone(order) }),
    );
    vm.request_post_load_init(id);
    id
}

#[test]
fn ensure_post_load_init_orders_dependencies() {
    let mut vm = Vm::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    // a would run first by default; its handler forces b to go first
    let a = vm.alloc_obj(false, false, false).unwrap();
    let b = staged(&mut vm, "b", None, &order);
    vm.objs.install(
        a,
        Box::new(Staged { name: "a", needs: Some(b), order: Rc::clone(&order) }),
    );
    vm.request_post_load_init(a);

    vm.do_all_post_load_init().unwrap();

    // each ran exactly once, dependency first
    assert_eq!(*order.borrow(), vec!["b", "a"]);
}

#[test]
fn cyclic_post_load_requests_are_an_error() {
    let mut vm = Vm::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    // a and b each demand the other runs first
    let a = vm.alloc_obj(false, false, false).unwrap();
    let b = staged(&mut vm, "b", Some(a), &order);
    vm.objs.install(
        a,
        Box::new(Staged { name: "a", needs: Some(b), order: Rc::clone(&order) }),
    );
    vm.request_post_load_init(a);

    assert!(matches!(
        vm.do_all_post_load_init(),
        Err(VmError::CircularInit(_))
    ));
}

#[test]
fn machine_globals_are_roots_and_survive_undo() {
    let mut vm = Vm::new();
    let h = vm.create_global_var();
    let s = vm.new_string("anchored").unwrap();
    vm.global_set(h, Value::Obj(s));

    vm.create_savepoint();
    vm.global_set(h, Value::Int(3));
    vm.undo_to_savepoint();
    // globals are transient with respect to undo
    assert_eq!(vm.global_get(h), Value::Int(3));

    vm.global_set(h, Value::Obj(s));
    vm.gc_full();
    assert!(vm.objs.is_obj_id_valid(s));

    vm.delete_global_var(h);
    vm.gc_full();
    assert!(!vm.objs.is_obj_id_valid(s));
}

#[test]
fn object_cap_reports_out_of_memory_after_collection() {
    let mut vm = Vm::with_config(
        tale_runtime::VmConfig::from_toml("max_objects = 8\ngc_enabled = false\n").unwrap(),
    );
    let root = vm.create_global_var();
    let keep = vm.new_record(vec![]).unwrap();
    vm.global_set(root, Value::Obj(keep));

    // garbage keeps getting reclaimed by the retry collection, so the
    // cap is only hit once live objects genuinely fill it
    for _ in 0..32 {
        vm.new_record(vec![]).unwrap();
    }

    let p = PropId(1);
    let mut last = keep;
    let err = loop {
        match vm.new_record(vec![]) {
            Ok(id) => {
                vm.set_prop(last, p, Value::Obj(id)).unwrap();
                last = id;
            }
            Err(e) => break e,
        }
    };
    assert!(matches!(err, VmError::OutOfMemory));
}

#[test]
fn scratch_registers_are_limited_and_recycled() {
    let vm = Vm::with_config(
        tale_runtime::VmConfig::from_toml("scratch_registers = 2\nscratch_register_bytes = 8\n")
            .unwrap(),
    );
    let r1 = vm.scratch.acquire().unwrap();
    let _r2 = vm.scratch.acquire().unwrap();
    assert!(vm.scratch.acquire().is_err());
    drop(r1);
    assert!(vm.scratch.acquire().is_ok());
}

#[test]
fn internal_state_tracks_the_gc_lattice() {
    let mut vm = Vm::new();
    let root = vm.create_global_var();
    let a = vm.new_record(vec![]).unwrap();
    vm.global_set(root, Value::Obj(a));
    let b = vm.new_record(vec![]).unwrap();

    vm.gc_full();
    // a: allocated + Reachable(2 << 4); b: deleted
    assert_eq!(vm.objs.internal_state(a), 0x21);
    assert_eq!(vm.objs.internal_state(b) & 0x1, 0);
}

#[test]
fn equality_consults_object_overrides_both_ways() {
    let mut vm = Vm::new();
    let a = vm.new_string("same").unwrap();
    let b = vm.new_string("same").unwrap();
    let c = vm.new_string("different").unwrap();

    assert!(vm.equals(&Value::Obj(a), &Value::Obj(b)));
    assert!(!vm.equals(&Value::Obj(a), &Value::Obj(c)));
    assert!(vm.equals(&Value::Int(4), &Value::Int(4)));
    assert!(!vm.equals(&Value::Int(4), &Value::Enum(4)));

    let l1 = vm.new_list(vec![Value::Obj(a), Value::Int(1)]).unwrap();
    let l2 = vm.new_list(vec![Value::Obj(b), Value::Int(1)]).unwrap();
    assert!(vm.equals(&Value::Obj(l1), &Value::Obj(l2)));
}

#[test]
fn enable_gc_suppresses_automatic_collection() {
    let mut vm = Vm::with_config(tale_runtime::VmConfig::from_toml("gc_max_allocs = 8\n").unwrap());
    let was = vm.enable_gc(false);
    assert!(was);

    let mut ids = Vec::new();
    for _ in 0..64 {
        ids.push(vm.new_string("pinned by disabled gc").unwrap());
    }
    // nothing was collected while disabled
    for &id in &ids {
        assert!(vm.objs.is_obj_id_valid(id));
    }

    vm.enable_gc(true);
    vm.gc_full();
    for &id in &ids {
        assert!(!vm.objs.is_obj_id_valid(id));
    }
}
