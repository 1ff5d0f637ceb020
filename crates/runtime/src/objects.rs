//! Built-in metaclasses: record objects, strings, lists, and the
//! comparator wrapper.
//!
//! A record object is the general-purpose mutable object: a superclass
//! list plus a property map, fully undoable and saveable. Strings and
//! lists are immutable once created; strings hold no references at all,
//! lists hold strong references to their elements. The comparator
//! wrapper gives a [`StringComparator`] an object identity so
//! dictionaries and grammar rules can share it by id.

use std::any::Any;
use std::collections::BTreeMap;

use tale_core::{EquivMapping, ObjId, PropId, StringComparator, Value};

use crate::error::{VmError, VmResult};
use crate::image::{put_dataholder, put_u8, put_u16, put_u32, Cursor};
use crate::meta::{Metaclass, MetaRegistry, VmObject};
use crate::save::FixupTable;
use crate::undo::{UndoKey, UndoRecord};
use crate::vm::Vm;

pub const RECORD_META: &str = "tale-object/030005";
pub const STRING_META: &str = "string/030008";
pub const LIST_META: &str = "list/030008";
pub const STRCOMP_META: &str = "string-comparator/030000";

// --- record object --------------------------------------------------------

/// Mutable object with a superclass list and a property map. Property
/// writes emit undo deltas when the object participates in undo.
#[derive(Default)]
pub struct RecordObject {
    superclasses: Vec<ObjId>,
    props: BTreeMap<PropId, Value>,
    modified: bool,
}

impl RecordObject {
    pub fn new(superclasses: Vec<ObjId>) -> Self {
        RecordObject {
            superclasses,
            props: BTreeMap::new(),
            modified: false,
        }
    }

    pub fn prop(&self, prop: PropId) -> Option<Value> {
        self.props.get(&prop).copied()
    }

    pub fn prop_count(&self) -> usize {
        self.props.len()
    }
}

impl VmObject for RecordObject {
    fn metaclass_name(&self) -> &'static str {
        RECORD_META
    }

    fn get_prop(&self, prop: PropId) -> Option<Value> {
        self.props.get(&prop).copied()
    }

    fn superclasses(&self) -> &[ObjId] {
        &self.superclasses
    }

    fn set_prop(&mut self, vm: &mut Vm, self_id: ObjId, prop: PropId, val: Value) -> VmResult<()> {
        let old = self.props.get(&prop).copied().unwrap_or(Value::Empty);
        vm.undo
            .add_record(&mut vm.objs, self_id, UndoKey::Prop(prop), old);
        self.props.insert(prop, val);
        self.modified = true;
        Ok(())
    }

    fn for_each_ref(&self, f: &mut dyn FnMut(ObjId)) {
        for &sc in &self.superclasses {
            f(sc);
        }
        for v in self.props.values() {
            if let Some(id) = v.as_valid_obj() {
                f(id);
            }
        }
    }

    fn apply_undo(&mut self, _vm: &mut Vm, rec: UndoRecord) -> VmResult<()> {
        if let UndoKey::Prop(prop) = rec.key {
            if rec.old_val == Value::Empty {
                self.props.remove(&prop);
            } else {
                self.props.insert(prop, rec.old_val);
            }
        }
        Ok(())
    }

    fn load_from_image(&mut self, _vm: &mut Vm, _self_id: ObjId, data: &[u8]) -> VmResult<()> {
        let mut cur = Cursor::new(data);
        let sc_count = cur.read_u16()? as usize;
        self.superclasses = (0..sc_count)
            .map(|_| Ok(ObjId(cur.read_u32()?)))
            .collect::<VmResult<_>>()?;
        let prop_count = cur.read_u16()? as usize;
        self.props.clear();
        for _ in 0..prop_count {
            let prop = PropId(cur.read_u16()?);
            let val = cur.read_dataholder()?;
            self.props.insert(prop, val);
        }
        self.modified = false;
        Ok(())
    }

    fn rebuild_image(&self, out: &mut Vec<u8>) -> VmResult<()> {
        put_u16(out, self.superclasses.len() as u16);
        for sc in &self.superclasses {
            put_u32(out, sc.0);
        }
        put_u16(out, self.props.len() as u16);
        for (prop, val) in &self.props {
            put_u16(out, prop.0);
            put_dataholder(out, val)?;
        }
        Ok(())
    }

    fn apply_fixups(&mut self, fixups: &FixupTable) {
        for sc in &mut self.superclasses {
            *sc = fixups.translate(*sc);
        }
        for v in self.props.values_mut() {
            if let Value::Obj(id) = v {
                *id = fixups.translate(*id);
            }
        }
    }

    fn is_changed_since_load(&self) -> bool {
        self.modified
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// --- string object --------------------------------------------------------

/// Immutable UTF-8 string. Equality is by content; holds no references.
pub struct StringObject {
    text: String,
}

impl StringObject {
    pub fn new(text: impl Into<String>) -> Self {
        StringObject { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl VmObject for StringObject {
    fn metaclass_name(&self) -> &'static str {
        STRING_META
    }

    fn load_from_image(&mut self, _vm: &mut Vm, _self_id: ObjId, data: &[u8]) -> VmResult<()> {
        let mut cur = Cursor::new(data);
        let len = cur.read_u16()? as usize;
        let bytes = cur.read_bytes(len)?;
        self.text = std::str::from_utf8(bytes)
            .map_err(|_| VmError::Data("string payload is not valid utf-8".into()))?
            .to_string();
        Ok(())
    }

    fn rebuild_image(&self, out: &mut Vec<u8>) -> VmResult<()> {
        if self.text.len() > u16::MAX as usize {
            return Err(VmError::Data("string too long for image format".into()));
        }
        put_u16(out, self.text.len() as u16);
        out.extend_from_slice(self.text.as_bytes());
        Ok(())
    }

    fn equals(&self, vm: &Vm, other: &Value) -> bool {
        match other {
            Value::Obj(id) => vm
                .objs
                .get_as::<StringObject>(*id)
                .is_some_and(|s| s.text == self.text),
            _ => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// --- list object ----------------------------------------------------------

/// Immutable element vector; equality is element-wise through the VM so
/// nested strings and lists compare by content.
pub struct ListObject {
    elems: Vec<Value>,
}

impl ListObject {
    pub fn new(elems: Vec<Value>) -> Self {
        ListObject { elems }
    }

    pub fn elems(&self) -> &[Value] {
        &self.elems
    }
}

impl VmObject for ListObject {
    fn metaclass_name(&self) -> &'static str {
        LIST_META
    }

    fn for_each_ref(&self, f: &mut dyn FnMut(ObjId)) {
        for v in &self.elems {
            if let Some(id) = v.as_valid_obj() {
                f(id);
            }
        }
    }

    fn load_from_image(&mut self, _vm: &mut Vm, _self_id: ObjId, data: &[u8]) -> VmResult<()> {
        let mut cur = Cursor::new(data);
        let count = cur.read_u16()? as usize;
        self.elems = (0..count).map(|_| cur.read_dataholder()).collect::<VmResult<_>>()?;
        Ok(())
    }

    fn rebuild_image(&self, out: &mut Vec<u8>) -> VmResult<()> {
        put_u16(out, self.elems.len() as u16);
        for v in &self.elems {
            put_dataholder(out, v)?;
        }
        Ok(())
    }

    fn apply_fixups(&mut self, fixups: &FixupTable) {
        for v in &mut self.elems {
            if let Value::Obj(id) = v {
                *id = fixups.translate(*id);
            }
        }
    }

    fn equals(&self, vm: &Vm, other: &Value) -> bool {
        let Value::Obj(id) = other else { return false };
        let Some(other) = vm.objs.get_as::<ListObject>(*id) else {
            return false;
        };
        self.elems.len() == other.elems.len()
            && self
                .elems
                .iter()
                .zip(&other.elems)
                .all(|(a, b)| vm.equals(a, b))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// --- comparator object ----------------------------------------------------

/// Object wrapper around an immutable [`StringComparator`].
///
/// Serialized layout:
///
/// ```text
/// u16 trunc_len
/// u16 flags          (bit 0 = case_sensitive)
/// u16 equiv_count
/// u16 total_value_chars
/// per equivalence:
///   u16 ref_ch
///   u8  value_ch_count
///   u32 uc_result_flags
///   u32 lc_result_flags
///   u16 value_ch[value_ch_count]
/// ```
pub struct StrCompObject {
    cmp: StringComparator,
}

impl StrCompObject {
    pub fn new(cmp: StringComparator) -> Self {
        StrCompObject { cmp }
    }

    pub fn comparator(&self) -> &StringComparator {
        &self.cmp
    }

    fn decode(data: &[u8]) -> VmResult<StringComparator> {
        let mut cur = Cursor::new(data);
        let trunc_len = cur.read_u16()? as usize;
        let flags = cur.read_u16()?;
        let equiv_cnt = cur.read_u16()? as usize;
        let total_chars = cur.read_u16()? as usize;
        let mut mappings = Vec::with_capacity(equiv_cnt);
        let mut seen_chars = 0usize;
        for _ in 0..equiv_cnt {
            let ref_ch = decode_char(cur.read_u16()?)?;
            let count = cur.read_u8()? as usize;
            let uc_result_flags = cur.read_u32()?;
            let lc_result_flags = cur.read_u32()?;
            let val_ch = (0..count)
                .map(|_| decode_char(cur.read_u16()?))
                .collect::<VmResult<Vec<char>>>()?;
            seen_chars += count;
            mappings.push((
                ref_ch,
                EquivMapping {
                    val_ch,
                    uc_result_flags,
                    lc_result_flags,
                },
            ));
        }
        if seen_chars != total_chars {
            return Err(VmError::Data(format!(
                "comparator mapping char count mismatch: header {total_chars}, actual {seen_chars}"
            )));
        }
        Ok(StringComparator::new(trunc_len, flags & 0x0001 != 0, mappings)?)
    }
}

fn decode_char(unit: u16) -> VmResult<char> {
    char::from_u32(unit as u32)
        .ok_or_else(|| VmError::Data(format!("surrogate code unit {unit:#06x} in comparator")))
}

impl VmObject for StrCompObject {
    fn metaclass_name(&self) -> &'static str {
        STRCOMP_META
    }

    fn load_from_image(&mut self, _vm: &mut Vm, _self_id: ObjId, data: &[u8]) -> VmResult<()> {
        self.cmp = Self::decode(data)?;
        Ok(())
    }

    fn rebuild_image(&self, out: &mut Vec<u8>) -> VmResult<()> {
        put_u16(out, self.cmp.trunc_len() as u16);
        put_u16(out, if self.cmp.case_sensitive() { 0x0001 } else { 0x0000 });
        put_u16(out, self.cmp.equiv_count() as u16);
        let mut total = 0usize;
        self.cmp.for_each_mapping(|_, m| total += m.val_ch.len());
        put_u16(out, total as u16);
        self.cmp.for_each_mapping(|ref_ch, m| {
            put_u16(out, ref_ch as u16);
            put_u8(out, m.val_ch.len() as u8);
            put_u32(out, m.uc_result_flags);
            put_u32(out, m.lc_result_flags);
            for &c in &m.val_ch {
                put_u16(out, c as u16);
            }
        });
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// --- registration ---------------------------------------------------------

fn create_record(vm: &mut Vm, id: ObjId) {
    vm.objs.install(id, Box::new(RecordObject::default()));
    vm.objs.set_gc_hints(id, true, false);
}

fn create_string(vm: &mut Vm, id: ObjId) {
    vm.objs.install(id, Box::new(StringObject::new("")));
    vm.objs.set_gc_hints(id, false, false);
}

fn create_list(vm: &mut Vm, id: ObjId) {
    vm.objs.install(id, Box::new(ListObject::new(Vec::new())));
    vm.objs.set_gc_hints(id, true, false);
}

fn create_strcomp(vm: &mut Vm, id: ObjId) {
    vm.objs
        .install(id, Box::new(StrCompObject::new(StringComparator::exact())));
    vm.objs.set_gc_hints(id, false, false);
}

/// Register the built-in metaclasses a fresh VM always carries.
pub fn register_builtins(reg: &mut MetaRegistry) {
    reg.register(Metaclass {
        name: RECORD_META,
        create_for_image_load: create_record,
        create_for_restore: create_record,
    });
    reg.register(Metaclass {
        name: STRING_META,
        create_for_image_load: create_string,
        create_for_restore: create_string,
    });
    reg.register(Metaclass {
        name: LIST_META,
        create_for_image_load: create_list,
        create_for_restore: create_list,
    });
    reg.register(Metaclass {
        name: STRCOMP_META,
        create_for_image_load: create_strcomp,
        create_for_restore: create_strcomp,
    });
    crate::dict::register(reg);
    crate::gramprod::register(reg);
}
