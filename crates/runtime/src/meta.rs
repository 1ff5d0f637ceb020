//! Metaclasses: first-class descriptions of kinds of objects.
//!
//! Each metaclass has a globally unique `name/version` string (the link
//! between image files and in-process implementations), factory functions
//! for the ways an instance can come into being, and an instance-side
//! interface — the [`VmObject`] trait — that the object table stores as a
//! trait object per slot. The object-id indirection plus this trait is
//! the only polymorphism mechanism; hosts can register further
//! metaclasses at startup.

use std::any::Any;

use tale_core::{ObjId, PropId, Value};

use crate::error::{VmError, VmResult};
use crate::objtable::DeadSet;
use crate::save::FixupTable;
use crate::undo::UndoRecord;
use crate::vm::Vm;

/// Factory: install a fresh, empty instance into an already-allocated
/// slot and set its GC hint bits.
pub type CreateFn = fn(&mut Vm, ObjId);

/// A registered metaclass.
pub struct Metaclass {
    /// Globally unique name with embedded version, e.g.
    /// `"dictionary2/030001"`.
    pub name: &'static str,
    /// Create an instance about to be loaded from an image file.
    pub create_for_image_load: CreateFn,
    /// Create an instance about to be restored from a saved state.
    pub create_for_restore: CreateFn,
}

impl Metaclass {
    /// The name without its version suffix.
    pub fn base_name(&self) -> &'static str {
        split_name(self.name).0
    }

    pub fn version(&self) -> u32 {
        split_name(self.name).1
    }
}

/// Split `"dictionary2/030001"` into `("dictionary2", 30001)`. A missing
/// or malformed version reads as zero.
pub fn split_name(name: &str) -> (&str, u32) {
    match name.split_once('/') {
        Some((base, ver)) => (base, ver.parse().unwrap_or(0)),
        None => (name, 0),
    }
}

/// Process-wide metaclass registry.
#[derive(Default)]
pub struct MetaRegistry {
    metas: Vec<Metaclass>,
}

impl MetaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metaclass; later registrations of the same base name
    /// shadow earlier ones.
    pub fn register(&mut self, meta: Metaclass) -> usize {
        self.metas.push(meta);
        self.metas.len() - 1
    }

    pub fn get(&self, idx: usize) -> &Metaclass {
        &self.metas[idx]
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Registry index for an instance, by its metaclass name.
    pub fn index_for(&self, obj: &dyn VmObject) -> Option<usize> {
        let base = split_name(obj.metaclass_name()).0;
        self.metas.iter().rposition(|m| m.base_name() == base)
    }

    /// Link a name+version requested by an image or save file to a
    /// registered metaclass. The base name must match exactly and the
    /// registered version must be at least the requested one.
    pub fn link(&self, requested: &str) -> VmResult<usize> {
        let (base, version) = split_name(requested);
        let idx = self
            .metas
            .iter()
            .rposition(|m| m.base_name() == base)
            .ok_or_else(|| VmError::UnknownMetaclass(requested.to_string()))?;
        let registered = self.metas[idx].version();
        if registered < version {
            return Err(VmError::MetaclassVersion {
                name: base.to_string(),
                requested: version,
                registered,
            });
        }
        Ok(idx)
    }
}

/// The per-instance interface every metaclass implements.
///
/// Instances are stored in object-table slots as boxed trait objects and
/// addressed by object id. Methods that need the rest of the VM receive
/// `&mut Vm`; the table temporarily lifts the instance out of its slot
/// while such a method runs, so the instance never aliases the table it
/// is called against.
pub trait VmObject: Any {
    /// The owning metaclass's registered name string.
    fn metaclass_name(&self) -> &'static str;

    // --- property interface ---------------------------------------------

    /// Directly-defined property value, without inheritance.
    fn get_prop(&self, _prop: PropId) -> Option<Value> {
        None
    }

    /// Superclass list, for inherited property search.
    fn superclasses(&self) -> &[ObjId] {
        &[]
    }

    /// Set a property. Undoable metaclasses record the old value with the
    /// undo log before storing; immutable ones refuse.
    fn set_prop(&mut self, _vm: &mut Vm, _self_id: ObjId, prop: PropId, _val: Value) -> VmResult<()> {
        Err(VmError::ImmutableProperty(prop))
    }

    // --- garbage collection ---------------------------------------------

    /// Report every strong outgoing object reference. Only called when
    /// the slot's can-have-refs hint is set.
    fn for_each_ref(&self, _f: &mut dyn FnMut(ObjId)) {}

    /// Drop weak references to objects about to be deleted. Only called
    /// when the slot's can-have-weak-refs hint is set.
    fn remove_stale_weak_refs(&mut self, _dead: &DeadSet) {}

    // --- undo -------------------------------------------------------------

    /// A new savepoint is now in effect.
    fn notify_new_savepoint(&mut self) {}

    /// Roll this object back per one undo record it emitted.
    fn apply_undo(&mut self, _vm: &mut Vm, _rec: UndoRecord) -> VmResult<()> {
        Ok(())
    }

    /// An undo record of this object is being discarded unapplied.
    fn discard_undo(&mut self, _rec: &UndoRecord) {}

    /// Report strong references held by one of this object's undo
    /// records. The default traces the old value's object reference.
    fn mark_undo_ref(&self, rec: &UndoRecord, f: &mut dyn FnMut(ObjId)) {
        if let Some(id) = rec.old_val.as_valid_obj() {
            f(id);
        }
    }

    /// Drop weak references inside one of this object's undo records.
    fn remove_stale_undo_weak_ref(&self, _rec: &mut UndoRecord, _dead: &DeadSet) {}

    // --- finalization -----------------------------------------------------

    fn has_finalizer(&self) -> bool {
        false
    }

    /// Run the finalizer. Errors are swallowed by the caller.
    fn invoke_finalizer(&mut self, _vm: &mut Vm, _self_id: ObjId) -> VmResult<()> {
        Ok(())
    }

    // --- image files ------------------------------------------------------

    /// Initialize from an image-file payload.
    fn load_from_image(&mut self, vm: &mut Vm, self_id: ObjId, data: &[u8]) -> VmResult<()>;

    /// Reinitialize from the image payload on restart. Defaults to a
    /// plain reload.
    fn reload_from_image(&mut self, vm: &mut Vm, self_id: ObjId, data: &[u8]) -> VmResult<()> {
        self.load_from_image(vm, self_id, data)
    }

    /// Write the image payload for the current state.
    fn rebuild_image(&self, out: &mut Vec<u8>) -> VmResult<()>;

    // --- saved states -----------------------------------------------------

    /// Write the saved-state body; defaults to the image payload form.
    fn save_to_stream(&self, out: &mut Vec<u8>) -> VmResult<()> {
        self.rebuild_image(out)
    }

    /// Read the saved-state body; defaults to the image payload form.
    fn restore_from_stream(&mut self, vm: &mut Vm, self_id: ObjId, data: &[u8]) -> VmResult<()> {
        self.load_from_image(vm, self_id, data)
    }

    /// Rewrite object ids through the restore fixup table.
    fn apply_fixups(&mut self, _fixups: &FixupTable) {}

    /// Whether the object differs from its image-file state. Unmodified
    /// root objects are skipped by save.
    fn is_changed_since_load(&self) -> bool {
        false
    }

    // --- post-load initialization ----------------------------------------

    /// Called once per load/restart/restore if the object requested it.
    fn post_load_init(&mut self, _vm: &mut Vm, _self_id: ObjId) -> VmResult<()> {
        Ok(())
    }

    // --- equality ---------------------------------------------------------

    /// Value equality beyond object identity (identity is handled before
    /// this is consulted).
    fn equals(&self, _vm: &Vm, _other: &Value) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_splitting() {
        assert_eq!(split_name("dictionary2/030001"), ("dictionary2", 30001));
        assert_eq!(split_name("string-comparator/030000"), ("string-comparator", 30000));
        assert_eq!(split_name("bare"), ("bare", 0));
    }

    fn dummy_create(_vm: &mut Vm, _id: ObjId) {}

    fn registry_with(name: &'static str) -> MetaRegistry {
        let mut reg = MetaRegistry::new();
        reg.register(Metaclass {
            name,
            create_for_image_load: dummy_create,
            create_for_restore: dummy_create,
        });
        reg
    }

    #[test]
    fn link_matches_base_name_and_version() {
        let reg = registry_with("dictionary2/030001");
        assert_eq!(reg.link("dictionary2/030001").unwrap(), 0);
        assert_eq!(reg.link("dictionary2/030000").unwrap(), 0);
        assert!(matches!(
            reg.link("dictionary2/030002"),
            Err(VmError::MetaclassVersion { .. })
        ));
        assert!(matches!(
            reg.link("lexicon/030001"),
            Err(VmError::UnknownMetaclass(_))
        ));
    }
}
