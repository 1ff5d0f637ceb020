//! Saved-state files: save, restore, and reset-to-image.
//!
//! A save holds only the saveable objects: not free, not transient, and
//! either dynamic or changed since image load. Restore snapshots the
//! current state to a memory buffer first, resets to the image, then
//! reallocates and reloads the saved objects; any data error rolls the
//! VM back to the snapshot with no user-visible effect.
//!
//! Saved ids are kept where possible. When a saved id is unavailable a
//! fresh id is allocated and recorded in the fixup table, and every
//! restored object rewrites its dataholders through that table at the
//! end.

use std::collections::HashMap;
use std::io::{Read, Write};

use tale_core::ObjId;
use tracing::debug;

use crate::error::{VmError, VmResult};
use crate::image::{put_bytes, put_short_str, put_u16, put_u32, Cursor};
use crate::vm::Vm;

pub const SAVE_MAGIC: [u8; 4] = *b"TSAV";
pub const SAVE_VERSION: u16 = 1;

/// Old-id to new-id translation built during restore.
#[derive(Debug, Default)]
pub struct FixupTable {
    map: HashMap<ObjId, ObjId>,
}

impl FixupTable {
    pub fn add(&mut self, old: ObjId, new: ObjId) {
        self.map.insert(old, new);
    }

    /// Translate an id; ids without an entry pass through unchanged.
    pub fn translate(&self, id: ObjId) -> ObjId {
        self.map.get(&id).copied().unwrap_or(id)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Serialize the current state to a byte buffer.
pub fn save_to_vec(vm: &Vm) -> VmResult<Vec<u8>> {
    let mut out = Vec::new();
    put_bytes(&mut out, &SAVE_MAGIC);
    put_u16(&mut out, SAVE_VERSION);

    // collect the saveable objects and the metaclasses they use
    let mut meta_indices: Vec<usize> = Vec::new();
    let mut objects: Vec<(ObjId, usize)> = Vec::new();
    for id in vm.objs.used_ids() {
        if !vm.objs.is_obj_saveable(id) {
            continue;
        }
        let Some(obj) = vm.objs.try_get(id) else { continue };
        let Some(mi) = vm.meta.index_for(obj) else {
            return Err(VmError::Data(format!("object {id} has no registered metaclass")));
        };
        let local = match meta_indices.iter().position(|&m| m == mi) {
            Some(i) => i,
            None => {
                meta_indices.push(mi);
                meta_indices.len() - 1
            }
        };
        objects.push((id, local));
    }

    put_u16(&mut out, meta_indices.len() as u16);
    for &mi in &meta_indices {
        put_short_str(&mut out, vm.meta.get(mi).name)?;
    }

    put_u32(&mut out, objects.len() as u32);
    for &(id, local) in &objects {
        let mut body = Vec::new();
        vm.objs.get(id).save_to_stream(&mut body)?;
        put_u32(&mut out, id.0);
        put_u16(&mut out, local as u16);
        put_u32(&mut out, body.len() as u32);
        put_bytes(&mut out, &body);
    }

    debug!(objects = objects.len(), bytes = out.len(), "state saved");
    Ok(out)
}

pub fn save(vm: &Vm, out: &mut dyn Write) -> VmResult<()> {
    let buf = save_to_vec(vm)?;
    out.write_all(&buf)?;
    Ok(())
}

/// Restore from a byte buffer, rolling back to the pre-restore state on
/// any error.
pub fn restore_from_slice(vm: &mut Vm, data: &[u8]) -> VmResult<()> {
    let snapshot = save_to_vec(vm)?;
    match restore_inner(vm, data) {
        Ok(()) => Ok(()),
        Err(err) => {
            // the snapshot came from a consistent state; a failure here
            // is unrecoverable and surfaces instead of the original
            restore_inner(vm, &snapshot)?;
            Err(err)
        }
    }
}

pub fn restore(vm: &mut Vm, input: &mut dyn Read) -> VmResult<()> {
    let mut data = Vec::new();
    input.read_to_end(&mut data)?;
    restore_from_slice(vm, &data)
}

fn restore_inner(vm: &mut Vm, data: &[u8]) -> VmResult<()> {
    let mut cur = Cursor::new(data);
    if cur.read_tag()? != SAVE_MAGIC {
        return Err(VmError::BadFormat("not a saved-state file".into()));
    }
    let version = cur.read_u16()?;
    if version > SAVE_VERSION {
        return Err(VmError::BadFormat(format!("unsupported save version {version}")));
    }

    // link the metaclass table before touching any state
    let meta_count = cur.read_u16()? as usize;
    let mut metas = Vec::with_capacity(meta_count);
    for _ in 0..meta_count {
        let name = cur.read_short_str()?;
        metas.push(vm.meta.link(name)?);
    }

    struct SavedObj<'a> {
        id: ObjId,
        meta_idx: usize,
        body: &'a [u8],
    }
    let obj_count = cur.read_u32()? as usize;
    let mut saved = Vec::with_capacity(obj_count);
    for _ in 0..obj_count {
        let id = ObjId(cur.read_u32()?);
        let local = cur.read_u16()? as usize;
        let meta_idx = *metas
            .get(local)
            .ok_or_else(|| VmError::Data(format!("metaclass index {local} out of range")))?;
        let len = cur.read_u32()? as usize;
        let body = cur.read_bytes(len)?;
        saved.push(SavedObj { id, meta_idx, body });
    }

    // back to the initial image state, then bring the saved objects in
    vm.reset_to_image()?;

    let mut fixups = FixupTable::default();
    let mut created: Vec<(ObjId, usize, &[u8])> = Vec::with_capacity(saved.len());
    for s in &saved {
        let target = if !vm.objs.is_obj_id_valid(s.id) {
            vm.objs.alloc_with_id(s.id, false, true, true)?;
            s.id
        } else if vm.objs.is_in_root_set(s.id) {
            // a modified root object restores into its own slot
            s.id
        } else {
            let fresh = vm.objs.alloc(false, true, true);
            fixups.add(s.id, fresh);
            fresh
        };
        let create = vm.meta.get(s.meta_idx).create_for_restore;
        create(vm, target);
        created.push((target, s.meta_idx, s.body));
    }

    for &(id, _, body) in &created {
        vm.with_obj(id, |obj, vm| obj.restore_from_stream(vm, id, body))??;
    }

    // dataholders in the bodies refer to saved ids; rewrite them
    for &(id, _, _) in &created {
        vm.objs.get_mut(id).apply_fixups(&fixups);
    }

    debug!(objects = created.len(), renumbered = !fixups.is_empty(), "state restored");

    vm.do_all_post_load_init()
}
