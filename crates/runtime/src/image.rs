//! Image-file reading and rebuilding.
//!
//! All multi-byte integers in image and saved-state files are
//! little-endian; the [`Cursor`] abstracts reads over a byte slice with
//! explicit truncation errors, and the `put_*` helpers build payloads.
//!
//! The container is a `TVMI` header, a metaclass dependency table, a
//! sequence of `OBJS` blocks (each tied to one metaclass and carrying
//! id+payload pairs), and an end marker. Payload layouts are defined by
//! each metaclass.

use tale_core::{ObjId, Value};
use tracing::debug;

use crate::error::{VmError, VmResult};
use crate::vm::Vm;

pub const IMAGE_MAGIC: [u8; 4] = *b"TVMI";
pub const IMAGE_VERSION: u16 = 1;
const BLOCK_OBJS: [u8; 4] = *b"OBJS";
const BLOCK_EOF: [u8; 4] = *b"EOF ";

/// Byte-slice reader with bounds-checked little-endian accessors.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> VmResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(VmError::Data(format!(
                "truncated data: wanted {n} bytes at offset {}",
                self.pos
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> VmResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> VmResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i16(&mut self) -> VmResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> VmResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> VmResult<&'a [u8]> {
        self.take(n)
    }

    pub fn read_tag(&mut self) -> VmResult<[u8; 4]> {
        let b = self.take(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// A length-prefixed UTF-8 string (u8 length).
    pub fn read_short_str(&mut self) -> VmResult<&'a str> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| VmError::Data("invalid utf-8 string".into()))
    }

    pub fn read_dataholder(&mut self) -> VmResult<Value> {
        let b = self.take(5)?;
        Value::from_dataholder(&[b[0], b[1], b[2], b[3], b[4]])
            .ok_or_else(|| VmError::Data(format!("unknown dataholder tag {}", b[0])))
    }
}

// --- payload writers -----------------------------------------------------

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i16(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    out.extend_from_slice(v);
}

pub fn put_short_str(out: &mut Vec<u8>, s: &str) -> VmResult<()> {
    if s.len() > 255 {
        return Err(VmError::Data(format!("string too long for format: {} bytes", s.len())));
    }
    put_u8(out, s.len() as u8);
    put_bytes(out, s.as_bytes());
    Ok(())
}

pub fn put_dataholder(out: &mut Vec<u8>, v: &Value) -> VmResult<()> {
    let dh = v
        .to_dataholder()
        .ok_or_else(|| VmError::Data("value has no portable form".into()))?;
    out.extend_from_slice(&dh);
    Ok(())
}

// --- image container ------------------------------------------------------

/// Load an entire image into a fresh VM: link the dependency table,
/// create every object at its image id in the root set, load payloads,
/// remember root payload snapshots for restart, then run post-load
/// initialization.
///
/// Configuration errors (unknown metaclasses, bad headers) are reported
/// before any object is created. A data error partway through load
/// leaves the VM unusable; the host discards it.
pub fn load_image(vm: &mut Vm, data: &[u8]) -> VmResult<()> {
    let mut cur = Cursor::new(data);
    if cur.read_tag()? != IMAGE_MAGIC {
        return Err(VmError::BadFormat("not an image file".into()));
    }
    let version = cur.read_u16()?;
    if version > IMAGE_VERSION {
        return Err(VmError::BadFormat(format!("unsupported image version {version}")));
    }

    // link the dependency table before creating anything
    let dep_count = cur.read_u16()? as usize;
    let mut deps = Vec::with_capacity(dep_count);
    for _ in 0..dep_count {
        let name = cur.read_short_str()?;
        deps.push(vm.meta.link(name)?);
    }

    // parse the block structure up front as well
    struct PendingObj<'a> {
        meta_idx: usize,
        id: ObjId,
        payload: &'a [u8],
    }
    let mut pending: Vec<PendingObj<'_>> = Vec::new();
    loop {
        let tag = cur.read_tag()?;
        if tag == BLOCK_EOF {
            break;
        }
        if tag != BLOCK_OBJS {
            return Err(VmError::BadFormat(format!("unknown block tag {tag:?}")));
        }
        let dep_idx = cur.read_u16()? as usize;
        let meta_idx = *deps
            .get(dep_idx)
            .ok_or_else(|| VmError::BadFormat(format!("metaclass index {dep_idx} out of range")))?;
        let count = cur.read_u16()? as usize;
        for _ in 0..count {
            let id = ObjId(cur.read_u32()?);
            let len = cur.read_u32()? as usize;
            let payload = cur.read_bytes(len)?;
            pending.push(PendingObj { meta_idx, id, payload });
        }
    }

    debug!(objects = pending.len(), "loading image");

    for p in &pending {
        vm.objs.alloc_with_id(p.id, true, true, true)?;
        let create = vm.meta.get(p.meta_idx).create_for_image_load;
        create(vm, p.id);
        vm.with_obj(p.id, |obj, vm| obj.load_from_image(vm, p.id, p.payload))??;
        vm.objs.save_image_snapshot(p.id, p.payload);
    }

    vm.do_all_post_load_init()
}

/// Write the current live, non-transient objects back out as an image.
/// Immutable metaclasses reproduce their original payload byte for byte.
pub fn rebuild_image(vm: &Vm) -> VmResult<Vec<u8>> {
    let mut out = Vec::new();
    put_bytes(&mut out, &IMAGE_MAGIC);
    put_u16(&mut out, IMAGE_VERSION);

    // gather objects per registered metaclass
    let mut by_meta: Vec<Vec<ObjId>> = vec![Vec::new(); vm.meta.len()];
    for id in vm.objs.used_ids() {
        if vm.objs.is_transient(id) {
            continue;
        }
        let Some(obj) = vm.objs.try_get(id) else { continue };
        if let Some(mi) = vm.meta.index_for(obj) {
            by_meta[mi].push(id);
        }
    }

    // dependency table: only metaclasses that have instances
    let used: Vec<usize> = (0..vm.meta.len()).filter(|&i| !by_meta[i].is_empty()).collect();
    put_u16(&mut out, used.len() as u16);
    for &mi in &used {
        put_short_str(&mut out, vm.meta.get(mi).name)?;
    }

    for (dep_idx, &mi) in used.iter().enumerate() {
        put_bytes(&mut out, &BLOCK_OBJS);
        put_u16(&mut out, dep_idx as u16);
        put_u16(&mut out, by_meta[mi].len() as u16);
        for &id in &by_meta[mi] {
            let mut payload = Vec::new();
            vm.objs.get(id).rebuild_image(&mut payload)?;
            put_u32(&mut out, id.0);
            put_u32(&mut out, payload.len() as u32);
            put_bytes(&mut out, &payload);
        }
    }

    put_bytes(&mut out, &BLOCK_EOF);
    Ok(out)
}
