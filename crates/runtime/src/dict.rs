//! The dictionary: tokens to `(object, defining-property)` associations.
//!
//! In-memory state is a hash table keyed by comparator hash plus a trie
//! for spelling correction; both are rebuilt from image and saved-state
//! data, never serialized — only the associations are. Word
//! associations are weak: the collector's sweep drops pairs whose object
//! is going away. The comparator reference is strong.
//!
//! Mutations participate in undo through owner-opaque record payloads
//! that `apply_undo` reverses.

use std::any::Any;
use std::collections::BTreeSet;

use tale_core::{ObjId, PropId, StringComparator, Value};

use crate::error::{VmError, VmResult};
use crate::image::{put_u8, put_u16, put_u32, Cursor};
use crate::meta::{Metaclass, MetaRegistry, VmObject};
use crate::objects::StrCompObject;
use crate::objtable::{DeadSet, ObjTable};
use crate::save::FixupTable;
use crate::undo::{UndoExt, UndoKey, UndoRecord};
use crate::vm::Vm;

pub const DICT_META: &str = "dictionary2/030001";

/// Keys in image files are XOR'ed byte-wise with this, nothing more than
/// light obfuscation against casual browsing.
const KEY_XOR: u8 = 0xBD;

const BUCKET_COUNT: usize = 256;

/// Comparator for an id, when it names a comparator object.
pub(crate) fn comparator_of(objs: &ObjTable, id: ObjId) -> Option<&StringComparator> {
    objs.get_as::<StrCompObject>(id).map(|o| o.comparator())
}

/// Hash used when no comparator is installed: the same additive fold the
/// comparator family uses, with no folding or substitution.
pub(crate) fn fallback_hash(s: &str) -> u16 {
    s.chars().fold(0u32, |h, c| (h + c as u32) & 0xFFFF) as u16
}

// --- undo payload ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DictUndoAction {
    /// A word was added; undo deletes it.
    Add,
    /// A word was deleted; undo adds it back.
    Del,
    /// The comparator changed; the old one rides in the record value.
    SetComparator,
}

#[derive(Debug)]
struct DictUndo {
    action: DictUndoAction,
    word: String,
    obj: ObjId,
    prop: PropId,
}

impl UndoExt for DictUndo {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// --- trie -----------------------------------------------------------------

#[derive(Default)]
struct TrieNode {
    edges: Vec<(char, TrieNode)>,
    word_count: usize,
}

impl TrieNode {
    fn add(&mut self, chars: &[char]) {
        match chars.split_first() {
            None => self.word_count += 1,
            Some((&ch, rest)) => {
                let child = match self.edges.iter_mut().position(|(c, _)| *c == ch) {
                    Some(i) => &mut self.edges[i].1,
                    None => {
                        self.edges.push((ch, TrieNode::default()));
                        &mut self.edges.last_mut().expect("just pushed").1
                    }
                };
                child.add(rest);
            }
        }
    }

    /// Remove one instance of a word; true if this subtree became empty.
    fn del(&mut self, chars: &[char]) -> bool {
        match chars.split_first() {
            None => {
                self.word_count = self.word_count.saturating_sub(1);
            }
            Some((&ch, rest)) => {
                if let Some(i) = self.edges.iter().position(|(c, _)| *c == ch) {
                    if self.edges[i].1.del(rest) {
                        self.edges.remove(i);
                    }
                }
            }
        }
        self.word_count == 0 && self.edges.is_empty()
    }

    fn search(
        &self,
        cmp: Option<&StringComparator>,
        rest: &[char],
        edits_left: usize,
        path: &mut String,
        out: &mut BTreeSet<String>,
    ) {
        if rest.is_empty() && self.word_count > 0 {
            out.insert(path.clone());
        }
        // extra input character: drop it and retry from this node
        if edits_left > 0 && !rest.is_empty() {
            self.search(cmp, &rest[1..], edits_left - 1, path, out);
        }
        for (ch, child) in &self.edges {
            path.push(*ch);
            let consumed = match cmp {
                Some(c) => c.match_chars(rest, *ch),
                None => usize::from(rest.first() == Some(ch)),
            };
            if consumed > 0 {
                child.search(cmp, &rest[consumed..], edits_left, path, out);
            } else if edits_left > 0 {
                // substituted character
                if !rest.is_empty() {
                    child.search(cmp, &rest[1..], edits_left - 1, path, out);
                }
                // missing character: descend without consuming input
                child.search(cmp, rest, edits_left - 1, path, out);
            }
            path.pop();
        }
    }
}

// --- the dictionary -------------------------------------------------------

struct DictEntry {
    key: String,
    items: Vec<(ObjId, PropId)>,
}

/// Image entries parsed but not yet installed; installation waits for
/// post-load init so the comparator object is guaranteed to exist.
struct StagedImage {
    comparator: ObjId,
    entries: Vec<(String, Vec<(ObjId, PropId)>)>,
}

pub struct Dictionary {
    comparator: ObjId,
    buckets: Vec<Vec<DictEntry>>,
    trie: TrieNode,
    modified: bool,
    staged: Option<StagedImage>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Dictionary {
            comparator: ObjId::INVALID,
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            trie: TrieNode::default(),
            modified: false,
            staged: None,
        }
    }
}

impl Dictionary {
    pub fn comparator_id(&self) -> ObjId {
        self.comparator
    }

    fn hash_of(&self, objs: &ObjTable, s: &str) -> u16 {
        match comparator_of(objs, self.comparator) {
            Some(cmp) => cmp.calc_hash(s),
            None => fallback_hash(s),
        }
    }

    fn bucket_of(&self, objs: &ObjTable, s: &str) -> usize {
        self.hash_of(objs, s) as usize % BUCKET_COUNT
    }

    /// Install an association without touching undo.
    fn add_word_raw(&mut self, objs: &ObjTable, word: &str, obj: ObjId, prop: PropId) {
        let b = self.bucket_of(objs, word);
        let bucket = &mut self.buckets[b];
        let entry = match bucket.iter_mut().position(|e| e.key == word) {
            Some(i) => &mut bucket[i],
            None => {
                bucket.push(DictEntry {
                    key: word.to_string(),
                    items: Vec::new(),
                });
                self.trie.add(&word.chars().collect::<Vec<_>>());
                bucket.last_mut().expect("just pushed")
            }
        };
        if !entry.items.contains(&(obj, prop)) {
            entry.items.push((obj, prop));
        }
    }

    /// Remove an association without touching undo; true if found.
    fn del_word_raw(&mut self, objs: &ObjTable, word: &str, obj: ObjId, prop: PropId) -> bool {
        let b = self.bucket_of(objs, word);
        let bucket = &mut self.buckets[b];
        let Some(i) = bucket.iter().position(|e| e.key == word) else {
            return false;
        };
        let before = bucket[i].items.len();
        bucket[i].items.retain(|&it| it != (obj, prop));
        let found = bucket[i].items.len() != before;
        if bucket[i].items.is_empty() {
            let key = bucket.remove(i).key;
            self.trie.del(&key.chars().collect::<Vec<_>>());
        }
        found
    }

    /// Swap comparators and rehash every entry.
    fn set_comparator_raw(&mut self, objs: &ObjTable, cmp: ObjId) {
        self.comparator = cmp;
        let old: Vec<DictEntry> = self.buckets.iter_mut().flat_map(std::mem::take).collect();
        for e in old {
            let b = self.bucket_of(objs, &e.key);
            self.buckets[b].push(e);
        }
    }

    /// Add a word with undo.
    pub fn add_word(&mut self, vm: &mut Vm, self_id: ObjId, word: &str, obj: ObjId, prop: PropId) {
        vm.undo.add_record(
            &mut vm.objs,
            self_id,
            UndoKey::Ext(Box::new(DictUndo {
                action: DictUndoAction::Add,
                word: word.to_string(),
                obj,
                prop,
            })),
            Value::Nil,
        );
        self.add_word_raw(&vm.objs, word, obj, prop);
        self.modified = true;
    }

    /// Delete a word with undo; true if the association existed.
    pub fn del_word(&mut self, vm: &mut Vm, self_id: ObjId, word: &str, obj: ObjId, prop: PropId) -> bool {
        if !self.del_word_raw(&vm.objs, word, obj, prop) {
            return false;
        }
        vm.undo.add_record(
            &mut vm.objs,
            self_id,
            UndoKey::Ext(Box::new(DictUndo {
                action: DictUndoAction::Del,
                word: word.to_string(),
                obj,
                prop,
            })),
            Value::Nil,
        );
        self.modified = true;
        true
    }

    /// Install a different comparator (or none), with undo; rehashes the
    /// table.
    pub fn set_comparator(&mut self, vm: &mut Vm, self_id: ObjId, cmp: ObjId) -> VmResult<()> {
        if cmp.is_valid() && comparator_of(&vm.objs, cmp).is_none() {
            return Err(VmError::TypeMismatch("string comparator"));
        }
        let old = self.comparator;
        vm.undo.add_record(
            &mut vm.objs,
            self_id,
            UndoKey::Ext(Box::new(DictUndo {
                action: DictUndoAction::SetComparator,
                word: String::new(),
                obj: ObjId::INVALID,
                prop: PropId::INVALID,
            })),
            Value::Obj(old),
        );
        self.set_comparator_raw(&vm.objs, cmp);
        self.modified = true;
        Ok(())
    }

    /// All associations for a token, under comparator equivalence.
    pub fn find(&self, objs: &ObjTable, word: &str) -> Vec<(ObjId, PropId)> {
        let b = self.bucket_of(objs, word);
        let cmp = comparator_of(objs, self.comparator);
        let mut out = Vec::new();
        for entry in &self.buckets[b] {
            let matched = match cmp {
                Some(c) => c.match_strings(word, &entry.key) != 0,
                None => word == entry.key,
            };
            if matched {
                out.extend_from_slice(&entry.items);
            }
        }
        out
    }

    /// The set of vocabulary properties a token is filed under.
    pub fn word_props(&self, objs: &ObjTable, word: &str) -> BTreeSet<PropId> {
        self.find(objs, word).into_iter().map(|(_, p)| p).collect()
    }

    pub fn is_defined(&self, objs: &ObjTable, word: &str, prop: PropId) -> bool {
        self.find(objs, word).iter().any(|&(_, p)| p == prop)
    }

    /// Spelling-correction candidates within `max_edits` of the input,
    /// walking the trie under the comparator's character equivalences.
    pub fn spell_candidates(&self, objs: &ObjTable, word: &str, max_edits: usize) -> Vec<String> {
        let cmp = comparator_of(objs, self.comparator);
        let chars: Vec<char> = word.chars().collect();
        let mut out = BTreeSet::new();
        let mut path = String::new();
        self.trie.search(cmp, &chars, max_edits, &mut path, &mut out);
        out.into_iter().collect()
    }

    /// Entries in deterministic order, for serialization.
    fn sorted_entries(&self) -> Vec<(&str, &[(ObjId, PropId)])> {
        let mut all: Vec<(&str, &[(ObjId, PropId)])> = self
            .buckets
            .iter()
            .flatten()
            .map(|e| (e.key.as_str(), e.items.as_slice()))
            .collect();
        all.sort_by_key(|&(k, _)| k);
        all
    }

    fn encode(&self, out: &mut Vec<u8>) -> VmResult<()> {
        put_u32(out, self.comparator.0);
        let entries = self.sorted_entries();
        put_u16(out, entries.len() as u16);
        for (key, items) in entries {
            if key.len() > 255 {
                return Err(VmError::Data(format!("dictionary key too long: {} bytes", key.len())));
            }
            put_u8(out, key.len() as u8);
            for &b in key.as_bytes() {
                put_u8(out, b ^ KEY_XOR);
            }
            put_u16(out, items.len() as u16);
            for &(obj, prop) in items {
                put_u32(out, obj.0);
                put_u16(out, prop.0);
            }
        }
        Ok(())
    }

    fn decode(data: &[u8]) -> VmResult<StagedImage> {
        let mut cur = Cursor::new(data);
        let comparator = ObjId(cur.read_u32()?);
        let count = cur.read_u16()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = cur.read_u8()? as usize;
            let raw = cur.read_bytes(key_len)?;
            let bytes: Vec<u8> = raw.iter().map(|&b| b ^ KEY_XOR).collect();
            let key = String::from_utf8(bytes)
                .map_err(|_| VmError::Data("dictionary key is not valid utf-8".into()))?;
            let sub = cur.read_u16()? as usize;
            let mut items = Vec::with_capacity(sub);
            for _ in 0..sub {
                let obj = ObjId(cur.read_u32()?);
                let prop = PropId(cur.read_u16()?);
                items.push((obj, prop));
            }
            entries.push((key, items));
        }
        Ok(StagedImage { comparator, entries })
    }
}

impl VmObject for Dictionary {
    fn metaclass_name(&self) -> &'static str {
        DICT_META
    }

    fn for_each_ref(&self, f: &mut dyn FnMut(ObjId)) {
        // the comparator is a strong reference; word associations are
        // weak and deliberately not traced
        if self.comparator.is_valid() {
            f(self.comparator);
        }
    }

    fn remove_stale_weak_refs(&mut self, dead: &DeadSet) {
        let mut dead_keys: Vec<String> = Vec::new();
        for bucket in &mut self.buckets {
            for entry in bucket.iter_mut() {
                entry.items.retain(|&(obj, _)| !dead.is_deletable(obj));
                if entry.items.is_empty() {
                    dead_keys.push(entry.key.clone());
                }
            }
            bucket.retain(|e| !e.items.is_empty());
        }
        for key in dead_keys {
            self.trie.del(&key.chars().collect::<Vec<_>>());
        }
    }

    fn apply_undo(&mut self, vm: &mut Vm, rec: UndoRecord) -> VmResult<()> {
        let UndoKey::Ext(ext) = rec.key else {
            return Ok(());
        };
        let Some(du) = ext.as_any().downcast_ref::<DictUndo>() else {
            return Ok(());
        };
        match du.action {
            DictUndoAction::Add => {
                self.del_word_raw(&vm.objs, &du.word, du.obj, du.prop);
            }
            DictUndoAction::Del => {
                self.add_word_raw(&vm.objs, &du.word, du.obj, du.prop);
            }
            DictUndoAction::SetComparator => {
                let old = rec.old_val.as_obj().unwrap_or(ObjId::INVALID);
                self.set_comparator_raw(&vm.objs, old);
            }
        }
        Ok(())
    }

    fn remove_stale_undo_weak_ref(&self, rec: &mut UndoRecord, dead: &DeadSet) {
        // an add/del record whose association target is going away can
        // never be usefully replayed
        if let UndoKey::Ext(ext) = &rec.key {
            if let Some(du) = ext.as_any().downcast_ref::<DictUndo>() {
                if du.action != DictUndoAction::SetComparator && dead.is_deletable(du.obj) {
                    rec.obj = ObjId::INVALID;
                }
            }
        }
    }

    fn load_from_image(&mut self, vm: &mut Vm, self_id: ObjId, data: &[u8]) -> VmResult<()> {
        let staged = Self::decode(data)?;
        *self = Dictionary::default();
        self.staged = Some(staged);
        vm.objs.request_post_load_init(self_id);
        Ok(())
    }

    fn post_load_init(&mut self, vm: &mut Vm, _self_id: ObjId) -> VmResult<()> {
        let Some(staged) = self.staged.take() else {
            return Ok(());
        };
        if staged.comparator.is_valid() {
            if comparator_of(&vm.objs, staged.comparator).is_none() {
                return Err(VmError::BadObjectRef(staged.comparator));
            }
            self.comparator = staged.comparator;
        }
        for (key, items) in staged.entries {
            for (obj, prop) in items {
                if !vm.objs.is_obj_id_valid(obj) {
                    return Err(VmError::BadObjectRef(obj));
                }
                self.add_word_raw(&vm.objs, &key, obj, prop);
            }
        }
        self.modified = false;
        Ok(())
    }

    fn rebuild_image(&self, out: &mut Vec<u8>) -> VmResult<()> {
        self.encode(out)
    }

    fn apply_fixups(&mut self, fixups: &FixupTable) {
        self.comparator = fixups.translate(self.comparator);
        for bucket in &mut self.buckets {
            for entry in bucket.iter_mut() {
                for (obj, _) in entry.items.iter_mut() {
                    *obj = fixups.translate(*obj);
                }
            }
        }
        if let Some(staged) = &mut self.staged {
            staged.comparator = fixups.translate(staged.comparator);
            for (_, items) in &mut staged.entries {
                for (obj, _) in items.iter_mut() {
                    *obj = fixups.translate(*obj);
                }
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

fn create_dict(vm: &mut Vm, id: ObjId) {
    vm.objs.install(id, Box::new(Dictionary::default()));
    vm.objs.set_gc_hints(id, true, true);
}

pub(crate) fn register(reg: &mut MetaRegistry) {
    reg.register(Metaclass {
        name: DICT_META,
        create_for_image_load: create_dict,
        create_for_restore: create_dict,
    });
}
