//! Grammar productions and the parse engine.
//!
//! A production is an immutable object holding rule alternatives; each
//! alternative is a scored token sequence of sub-productions,
//! part-of-speech lookups, literals, token-type tests and the
//! all-consuming star. Matching expands alternatives against a work
//! queue of partial-match states; alternatives carrying badness wait in
//! a side queue and only run when the clean queue drains without a
//! result.
//!
//! All per-parse allocation is scoped to the parse: states and matches
//! live in an index arena dropped wholesale at the end, token text in
//! the caller's bump arena.
//!
//! Literal tokens cache their comparator hashes; the cache is tagged
//! with the comparator object that computed it and referenced weakly, so
//! the collector invalidates it when the comparator dies and a parse
//! under a different comparator recomputes it.

use std::any::Any;
use std::cell::Cell;
use std::collections::{HashSet, VecDeque};

use bumpalo::Bump;
use tale_core::{ObjId, PropId, StringComparator, Value};
use tracing::trace;

use crate::dict::{comparator_of, fallback_hash, Dictionary};
use crate::error::{VmError, VmResult};
use crate::image::{put_i16, put_u8, put_u16, put_u32, Cursor};
use crate::meta::{Metaclass, MetaRegistry, VmObject};
use crate::objtable::{DeadSet, ObjTable};
use crate::vm::Vm;

pub const GRAMPROD_META: &str = "grammar-production/030001";

/// Input token type enums.
pub const TOKT_WORD: u32 = 1;
pub const TOKT_NUMBER: u32 = 2;
pub const TOKT_PUNCT: u32 = 3;

/// Runaway-expansion backstop; indirect left recursion is the grammar
/// author's bug, but it should not hang the host.
const STATE_LIMIT: usize = 1 << 16;

/// Wire codes for rule-token match types.
mod wire {
    pub const PROD: u8 = 1;
    pub const SPEECH: u8 = 2;
    pub const LITERAL: u8 = 3;
    pub const TOKTYPE: u8 = 4;
    pub const STAR: u8 = 5;
    pub const NSPEECH: u8 = 6;
}

/// One parser input token: the word text plus its type enum.
#[derive(Debug, Clone, Copy)]
pub struct InputToken<'a> {
    pub text: &'a str,
    pub typ: u32,
}

/// Whitespace tokenization with the text held in the parse arena.
pub fn tokenize<'a>(bump: &'a Bump, line: &str) -> Vec<InputToken<'a>> {
    line.split_whitespace()
        .map(|w| {
            let typ = if w.chars().all(|c| c.is_ascii_digit()) {
                TOKT_NUMBER
            } else if w.chars().any(char::is_alphanumeric) {
                TOKT_WORD
            } else {
                TOKT_PUNCT
            };
            InputToken {
                text: bump.alloc_str(w),
                typ,
            }
        })
        .collect()
}

// --- rule structure -------------------------------------------------------

#[derive(Debug)]
pub enum TokKind {
    /// Match a sub-production.
    Prod(ObjId),
    /// Match a word filed under this vocabulary property.
    Speech(PropId),
    /// Match a word filed under any of these vocabulary properties.
    NSpeech(Vec<PropId>),
    /// Match this literal text under the dictionary's comparator.
    Literal { text: String, hash: Cell<u16> },
    /// Match any token of this type enum.
    TokType(u32),
    /// Match all remaining input, including none.
    Star,
}

#[derive(Debug)]
pub struct TokInfo {
    /// Processor-object property this token's match binds to;
    /// `PropId::INVALID` for no binding.
    pub prop: PropId,
    pub kind: TokKind,
}

#[derive(Debug)]
pub struct AltInfo {
    pub score: i16,
    pub badness: i16,
    /// Class instantiated to represent a match of this alternative.
    pub proc_obj: ObjId,
    pub toks: Vec<TokInfo>,
    /// First token is a self-reference.
    pub circular: bool,
}

/// The grammar-production object.
pub struct GramProdObj {
    /// Original image payload, reproduced verbatim on rebuild.
    image_data: Option<Box<[u8]>>,
    alts: Vec<AltInfo>,
    has_circular_alt: bool,
    /// Comparator that computed the cached literal hashes; weak.
    cached_comparator: Cell<ObjId>,
    hashes_cached: Cell<bool>,
}

impl GramProdObj {
    pub fn new(alts: Vec<AltInfo>) -> Self {
        GramProdObj {
            image_data: None,
            alts,
            has_circular_alt: false,
            cached_comparator: Cell::new(ObjId::INVALID),
            hashes_cached: Cell::new(false),
        }
    }

    pub fn alts(&self) -> &[AltInfo] {
        &self.alts
    }

    pub fn has_circular_alt(&self) -> bool {
        self.has_circular_alt
    }

    /// Mark self-referencing alternatives; must run once the object's id
    /// is known.
    pub fn finish(&mut self, self_id: ObjId) {
        for alt in &mut self.alts {
            alt.circular = matches!(alt.toks.first(), Some(TokInfo { kind: TokKind::Prod(p), .. }) if *p == self_id);
        }
        self.has_circular_alt = self.alts.iter().any(|a| a.circular);
    }

    /// Recompute literal hashes unless the cache already belongs to this
    /// comparator.
    fn ensure_literal_hashes(&self, cmp_id: ObjId, cmp: Option<&StringComparator>) {
        if self.hashes_cached.get() && self.cached_comparator.get() == cmp_id {
            return;
        }
        for alt in &self.alts {
            for tok in &alt.toks {
                if let TokKind::Literal { text, hash } = &tok.kind {
                    hash.set(match cmp {
                        Some(c) => c.calc_hash(text),
                        None => fallback_hash(text),
                    });
                }
            }
        }
        self.cached_comparator.set(cmp_id);
        self.hashes_cached.set(true);
    }

    fn decode(data: &[u8], self_id: ObjId) -> VmResult<Self> {
        let mut cur = Cursor::new(data);
        let alt_count = cur.read_u16()? as usize;
        let mut alts = Vec::with_capacity(alt_count);
        for _ in 0..alt_count {
            let score = cur.read_i16()?;
            let badness = cur.read_i16()?;
            let proc_obj = ObjId(cur.read_u32()?);
            let tok_count = cur.read_u16()? as usize;
            let mut toks = Vec::with_capacity(tok_count);
            for _ in 0..tok_count {
                let prop = PropId(cur.read_u16()?);
                let kind = match cur.read_u8()? {
                    wire::PROD => TokKind::Prod(ObjId(cur.read_u32()?)),
                    wire::SPEECH => TokKind::Speech(PropId(cur.read_u16()?)),
                    wire::NSPEECH => {
                        let n = cur.read_u16()? as usize;
                        TokKind::NSpeech(
                            (0..n).map(|_| Ok(PropId(cur.read_u16()?))).collect::<VmResult<_>>()?,
                        )
                    }
                    wire::LITERAL => {
                        let len = cur.read_u16()? as usize;
                        let bytes = cur.read_bytes(len)?;
                        let text = std::str::from_utf8(bytes)
                            .map_err(|_| VmError::Data("literal is not valid utf-8".into()))?
                            .to_string();
                        TokKind::Literal { text, hash: Cell::new(0) }
                    }
                    wire::TOKTYPE => TokKind::TokType(cur.read_u32()?),
                    wire::STAR => TokKind::Star,
                    t => return Err(VmError::Data(format!("unknown grammar token type {t}"))),
                };
                toks.push(TokInfo { prop, kind });
            }
            alts.push(AltInfo { score, badness, proc_obj, toks, circular: false });
        }
        let mut obj = GramProdObj {
            image_data: Some(data.into()),
            alts,
            has_circular_alt: false,
            cached_comparator: Cell::new(ObjId::INVALID),
            hashes_cached: Cell::new(false),
        };
        obj.finish(self_id);
        Ok(obj)
    }

    fn encode(&self, out: &mut Vec<u8>) -> VmResult<()> {
        put_u16(out, self.alts.len() as u16);
        for alt in &self.alts {
            put_i16(out, alt.score);
            put_i16(out, alt.badness);
            put_u32(out, alt.proc_obj.0);
            put_u16(out, alt.toks.len() as u16);
            for tok in &alt.toks {
                put_u16(out, tok.prop.0);
                match &tok.kind {
                    TokKind::Prod(p) => {
                        put_u8(out, wire::PROD);
                        put_u32(out, p.0);
                    }
                    TokKind::Speech(p) => {
                        put_u8(out, wire::SPEECH);
                        put_u16(out, p.0);
                    }
                    TokKind::NSpeech(ps) => {
                        put_u8(out, wire::NSPEECH);
                        put_u16(out, ps.len() as u16);
                        for p in ps {
                            put_u16(out, p.0);
                        }
                    }
                    TokKind::Literal { text, .. } => {
                        put_u8(out, wire::LITERAL);
                        put_u16(out, text.len() as u16);
                        out.extend_from_slice(text.as_bytes());
                    }
                    TokKind::TokType(e) => {
                        put_u8(out, wire::TOKTYPE);
                        put_u32(out, *e);
                    }
                    TokKind::Star => put_u8(out, wire::STAR),
                }
            }
        }
        Ok(())
    }
}

impl VmObject for GramProdObj {
    fn metaclass_name(&self) -> &'static str {
        GRAMPROD_META
    }

    // productions are immutable at run-time and reference only root-set
    // objects, so there is nothing to trace

    fn remove_stale_weak_refs(&mut self, dead: &DeadSet) {
        if self.hashes_cached.get() && dead.is_deletable(self.cached_comparator.get()) {
            self.hashes_cached.set(false);
            self.cached_comparator.set(ObjId::INVALID);
        }
    }

    fn load_from_image(&mut self, _vm: &mut Vm, self_id: ObjId, data: &[u8]) -> VmResult<()> {
        *self = Self::decode(data, self_id)?;
        Ok(())
    }

    fn rebuild_image(&self, out: &mut Vec<u8>) -> VmResult<()> {
        match &self.image_data {
            Some(data) => {
                out.extend_from_slice(data);
                Ok(())
            }
            None => self.encode(out),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// --- the parse engine -----------------------------------------------------

/// A successful parse: the instantiated processor-object tree plus the
/// input range consumed (`end_tok` exclusive).
#[derive(Debug, Clone, Copy)]
pub struct ParseResult {
    pub root: ObjId,
    pub first_tok: usize,
    pub end_tok: usize,
}

/// What a rule token bound to.
#[derive(Debug, Clone, Copy)]
enum Binding {
    /// One input token.
    Tok(usize),
    /// A sub-production match, by match index.
    Sub(usize),
    /// All input from this position on.
    Rest(usize),
}

/// One in-progress match.
#[derive(Debug, Clone)]
struct State {
    prod: ObjId,
    alt: usize,
    /// Position within the alternative's token array.
    alt_pos: usize,
    start_pos: usize,
    /// Current input position.
    tok_pos: usize,
    /// Caller on the production stack, resumed when this state's
    /// production completes.
    enclosing: Option<usize>,
    bindings: Vec<(PropId, Binding)>,
}

/// A completed alternative.
#[derive(Debug)]
struct MatchInfo {
    proc_obj: ObjId,
    start: usize,
    end: usize,
    bindings: Vec<(PropId, Binding)>,
}

/// Per-parse arena for states and matches; dropped wholesale when the
/// parse ends.
#[derive(Default)]
struct ParsePool {
    states: Vec<State>,
    matches: Vec<MatchInfo>,
    work: VecDeque<usize>,
    badness: VecDeque<usize>,
    /// Circular-alternative seedings already performed, keyed by
    /// (production, alternative, start, end, enclosing).
    seeded: HashSet<(u32, usize, usize, usize, usize)>,
    /// Top-level full-input completions: (match, score, badness).
    success: Vec<(usize, i16, i16)>,
}

struct Matcher<'v, 't> {
    objs: &'v ObjTable,
    dict: Option<&'v Dictionary>,
    cmp_id: ObjId,
    cmp: Option<&'v StringComparator>,
    toks: &'t [InputToken<'t>],
    tok_hashes: Vec<u16>,
    pool: ParsePool,
}

impl<'v, 't> Matcher<'v, 't> {
    fn prod(&self, id: ObjId) -> VmResult<&'v GramProdObj> {
        self.objs
            .get_as::<GramProdObj>(id)
            .ok_or(VmError::TypeMismatch("grammar production"))
    }

    fn push_state(&mut self, st: State, deferred: bool) -> VmResult<()> {
        if self.pool.states.len() >= STATE_LIMIT {
            return Err(VmError::ResourceLimit("grammar work queue"));
        }
        let sid = self.pool.states.len();
        self.pool.states.push(st);
        if deferred {
            self.pool.badness.push_back(sid);
        } else {
            self.pool.work.push_back(sid);
        }
        Ok(())
    }

    /// Expand a production's non-circular alternatives at an input
    /// position. Circular alternatives are seeded only from an interior
    /// match for the same start position.
    fn enqueue_alts(&mut self, prod_id: ObjId, pos: usize, enclosing: Option<usize>) -> VmResult<()> {
        let prod = self.prod(prod_id)?;
        prod.ensure_literal_hashes(self.cmp_id, self.cmp);
        for (ai, alt) in prod.alts.iter().enumerate() {
            if alt.circular {
                continue;
            }
            self.push_state(
                State {
                    prod: prod_id,
                    alt: ai,
                    alt_pos: 0,
                    start_pos: pos,
                    tok_pos: pos,
                    enclosing,
                    bindings: Vec::new(),
                },
                alt.badness != 0,
            )?;
        }
        Ok(())
    }

    fn run(&mut self, root: ObjId) -> VmResult<Option<usize>> {
        self.enqueue_alts(root, 0, None)?;
        loop {
            while let Some(sid) = self.pool.work.pop_front() {
                self.step(sid)?;
            }
            // the clean queue is dry: fall back to badness-carrying
            // states only if nothing has succeeded
            if self.pool.success.is_empty() && !self.pool.badness.is_empty() {
                while let Some(sid) = self.pool.badness.pop_front() {
                    self.pool.work.push_back(sid);
                }
                continue;
            }
            break;
        }
        trace!(
            states = self.pool.states.len(),
            matches = self.pool.matches.len(),
            successes = self.pool.success.len(),
            "parse queue drained"
        );
        Ok(self.pick_winner())
    }

    fn step(&mut self, sid: usize) -> VmResult<()> {
        let (prod_id, alt_idx, alt_pos, tok_pos) = {
            let s = &self.pool.states[sid];
            (s.prod, s.alt, s.alt_pos, s.tok_pos)
        };
        let prod = self.prod(prod_id)?;
        let alt = &prod.alts[alt_idx];

        if alt_pos == alt.toks.len() {
            return self.complete(sid, prod, alt);
        }

        let tok = &alt.toks[alt_pos];
        match &tok.kind {
            TokKind::Prod(p) => {
                // suspend this state; a completion of the sub-production
                // resumes a clone of it
                self.enqueue_alts(*p, tok_pos, Some(sid))?;
            }
            TokKind::Speech(vp) => {
                if self.word_defined(tok_pos, *vp) {
                    self.advance(sid, Some((tok.prop, Binding::Tok(tok_pos))), tok_pos + 1);
                }
            }
            TokKind::NSpeech(vps) => {
                if vps.iter().any(|vp| self.word_defined(tok_pos, *vp)) {
                    self.advance(sid, Some((tok.prop, Binding::Tok(tok_pos))), tok_pos + 1);
                }
            }
            TokKind::Literal { text, hash } => {
                if self.literal_matches(tok_pos, text, hash.get()) {
                    self.advance(sid, Some((tok.prop, Binding::Tok(tok_pos))), tok_pos + 1);
                }
            }
            TokKind::TokType(en) => {
                if tok_pos < self.toks.len() && self.toks[tok_pos].typ == *en {
                    self.advance(sid, Some((tok.prop, Binding::Tok(tok_pos))), tok_pos + 1);
                }
            }
            TokKind::Star => {
                // all remaining input, including none
                self.advance(sid, Some((tok.prop, Binding::Rest(tok_pos))), self.toks.len());
            }
        }
        Ok(())
    }

    /// Bind, step past the current rule token, and requeue.
    fn advance(&mut self, sid: usize, bind: Option<(PropId, Binding)>, new_tok_pos: usize) {
        let st = &mut self.pool.states[sid];
        if let Some(b) = bind {
            st.bindings.push(b);
        }
        st.alt_pos += 1;
        st.tok_pos = new_tok_pos;
        self.pool.work.push_back(sid);
    }

    fn complete(&mut self, sid: usize, prod: &'v GramProdObj, alt: &'v AltInfo) -> VmResult<()> {
        let st = self.pool.states[sid].clone();
        let m_idx = self.pool.matches.len();
        self.pool.matches.push(MatchInfo {
            proc_obj: alt.proc_obj,
            start: st.start_pos,
            end: st.tok_pos,
            bindings: st.bindings,
        });

        // an interior match seeds the circular alternatives: the
        // self-reference is satisfied by the match just produced
        if prod.has_circular_alt {
            let enc_key = st.enclosing.map_or(usize::MAX, |e| e);
            for (ai, a) in prod.alts.iter().enumerate() {
                if !a.circular {
                    continue;
                }
                let key = (st.prod.0, ai, st.start_pos, st.tok_pos, enc_key);
                if self.pool.seeded.insert(key) {
                    let first_prop = a.toks[0].prop;
                    self.push_state(
                        State {
                            prod: st.prod,
                            alt: ai,
                            alt_pos: 1,
                            start_pos: st.start_pos,
                            tok_pos: st.tok_pos,
                            enclosing: st.enclosing,
                            bindings: vec![(first_prop, Binding::Sub(m_idx))],
                        },
                        a.badness != 0,
                    )?;
                }
            }
        }

        match st.enclosing {
            Some(enc) => {
                let mut resumed = self.pool.states[enc].clone();
                let eprod = self.prod(resumed.prod)?;
                let etok = &eprod.alts[resumed.alt].toks[resumed.alt_pos];
                resumed.bindings.push((etok.prop, Binding::Sub(m_idx)));
                resumed.alt_pos += 1;
                resumed.tok_pos = st.tok_pos;
                self.push_state(resumed, false)?;
            }
            None => {
                if st.tok_pos == self.toks.len() {
                    self.pool.success.push((m_idx, alt.score, alt.badness));
                }
                // tokens remain: not a candidate final result
            }
        }
        Ok(())
    }

    fn word_defined(&self, tok_pos: usize, vp: PropId) -> bool {
        let Some(dict) = self.dict else { return false };
        if tok_pos >= self.toks.len() {
            return false;
        }
        dict.is_defined(self.objs, self.toks[tok_pos].text, vp)
    }

    fn literal_matches(&self, tok_pos: usize, lit: &str, lit_hash: u16) -> bool {
        if tok_pos >= self.toks.len() {
            return false;
        }
        let text = self.toks[tok_pos].text;
        match self.cmp {
            Some(c) => self.tok_hashes[tok_pos] == lit_hash && c.match_strings(text, lit) != 0,
            None => text == lit,
        }
    }

    /// Highest score wins; ties break to lowest badness, then to the
    /// first match produced. Badness-carrying results are considered
    /// only when no clean result exists.
    fn pick_winner(&self) -> Option<usize> {
        let succ = &self.pool.success;
        let any_clean = succ.iter().any(|&(_, _, b)| b == 0);
        let mut best: Option<(usize, i16, i16)> = None;
        for &(m, score, badness) in succ {
            if any_clean && badness != 0 {
                continue;
            }
            best = match best {
                None => Some((m, score, badness)),
                Some((_, bs, bb)) if score > bs || (score == bs && badness < bb) => {
                    Some((m, score, badness))
                }
                keep => keep,
            };
        }
        best.map(|(m, _, _)| m)
    }
}

/// Match a token list against a root production and instantiate the
/// winning match tree. `Ok(None)` means no alternative matched.
pub fn parse(
    vm: &mut Vm,
    root: ObjId,
    toks: &[InputToken<'_>],
    dict_id: ObjId,
) -> VmResult<Option<ParseResult>> {
    let (winner, pool) = {
        let objs = &vm.objs;
        let dict = objs.get_as::<Dictionary>(dict_id);
        let cmp_id = dict.map_or(ObjId::INVALID, |d| d.comparator_id());
        let cmp = comparator_of(objs, cmp_id);
        let tok_hashes = toks
            .iter()
            .map(|t| match cmp {
                Some(c) => c.calc_hash(t.text),
                None => fallback_hash(t.text),
            })
            .collect();
        let mut matcher = Matcher {
            objs,
            dict,
            cmp_id,
            cmp,
            toks,
            tok_hashes,
            pool: ParsePool::default(),
        };
        let winner = matcher.run(root)?;
        (winner, matcher.pool)
    };

    let Some(w) = winner else {
        return Ok(None);
    };
    let (first_tok, end_tok) = {
        let m = &pool.matches[w];
        (m.start, m.end)
    };
    let root_obj = build_match_tree(vm, &pool, w, toks)?;
    Ok(Some(ParseResult { root: root_obj, first_tok, end_tok }))
}

/// Depth-first instantiation of the winning match: one processor-object
/// instance per match, with each bound property assigned the child
/// processor object or a string object for the input token.
fn build_match_tree(
    vm: &mut Vm,
    pool: &ParsePool,
    mi: usize,
    toks: &[InputToken<'_>],
) -> VmResult<ObjId> {
    let (proc_obj, bindings) = {
        let m = &pool.matches[mi];
        (m.proc_obj, m.bindings.clone())
    };
    let supers = if proc_obj.is_valid() { vec![proc_obj] } else { Vec::new() };
    let inst = vm.new_record(supers)?;
    for (prop, b) in bindings {
        if !prop.is_valid() {
            continue;
        }
        let val = match b {
            Binding::Tok(i) => Value::Obj(vm.new_string(toks[i].text)?),
            Binding::Sub(c) => Value::Obj(build_match_tree(vm, pool, c, toks)?),
            Binding::Rest(i) => {
                let elems = toks[i..]
                    .iter()
                    .map(|t| vm.new_string(t.text).map(Value::Obj))
                    .collect::<VmResult<Vec<_>>>()?;
                Value::Obj(vm.new_list(elems)?)
            }
        };
        vm.set_prop(inst, prop, val)?;
    }
    Ok(inst)
}

fn create_gramprod(vm: &mut Vm, id: ObjId) {
    vm.objs.install(id, Box::new(GramProdObj::new(Vec::new())));
    vm.objs.set_gc_hints(id, false, true);
}

pub(crate) fn register(reg: &mut MetaRegistry) {
    reg.register(Metaclass {
        name: GRAMPROD_META,
        create_for_image_load: create_gramprod,
        create_for_restore: create_gramprod,
    });
}
