//! Tale Runtime: the core of the Tale interactive-fiction VM.
//!
//! Four tightly coupled subsystems make up the core:
//!
//! - `objtable`: the id-to-instance object table with a three-state
//!   mark/sweep collector supporting finalizers, weak references and
//!   incremental passes
//! - `undo`: a bounded circular log of per-property deltas with nested
//!   savepoints and selective rollback, integrated with GC marking
//! - `gramprod`: the chart-style grammar-production matcher with
//!   alternatives, scoring, ambiguity handling and dictionary lookup
//! - the string comparator (in `tale-core`), wrapped here as a
//!   metaclass and consumed by `dict`
//!
//! Around them sit the metaclass registry (`meta`), the built-in
//! metaclasses (`objects`, `dict`), image loading and rebuilding
//! (`image`), saved states (`save`), the scratch-register cache
//! (`regpool`), and the [`Vm`] context struct (`vm`) that owns every
//! process-wide singleton explicitly.

pub mod config;
pub mod dict;
pub mod error;
pub mod gramprod;
pub mod image;
pub mod meta;
pub mod objects;
pub mod objtable;
pub mod regpool;
pub mod save;
pub mod undo;
pub mod vm;

pub use config::VmConfig;
pub use dict::{Dictionary, DICT_META};
pub use error::{VmError, VmResult};
pub use gramprod::{
    AltInfo, GramProdObj, InputToken, ParseResult, TokInfo, TokKind, tokenize, GRAMPROD_META,
    TOKT_NUMBER, TOKT_PUNCT, TOKT_WORD,
};
pub use meta::{Metaclass, MetaRegistry, VmObject};
pub use objects::{
    ListObject, RecordObject, StrCompObject, StringObject, LIST_META, RECORD_META, STRCOMP_META,
    STRING_META,
};
pub use objtable::{DeadSet, Finalize, ObjTable, Reach, SlotFlags, PAGE_SIZE};
pub use regpool::{ScratchGuard, ScratchPool};
pub use save::FixupTable;
pub use undo::{UndoExt, UndoKey, UndoLog, UndoRecord, SAVEPT_MAX};
pub use vm::{GlobalVarHandle, Vm};

// the core value types are part of this crate's public surface
pub use tale_core::{
    EquivMapping, NativeCodeDesc, ObjId, PropId, StringComparator, Value, RF_CASEFOLD, RF_MATCH,
    RF_TRUNC,
};
