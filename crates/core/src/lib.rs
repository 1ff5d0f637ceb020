//! Tale Core: value representation and string matching for the Tale VM
//!
//! This crate holds the two leaf pieces of the VM that everything else
//! builds on and that depend on nothing else:
//!
//! - `value`: the universal tagged scalar (`Value`, `ObjId`, `PropId`,
//!   `NativeCodeDesc`) plus its portable dataholder form
//! - `strcmp`: the parameterized string comparator supplying hashing and
//!   truncation/case/equivalence matching to dictionaries and grammar
//!   rules

pub mod strcmp;
pub mod value;

pub use strcmp::{ComparatorError, EquivMapping, StringComparator, RF_CASEFOLD, RF_MATCH, RF_TRUNC};
pub use value::{NativeCodeDesc, ObjId, PropId, Value};
