//! Runtime error taxonomy.
//!
//! One error enum covers the whole core: configuration errors (bad
//! metaclass linkage, malformed headers), data errors during load and
//! restore, runtime type errors reported to the executing program, and
//! resource errors. Errors unwind with `?`, releasing scoped resources
//! (parse pools, scratch registers) along the way.
//!
//! A failed grammar parse is not an error; the parse entry points return
//! `Ok(None)` for "no match".

use std::fmt;
use tale_core::{ObjId, PropId};

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug)]
pub enum VmError {
    // --- configuration errors -------------------------------------------
    /// An image or save file requires a metaclass nobody registered.
    UnknownMetaclass(String),
    /// The file requires a newer metaclass version than is registered.
    MetaclassVersion { name: String, requested: u32, registered: u32 },
    /// Malformed image or save header/block structure.
    BadFormat(String),

    // --- data errors during load/restore --------------------------------
    /// A field in a payload is out of range or otherwise malformed.
    Data(String),
    /// A reference to an object id that does not exist.
    BadObjectRef(ObjId),
    /// `allocate_with_id` hit a slot that is already in use.
    SlotInUse(ObjId),
    /// Circular `ensure_post_load_init` dependency.
    CircularInit(ObjId),

    // --- runtime type errors --------------------------------------------
    /// Wrong number of arguments to a native method.
    WrongArgCount { min: usize, max: usize, actual: usize },
    /// A value with the wrong tag was passed to a type-specific operation.
    TypeMismatch(&'static str),
    /// Comparison between values of incomparable object types.
    InvalidComparison,
    /// Attempt to set a property of an immutable object.
    ImmutableProperty(PropId),

    // --- resource errors -------------------------------------------------
    /// Allocation failed even after a full collection pass.
    OutOfMemory,
    /// The scratch-register cache has no free registers.
    RegistersExhausted,
    /// An internal working-set limit was hit (runaway grammar expansion).
    ResourceLimit(&'static str),

    /// I/O failure reading or writing a saved state.
    Io(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::UnknownMetaclass(name) => write!(f, "unknown metaclass: {name}"),
            VmError::MetaclassVersion { name, requested, registered } => write!(
                f,
                "metaclass {name} version {requested:06} required, only {registered:06} registered"
            ),
            VmError::BadFormat(msg) => write!(f, "malformed file: {msg}"),
            VmError::Data(msg) => write!(f, "bad data: {msg}"),
            VmError::BadObjectRef(id) => write!(f, "reference to nonexistent object {id}"),
            VmError::SlotInUse(id) => write!(f, "object slot {id} is already in use"),
            VmError::CircularInit(id) => {
                write!(f, "circular post-load initialization dependency at {id}")
            }
            VmError::WrongArgCount { min, max, actual } => {
                write!(f, "wrong number of arguments: expected {min}..={max}, got {actual}")
            }
            VmError::TypeMismatch(what) => write!(f, "type mismatch: expected {what}"),
            VmError::InvalidComparison => write!(f, "invalid comparison between object types"),
            VmError::ImmutableProperty(p) => write!(f, "cannot set immutable property {p}"),
            VmError::OutOfMemory => write!(f, "out of memory after garbage collection"),
            VmError::RegistersExhausted => write!(f, "scratch register cache exhausted"),
            VmError::ResourceLimit(what) => write!(f, "internal limit reached: {what}"),
            VmError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for VmError {
    fn from(e: std::io::Error) -> Self {
        VmError::Io(e)
    }
}

impl From<tale_core::ComparatorError> for VmError {
    fn from(e: tale_core::ComparatorError) -> Self {
        VmError::Data(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_informative() {
        let e = VmError::UnknownMetaclass("widget/030000".into());
        assert!(e.to_string().contains("widget/030000"));

        let e = VmError::WrongArgCount { min: 1, max: 2, actual: 5 };
        assert!(e.to_string().contains('5'));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let e: VmError = io.into();
        assert!(matches!(e, VmError::Io(_)));
    }
}
