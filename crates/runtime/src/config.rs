//! VM configuration.
//!
//! All the tunables a host can set before constructing a [`crate::Vm`]:
//! undo capacity, garbage-collection thresholds, and the scratch-register
//! cache size. Loadable from TOML so hosts can ship a config file instead
//! of hard-coding numbers.

use serde::Deserialize;

use crate::error::{VmError, VmResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Capacity of the undo record ring.
    pub undo_records: usize,

    /// Maximum number of simultaneously open savepoints; creating one
    /// more drops the oldest.
    pub max_savepoints: usize,

    /// Allocations between automatic collection passes.
    pub gc_max_allocs: usize,

    /// Heap bytes allocated between automatic collection passes.
    pub gc_max_bytes: usize,

    /// Whether automatic collection is initially enabled.
    pub gc_enabled: bool,

    /// Hard cap on live objects; the allocator runs a full collection and
    /// retries once before reporting out-of-memory.
    pub max_objects: usize,

    /// Number of scratch registers in the numeric working cache.
    pub scratch_registers: usize,

    /// Size of each scratch register, in bytes.
    pub scratch_register_bytes: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            undo_records: 16 * 1024,
            max_savepoints: 32,
            gc_max_allocs: 10_000,
            gc_max_bytes: 8 * 1024 * 1024,
            gc_enabled: true,
            max_objects: usize::MAX,
            scratch_registers: 32,
            scratch_register_bytes: 128,
        }
    }
}

impl VmConfig {
    /// Parse a TOML configuration fragment; omitted keys keep defaults.
    pub fn from_toml(text: &str) -> VmResult<Self> {
        toml::from_str(text).map_err(|e| VmError::BadFormat(format!("config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = VmConfig::default();
        assert!(cfg.undo_records > cfg.max_savepoints);
        assert!(cfg.gc_enabled);
    }

    #[test]
    fn toml_overrides() {
        let cfg = VmConfig::from_toml("undo_records = 64\nmax_savepoints = 4\n").unwrap();
        assert_eq!(cfg.undo_records, 64);
        assert_eq!(cfg.max_savepoints, 4);
        assert!(cfg.gc_enabled);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(VmConfig::from_toml("gc_max_alocs = 1\n").is_err());
    }
}
