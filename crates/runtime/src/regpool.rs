//! Scratch-register cache for numeric working storage.
//!
//! A fixed pool of byte buffers handed out through RAII guards. The
//! host's numeric routines acquire a register, work in it, and release
//! it by dropping the guard; every register must be back in the cache
//! before a collection pass begins.

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};

use crate::error::{VmError, VmResult};

pub struct ScratchPool {
    free: RefCell<Vec<Box<[u8]>>>,
    outstanding: Cell<usize>,
}

impl ScratchPool {
    pub fn new(count: usize, register_bytes: usize) -> Self {
        ScratchPool {
            free: RefCell::new(
                (0..count)
                    .map(|_| vec![0u8; register_bytes].into_boxed_slice())
                    .collect(),
            ),
            outstanding: Cell::new(0),
        }
    }

    /// Registers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Acquire a zeroed register.
    pub fn acquire(&self) -> VmResult<ScratchGuard<'_>> {
        let mut buf = self
            .free
            .borrow_mut()
            .pop()
            .ok_or(VmError::RegistersExhausted)?;
        buf.fill(0);
        self.outstanding.set(self.outstanding.get() + 1);
        Ok(ScratchGuard { pool: self, buf: Some(buf) })
    }
}

/// An acquired register; dropping it returns the storage to the cache.
pub struct ScratchGuard<'a> {
    pool: &'a ScratchPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for ScratchGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("register present until drop")
    }
}

impl DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("register present until drop")
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.borrow_mut().push(buf);
            self.pool.outstanding.set(self.pool.outstanding.get() - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let pool = ScratchPool::new(2, 16);
        {
            let mut a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(pool.outstanding(), 2);
            assert!(matches!(pool.acquire(), Err(VmError::RegistersExhausted)));
            a[0] = 0xFF;
        }
        assert_eq!(pool.outstanding(), 0);
        // the dirtied register comes back zeroed
        let a = pool.acquire().unwrap();
        assert_eq!(a[0], 0);
    }
}
