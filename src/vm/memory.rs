// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::Ordering;
use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use crate::compartment::Object;
use crate::vm::mmap::{host_page_size, Mmap, Permissions};
use crate::vm::vmcontext::VMMemoryDefinition;
use crate::{Error, Result, SANDBOX_BYTES, WASM_PAGE_SIZE};

/// A linear memory instance: a fixed [`SANDBOX_BYTES`] reservation of which
/// the first `current_length` bytes are committed.
///
/// The base address never moves, which is what lets compiled code address
/// the memory as `base[offset & ADDRESS_MASK]` with no bounds check: any
/// masked offset lands inside the reservation, and offsets at or beyond the
/// committed length fault on the `PROT_NONE` tail.
#[derive(Debug)]
pub struct Memory {
    mmap: Mmap,
    def: VMMemoryDefinition,
    /// Declared maximum, in wasm pages.
    maximum: u64,
}

impl Memory {
    /// Reserves the sandbox range and commits `initial` pages, zero-filled.
    pub fn new(initial: u64, maximum: u64) -> Result<Self> {
        let mmap =
            Mmap::reserve(usize::try_from(SANDBOX_BYTES).unwrap()).map_err(|error| {
                tracing::debug!("memory reservation failed: {error}");
                Error::OutOfMemory
            })?;

        let initial_bytes = usize::try_from(initial * WASM_PAGE_SIZE).unwrap();
        if initial_bytes != 0 {
            mmap.commit(0, initial_bytes, Permissions::READ | Permissions::WRITE)
                .map_err(|error| {
                    tracing::debug!("memory commit failed: {error}");
                    Error::OutOfMemory
                })?;
        }

        let def = VMMemoryDefinition {
            base: mmap.as_ptr(),
            current_length: initial_bytes.into(),
        };

        Ok(Self { mmap, def, maximum })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.mmap.as_ptr()
    }

    /// The runtime descriptor compiled code reads. Its address is stable for
    /// the memory's lifetime.
    #[inline]
    pub fn vmmemory_definition(&self) -> *const VMMemoryDefinition {
        &self.def
    }

    /// Current size in wasm pages.
    pub fn num_pages(&self) -> u64 {
        self.def.current_length.load(Ordering::Acquire) as u64 / WASM_PAGE_SIZE
    }

    /// Current size in bytes.
    pub fn committed_bytes(&self) -> usize {
        self.def.current_length.load(Ordering::Acquire)
    }

    pub fn maximum(&self) -> u64 {
        self.maximum
    }

    /// Commits `delta` additional pages. Returns the previous page count.
    pub fn grow(&self, delta: u64) -> Result<u64> {
        let old_pages = self.num_pages();
        if delta == 0 {
            return Ok(old_pages);
        }

        let new_pages = old_pages.checked_add(delta).ok_or(Error::PageLimit)?;
        if new_pages > self.maximum {
            return Err(Error::PageLimit);
        }

        let old_bytes = usize::try_from(old_pages * WASM_PAGE_SIZE).unwrap();
        let delta_bytes = usize::try_from(delta * WASM_PAGE_SIZE).unwrap();
        self.mmap
            .commit(old_bytes, delta_bytes, Permissions::READ | Permissions::WRITE)
            .map_err(|error| {
                tracing::debug!("memory growth failed: {error}");
                Error::OutOfMemory
            })?;

        // Publish the new size; racing readers see the old or new value.
        self.def
            .current_length
            .store(old_bytes + delta_bytes, Ordering::Release);

        Ok(old_pages)
    }

    /// Returns `[start_page, start_page + num_pages)` to zero-filled pages.
    pub fn unmap_pages(&self, start_page: u64, num_pages: u64) -> Result<()> {
        let end = start_page
            .checked_add(num_pages)
            .ok_or(Error::OutOfBounds(start_page))?;
        if end > self.num_pages() {
            return Err(Error::OutOfBounds(end * WASM_PAGE_SIZE));
        }

        self.mmap
            .decommit(
                usize::try_from(start_page * WASM_PAGE_SIZE).unwrap(),
                usize::try_from(num_pages * WASM_PAGE_SIZE).unwrap(),
            )
            .map_err(|_| Error::OutOfMemory)
    }

    /// Host pointer for `[offset, offset + len)`, validated only against the
    /// reservation. The range may fault on access if it is not committed.
    pub fn reserved_range(&self, offset: u64, len: u64) -> Result<*mut u8> {
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds(offset))?;
        if end > SANDBOX_BYTES {
            return Err(Error::OutOfBounds(offset));
        }
        // Safety: in bounds of the reservation per the check above.
        Ok(unsafe { self.base().add(offset as usize) })
    }

    /// Host pointer for `[offset, offset + len)`, validated against the
    /// committed length.
    pub fn validated_range(&self, offset: u64, len: u64) -> Result<*mut u8> {
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds(offset))?;
        if end > self.committed_bytes() as u64 {
            return Err(Error::OutOfBounds(offset));
        }
        // Safety: in bounds of the committed range per the check above.
        Ok(unsafe { self.base().add(offset as usize) })
    }
}

/// Where a fault address landed: which memory reservation, and the offset
/// within it.
#[derive(Debug, Clone, Copy)]
pub struct ReservationHit {
    pub compartment: u64,
    pub memory: Object,
    pub offset: u64,
}

#[derive(Debug)]
struct Registration {
    len: usize,
    compartment: u64,
    memory: Object,
}

/// Process-wide registry of memory reservations, consulted by the signal
/// handler to attribute faults.
///
/// Invariant: no thread holds this lock while executing compiled code, so
/// the handler taking it cannot self-deadlock.
fn reservations() -> &'static Mutex<BTreeMap<usize, Registration>> {
    static RESERVATIONS: OnceLock<Mutex<BTreeMap<usize, Registration>>> = OnceLock::new();
    RESERVATIONS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

pub(crate) fn register_reservation(memory: &Memory, compartment: u64, object: Object) {
    let start = memory.base() as usize;
    reservations().lock().unwrap().insert(
        start,
        Registration {
            len: memory.mmap.len(),
            compartment,
            memory: object,
        },
    );
}

pub(crate) fn unregister_reservation(base: *mut u8) {
    reservations().lock().unwrap().remove(&(base as usize));
}

/// Attributes `addr` to a registered reservation, if any.
pub(crate) fn lookup_reservation(addr: usize) -> Option<ReservationHit> {
    let map = reservations().lock().unwrap();
    let (start, registration) = map.range(..=addr).next_back()?;
    if addr - start < registration.len {
        Some(ReservationHit {
            compartment: registration.compartment,
            memory: registration.memory,
            offset: (addr - start) as u64,
        })
    } else {
        None
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unregister_reservation(self.base());
    }
}

// Keep dead page-size users honest: the wasm page size must be a multiple
// of every supported host page size.
const _: () = assert!(WASM_PAGE_SIZE % 4096 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_and_validate() {
        let memory = Memory::new(1, 2).unwrap();
        assert_eq!(memory.num_pages(), 1);
        assert!(memory.validated_range(0, WASM_PAGE_SIZE).is_ok());
        assert!(memory.validated_range(WASM_PAGE_SIZE, 1).is_err());
        assert!(memory.reserved_range(WASM_PAGE_SIZE, 1).is_ok());

        assert_eq!(memory.grow(1).unwrap(), 1);
        assert_eq!(memory.num_pages(), 2);
        assert!(memory.validated_range(WASM_PAGE_SIZE, 1).is_ok());

        assert!(matches!(memory.grow(1), Err(Error::PageLimit)));
    }

    #[test]
    fn committed_pages_are_zeroed() {
        let memory = Memory::new(1, 1).unwrap();
        // Safety: page 0 is committed.
        unsafe {
            let ptr = memory.base();
            assert_eq!(*ptr.add(1234), 0);
            *ptr.add(1234) = 7;
            memory.unmap_pages(0, 1).unwrap();
            assert_eq!(*ptr.add(1234), 0);
        }
    }

    #[test]
    fn reservation_lookup() {
        let memory = Memory::new(1, 1).unwrap();
        let object = Object::from_raw_parts(1, 0, 0);
        register_reservation(&memory, 1, object);

        let hit = lookup_reservation(memory.base() as usize + 100).unwrap();
        assert_eq!(hit.offset, 100);
        assert_eq!(hit.compartment, 1);
        assert_eq!(hit.memory, object);

        let last = lookup_reservation(memory.base() as usize + SANDBOX_BYTES as usize - 1).unwrap();
        assert_eq!(last.memory, object);
    }
}
