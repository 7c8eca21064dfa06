// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::vm::vmcontext::{VMFuncRef, VMTableDefinition};

/// Runtime storage of one table.
///
/// Storage length is always a power of two: indirect-call dispatch masks the
/// callee index with `current_elements - 1`, so padding slots introduced by
/// growth must exist and hold null (a masked hit on one raises the
/// uninitialized-element trap). Element words are pointer-sized atomics so
/// stores are indivisible with respect to concurrent dispatch loads.
#[derive(Debug)]
pub struct Table {
    slots: Vec<AtomicUsize>,
    def: VMTableDefinition,
}

impl Table {
    /// Creates a table with `len` slots, all null. `len` must be a power of
    /// two (or zero).
    pub fn new(len: usize) -> Self {
        debug_assert!(len == 0 || len.is_power_of_two());

        let mut slots = Vec::new();
        slots.resize_with(len, || AtomicUsize::new(0));

        let def = VMTableDefinition {
            base: slots.as_mut_ptr().cast(),
            current_elements: AtomicUsize::new(len),
        };

        Self { slots, def }
    }

    /// The runtime descriptor compiled code reads. Its address is stable for
    /// the table's lifetime (the descriptor is re-pointed on growth, the
    /// descriptor itself does not move).
    #[inline]
    pub fn vmtable_definition(&self) -> *const VMTableDefinition {
        &self.def
    }

    /// Storage size (the dispatch mask is this minus one).
    pub fn storage_len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<*mut VMFuncRef> {
        let word = self.slots.get(index)?.load(Ordering::Acquire);
        Some(word as *mut VMFuncRef)
    }

    pub fn set(&self, index: usize, func_ref: *mut VMFuncRef) {
        self.slots[index].store(func_ref as usize, Ordering::Release);
    }

    /// Grows storage to `new_len` slots (a power of two at least the current
    /// length); new slots are null.
    pub fn grow_storage(&mut self, new_len: usize) {
        debug_assert!(new_len.is_power_of_two());
        debug_assert!(new_len >= self.slots.len());

        self.slots.resize_with(new_len, || AtomicUsize::new(0));

        self.def.base = self.slots.as_mut_ptr().cast();
        self.def.current_elements.store(new_len, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_stays_power_of_two() {
        let mut table = Table::new(4);
        assert_eq!(table.storage_len(), 4);
        assert!(table.get(0).unwrap().is_null());

        let marker = 0x1000 as *mut VMFuncRef;
        table.set(1, marker);
        assert_eq!(table.get(1).unwrap(), marker);

        table.grow_storage(8);
        assert_eq!(table.storage_len(), 8);
        assert_eq!(table.get(1).unwrap(), marker);
        assert!(table.get(7).unwrap().is_null());
    }
}
