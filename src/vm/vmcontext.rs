// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # VMContext
//!
//! Compiled code needs runtime data at well-known offsets: linear-memory
//! bases, table descriptors, global storage, import bindings, the builtin
//! function array. All of it is kept in a per-instance `VMContext` blob that
//! conceptually looks like this:
//!
//! ```text
//! #[repr(C)]
//! struct VMContext {
//!     magic: usize,
//!     builtins: *const VMBuiltinFunctionsArray,
//!     host: *const InstanceHostData,
//!     memories: [*mut VMMemoryDefinition; num_memories],
//!     tables: [*mut VMTableDefinition; num_tables],
//!     global_defs: [*mut VMGlobalDefinition; num_globals],
//!     global_offsets: [usize; num_globals],
//!     func_imports: [VMFunctionImport; num_imported_funcs],
//! }
//! ```
//!
//! The index spaces are imports-first, matching [`crate::ir::Module`]. The
//! final size depends on the module, so the blob cannot be a Rust struct;
//! [`VMContextOffsets`] plans the layout and both the emitter and the
//! instantiator do pointer-plus-offset arithmetic against that plan.
//!
//! Mutable globals deliberately do *not* live here: each [`crate::Context`]
//! owns a buffer with the compartment-wide mutable-global layout, and
//! compiled code reaches it through the second parameter of every call, the
//! [`VMContextRuntime`]. `global_offsets` records each global's byte offset
//! in that layout; `global_defs` carries the storage address for immutable
//! globals.

use core::sync::atomic::AtomicUsize;

use static_assertions::const_assert_eq;

use crate::ir;

pub const VMCONTEXT_MAGIC: u32 = u32::from_le_bytes(*b"vslc");

/// Offset of the host-data pointer. The first three slots (magic, builtins,
/// host) sit at fixed offsets in every layout so builtins can reach the host
/// data without a per-module plan.
pub const VMCTX_HOST_OFFSET: u32 = 2 * PTR_SIZE;

/// Pointer size of supported hosts. The sandbox design requires a 64-bit
/// address space.
pub const PTR_SIZE: u32 = 8;
const_assert_eq!(PTR_SIZE as usize, size_of::<usize>());

/// Runtime descriptor of one linear memory, read by compiled code.
#[derive(Debug)]
#[repr(C)]
pub struct VMMemoryDefinition {
    /// The start address of the reserved range. Fixed for the memory's
    /// lifetime.
    pub base: *mut u8,
    /// The current logical size in bytes. Atomic so growth publishes the new
    /// size with release ordering and racing readers see either size.
    pub current_length: AtomicUsize,
}

/// Runtime descriptor of one table, read by compiled code.
///
/// `base` points at an array of `*mut VMFuncRef` words; `current_elements`
/// is always a power of two so `index & (current_elements - 1)` stays inside
/// the storage.
#[derive(Debug)]
#[repr(C)]
pub struct VMTableDefinition {
    pub base: *mut u8,
    pub current_elements: AtomicUsize,
}

/// Storage for one immutable global's value.
#[derive(Debug, Default)]
#[repr(C, align(16))]
pub struct VMGlobalDefinition {
    storage: [u8; 16],
}

impl VMGlobalDefinition {
    pub fn from_bits(bits: u128) -> Self {
        Self {
            storage: bits.to_le_bytes(),
        }
    }

    pub fn bits(&self) -> u128 {
        u128::from_le_bytes(self.storage)
    }
}

/// A reference to a callable function, the value stored in funcref table
/// slots and the payload of every function import.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VMFuncRef {
    /// Entry point using the internal wasm calling convention.
    pub wasm_call: *const u8,
    /// Entry point using the array calling convention
    /// `fn(vmctx, cctx, values)`.
    pub array_call: *const u8,
    /// The owning instance's VMContext.
    pub vmctx: *mut u8,
    /// Interned signature tag; compared on indirect calls.
    pub type_index: u32,
    _pad: u32,
}

impl VMFuncRef {
    pub fn new(wasm_call: *const u8, array_call: *const u8, vmctx: *mut u8, type_index: u32) -> Self {
        Self {
            wasm_call,
            array_call,
            vmctx,
            type_index,
            _pad: 0,
        }
    }
}

// Safety: raw pointers into instance-owned allocations whose lifetime is
// coordinated by the compartment.
unsafe impl Send for VMFuncRef {}
// Safety: see above.
unsafe impl Sync for VMFuncRef {}

/// One resolved function import as laid out inside the VMContext.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VMFunctionImport {
    pub wasm_call: *const u8,
    pub array_call: *const u8,
    pub vmctx: *mut u8,
}

/// Per-Context state passed as the second parameter of every compiled call
/// and threaded through unchanged.
#[derive(Debug)]
#[repr(C)]
pub struct VMContextRuntime {
    /// Base of this context's mutable-global buffer.
    pub globals: *mut u8,
    /// Stack limit checked by function prologues.
    pub stack_limit: usize,
}

// Safety: the context owner coordinates access.
unsafe impl Send for VMContextRuntime {}
// Safety: see above.
unsafe impl Sync for VMContextRuntime {}

/// Byte size of one slot in a context's mutable-global buffer. Uniform so a
/// global's offset is independent of surrounding value kinds.
pub const GLOBAL_SLOT_BYTES: u32 = 16;

/// A VMContext layout plan for one module, used by the emitter for offset
/// calculations and by the instantiator to populate the blob.
#[derive(Debug, Clone)]
pub struct VMContextOffsets {
    num_memories: u32,
    num_tables: u32,
    num_globals: u32,
    num_imported_funcs: u32,

    magic: u32,
    builtins: u32,
    host: u32,
    memories: u32,
    tables: u32,
    global_defs: u32,
    global_offsets: u32,
    func_imports: u32,
    size: u32,
}

impl VMContextOffsets {
    pub fn for_module(module: &ir::Module) -> Self {
        let mut offset = 0u32;
        let mut member_offset = |size_of_member: u32| -> u32 {
            let out = offset;
            offset += size_of_member;
            out
        };

        let num_memories = module.num_memories();
        let num_tables = module.num_tables();
        let num_globals = module.num_globals();
        let num_imported_funcs = module.num_imported_funcs();

        Self {
            num_memories,
            num_tables,
            num_globals,
            num_imported_funcs,

            magic: member_offset(PTR_SIZE),
            builtins: member_offset(PTR_SIZE),
            host: member_offset(PTR_SIZE),
            memories: member_offset(num_memories * PTR_SIZE),
            tables: member_offset(num_tables * PTR_SIZE),
            global_defs: member_offset(num_globals * PTR_SIZE),
            global_offsets: member_offset(num_globals * PTR_SIZE),
            func_imports: member_offset(num_imported_funcs * size_of::<VMFunctionImport>() as u32),
            size: offset,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn magic(&self) -> u32 {
        self.magic
    }

    #[inline]
    pub fn builtins(&self) -> u32 {
        self.builtins
    }

    #[inline]
    pub fn host(&self) -> u32 {
        self.host
    }

    /// Offset of the `*mut VMMemoryDefinition` for memory `index`.
    #[inline]
    pub fn memory_pointer(&self, index: u32) -> u32 {
        assert!(index < self.num_memories);
        self.memories + index * PTR_SIZE
    }

    /// Offset of the `*mut VMTableDefinition` for table `index`.
    #[inline]
    pub fn table_pointer(&self, index: u32) -> u32 {
        assert!(index < self.num_tables);
        self.tables + index * PTR_SIZE
    }

    /// Offset of the `*mut VMGlobalDefinition` for (immutable) global
    /// `index`.
    #[inline]
    pub fn global_definition_pointer(&self, index: u32) -> u32 {
        assert!(index < self.num_globals);
        self.global_defs + index * PTR_SIZE
    }

    /// Offset of the context-buffer offset word for (mutable) global
    /// `index`.
    #[inline]
    pub fn global_offset_word(&self, index: u32) -> u32 {
        assert!(index < self.num_globals);
        self.global_offsets + index * PTR_SIZE
    }

    /// Offset of the `VMFunctionImport` for imported function `index`.
    #[inline]
    pub fn function_import(&self, index: u32) -> u32 {
        assert!(index < self.num_imported_funcs);
        self.func_imports + index * size_of::<VMFunctionImport>() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_disjoint_and_sized() {
        let module = ir::Module {
            memories: vec![crate::types::MemoryType {
                minimum: 1,
                maximum: None,
            }],
            ..ir::Module::default()
        };
        let offsets = VMContextOffsets::for_module(&module);

        assert_eq!(offsets.magic(), 0);
        assert_eq!(offsets.builtins(), 8);
        assert_eq!(offsets.host(), 16);
        assert_eq!(offsets.memory_pointer(0), 24);
        assert_eq!(offsets.size(), 32);
    }
}
