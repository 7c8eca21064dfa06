// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The low-level runtime: mapped memory, table storage, VMContext layout,
//! builtins, and executable code regions. Everything in here is shared with
//! compiled code through raw pointers and fixed layouts.

pub mod builtins;
pub mod code;
pub mod memory;
pub mod mmap;
pub mod table;
pub mod vmcontext;

pub use builtins::{BuiltinFunctionIndex, VMBuiltinFunctionsArray, BUILTINS};
pub use code::{CodeInfo, CodeMemory, FunctionLoc};
pub use memory::Memory;
pub use mmap::{host_page_size, Mmap, Permissions};
pub use table::Table;
pub use vmcontext::{
    VMContextOffsets, VMContextRuntime, VMFuncRef, VMFunctionImport, VMGlobalDefinition,
    VMMemoryDefinition, VMTableDefinition, GLOBAL_SLOT_BYTES, PTR_SIZE, VMCONTEXT_MAGIC,
    VMCTX_HOST_OFFSET,
};
