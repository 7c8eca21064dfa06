// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! vessel is a compartmentalized WebAssembly execution engine.
//!
//! A validated, structured intermediate representation (see [`ir`]) is
//! compiled to native machine code with Cranelift. All runtime state lives in
//! [`Compartment`]s: arenas of root-counted objects (functions, tables,
//! memories, globals, exception types, instances, contexts) collected by a
//! mark-and-sweep pass over explicit roots. Linear memories are sandboxed by
//! construction: every memory reserves [`SANDBOX_BYTES`] of virtual address
//! space and compiled accesses are masked with [`ADDRESS_MASK`], so no
//! combination of guest offsets can reach outside the reservation. Faults on
//! uncommitted pages, together with the other hardware traps compiled code
//! can raise, are converted into typed [`Exception`]s by the signal plumbing
//! in this crate.

#![cfg(unix)]

mod arch;
mod compartment;
mod compile;
mod context;
mod emit;
mod engine;
mod errors;
mod exception;
mod func;
mod global;
mod instance;
pub mod ir;
mod linker;
mod memory;
mod module;
mod quota;
mod table;
mod trap;
mod traphandler;
mod types;
mod utils;
mod values;
mod vm;

pub use compartment::{Compartment, Foreign, Object, ObjectKind};
pub use context::Context;
pub use engine::{Engine, EngineConfig, OptLevel};
pub use errors::{CompileError, Error};
pub use exception::{
    describe_call_stack, describe_instruction_pointer, exception_types, CallStack, Exception,
    ExceptionKind, ExceptionType,
};
pub use func::Function;
pub use global::Global;
pub use instance::{instantiate_module, ImportBindings, Instance};
pub use linker::{link_module, Linker, Resolver};
pub use memory::Memory;
pub use module::Module;
pub use quota::ResourceQuota;
pub use table::Table;
pub use traphandler::{catch_runtime_exceptions, throw_exception, unwind_signals_as_exceptions};
pub use types::{ExternType, FuncType, GlobalType, MemoryType, Mutability, TableType, ValKind};
pub use values::{UntaggedValue, Value};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The size of one WebAssembly page, in bytes.
pub const WASM_PAGE_SIZE: u64 = 0x1_0000;

/// The number of pages a 32-bit memory can have before running out of byte
/// index space.
pub const WASM_MAX_PAGES: u64 = 1 << 16;

/// The size of the virtual address range reserved for every linear memory.
///
/// This is the core security constant: it is a power of two large enough to
/// hold the largest representable 32-bit offset (4 GiB) plus as much again in
/// guard space, so a 32-bit offset that has been zero-extended and masked
/// with [`ADDRESS_MASK`] can never resolve outside the reservation.
pub const SANDBOX_BYTES: u64 = 1 << 33;

/// The address mask applied by compiled code to every linear-memory access.
pub const ADDRESS_MASK: u64 = SANDBOX_BYTES - 1;

const _: () = assert!(SANDBOX_BYTES.is_power_of_two());
const _: () = assert!(SANDBOX_BYTES >= 2 * WASM_MAX_PAGES * WASM_PAGE_SIZE);
