// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod obj;

use cranelift_codegen::ir::{ExternalName, UserExternalName, UserExternalNameRef};
use cranelift_codegen::{binemit, Final, FinalizedMachReloc, FinalizedRelocTarget, MachBufferFinalized};
use cranelift_entity::PrimaryMap;

pub use obj::{build_object, parse_object, CompileOutput, ParsedObject};

use crate::emit::NS_WASM_FUNC;
use crate::errors::CompileError;
use crate::trap::TrapKind;

/// The machine code and metadata of one compiled function.
#[derive(Debug)]
pub struct CompiledFunction {
    /// The machine code buffer for this function.
    pub buffer: MachBufferFinalized<Final>,
    /// What names each name ref corresponds to.
    name_map: PrimaryMap<UserExternalNameRef, UserExternalName>,
    /// The alignment for the compiled function.
    pub alignment: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum RelocationTarget {
    /// A call to another function in this module, by full-index-space
    /// function index.
    Wasm(u32),
}

#[derive(Debug)]
pub struct Relocation {
    pub kind: binemit::Reloc,
    pub target: RelocationTarget,
    pub addend: binemit::Addend,
    pub offset: binemit::CodeOffset,
}

impl CompiledFunction {
    pub fn new(
        buffer: MachBufferFinalized<Final>,
        name_map: PrimaryMap<UserExternalNameRef, UserExternalName>,
        alignment: u32,
    ) -> Self {
        Self {
            buffer,
            name_map,
            alignment,
        }
    }

    /// Returns the function's relocations. All of them target other
    /// functions in the same text section (builtins and imports are reached
    /// through the VMContext, which leaves nothing else to relocate).
    pub fn relocations(&self) -> Result<Vec<Relocation>, CompileError> {
        self.buffer
            .relocs()
            .iter()
            .map(|reloc| mach_reloc_to_reloc(reloc, &self.name_map))
            .collect()
    }

    /// Trap sites recorded by codegen, as (code offset, kind) pairs.
    pub fn traps(&self) -> impl Iterator<Item = (u32, TrapKind)> + '_ {
        self.buffer.traps().iter().filter_map(|trap| {
            let kind = TrapKind::from_trap_code(trap.code)?;
            Some((trap.offset, kind))
        })
    }
}

fn mach_reloc_to_reloc(
    reloc: &FinalizedMachReloc,
    name_map: &PrimaryMap<UserExternalNameRef, UserExternalName>,
) -> Result<Relocation, CompileError> {
    let &FinalizedMachReloc {
        offset,
        kind,
        ref target,
        addend,
    } = reloc;

    let target = match *target {
        FinalizedRelocTarget::ExternalName(ExternalName::User(user_func_ref)) => {
            let name = &name_map[user_func_ref];
            match name.namespace {
                NS_WASM_FUNC => RelocationTarget::Wasm(name.index),
                other => {
                    return Err(CompileError::UnsupportedReloc(format!(
                        "unknown name namespace {other}"
                    )))
                }
            }
        }
        FinalizedRelocTarget::ExternalName(ExternalName::LibCall(libcall)) => {
            // Cranelift emits libcalls for operations with no ISA lowering;
            // the supported targets with host feature detection have native
            // lowerings for everything the emitter produces.
            return Err(CompileError::UnsupportedReloc(format!(
                "libcall {libcall:?}"
            )));
        }
        _ => {
            return Err(CompileError::UnsupportedReloc(format!(
                "unsupported relocation target {target:?}"
            )))
        }
    };

    Ok(Relocation {
        kind,
        target,
        addend,
        offset,
    })
}
