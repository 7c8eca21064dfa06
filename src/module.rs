// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use crate::compile::{build_object, parse_object, CompileOutput};
use crate::emit::FuncEnv;
use crate::engine::Engine;
use crate::ir;
use crate::vm::{CodeInfo, CodeMemory, FunctionLoc, VMContextOffsets};
use crate::{Error, Result};

/// A compiled module artifact: the IR's structural metadata plus a
/// published native image. Cheap to clone; instances share it.
#[derive(Clone)]
pub struct Module(pub(crate) Arc<ModuleInner>);

pub(crate) struct ModuleInner {
    engine: Engine,
    ir: Arc<ir::Module>,
    /// The serialized carrier; what [`Module::object_code`] returns.
    object_code: Arc<Vec<u8>>,
    code: CodeMemory,
    /// Per defined function: (body, array trampoline) locations.
    pub(crate) funcs: Vec<(FunctionLoc, FunctionLoc)>,
    /// Interned signature tag per entry of the IR type table.
    pub(crate) type_tags: Vec<u32>,
    pub(crate) offsets: VMContextOffsets,
}

impl Module {
    /// Compiles a validated IR module to native code.
    pub fn compile(engine: &Engine, module: ir::Module) -> Result<Module> {
        let type_tags: Vec<u32> = module
            .types
            .iter()
            .map(|ty| engine.intern_type(ty))
            .collect();

        let compiler = engine.compiler();
        let env = FuncEnv::new(compiler.target_isa(), &module, &type_tags);
        let num_defined = module.functions.len() as u32;

        tracing::debug!(
            "compiling module '{}': {} function(s)",
            module.debug_name,
            num_defined
        );

        let mut outputs = Vec::with_capacity(2 * num_defined as usize);
        for def_index in 0..num_defined {
            let function = compiler.compile_function(&env, def_index)?;
            outputs.push(CompileOutput {
                function,
                symbol: function_symbol(&module, def_index),
            });
        }
        for def_index in 0..num_defined {
            let function = compiler.compile_array_trampoline(&env, def_index)?;
            outputs.push(CompileOutput {
                function,
                symbol: format!("array_to_wasm[{def_index}]"),
            });
        }

        let object_code = build_object(
            compiler.target_isa(),
            outputs,
            num_defined,
            module.num_imported_funcs(),
            module.fingerprint(),
        )?;

        Self::load(engine, Arc::new(module), object_code, type_tags)
    }

    /// Reloads a previously emitted image. The IR module is still required
    /// for its structural metadata; an image whose fingerprint does not
    /// match it is rejected.
    pub fn load_precompiled(
        engine: &Engine,
        module: ir::Module,
        object_code: &[u8],
    ) -> Result<Module> {
        let type_tags: Vec<u32> = module
            .types
            .iter()
            .map(|ty| engine.intern_type(ty))
            .collect();
        Self::load(engine, Arc::new(module), object_code.to_vec(), type_tags)
    }

    fn load(
        engine: &Engine,
        ir: Arc<ir::Module>,
        object_code: Vec<u8>,
        type_tags: Vec<u32>,
    ) -> Result<Module> {
        let parsed = parse_object(&object_code, ir.fingerprint())?;

        if parsed.funcs.len() != ir.functions.len() {
            return Err(Error::PrecompiledMismatch(format!(
                "image has {} function(s), IR declares {}",
                parsed.funcs.len(),
                ir.functions.len()
            )));
        }

        // Symbolization table: bodies and trampolines, sorted by offset.
        let mut functions = Vec::with_capacity(2 * parsed.funcs.len());
        for (def_index, (wasm_loc, array_loc)) in parsed.funcs.iter().enumerate() {
            functions.push((*wasm_loc, function_symbol(&ir, def_index as u32)));
            functions.push((*array_loc, format!("array_to_wasm[{def_index}]")));
        }
        functions.sort_by_key(|(loc, _)| loc.start);

        let mut trap_table: Vec<(u32, crate::trap::TrapKind)> = parsed
            .trap_offsets
            .iter()
            .copied()
            .zip(parsed.traps.iter().copied())
            .collect();
        trap_table.sort_by_key(|(offset, _)| *offset);

        let info = CodeInfo {
            trap_offsets: trap_table.iter().map(|(offset, _)| *offset).collect(),
            traps: trap_table.iter().map(|(_, kind)| *kind).collect(),
            functions,
            debug_name: ir.debug_name.clone(),
        };

        let mut code = CodeMemory::with_text(parsed.text, info)?;
        code.publish()?;

        // `parsed` borrows the serialized bytes; take what outlives it
        // before the bytes move into the artifact.
        let funcs = parsed.funcs;

        Ok(Module(Arc::new(ModuleInner {
            engine: engine.clone(),
            offsets: VMContextOffsets::for_module(&ir),
            ir,
            object_code: Arc::new(object_code),
            code,
            funcs,
            type_tags,
        })))
    }

    pub fn engine(&self) -> &Engine {
        &self.0.engine
    }

    /// The IR this module was compiled from.
    pub fn ir(&self) -> &ir::Module {
        &self.0.ir
    }

    /// The serialized object code; feed it to [`Module::load_precompiled`]
    /// to bypass a redundant compilation.
    pub fn object_code(&self) -> &[u8] {
        &self.0.object_code
    }

    /// Absolute entry address of defined function `def_index`.
    pub(crate) fn wasm_entry(&self, def_index: u32) -> *const u8 {
        self.0
            .code
            .resolve_function_loc(self.0.funcs[def_index as usize].0) as *const u8
    }

    /// Absolute address of the array-call trampoline of defined function
    /// `def_index`.
    pub(crate) fn array_entry(&self, def_index: u32) -> *const u8 {
        self.0
            .code
            .resolve_function_loc(self.0.funcs[def_index as usize].1) as *const u8
    }

    /// The interned signature tag of function index `func_index`.
    pub(crate) fn func_type_tag(&self, func_index: u32) -> u32 {
        self.0.type_tags[self.0.ir.func_type_index(func_index) as usize]
    }
}

impl core::fmt::Debug for Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("debug_name", &self.0.ir.debug_name)
            .finish_non_exhaustive()
    }
}

fn function_symbol(module: &ir::Module, def_index: u32) -> String {
    let name = &module.functions[def_index as usize].debug_name;
    if name.is_empty() {
        format!("wasm[{def_index}]")
    } else {
        format!("wasm[{def_index}]::{name}")
    }
}
