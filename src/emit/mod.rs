// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The structured-IR to machine code emitter.
//!
//! [`Compiler::compile_function`] lowers one IR function into Cranelift IR
//! and compiles it; [`Compiler::compile_array_trampoline`] additionally
//! produces the array-call entry point for the function, which the unchecked
//! invocation path and cross-module funcrefs use.

mod expr;
mod ops;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    self, AbiParam, ArgumentPurpose, InstBuilder, MemFlags, Signature, UserExternalName,
    UserFuncName,
};
use cranelift_codegen::isa::{CallConv, TargetIsa};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};

use crate::compile::CompiledFunction;
use crate::errors::CompileError;
use crate::ir as vir;
use crate::trap::TrapKind;
use crate::types::{FuncType, ValKind};
use crate::utils::i32_offset_of;
use crate::vm::vmcontext::{VMContextOffsets, VMContextRuntime};

/// Namespace for user external names that refer to compiled wasm functions;
/// the index is the function index in the module's full index space.
pub const NS_WASM_FUNC: u32 = 0;

/// Returns the corresponding cranelift type for the provided value kind.
pub fn value_type(kind: ValKind) -> ir::Type {
    match kind {
        ValKind::I32 => ir::types::I32,
        ValKind::I64 => ir::types::I64,
        ValKind::F32 => ir::types::F32,
        ValKind::F64 => ir::types::F64,
        ValKind::V128 => ir::types::I8X16,
        // References are pointer-sized bit patterns in compiled code.
        ValKind::FuncRef | ValKind::AnyRef | ValKind::NullRef => ir::types::I64,
    }
}

fn blank_sig(isa: &dyn TargetIsa, call_conv: CallConv) -> Signature {
    let pointer_type = isa.pointer_type();
    let mut sig = Signature::new(call_conv);

    // The callee instance's VMContext and the invoking context's runtime.
    sig.params
        .push(AbiParam::special(pointer_type, ArgumentPurpose::VMContext));
    sig.params.push(AbiParam::new(pointer_type));

    sig
}

/// The internal calling convention of compiled functions:
/// `(vmctx, cctx, params…) -> results`.
pub fn wasm_call_signature(isa: &dyn TargetIsa, func_ty: &FuncType) -> Signature {
    let mut sig = blank_sig(isa, CallConv::Fast);

    let cvt = |kind: &ValKind| AbiParam::new(value_type(*kind));
    sig.params.extend(func_ty.params().iter().map(&cvt));
    sig.returns.extend(func_ty.results().iter().map(&cvt));

    sig
}

/// The array calling convention every function also gets an entry point
/// for: `extern "C" fn(vmctx, cctx, values)`, where `values` is a buffer of
/// 16-byte slots holding the arguments on entry and the results on return.
pub fn array_call_signature(isa: &dyn TargetIsa) -> Signature {
    let mut sig = blank_sig(isa, CallConv::triple_default(isa.triple()));
    sig.params.push(AbiParam::new(isa.pointer_type()));
    sig
}

/// Signature of a runtime builtin, by index. Builtins use the platform
/// calling convention; they are plain `extern "C"` Rust functions.
pub fn builtin_signature(
    isa: &dyn TargetIsa,
    index: crate::vm::BuiltinFunctionIndex,
) -> Signature {
    use crate::vm::BuiltinFunctionIndex as B;

    let ptr = isa.pointer_type();
    let mut sig = Signature::new(CallConv::triple_default(isa.triple()));

    if index == B::memory_grow() {
        sig.params.push(AbiParam::new(ptr)); // vmctx
        sig.params.push(AbiParam::new(ir::types::I32)); // memory_index
        sig.params.push(AbiParam::new(ir::types::I64)); // delta
        sig.returns.push(AbiParam::new(ir::types::I64));
    } else if index == B::throw() {
        sig.params.push(AbiParam::new(ptr)); // vmctx
        sig.params.push(AbiParam::new(ptr)); // cctx
        sig.params.push(AbiParam::new(ir::types::I32)); // tag_index
        sig.params.push(AbiParam::new(ptr)); // args
    } else if index == B::trap_indirect_call() {
        sig.params.push(AbiParam::new(ptr)); // vmctx
        sig.params.push(AbiParam::new(ir::types::I32)); // table_index
        sig.params.push(AbiParam::new(ir::types::I64)); // elem_index
        sig.params.push(AbiParam::new(ir::types::I32)); // is_null
    } else if index == B::trap_misaligned() {
        sig.params.push(AbiParam::new(ptr)); // vmctx
        sig.params.push(AbiParam::new(ir::types::I64)); // addr
    } else {
        unreachable!("unknown builtin");
    }

    sig
}

/// Per-module immutable facts the emitter consults.
pub struct FuncEnv<'a> {
    pub module: &'a vir::Module,
    pub offsets: VMContextOffsets,
    /// Interned signature tag per entry of `module.types`.
    pub type_tags: &'a [u32],
    pub isa: &'a dyn TargetIsa,
}

impl<'a> FuncEnv<'a> {
    pub fn new(isa: &'a dyn TargetIsa, module: &'a vir::Module, type_tags: &'a [u32]) -> Self {
        Self {
            module,
            offsets: VMContextOffsets::for_module(module),
            type_tags,
            isa,
        }
    }

    pub fn pointer_type(&self) -> ir::Type {
        self.isa.pointer_type()
    }

    /// The function type of function index `index`.
    pub fn func_type(&self, index: u32) -> &'a FuncType {
        &self.module.types[self.module.func_type_index(index) as usize]
    }
}

/// Structured IR to machine code compiler for one target.
pub struct Compiler {
    isa: cranelift_codegen::isa::OwnedTargetIsa,
}

impl Compiler {
    pub fn new(isa: cranelift_codegen::isa::OwnedTargetIsa) -> Self {
        Self { isa }
    }

    pub fn target_isa(&self) -> &dyn TargetIsa {
        self.isa.as_ref()
    }

    /// Compiles the body of defined function `def_index`.
    pub fn compile_function(
        &self,
        env: &FuncEnv<'_>,
        def_index: u32,
    ) -> Result<CompiledFunction, CompileError> {
        let isa = self.target_isa();
        let module = env.module;
        let func_index = module.num_imported_funcs() + def_index;
        let func_def = &module.functions[def_index as usize];
        let func_ty = &module.types[func_def.type_index as usize];

        if func_ty.results().len() > 1 {
            return Err(CompileError::MalformedIr(
                "multiple results are not supported".to_string(),
            ));
        }

        let mut ctx = CompilationContext::new(isa);
        ctx.codegen_context.func.signature = wasm_call_signature(isa, func_ty);
        ctx.codegen_context.func.name = UserFuncName::User(UserExternalName {
            namespace: NS_WASM_FUNC,
            index: func_index,
        });

        {
            let mut builder =
                FunctionBuilder::new(&mut ctx.codegen_context.func, &mut ctx.func_ctx);

            let entry_block = builder.create_block();
            builder.append_block_params_for_function_params(entry_block);
            builder.switch_to_block(entry_block);
            builder.seal_block(entry_block); // Declare all predecessors known.

            let cctx = builder.block_params(entry_block)[1];
            emit_stack_check(&mut builder, isa, cctx);

            expr::emit_function_body(&mut builder, env, func_def, func_ty)?;
            builder.finalize();
        }

        tracing::trace!(
            "lowered {} to CLIF:\n{}",
            func_def.debug_name,
            ctx.codegen_context.func.display()
        );

        ctx.finish(isa)
    }

    /// Compiles the array-call entry point for defined function `def_index`:
    /// unpacks arguments from the value buffer, calls the function, packs
    /// the results back.
    pub fn compile_array_trampoline(
        &self,
        env: &FuncEnv<'_>,
        def_index: u32,
    ) -> Result<CompiledFunction, CompileError> {
        let isa = self.target_isa();
        let module = env.module;
        let func_index = module.num_imported_funcs() + def_index;
        let func_def = &module.functions[def_index as usize];
        let func_ty = &module.types[func_def.type_index as usize];

        let mut ctx = CompilationContext::new(isa);
        ctx.codegen_context.func.signature = array_call_signature(isa);

        {
            let mut builder =
                FunctionBuilder::new(&mut ctx.codegen_context.func, &mut ctx.func_ctx);

            let entry_block = builder.create_block();
            builder.append_block_params_for_function_params(entry_block);
            builder.switch_to_block(entry_block);
            builder.seal_block(entry_block);

            let vmctx = builder.block_params(entry_block)[0];
            let cctx = builder.block_params(entry_block)[1];
            let values = builder.block_params(entry_block)[2];

            let mut args = vec![vmctx, cctx];
            for (i, kind) in func_ty.params().iter().enumerate() {
                let offset = i32::try_from(i * 16).unwrap();
                args.push(builder.ins().load(
                    value_type(*kind),
                    MemFlags::trusted(),
                    values,
                    offset,
                ));
            }

            let callee_sig = builder
                .func
                .import_signature(wasm_call_signature(isa, func_ty));
            let name_ref = builder
                .func
                .declare_imported_user_function(UserExternalName {
                    namespace: NS_WASM_FUNC,
                    index: func_index,
                });
            let callee = builder.func.import_function(ir::ExtFuncData {
                name: ir::ExternalName::User(name_ref),
                signature: callee_sig,
                colocated: true,
            });

            let call = builder.ins().call(callee, &args);
            let results = builder.func.dfg.inst_results(call).to_vec();
            for (i, result) in results.iter().enumerate() {
                let offset = i32::try_from(i * 16).unwrap();
                builder
                    .ins()
                    .store(MemFlags::trusted(), *result, values, offset);
            }
            builder.ins().return_(&[]);
            builder.finalize();
        }

        ctx.finish(isa)
    }
}

/// Guards the prologue against stack exhaustion: trap before the frame can
/// run past the budget recorded in the context runtime.
fn emit_stack_check(builder: &mut FunctionBuilder<'_>, isa: &dyn TargetIsa, cctx: ir::Value) {
    let ptr = isa.pointer_type();
    let limit = builder.ins().load(
        ptr,
        MemFlags::trusted(),
        cctx,
        i32_offset_of!(VMContextRuntime, stack_limit),
    );
    let sp = builder.ins().get_stack_pointer(ptr);
    let overflowed = builder.ins().icmp(IntCC::UnsignedLessThan, sp, limit);
    builder
        .ins()
        .trapnz(overflowed, TrapKind::StackOverflow.into_trap_code());
}

/// The compilation context for a single function.
struct CompilationContext {
    func_ctx: FunctionBuilderContext,
    codegen_context: Context,
}

impl CompilationContext {
    fn new(_isa: &dyn TargetIsa) -> Self {
        Self {
            func_ctx: FunctionBuilderContext::new(),
            codegen_context: Context::new(),
        }
    }

    fn finish(mut self, isa: &dyn TargetIsa) -> Result<CompiledFunction, CompileError> {
        let compiled_code = self
            .codegen_context
            .compile(isa, &mut ControlPlane::default())?;

        let preferred_alignment = isa.function_alignment().preferred;
        let alignment = compiled_code.buffer.alignment.max(preferred_alignment);

        Ok(CompiledFunction::new(
            compiled_code.buffer.clone(),
            self.codegen_context.func.params.user_named_funcs().clone(),
            alignment,
        ))
    }
}
