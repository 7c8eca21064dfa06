// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The structured-IR expression visitor.
//!
//! Control flow is lowered onto basic blocks with block parameters as the
//! typed join points: every in-scope branch target is a frame on
//! [`ExprEmitter::targets`] holding its join block; a `Branch` walks the
//! stack, passes its value as a jump argument and counts the edge.
//!
//! After a terminator the emitter parks in a fresh predecessor-less block
//! and stops emitting: expressions in unreachable positions produce no
//! instructions and yield a sentinel value that, by construction, no emitted
//! instruction ever consumes (every consumer re-checks reachability after
//! evaluating its operands). The empty dead blocks are closed with a trap to
//! keep the layout well-formed and are swept by Cranelift.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::immediates::{Ieee32, Ieee64};
use cranelift_codegen::ir::{
    self, Block, GlobalValue, GlobalValueData, InstBuilder, MemFlags, StackSlotData, StackSlotKind,
    TrapCode, UserExternalName, Value,
};
use cranelift_entity::EntityRef;
use cranelift_frontend::{FunctionBuilder, Variable};
use hashbrown::HashMap;

use super::ops;
use super::{builtin_signature, value_type, wasm_call_signature, FuncEnv, NS_WASM_FUNC};
use crate::errors::CompileError;
use crate::ir::{AddrWidth, Expr, Extension, FunctionDef, Literal, MemOp, TargetId, Type};
use crate::trap::TrapKind;
use crate::types::{FuncType, Mutability, ValKind};
use crate::utils::i32_offset_of;
use crate::vm::vmcontext::{VMContextRuntime, VMFuncRef, VMFunctionImport, VMTableDefinition};
use crate::vm::BuiltinFunctionIndex;
use crate::{ADDRESS_MASK, WASM_PAGE_SIZE};

/// An in-scope branch target: the join block branches deliver values to,
/// and the number of recorded incoming edges.
struct TargetFrame {
    id: TargetId,
    block: Block,
    kind: Option<ValKind>,
    edges: u32,
}

pub fn emit_function_body(
    builder: &mut FunctionBuilder<'_>,
    env: &FuncEnv<'_>,
    func_def: &FunctionDef,
    func_ty: &FuncType,
) -> Result<(), CompileError> {
    let entry_block = builder.current_block().unwrap();
    let vmctx = builder.block_params(entry_block)[0];
    let cctx = builder.block_params(entry_block)[1];

    // The sentinel returned for unreachable positions. Never consumed by an
    // emitted instruction; dead if the function has no unreachable code.
    let sentinel = builder.ins().iconst(ir::types::I32, 0);

    let mut emitter = ExprEmitter {
        builder,
        env,
        func_def,
        return_kind: func_ty.results().first().copied(),
        locals: Vec::new(),
        targets: Vec::new(),
        reachable: true,
        sentinel,
        vmctx,
        cctx,
        vmctx_gv: None,
        memory_base_gvs: HashMap::new(),
        table_def_gvs: HashMap::new(),
        global_def_gvs: HashMap::new(),
        builtin_sigs: HashMap::new(),
        func_refs: HashMap::new(),
        sig_refs: HashMap::new(),
    };

    emitter.declare_locals(entry_block, func_ty);

    let want = emitter.return_kind.map_or(Type::Void, Type::Val);
    let result = emitter.emit(&func_def.body, want)?;

    if emitter.reachable {
        match result {
            Some(value) => {
                emitter.builder.ins().return_(&[value]);
            }
            None => {
                emitter.builder.ins().return_(&[]);
            }
        }
    } else {
        emitter.close_dead_block();
    }

    debug_assert!(emitter.targets.is_empty());
    Ok(())
}

struct ExprEmitter<'a, 'b, 'c> {
    builder: &'a mut FunctionBuilder<'c>,
    env: &'a FuncEnv<'b>,
    func_def: &'a FunctionDef,
    return_kind: Option<ValKind>,
    locals: Vec<(Variable, ValKind)>,
    targets: Vec<TargetFrame>,
    /// Whether the current insertion point is reachable. While false,
    /// nothing is emitted and every expression yields the sentinel.
    reachable: bool,
    sentinel: Value,
    vmctx: Value,
    cctx: Value,
    vmctx_gv: Option<GlobalValue>,
    memory_base_gvs: HashMap<u32, GlobalValue>,
    table_def_gvs: HashMap<u32, GlobalValue>,
    global_def_gvs: HashMap<u32, GlobalValue>,
    builtin_sigs: HashMap<u32, ir::SigRef>,
    func_refs: HashMap<u32, ir::FuncRef>,
    sig_refs: HashMap<u32, ir::SigRef>,
}

impl<'a, 'b, 'c> ExprEmitter<'a, 'b, 'c> {
    fn declare_locals(&mut self, entry_block: Block, func_ty: &FuncType) {
        // Parameters occupy the first locals and are seeded from the
        // incoming arguments; the rest are zero-initialized.
        for (i, kind) in func_ty.params().iter().enumerate() {
            let local = Variable::new(i);
            self.builder.declare_var(local, value_type(*kind));
            let param_value = self.builder.block_params(entry_block)[2 + i];
            self.builder.def_var(local, param_value);
            self.locals.push((local, *kind));
        }

        let num_params = func_ty.params().len();
        for (i, kind) in self.func_def.locals.iter().enumerate() {
            let local = Variable::new(num_params + i);
            self.builder.declare_var(local, value_type(*kind));
            let init = self.zero_value(*kind);
            self.builder.def_var(local, init);
            self.locals.push((local, *kind));
        }
    }

    fn zero_value(&mut self, kind: ValKind) -> Value {
        match kind {
            ValKind::I32 => self.builder.ins().iconst(ir::types::I32, 0),
            ValKind::I64 => self.builder.ins().iconst(ir::types::I64, 0),
            ValKind::F32 => self.builder.ins().f32const(Ieee32::with_bits(0)),
            ValKind::F64 => self.builder.ins().f64const(Ieee64::with_bits(0)),
            ValKind::V128 => {
                let handle = self
                    .builder
                    .func
                    .dfg
                    .constants
                    .insert([0; 16].to_vec().into());
                self.builder.ins().vconst(ir::types::I8X16, handle)
            }
            ValKind::FuncRef | ValKind::AnyRef | ValKind::NullRef => {
                self.builder.ins().iconst(ir::types::I64, 0)
            }
        }
    }

    /// The placeholder for positions whose computation cannot complete. No
    /// emitted instruction consumes it.
    fn placeholder(&self, want: Type) -> Option<Value> {
        want.val().map(|_| self.sentinel)
    }

    fn vmctx_gv(&mut self) -> GlobalValue {
        if let Some(gv) = self.vmctx_gv {
            return gv;
        }
        let gv = self
            .builder
            .func
            .create_global_value(GlobalValueData::VMContext);
        self.vmctx_gv = Some(gv);
        gv
    }

    /// Global value holding the (immovable) base of memory `index`:
    /// `*(*(vmctx + memories[index]))`. Both loads are readonly, the base
    /// address of a memory never changes.
    fn memory_base(&mut self, index: u32) -> Value {
        let ptr = self.env.pointer_type();
        if let Some(gv) = self.memory_base_gvs.get(&index) {
            return self.builder.ins().global_value(ptr, *gv);
        }

        let vmctx = self.vmctx_gv();
        let flags = MemFlags::trusted().with_readonly();
        let def_ptr = self.builder.func.create_global_value(GlobalValueData::Load {
            base: vmctx,
            offset: i32::try_from(self.env.offsets.memory_pointer(index))
                .unwrap()
                .into(),
            global_type: ptr,
            flags,
        });
        let base = self.builder.func.create_global_value(GlobalValueData::Load {
            base: def_ptr,
            offset: 0.into(),
            global_type: ptr,
            flags,
        });
        self.memory_base_gvs.insert(index, base);
        self.builder.ins().global_value(ptr, base)
    }

    /// Pointer to the `VMMemoryDefinition` of memory `index`.
    fn memory_definition(&mut self, index: u32) -> Value {
        let ptr = self.env.pointer_type();
        let vmctx = self.vmctx_gv();
        let gv = self.builder.func.create_global_value(GlobalValueData::Load {
            base: vmctx,
            offset: i32::try_from(self.env.offsets.memory_pointer(index))
                .unwrap()
                .into(),
            global_type: ptr,
            flags: MemFlags::trusted().with_readonly(),
        });
        self.builder.ins().global_value(ptr, gv)
    }

    /// Pointer to the `VMTableDefinition` of table `index`.
    fn table_definition(&mut self, index: u32) -> Value {
        let ptr = self.env.pointer_type();
        if let Some(gv) = self.table_def_gvs.get(&index) {
            return self.builder.ins().global_value(ptr, *gv);
        }
        let vmctx = self.vmctx_gv();
        let gv = self.builder.func.create_global_value(GlobalValueData::Load {
            base: vmctx,
            offset: i32::try_from(self.env.offsets.table_pointer(index))
                .unwrap()
                .into(),
            global_type: ptr,
            flags: MemFlags::trusted().with_readonly(),
        });
        self.table_def_gvs.insert(index, gv);
        self.builder.ins().global_value(ptr, gv)
    }

    /// Pointer to the `VMGlobalDefinition` of (immutable) global `index`.
    fn global_definition(&mut self, index: u32) -> Value {
        let ptr = self.env.pointer_type();
        if let Some(gv) = self.global_def_gvs.get(&index) {
            return self.builder.ins().global_value(ptr, *gv);
        }
        let vmctx = self.vmctx_gv();
        let gv = self.builder.func.create_global_value(GlobalValueData::Load {
            base: vmctx,
            offset: i32::try_from(self.env.offsets.global_definition_pointer(index))
                .unwrap()
                .into(),
            global_type: ptr,
            flags: MemFlags::trusted().with_readonly(),
        });
        self.global_def_gvs.insert(index, gv);
        self.builder.ins().global_value(ptr, gv)
    }

    /// Address of mutable global `index` inside the invoking context's
    /// buffer.
    fn mutable_global_addr(&mut self, index: u32) -> Value {
        let ptr = self.env.pointer_type();
        let offset = self.builder.ins().load(
            ptr,
            MemFlags::trusted().with_readonly(),
            self.vmctx,
            i32::try_from(self.env.offsets.global_offset_word(index)).unwrap(),
        );
        let base = self.builder.ins().load(
            ptr,
            MemFlags::trusted(),
            self.cctx,
            i32_offset_of!(VMContextRuntime, globals),
        );
        self.builder.ins().iadd(base, offset)
    }

    /// Closes the current (dead, unterminated) block so the layout stays
    /// valid; the block has no predecessors and is swept by Cranelift.
    fn close_dead_block(&mut self) {
        debug_assert!(!self.reachable);
        self.builder
            .ins()
            .trap(TrapKind::UnreachableCodeReached.into_trap_code());
    }

    /// Emits a jump to `dest` when reachable (returning true), otherwise
    /// closes the dead block. Either way the current block is terminated.
    fn end_block_with_jump(&mut self, dest: Block, args: &[Value]) -> bool {
        if self.reachable {
            self.builder.ins().jump(dest, args);
            true
        } else {
            self.close_dead_block();
            false
        }
    }

    /// Parks the emitter in a fresh predecessor-less block after a
    /// terminator.
    fn enter_dead_code(&mut self) {
        let block = self.builder.create_block();
        self.builder.seal_block(block);
        self.builder.switch_to_block(block);
        self.reachable = false;
    }

    fn find_target(&self, id: TargetId) -> Result<usize, CompileError> {
        self.targets
            .iter()
            .rposition(|frame| frame.id == id)
            .ok_or_else(|| {
                CompileError::MalformedIr(format!("branch to out-of-scope target {id:?}"))
            })
    }

    fn builtin_sig(&mut self, index: BuiltinFunctionIndex) -> ir::SigRef {
        if let Some(sig) = self.builtin_sigs.get(&index.as_u32()) {
            return *sig;
        }
        let sig = self
            .builder
            .func
            .import_signature(builtin_signature(self.env.isa, index));
        self.builtin_sigs.insert(index.as_u32(), sig);
        sig
    }

    /// Loads the entry of the builtin array for `index`; the array address
    /// itself lives in the VMContext.
    fn builtin_callee(&mut self, index: BuiltinFunctionIndex) -> Value {
        let ptr = self.env.pointer_type();
        let flags = MemFlags::trusted().with_readonly();
        let array = self.builder.ins().load(
            ptr,
            flags,
            self.vmctx,
            i32::try_from(self.env.offsets.builtins()).unwrap(),
        );
        self.builder
            .ins()
            .load(ptr, flags, array, i32::try_from(index.as_u32() * 8).unwrap())
    }

    fn call_builtin(&mut self, index: BuiltinFunctionIndex, args: &[Value]) -> ir::Inst {
        let sig = self.builtin_sig(index);
        let callee = self.builtin_callee(index);
        self.builder.ins().call_indirect(sig, callee, args)
    }

    /// Direct-call `FuncRef` for defined function `func_index`.
    fn direct_func_ref(&mut self, func_index: u32) -> ir::FuncRef {
        if let Some(fr) = self.func_refs.get(&func_index) {
            return *fr;
        }
        let ty = self.env.func_type(func_index);
        let sig = self
            .builder
            .func
            .import_signature(wasm_call_signature(self.env.isa, ty));
        let name_ref = self
            .builder
            .func
            .declare_imported_user_function(UserExternalName {
                namespace: NS_WASM_FUNC,
                index: func_index,
            });
        let fr = self.builder.func.import_function(ir::ExtFuncData {
            name: ir::ExternalName::User(name_ref),
            signature: sig,
            colocated: true,
        });
        self.func_refs.insert(func_index, fr);
        fr
    }

    /// Imported signature for the module type-table entry `type_index`.
    fn wasm_sig_ref(&mut self, type_index: u32) -> ir::SigRef {
        if let Some(sig) = self.sig_refs.get(&type_index) {
            return *sig;
        }
        let ty = &self.env.module.types[type_index as usize];
        let sig = self
            .builder
            .func
            .import_signature(wasm_call_signature(self.env.isa, ty));
        self.sig_refs.insert(type_index, sig);
        sig
    }

    /// Emits `expr`, returning its value when the position's type `want` is
    /// non-Void. In unreachable positions nothing is emitted and the
    /// sentinel is returned.
    fn emit(&mut self, expr: &Expr, want: Type) -> Result<Option<Value>, CompileError> {
        if !self.reachable {
            return Ok(self.placeholder(want));
        }

        let value = match expr {
            Expr::Literal(literal) => Some(self.emit_literal(literal)),

            Expr::LocalGet(index) => {
                let (local, _) = self.locals[*index as usize];
                Some(self.builder.use_var(local))
            }
            Expr::LocalSet(index, value) => {
                let (local, kind) = self.locals[*index as usize];
                let value = self.emit_value(value, kind)?;
                if self.reachable {
                    self.builder.def_var(local, value);
                    Some(value)
                } else {
                    Some(self.sentinel)
                }
            }

            Expr::GlobalGet(index) => Some(self.emit_global_get(*index)?),
            Expr::GlobalSet(index, value) => {
                let ty = self.env.module.global_type(*index);
                debug_assert_eq!(ty.mutability, Mutability::Var);
                let value = self.emit_value(value, ty.content)?;
                if self.reachable {
                    let addr = self.mutable_global_addr(*index);
                    self.builder.ins().store(MemFlags::trusted(), value, addr, 0);
                }
                None
            }

            Expr::Load {
                memory,
                addr,
                width,
                mem_op,
                result,
                extend,
                align_log2: _,
                atomic,
            } => Some(self.emit_load(*memory, addr, *width, *mem_op, *result, *extend, *atomic)?),
            Expr::Store {
                memory,
                addr,
                width,
                mem_op,
                value,
                value_kind,
                align_log2: _,
                atomic,
            } => {
                self.emit_store(*memory, addr, *width, *mem_op, value, *value_kind, *atomic)?;
                None
            }

            Expr::Unary { op, operand } => {
                let operand_kind = self.infer_kind(operand).unwrap_or(ValKind::I32);
                let x = self.emit_value(operand, operand_kind)?;
                if self.reachable {
                    Some(ops::emit_unary(self.builder, *op, x))
                } else {
                    Some(self.sentinel)
                }
            }
            Expr::Binary { op, ty, lhs, rhs } => {
                let lhs = self.emit_value(lhs, *ty)?;
                let rhs = self.emit_value(rhs, *ty)?;
                if self.reachable {
                    Some(ops::emit_binary(self.builder, *op, lhs, rhs))
                } else {
                    Some(self.sentinel)
                }
            }
            Expr::Compare {
                op,
                operand_ty,
                lhs,
                rhs,
            } => {
                let lhs = self.emit_value(lhs, *operand_ty)?;
                let rhs = self.emit_value(rhs, *operand_ty)?;
                if self.reachable {
                    Some(ops::emit_compare(self.builder, *op, lhs, rhs))
                } else {
                    Some(self.sentinel)
                }
            }
            Expr::Cast { op, operand } => {
                let hint = want.val().unwrap_or(ValKind::I32);
                let operand_kind = ops::cast_operand_kind(*op, hint);
                let x = self.emit_value(operand, operand_kind)?;
                if self.reachable {
                    Some(ops::emit_cast(self.builder, *op, operand_kind, x))
                } else {
                    Some(self.sentinel)
                }
            }

            Expr::CallDirect { func, args } => self.emit_call_direct(*func, args)?,
            Expr::CallIndirect {
                table,
                type_index,
                index,
                args,
            } => self.emit_call_indirect(*table, *type_index, index, args)?,

            Expr::MemoryGrow { memory, delta } => Some(self.emit_memory_grow(*memory, delta)?),
            Expr::MemorySize { memory } => Some(self.emit_memory_size(*memory)),

            Expr::Throw { tag, args } => {
                self.emit_throw(*tag, args)?;
                self.placeholder(want)
            }
            Expr::Unreachable => {
                self.builder
                    .ins()
                    .trap(TrapKind::UnreachableCodeReached.into_trap_code());
                self.enter_dead_code();
                self.placeholder(want)
            }

            Expr::Label { target, ty, body } => self.emit_label(*target, *ty, body)?,
            Expr::Loop {
                continue_target,
                break_target,
                ty,
                body,
            } => self.emit_loop(*continue_target, *break_target, *ty, body)?,
            Expr::Switch {
                key,
                key_ty,
                arms,
                default_index,
                target,
                ty,
            } => self.emit_switch(key, *key_ty, arms, *default_index, *target, *ty)?,
            Expr::IfElse {
                cond,
                ty,
                then,
                else_,
            } => self.emit_if_else(cond, *ty, then, else_)?,
            Expr::Sequence { first, second } => {
                self.emit(first, Type::Void)?;
                self.emit(second, want)?
            }
            Expr::Branch { target, value } => {
                self.emit_branch(*target, value.as_deref())?;
                self.placeholder(want)
            }
            Expr::Return { value } => {
                self.emit_return(value.as_deref())?;
                self.placeholder(want)
            }
            Expr::Nop => None,
            Expr::DiscardResult(inner) => {
                match self.infer_kind(inner) {
                    Some(kind) => {
                        self.emit(inner, Type::Val(kind))?;
                    }
                    None => {
                        self.emit(inner, Type::Void)?;
                    }
                }
                None
            }
        };

        Ok(match want {
            Type::Void => None,
            Type::Val(_) => value,
        })
    }

    /// Emits `expr` in a position that must produce a value of `kind`.
    fn emit_value(&mut self, expr: &Expr, kind: ValKind) -> Result<Value, CompileError> {
        let value = self.emit(expr, Type::Val(kind))?;
        value.ok_or_else(|| {
            CompileError::MalformedIr(format!("expected a {kind} value, found a void expression"))
        })
    }

    fn emit_literal(&mut self, literal: &Literal) -> Value {
        match literal {
            Literal::I32(v) => self.builder.ins().iconst(ir::types::I32, i64::from(*v)),
            Literal::I64(v) => self.builder.ins().iconst(ir::types::I64, *v),
            Literal::F32(bits) => self.builder.ins().f32const(Ieee32::with_bits(*bits)),
            Literal::F64(bits) => self.builder.ins().f64const(Ieee64::with_bits(*bits)),
            Literal::V128(bits) => {
                let handle = self
                    .builder
                    .func
                    .dfg
                    .constants
                    .insert(bits.to_le_bytes().to_vec().into());
                self.builder.ins().vconst(ir::types::I8X16, handle)
            }
            Literal::NullRef => self.builder.ins().iconst(ir::types::I64, 0),
        }
    }

    fn emit_global_get(&mut self, index: u32) -> Result<Value, CompileError> {
        let ty = self.env.module.global_type(index);
        let clif_ty = value_type(ty.content);

        let value = match ty.mutability {
            Mutability::Const => {
                let def = self.global_definition(index);
                // Immutable globals are written once before the first read;
                // from compiled code they are constants.
                self.builder
                    .ins()
                    .load(clif_ty, MemFlags::trusted().with_readonly(), def, 0)
            }
            Mutability::Var => {
                let addr = self.mutable_global_addr(index);
                self.builder.ins().load(clif_ty, MemFlags::trusted(), addr, 0)
            }
        };
        Ok(value)
    }

    /// Lowers a linear-memory address: evaluate, zero-extend 32-bit
    /// addresses to 64 bits (sign extension would escape the sandbox), and
    /// mask into the reservation. Returns `None` if the address expression
    /// diverted control.
    fn emit_address(
        &mut self,
        memory: u32,
        addr: &Expr,
        width: AddrWidth,
    ) -> Result<Option<(Value, Value)>, CompileError> {
        let narrow = match width {
            AddrWidth::A32 => self.emit_value(addr, ValKind::I32)?,
            AddrWidth::A64 => self.emit_value(addr, ValKind::I64)?,
        };
        if !self.reachable {
            return Ok(None);
        }
        let index = match width {
            AddrWidth::A32 => self.builder.ins().uextend(ir::types::I64, narrow),
            AddrWidth::A64 => narrow,
        };
        let masked = self
            .builder
            .ins()
            .band_imm(index, i64::try_from(ADDRESS_MASK).unwrap());
        let base = self.memory_base(memory);
        let ea = self.builder.ins().iadd(base, masked);
        Ok(Some((ea, masked)))
    }

    /// Checks natural alignment of an atomic access and diverts misaligned
    /// addresses to the trap builtin.
    fn emit_atomic_alignment_check(&mut self, masked: Value, bytes: u64) {
        debug_assert!(self.reachable);

        let rem = self
            .builder
            .ins()
            .band_imm(masked, i64::try_from(bytes - 1).unwrap());

        let trap_block = self.builder.create_block();
        let cont_block = self.builder.create_block();
        self.builder.set_cold_block(trap_block);
        self.builder
            .ins()
            .brif(rem, trap_block, &[], cont_block, &[]);
        self.builder.seal_block(trap_block);
        self.builder.seal_block(cont_block);

        self.builder.switch_to_block(trap_block);
        let vmctx = self.vmctx;
        self.call_builtin(BuiltinFunctionIndex::trap_misaligned(), &[vmctx, masked]);
        self.builder
            .ins()
            .trap(TrapKind::UnreachableCodeReached.into_trap_code());

        self.builder.switch_to_block(cont_block);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_load(
        &mut self,
        memory: u32,
        addr: &Expr,
        width: AddrWidth,
        mem_op: MemOp,
        result: ValKind,
        extend: Extension,
        atomic: bool,
    ) -> Result<Value, CompileError> {
        let Some((ea, masked)) = self.emit_address(memory, addr, width)? else {
            return Ok(self.sentinel);
        };

        // Accesses beyond the committed length fault inside the reservation;
        // the trap code marks the site for the signal handler.
        let flags = MemFlags::new().with_trap_code(Some(TrapCode::HEAP_OUT_OF_BOUNDS));
        let result_ty = value_type(result);

        if atomic {
            self.emit_atomic_alignment_check(masked, mem_op.bytes());
            return Ok(self.builder.ins().atomic_load(result_ty, flags, ea));
        }

        let value = match (mem_op, result, extend) {
            (MemOp::I8, _, Extension::Zero) => self.builder.ins().uload8(result_ty, flags, ea, 0),
            (MemOp::I8, _, Extension::Sign) => self.builder.ins().sload8(result_ty, flags, ea, 0),
            (MemOp::I16, _, Extension::Zero) => self.builder.ins().uload16(result_ty, flags, ea, 0),
            (MemOp::I16, _, Extension::Sign) => self.builder.ins().sload16(result_ty, flags, ea, 0),
            (MemOp::I32, ValKind::I64, Extension::Zero) => self.builder.ins().uload32(flags, ea, 0),
            (MemOp::I32, ValKind::I64, Extension::Sign) => self.builder.ins().sload32(flags, ea, 0),
            _ => self.builder.ins().load(result_ty, flags, ea, 0),
        };
        Ok(value)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_store(
        &mut self,
        memory: u32,
        addr: &Expr,
        width: AddrWidth,
        mem_op: MemOp,
        value: &Expr,
        value_kind: ValKind,
        atomic: bool,
    ) -> Result<(), CompileError> {
        let value = self.emit_value(value, value_kind)?;
        let Some((ea, masked)) = self.emit_address(memory, addr, width)? else {
            return Ok(());
        };

        let flags = MemFlags::new().with_trap_code(Some(TrapCode::HEAP_OUT_OF_BOUNDS));

        if atomic {
            self.emit_atomic_alignment_check(masked, mem_op.bytes());
            self.builder.ins().atomic_store(flags, value, ea);
            return Ok(());
        }

        // Stores to a narrower memory type truncate.
        match (mem_op, value_kind) {
            (MemOp::I8, _) => self.builder.ins().istore8(flags, value, ea, 0),
            (MemOp::I16, _) => self.builder.ins().istore16(flags, value, ea, 0),
            (MemOp::I32, ValKind::I64) => self.builder.ins().istore32(flags, value, ea, 0),
            _ => self.builder.ins().store(flags, value, ea, 0),
        };
        Ok(())
    }

    /// Emits call arguments: `[vmctx, cctx, args…]`. Returns `None` if an
    /// argument diverted control.
    fn emit_call_args(
        &mut self,
        ty: &FuncType,
        args: &[Expr],
    ) -> Result<Option<Vec<Value>>, CompileError> {
        debug_assert_eq!(ty.params().len(), args.len());
        let mut values = Vec::with_capacity(args.len() + 2);
        values.push(self.vmctx);
        values.push(self.cctx);
        for (arg, kind) in args.iter().zip(ty.params().iter()) {
            values.push(self.emit_value(arg, *kind)?);
        }
        Ok(self.reachable.then_some(values))
    }

    fn emit_call_direct(
        &mut self,
        func_index: u32,
        args: &[Expr],
    ) -> Result<Option<Value>, CompileError> {
        let ty = self.env.func_type(func_index).clone();
        let Some(mut call_args) = self.emit_call_args(&ty, args)? else {
            return Ok(Some(self.sentinel));
        };

        let inst = if self.env.module.is_imported_func(func_index) {
            // Imported functions go through the VMFunctionImport record:
            // swap in the callee instance's vmctx and call indirectly.
            let import_offset =
                i32::try_from(self.env.offsets.function_import(func_index)).unwrap();
            let flags = MemFlags::trusted().with_readonly();
            let ptr = self.env.pointer_type();
            let wasm_call = self.builder.ins().load(
                ptr,
                flags,
                self.vmctx,
                import_offset + i32_offset_of!(VMFunctionImport, wasm_call),
            );
            let callee_vmctx = self.builder.ins().load(
                ptr,
                flags,
                self.vmctx,
                import_offset + i32_offset_of!(VMFunctionImport, vmctx),
            );
            call_args[0] = callee_vmctx;

            let sig = self.wasm_sig_ref(self.env.module.func_type_index(func_index));
            self.builder.ins().call_indirect(sig, wasm_call, &call_args)
        } else {
            let func_ref = self.direct_func_ref(func_index);
            self.builder.ins().call(func_ref, &call_args)
        };

        Ok(self.builder.func.dfg.inst_results(inst).first().copied())
    }

    fn emit_call_indirect(
        &mut self,
        table: u32,
        type_index: u32,
        index: &Expr,
        args: &[Expr],
    ) -> Result<Option<Value>, CompileError> {
        let ptr = self.env.pointer_type();
        let ty = self.env.module.types[type_index as usize].clone();
        let expected_tag = self.env.type_tags[type_index as usize];

        // (1) evaluate the 32-bit callee index
        let index_value = self.emit_value(index, ValKind::I32)?;
        if !self.reachable {
            return Ok(Some(self.sentinel));
        }
        let index64 = self.builder.ins().uextend(ir::types::I64, index_value);

        // (2) mask with the (power-of-two) storage size
        let def = self.table_definition(table);
        let len = self.builder.ins().load(
            ptr,
            MemFlags::trusted(),
            def,
            i32_offset_of!(VMTableDefinition, current_elements),
        );
        let mask = self.builder.ins().iadd_imm(len, -1);
        let masked = self.builder.ins().band(index64, mask);

        // (3) load the function reference from the table slot
        let base = self.builder.ins().load(
            ptr,
            MemFlags::trusted(),
            def,
            i32_offset_of!(VMTableDefinition, base),
        );
        let slot = self.builder.ins().ishl_imm(masked, 3);
        let slot_addr = self.builder.ins().iadd(base, slot);
        let func_ref = self
            .builder
            .ins()
            .load(ptr, MemFlags::trusted(), slot_addr, 0);

        // Null and mismatched slots divert to cold paths that raise the
        // exception with the exact table and element index.
        let null_block = self.builder.create_block();
        let check_sig_block = self.builder.create_block();
        let mismatch_block = self.builder.create_block();
        let call_block = self.builder.create_block();
        self.builder.set_cold_block(null_block);
        self.builder.set_cold_block(mismatch_block);

        let is_null = self.builder.ins().icmp_imm(IntCC::Equal, func_ref, 0);
        self.builder
            .ins()
            .brif(is_null, null_block, &[], check_sig_block, &[]);
        self.builder.seal_block(null_block);
        self.builder.seal_block(check_sig_block);

        let vmctx = self.vmctx;

        self.builder.switch_to_block(null_block);
        let table_index_value = self.builder.ins().iconst(ir::types::I32, i64::from(table));
        let one = self.builder.ins().iconst(ir::types::I32, 1);
        self.call_builtin(
            BuiltinFunctionIndex::trap_indirect_call(),
            &[vmctx, table_index_value, masked, one],
        );
        self.builder
            .ins()
            .trap(TrapKind::UnreachableCodeReached.into_trap_code());

        self.builder.switch_to_block(check_sig_block);
        let tag = self.builder.ins().load(
            ir::types::I32,
            MemFlags::trusted().with_readonly(),
            func_ref,
            i32_offset_of!(VMFuncRef, type_index),
        );
        let tag_matches = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, tag, i64::from(expected_tag));
        self.builder
            .ins()
            .brif(tag_matches, call_block, &[], mismatch_block, &[]);
        self.builder.seal_block(mismatch_block);
        self.builder.seal_block(call_block);

        self.builder.switch_to_block(mismatch_block);
        let table_index_value = self.builder.ins().iconst(ir::types::I32, i64::from(table));
        let zero = self.builder.ins().iconst(ir::types::I32, 0);
        self.call_builtin(
            BuiltinFunctionIndex::trap_indirect_call(),
            &[vmctx, table_index_value, masked, zero],
        );
        self.builder
            .ins()
            .trap(TrapKind::UnreachableCodeReached.into_trap_code());

        // (4) call through the reference with the callee's own vmctx
        self.builder.switch_to_block(call_block);
        let flags = MemFlags::trusted().with_readonly();
        let wasm_call =
            self.builder
                .ins()
                .load(ptr, flags, func_ref, i32_offset_of!(VMFuncRef, wasm_call));
        let callee_vmctx =
            self.builder
                .ins()
                .load(ptr, flags, func_ref, i32_offset_of!(VMFuncRef, vmctx));

        let Some(mut call_args) = self.emit_call_args(&ty, args)? else {
            return Ok(Some(self.sentinel));
        };
        call_args[0] = callee_vmctx;
        let sig = self.wasm_sig_ref(type_index);
        let inst = self.builder.ins().call_indirect(sig, wasm_call, &call_args);

        Ok(self.builder.func.dfg.inst_results(inst).first().copied())
    }

    fn emit_memory_grow(&mut self, memory: u32, delta: &Expr) -> Result<Value, CompileError> {
        let delta = self.emit_value(delta, ValKind::I32)?;
        if !self.reachable {
            return Ok(self.sentinel);
        }
        let delta64 = self.builder.ins().uextend(ir::types::I64, delta);
        let memory_index = self.builder.ins().iconst(ir::types::I32, i64::from(memory));
        let vmctx = self.vmctx;
        let inst = self.call_builtin(
            BuiltinFunctionIndex::memory_grow(),
            &[vmctx, memory_index, delta64],
        );
        let old_pages = self.builder.func.dfg.inst_results(inst)[0];
        Ok(self.builder.ins().ireduce(ir::types::I32, old_pages))
    }

    fn emit_memory_size(&mut self, memory: u32) -> Value {
        let def = self.memory_definition(memory);
        let len = self.builder.ins().load(
            self.env.pointer_type(),
            MemFlags::trusted(),
            def,
            i32_offset_of!(crate::vm::VMMemoryDefinition, current_length),
        );
        let pages = self
            .builder
            .ins()
            .ushr_imm(len, i64::from(WASM_PAGE_SIZE.trailing_zeros()));
        self.builder.ins().ireduce(ir::types::I32, pages)
    }

    fn emit_throw(&mut self, tag: u32, args: &[Expr]) -> Result<(), CompileError> {
        let module = self.env.module;
        let params: Vec<ValKind> = if let Some(def) = module.defined_exception_type_index(tag) {
            module.exception_types[def as usize].params.clone()
        } else {
            let mut seen = 0;
            let mut params = Vec::new();
            for import in &module.imports {
                if let crate::ir::ImportKind::ExceptionType(p) = &import.ty {
                    if seen == tag {
                        params = p.clone();
                        break;
                    }
                    seen += 1;
                }
            }
            params
        };

        let mut values = Vec::with_capacity(params.len());
        for (arg, kind) in args.iter().zip(params.iter()) {
            values.push(self.emit_value(arg, *kind)?);
        }
        if !self.reachable {
            return Ok(());
        }

        // Spill the arguments into 16-byte slots the builtin can read.
        let size = u32::try_from(params.len().max(1) * 16).unwrap();
        let slot = self
            .builder
            .create_sized_stack_slot(StackSlotData::new(StackSlotKind::ExplicitSlot, size, 4));
        for (i, value) in values.into_iter().enumerate() {
            self.builder
                .ins()
                .stack_store(value, slot, i32::try_from(i * 16).unwrap());
        }

        let args_addr = self
            .builder
            .ins()
            .stack_addr(self.env.pointer_type(), slot, 0);
        let tag_value = self.builder.ins().iconst(ir::types::I32, i64::from(tag));
        let vmctx = self.vmctx;
        let cctx = self.cctx;
        self.call_builtin(
            BuiltinFunctionIndex::throw(),
            &[vmctx, cctx, tag_value, args_addr],
        );
        self.builder
            .ins()
            .trap(TrapKind::UnreachableCodeReached.into_trap_code());
        self.enter_dead_code();
        Ok(())
    }

    fn emit_label(
        &mut self,
        target: TargetId,
        ty: Type,
        body: &Expr,
    ) -> Result<Option<Value>, CompileError> {
        let succ = self.builder.create_block();
        if let Some(kind) = ty.val() {
            self.builder.append_block_param(succ, value_type(kind));
        }

        self.targets.push(TargetFrame {
            id: target,
            block: succ,
            kind: ty.val(),
            edges: 0,
        });

        let body_value = self.emit(body, ty)?;

        let frame = self.targets.pop().unwrap();
        let args: Vec<Value> = if self.reachable {
            body_value.into_iter().collect()
        } else {
            Vec::new()
        };
        let fell_through = self.end_block_with_jump(succ, &args);

        self.builder.seal_block(succ);
        self.builder.switch_to_block(succ);
        self.reachable = fell_through || frame.edges > 0;

        Ok(ty.val().map(|_| self.builder.block_params(succ)[0]))
    }

    fn emit_loop(
        &mut self,
        continue_target: TargetId,
        break_target: TargetId,
        ty: Type,
        body: &Expr,
    ) -> Result<Option<Value>, CompileError> {
        let header = self.builder.create_block();
        let succ = self.builder.create_block();
        if let Some(kind) = ty.val() {
            self.builder.append_block_param(succ, value_type(kind));
        }

        self.end_block_with_jump(header, &[]);
        self.builder.switch_to_block(header);

        self.targets.push(TargetFrame {
            id: continue_target,
            block: header,
            kind: None,
            edges: 0,
        });
        self.targets.push(TargetFrame {
            id: break_target,
            block: succ,
            kind: ty.val(),
            edges: 0,
        });

        self.emit(body, Type::Void)?;

        // Fallthrough at the end of the body loops back to the header;
        // only a branch to the break target escapes.
        self.end_block_with_jump(header, &[]);

        let break_frame = self.targets.pop().unwrap();
        self.targets.pop().unwrap();

        self.builder.seal_block(header);
        self.builder.seal_block(succ);
        self.builder.switch_to_block(succ);
        self.reachable = break_frame.edges > 0;

        Ok(ty.val().map(|_| self.builder.block_params(succ)[0]))
    }

    fn emit_if_else(
        &mut self,
        cond: &Expr,
        ty: Type,
        then: &Expr,
        else_: &Expr,
    ) -> Result<Option<Value>, CompileError> {
        let cond_value = self.emit_value(cond, ValKind::I32)?;

        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        let succ = self.builder.create_block();
        if let Some(kind) = ty.val() {
            self.builder.append_block_param(succ, value_type(kind));
        }

        let live_in = self.reachable;
        if live_in {
            self.builder
                .ins()
                .brif(cond_value, then_block, &[], else_block, &[]);
        } else {
            self.close_dead_block();
        }
        self.builder.seal_block(then_block);
        self.builder.seal_block(else_block);

        self.builder.switch_to_block(then_block);
        self.reachable = live_in;
        let then_value = self.emit(then, ty)?;
        let args: Vec<Value> = if self.reachable {
            then_value.into_iter().collect()
        } else {
            Vec::new()
        };
        let then_live = self.end_block_with_jump(succ, &args);

        self.builder.switch_to_block(else_block);
        self.reachable = live_in;
        let else_value = self.emit(else_, ty)?;
        let args: Vec<Value> = if self.reachable {
            else_value.into_iter().collect()
        } else {
            Vec::new()
        };
        let else_live = self.end_block_with_jump(succ, &args);

        self.builder.seal_block(succ);
        self.builder.switch_to_block(succ);
        self.reachable = then_live || else_live;

        Ok(ty.val().map(|_| self.builder.block_params(succ)[0]))
    }

    fn emit_switch(
        &mut self,
        key: &Expr,
        key_ty: ValKind,
        arms: &[crate::ir::SwitchArm],
        default_index: u32,
        target: TargetId,
        ty: Type,
    ) -> Result<Option<Value>, CompileError> {
        debug_assert!(!arms.is_empty());
        debug_assert!((default_index as usize) < arms.len());

        let key_value = self.emit_value(key, key_ty)?;

        let arm_blocks: Vec<Block> = arms.iter().map(|_| self.builder.create_block()).collect();
        let succ = self.builder.create_block();
        if let Some(kind) = ty.val() {
            self.builder.append_block_param(succ, value_type(kind));
        }

        self.targets.push(TargetFrame {
            id: target,
            block: succ,
            kind: ty.val(),
            edges: 0,
        });

        // Compare the key against each non-default arm's constant, in
        // order; ties go to the first matching arm. Everything else falls
        // to the default arm.
        let entry_live = self.reachable;
        if entry_live {
            for (i, arm) in arms.iter().enumerate() {
                if i as u32 == default_index {
                    continue;
                }
                let next = self.builder.create_block();
                let matches =
                    self.builder
                        .ins()
                        .icmp_imm(IntCC::Equal, key_value, arm.key as i64);
                self.builder
                    .ins()
                    .brif(matches, arm_blocks[i], &[], next, &[]);
                self.builder.seal_block(next);
                self.builder.switch_to_block(next);
            }
            self.builder
                .ins()
                .jump(arm_blocks[default_index as usize], &[]);
        } else {
            self.close_dead_block();
        }

        // Arms fall through to the next arm; the final arm's value becomes
        // the switch result.
        let mut fall_through = false;
        let mut final_fall = false;
        for (i, arm) in arms.iter().enumerate() {
            self.builder.switch_to_block(arm_blocks[i]);
            self.reachable = entry_live || fall_through;

            if i + 1 == arms.len() {
                let value = self.emit(&arm.body, ty)?;
                let args: Vec<Value> = if self.reachable {
                    value.into_iter().collect()
                } else {
                    Vec::new()
                };
                final_fall = self.end_block_with_jump(succ, &args);
            } else {
                self.emit(&arm.body, Type::Void)?;
                fall_through = self.end_block_with_jump(arm_blocks[i + 1], &[]);
            }
        }
        for block in &arm_blocks {
            self.builder.seal_block(*block);
        }

        let frame = self.targets.pop().unwrap();
        self.builder.seal_block(succ);
        self.builder.switch_to_block(succ);
        self.reachable = final_fall || frame.edges > 0;

        Ok(ty.val().map(|_| self.builder.block_params(succ)[0]))
    }

    fn emit_branch(&mut self, target: TargetId, value: Option<&Expr>) -> Result<(), CompileError> {
        let frame_index = self.find_target(target)?;
        let kind = self.targets[frame_index].kind;

        // A branch to a typed target carries a value.
        let mut args = Vec::new();
        if let Some(kind) = kind {
            let value = value.ok_or_else(|| {
                CompileError::MalformedIr("branch to a typed target without a value".to_string())
            })?;
            args.push(self.emit_value(value, kind)?);
        } else if let Some(value) = value {
            self.emit(value, Type::Void)?;
        }

        if self.reachable {
            let block = self.targets[frame_index].block;
            self.builder.ins().jump(block, &args);
            self.targets[frame_index].edges += 1;
            self.enter_dead_code();
        }
        Ok(())
    }

    fn emit_return(&mut self, value: Option<&Expr>) -> Result<(), CompileError> {
        let mut results = Vec::new();
        match (self.return_kind, value) {
            (Some(kind), Some(value)) => results.push(self.emit_value(value, kind)?),
            (None, Some(value)) => {
                self.emit(value, Type::Void)?;
            }
            (Some(_), None) => {
                return Err(CompileError::MalformedIr(
                    "return without a value from a typed function".to_string(),
                ))
            }
            (None, None) => {}
        }

        if self.reachable {
            self.builder.ins().return_(&results);
            self.enter_dead_code();
        }
        Ok(())
    }

    /// Infers the natural result kind of a value-producing expression, or
    /// `None` for void/diverging expressions. Used where the surrounding
    /// position does not pin a type (`DiscardResult`, unary operands).
    fn infer_kind(&self, expr: &Expr) -> Option<ValKind> {
        match expr {
            Expr::Literal(literal) => Some(literal.kind()),
            Expr::LocalGet(index) | Expr::LocalSet(index, _) => Some(self.local_kind(*index)),
            Expr::GlobalGet(index) => Some(self.env.module.global_type(*index).content),
            Expr::GlobalSet(..) => None,
            Expr::Load { result, .. } => Some(*result),
            Expr::Store { .. } => None,
            Expr::Unary { op, operand } => match op {
                crate::ir::UnaryOp::Eqz => Some(ValKind::I32),
                _ => self.infer_kind(operand),
            },
            Expr::Binary { ty, .. } => Some(*ty),
            Expr::Compare { .. } => Some(ValKind::I32),
            Expr::Cast { op, operand } => {
                let operand_kind = self.infer_kind(operand).unwrap_or(ValKind::I32);
                Some(ops::cast_result_kind(*op, operand_kind))
            }
            Expr::CallDirect { func, .. } => self.env.func_type(*func).results().first().copied(),
            Expr::CallIndirect { type_index, .. } => self.env.module.types[*type_index as usize]
                .results()
                .first()
                .copied(),
            Expr::MemoryGrow { .. } | Expr::MemorySize { .. } => Some(ValKind::I32),
            Expr::Throw { .. } | Expr::Unreachable => None,
            Expr::Label { ty, .. }
            | Expr::Loop { ty, .. }
            | Expr::Switch { ty, .. }
            | Expr::IfElse { ty, .. } => ty.val(),
            Expr::Sequence { second, .. } => self.infer_kind(second),
            Expr::Branch { .. } | Expr::Return { .. } => None,
            Expr::Nop | Expr::DiscardResult(_) => None,
        }
    }

    fn local_kind(&self, index: u32) -> ValKind {
        self.locals[index as usize].1
    }
}
