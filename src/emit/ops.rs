// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Emission strategies for the leaf operator families: one table per family,
//! dispatched on the operator tag.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{self, InstBuilder, MemFlags, Value};
use cranelift_frontend::FunctionBuilder;

use crate::ir::{BinaryOp, CastOp, CompareOp, UnaryOp};
use crate::types::ValKind;

pub fn emit_unary(builder: &mut FunctionBuilder<'_>, op: UnaryOp, x: Value) -> Value {
    match op {
        UnaryOp::Clz => builder.ins().clz(x),
        UnaryOp::Ctz => builder.ins().ctz(x),
        UnaryOp::Popcnt => builder.ins().popcnt(x),
        UnaryOp::Eqz => {
            let cmp = builder.ins().icmp_imm(IntCC::Equal, x, 0);
            builder.ins().uextend(ir::types::I32, cmp)
        }
        UnaryOp::IAbs => builder.ins().iabs(x),
        UnaryOp::FNeg => builder.ins().fneg(x),
        UnaryOp::FAbs => builder.ins().fabs(x),
        UnaryOp::Ceil => builder.ins().ceil(x),
        UnaryOp::Floor => builder.ins().floor(x),
        UnaryOp::Trunc => builder.ins().trunc(x),
        UnaryOp::Nearest => builder.ins().nearest(x),
        UnaryOp::Sqrt => builder.ins().sqrt(x),
    }
}

pub fn emit_binary(builder: &mut FunctionBuilder<'_>, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
    match op {
        BinaryOp::Add => builder.ins().iadd(lhs, rhs),
        BinaryOp::Sub => builder.ins().isub(lhs, rhs),
        BinaryOp::Mul => builder.ins().imul(lhs, rhs),
        // Division and remainder trap on divide-by-zero and MIN/-1 overflow;
        // the trap sites land in the module's trap table.
        BinaryOp::DivS => builder.ins().sdiv(lhs, rhs),
        BinaryOp::DivU => builder.ins().udiv(lhs, rhs),
        BinaryOp::RemS => builder.ins().srem(lhs, rhs),
        BinaryOp::RemU => builder.ins().urem(lhs, rhs),
        BinaryOp::And => builder.ins().band(lhs, rhs),
        BinaryOp::Or => builder.ins().bor(lhs, rhs),
        BinaryOp::Xor => builder.ins().bxor(lhs, rhs),
        BinaryOp::Shl => builder.ins().ishl(lhs, rhs),
        BinaryOp::ShrS => builder.ins().sshr(lhs, rhs),
        BinaryOp::ShrU => builder.ins().ushr(lhs, rhs),
        BinaryOp::Rotl => builder.ins().rotl(lhs, rhs),
        BinaryOp::Rotr => builder.ins().rotr(lhs, rhs),
        BinaryOp::FAdd => builder.ins().fadd(lhs, rhs),
        BinaryOp::FSub => builder.ins().fsub(lhs, rhs),
        BinaryOp::FMul => builder.ins().fmul(lhs, rhs),
        BinaryOp::FDiv => builder.ins().fdiv(lhs, rhs),
        // fmin/fmax propagate NaN the way wasm requires.
        BinaryOp::FMin => builder.ins().fmin(lhs, rhs),
        BinaryOp::FMax => builder.ins().fmax(lhs, rhs),
        BinaryOp::FCopysign => builder.ins().fcopysign(lhs, rhs),
    }
}

pub fn emit_compare(
    builder: &mut FunctionBuilder<'_>,
    op: CompareOp,
    lhs: Value,
    rhs: Value,
) -> Value {
    let cmp = match op {
        CompareOp::Eq => builder.ins().icmp(IntCC::Equal, lhs, rhs),
        CompareOp::Ne => builder.ins().icmp(IntCC::NotEqual, lhs, rhs),
        CompareOp::LtS => builder.ins().icmp(IntCC::SignedLessThan, lhs, rhs),
        CompareOp::LtU => builder.ins().icmp(IntCC::UnsignedLessThan, lhs, rhs),
        CompareOp::GtS => builder.ins().icmp(IntCC::SignedGreaterThan, lhs, rhs),
        CompareOp::GtU => builder.ins().icmp(IntCC::UnsignedGreaterThan, lhs, rhs),
        CompareOp::LeS => builder
            .ins()
            .icmp(IntCC::SignedLessThanOrEqual, lhs, rhs),
        CompareOp::LeU => builder
            .ins()
            .icmp(IntCC::UnsignedLessThanOrEqual, lhs, rhs),
        CompareOp::GeS => builder
            .ins()
            .icmp(IntCC::SignedGreaterThanOrEqual, lhs, rhs),
        CompareOp::GeU => builder
            .ins()
            .icmp(IntCC::UnsignedGreaterThanOrEqual, lhs, rhs),
        CompareOp::FEq => builder.ins().fcmp(FloatCC::Equal, lhs, rhs),
        CompareOp::FNe => builder.ins().fcmp(FloatCC::NotEqual, lhs, rhs),
        CompareOp::FLt => builder.ins().fcmp(FloatCC::LessThan, lhs, rhs),
        CompareOp::FGt => builder.ins().fcmp(FloatCC::GreaterThan, lhs, rhs),
        CompareOp::FLe => builder.ins().fcmp(FloatCC::LessThanOrEqual, lhs, rhs),
        CompareOp::FGe => builder.ins().fcmp(FloatCC::GreaterThanOrEqual, lhs, rhs),
    };
    builder.ins().uextend(ir::types::I32, cmp)
}

/// The result kind a cast produces.
pub fn cast_result_kind(op: CastOp, operand: ValKind) -> ValKind {
    use CastOp::*;
    match op {
        Wrap => ValKind::I32,
        ExtendS | ExtendU => ValKind::I64,
        SignExtend8 | SignExtend16 | SignExtend32 => operand,
        TruncF32ToI32S | TruncF32ToI32U | TruncF64ToI32S | TruncF64ToI32U
        | TruncSatF32ToI32S | TruncSatF32ToI32U | TruncSatF64ToI32S | TruncSatF64ToI32U => {
            ValKind::I32
        }
        TruncF32ToI64S | TruncF32ToI64U | TruncF64ToI64S | TruncF64ToI64U
        | TruncSatF32ToI64S | TruncSatF32ToI64U | TruncSatF64ToI64S | TruncSatF64ToI64U => {
            ValKind::I64
        }
        ConvertI32SToF32 | ConvertI32UToF32 | ConvertI64SToF32 | ConvertI64UToF32 => ValKind::F32,
        ConvertI32SToF64 | ConvertI32UToF64 | ConvertI64SToF64 | ConvertI64UToF64 => ValKind::F64,
        Promote => ValKind::F64,
        Demote => ValKind::F32,
        ReinterpretF32ToI32 => ValKind::I32,
        ReinterpretF64ToI64 => ValKind::I64,
        ReinterpretI32ToF32 => ValKind::F32,
        ReinterpretI64ToF64 => ValKind::F64,
    }
}

/// The operand kind a cast consumes.
pub fn cast_operand_kind(op: CastOp, result_hint: ValKind) -> ValKind {
    use CastOp::*;
    match op {
        Wrap => ValKind::I64,
        ExtendS | ExtendU => ValKind::I32,
        SignExtend8 | SignExtend16 | SignExtend32 => result_hint,
        TruncF32ToI32S | TruncF32ToI32U | TruncF32ToI64S | TruncF32ToI64U
        | TruncSatF32ToI32S | TruncSatF32ToI32U | TruncSatF32ToI64S | TruncSatF32ToI64U
        | Promote | ReinterpretF32ToI32 => ValKind::F32,
        TruncF64ToI32S | TruncF64ToI32U | TruncF64ToI64S | TruncF64ToI64U
        | TruncSatF64ToI32S | TruncSatF64ToI32U | TruncSatF64ToI64S | TruncSatF64ToI64U
        | Demote | ReinterpretF64ToI64 => ValKind::F64,
        ConvertI32SToF32 | ConvertI32UToF32 | ConvertI32SToF64 | ConvertI32UToF64
        | ReinterpretI32ToF32 => ValKind::I32,
        ConvertI64SToF32 | ConvertI64UToF32 | ConvertI64SToF64 | ConvertI64UToF64
        | ReinterpretI64ToF64 => ValKind::I64,
    }
}

pub fn emit_cast(
    builder: &mut FunctionBuilder<'_>,
    op: CastOp,
    operand_kind: ValKind,
    x: Value,
) -> Value {
    use CastOp::*;

    let i32t = ir::types::I32;
    let i64t = ir::types::I64;
    let f32t = ir::types::F32;
    let f64t = ir::types::F64;

    match op {
        Wrap => builder.ins().ireduce(i32t, x),
        ExtendS => builder.ins().sextend(i64t, x),
        ExtendU => builder.ins().uextend(i64t, x),
        SignExtend8 => {
            let narrow = builder.ins().ireduce(ir::types::I8, x);
            builder
                .ins()
                .sextend(super::value_type(operand_kind), narrow)
        }
        SignExtend16 => {
            let narrow = builder.ins().ireduce(ir::types::I16, x);
            builder
                .ins()
                .sextend(super::value_type(operand_kind), narrow)
        }
        SignExtend32 => {
            let narrow = builder.ins().ireduce(i32t, x);
            builder.ins().sextend(i64t, narrow)
        }
        // Trapping truncations; NaN and out-of-range inputs raise the
        // invalid-conversion trap.
        TruncF32ToI32S | TruncF64ToI32S => builder.ins().fcvt_to_sint(i32t, x),
        TruncF32ToI32U | TruncF64ToI32U => builder.ins().fcvt_to_uint(i32t, x),
        TruncF32ToI64S | TruncF64ToI64S => builder.ins().fcvt_to_sint(i64t, x),
        TruncF32ToI64U | TruncF64ToI64U => builder.ins().fcvt_to_uint(i64t, x),
        TruncSatF32ToI32S | TruncSatF64ToI32S => builder.ins().fcvt_to_sint_sat(i32t, x),
        TruncSatF32ToI32U | TruncSatF64ToI32U => builder.ins().fcvt_to_uint_sat(i32t, x),
        TruncSatF32ToI64S | TruncSatF64ToI64S => builder.ins().fcvt_to_sint_sat(i64t, x),
        TruncSatF32ToI64U | TruncSatF64ToI64U => builder.ins().fcvt_to_uint_sat(i64t, x),
        ConvertI32SToF32 | ConvertI64SToF32 => builder.ins().fcvt_from_sint(f32t, x),
        ConvertI32UToF32 | ConvertI64UToF32 => builder.ins().fcvt_from_uint(f32t, x),
        ConvertI32SToF64 | ConvertI64SToF64 => builder.ins().fcvt_from_sint(f64t, x),
        ConvertI32UToF64 | ConvertI64UToF64 => builder.ins().fcvt_from_uint(f64t, x),
        Promote => builder.ins().fpromote(f64t, x),
        Demote => builder.ins().fdemote(f32t, x),
        ReinterpretF32ToI32 => builder.ins().bitcast(i32t, MemFlags::new(), x),
        ReinterpretF64ToI64 => builder.ins().bitcast(i64t, MemFlags::new(), x),
        ReinterpretI32ToF32 => builder.ins().bitcast(f32t, MemFlags::new(), x),
        ReinterpretI64ToF64 => builder.ins().bitcast(f64t, MemFlags::new(), x),
    }
}
