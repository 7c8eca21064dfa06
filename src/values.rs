// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::compartment::Object;
use crate::func::Function;
use crate::types::ValKind;
use crate::utils::enum_accessors;

/// An untyped value as compiled code and the unchecked invocation path see
/// it: a 128-bit bag of bits whose interpretation is supplied externally.
///
/// Every slot of an invocation argument buffer is one `UntaggedValue`
/// regardless of the value kind it carries, so compiled trampolines address
/// the buffer with a fixed 16-byte stride.
#[derive(Copy, Clone, Default)]
#[repr(C, align(16))]
pub struct UntaggedValue {
    bits: u128,
}

impl UntaggedValue {
    pub const ZERO: UntaggedValue = UntaggedValue { bits: 0 };

    pub fn from_i32(v: i32) -> Self {
        Self {
            bits: v as u32 as u128,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Self {
            bits: v as u64 as u128,
        }
    }

    pub fn from_f32_bits(v: u32) -> Self {
        Self { bits: v as u128 }
    }

    pub fn from_f64_bits(v: u64) -> Self {
        Self { bits: v as u128 }
    }

    pub fn from_v128(v: u128) -> Self {
        Self { bits: v }
    }

    pub fn from_ptr(v: usize) -> Self {
        Self { bits: v as u128 }
    }

    /// Packs a compartment-scoped object handle. Used for the reference
    /// arguments of intrinsic exceptions.
    pub fn from_object(o: Object) -> Self {
        Self { bits: o.to_bits() }
    }

    pub fn as_i32(self) -> i32 {
        self.bits as u32 as i32
    }

    pub fn as_i64(self) -> i64 {
        self.bits as u64 as i64
    }

    pub fn as_f32_bits(self) -> u32 {
        self.bits as u32
    }

    pub fn as_f64_bits(self) -> u64 {
        self.bits as u64
    }

    pub fn as_v128(self) -> u128 {
        self.bits
    }

    pub fn as_ptr(self) -> usize {
        self.bits as u64 as usize
    }

    pub fn as_object(self) -> Option<Object> {
        Object::from_bits(self.bits)
    }
}

impl fmt::Debug for UntaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UntaggedValue({:#x})", self.bits)
    }
}

/// A runtime value tagged with its kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// A 32-bit integer.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A 32-bit float, stored as its raw bits. Use `f32::from_bits` to
    /// recover the float; raw bits keep NaN payloads intact.
    F32(u32),
    /// A 64-bit float, stored as its raw bits.
    F64(u64),
    /// A 128-bit vector.
    V128(u128),
    /// A function reference, possibly null.
    FuncRef(Option<Function>),
    /// An opaque object reference, possibly null.
    AnyRef(Option<Object>),
}

impl Value {
    pub fn kind(&self) -> ValKind {
        match self {
            Value::I32(_) => ValKind::I32,
            Value::I64(_) => ValKind::I64,
            Value::F32(_) => ValKind::F32,
            Value::F64(_) => ValKind::F64,
            Value::V128(_) => ValKind::V128,
            Value::FuncRef(_) => ValKind::FuncRef,
            Value::AnyRef(_) => ValKind::AnyRef,
        }
    }

    /// Returns the zero/null value for the given kind.
    pub fn default_for_kind(kind: ValKind) -> Value {
        match kind {
            ValKind::I32 => Value::I32(0),
            ValKind::I64 => Value::I64(0),
            ValKind::F32 => Value::F32(0),
            ValKind::F64 => Value::F64(0),
            ValKind::V128 => Value::V128(0),
            ValKind::FuncRef => Value::FuncRef(None),
            ValKind::AnyRef | ValKind::NullRef => Value::AnyRef(None),
        }
    }

    /// Whether this value may flow into a slot of kind `expected`.
    pub fn matches_kind(&self, expected: ValKind) -> bool {
        match (self, expected) {
            (Value::FuncRef(None) | Value::AnyRef(None), ValKind::NullRef) => true,
            (Value::FuncRef(_), ValKind::AnyRef) => true,
            _ => self.kind() == expected,
        }
    }

    enum_accessors! {
        e
        (I32(i32) is_i32 get_i32 unwrap_i32 *e)
        (I64(i64) is_i64 get_i64 unwrap_i64 *e)
        (F32(u32) is_f32 get_f32 unwrap_f32 *e)
        (F64(u64) is_f64 get_f64 unwrap_f64 *e)
        (V128(u128) is_v128 get_v128 unwrap_v128 *e)
        (FuncRef(Option<Function>) is_func_ref get_func_ref unwrap_func_ref *e)
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(val: i32) -> Value {
        Value::I32(val)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(val: i64) -> Value {
        Value::I64(val)
    }
}

impl From<f32> for Value {
    #[inline]
    fn from(val: f32) -> Value {
        Value::F32(val.to_bits())
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(val: f64) -> Value {
        Value::F64(val.to_bits())
    }
}
