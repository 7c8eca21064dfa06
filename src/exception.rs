// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime exceptions.
//!
//! The intrinsic taxonomy is a closed set of kinds with fixed parameter
//! tuples; user exception types are compartment objects created by modules
//! or the host. An [`Exception`] is a plain host value, not a GC object:
//! whoever catches it owns it, and dropping it destroys it.

use core::fmt;
use smallvec::SmallVec;

use crate::compartment::{Compartment, Object, ObjectData};
use crate::types::ValKind;
use crate::values::UntaggedValue;
use crate::vm::code;
use crate::{Error, Result};

/// The intrinsic runtime exception kinds, or a user-defined type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExceptionKind {
    /// (memory, i64 offset)
    OutOfBoundsMemoryAccess,
    /// (table, i64 index)
    OutOfBoundsTableAccess,
    /// (memory, i64 offset, i64 length)
    OutOfBoundsDataSegmentAccess,
    /// (table, i64 offset, i64 length)
    OutOfBoundsElemSegmentAccess,
    StackOverflow,
    IntegerDivideByZeroOrOverflow,
    InvalidFloatOperation,
    InvokeSignatureMismatch,
    ReachedUnreachable,
    IndirectCallSignatureMismatch,
    /// (table, i64 index)
    UninitializedTableElement,
    CalledAbort,
    CalledUnimplementedIntrinsic,
    OutOfMemory,
    /// (i64 address)
    MisalignedAtomicMemoryAccess,
    InvalidArgument,
    /// A user-defined exception type.
    User(ExceptionType),
}

impl ExceptionKind {
    /// The parameter kinds of this exception's argument tuple. User types
    /// carry their parameters in the compartment; see
    /// [`ExceptionType::parameters`].
    pub fn intrinsic_parameters(&self) -> &'static [ValKind] {
        use ValKind::{AnyRef, I64};
        match self {
            ExceptionKind::OutOfBoundsMemoryAccess
            | ExceptionKind::OutOfBoundsTableAccess
            | ExceptionKind::UninitializedTableElement => &[AnyRef, I64],
            ExceptionKind::OutOfBoundsDataSegmentAccess
            | ExceptionKind::OutOfBoundsElemSegmentAccess => &[AnyRef, I64, I64],
            ExceptionKind::MisalignedAtomicMemoryAccess => &[I64],
            ExceptionKind::User(_) => &[],
            _ => &[],
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ExceptionKind::OutOfBoundsMemoryAccess => "outOfBoundsMemoryAccess",
            ExceptionKind::OutOfBoundsTableAccess => "outOfBoundsTableAccess",
            ExceptionKind::OutOfBoundsDataSegmentAccess => "outOfBoundsDataSegmentAccess",
            ExceptionKind::OutOfBoundsElemSegmentAccess => "outOfBoundsElemSegmentAccess",
            ExceptionKind::StackOverflow => "stackOverflow",
            ExceptionKind::IntegerDivideByZeroOrOverflow => "integerDivideByZeroOrOverflow",
            ExceptionKind::InvalidFloatOperation => "invalidFloatOperation",
            ExceptionKind::InvokeSignatureMismatch => "invokeSignatureMismatch",
            ExceptionKind::ReachedUnreachable => "reachedUnreachable",
            ExceptionKind::IndirectCallSignatureMismatch => "indirectCallSignatureMismatch",
            ExceptionKind::UninitializedTableElement => "uninitializedTableElement",
            ExceptionKind::CalledAbort => "calledAbort",
            ExceptionKind::CalledUnimplementedIntrinsic => "calledUnimplementedIntrinsic",
            ExceptionKind::OutOfMemory => "outOfMemory",
            ExceptionKind::MisalignedAtomicMemoryAccess => "misalignedAtomicMemoryAccess",
            ExceptionKind::InvalidArgument => "invalidArgument",
            ExceptionKind::User(_) => "user",
        }
    }
}

/// Accessors for the intrinsic exception kinds, mirroring the taxonomy
/// table.
pub mod exception_types {
    use super::ExceptionKind;

    macro_rules! intrinsic_accessors {
        ($($fn_name:ident => $variant:ident;)*) => {
            $(
                pub fn $fn_name() -> ExceptionKind {
                    ExceptionKind::$variant
                }
            )*
        };
    }

    intrinsic_accessors! {
        out_of_bounds_memory_access => OutOfBoundsMemoryAccess;
        out_of_bounds_table_access => OutOfBoundsTableAccess;
        out_of_bounds_data_segment_access => OutOfBoundsDataSegmentAccess;
        out_of_bounds_elem_segment_access => OutOfBoundsElemSegmentAccess;
        stack_overflow => StackOverflow;
        integer_divide_by_zero_or_overflow => IntegerDivideByZeroOrOverflow;
        invalid_float_operation => InvalidFloatOperation;
        invoke_signature_mismatch => InvokeSignatureMismatch;
        reached_unreachable => ReachedUnreachable;
        indirect_call_signature_mismatch => IndirectCallSignatureMismatch;
        uninitialized_table_element => UninitializedTableElement;
        called_abort => CalledAbort;
        called_unimplemented_intrinsic => CalledUnimplementedIntrinsic;
        out_of_memory => OutOfMemory;
        misaligned_atomic_memory_access => MisalignedAtomicMemoryAccess;
        invalid_argument => InvalidArgument;
    }
}

/// A user-defined exception type: a parameter tuple plus a debug name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionType(pub(crate) Object);

#[derive(Clone)]
pub(crate) struct ExceptionTypeData {
    pub(crate) params: Vec<ValKind>,
    pub(crate) debug_name: String,
}

impl ExceptionType {
    pub fn new(
        compartment: &Compartment,
        params: impl IntoIterator<Item = ValKind>,
        debug_name: impl Into<String>,
    ) -> ExceptionType {
        let data = ExceptionTypeData {
            params: params.into_iter().collect(),
            debug_name: debug_name.into(),
        };
        let object = compartment
            .state()
            .alloc(compartment.id(), ObjectData::ExceptionType(data));
        ExceptionType(object)
    }

    pub fn as_object(&self) -> Object {
        self.0
    }

    pub fn from_object(compartment: &Compartment, object: Object) -> Result<ExceptionType> {
        match compartment.object_kind(object)? {
            crate::ObjectKind::ExceptionType => Ok(ExceptionType(object)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn parameters(&self, compartment: &Compartment) -> Result<Vec<ValKind>> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::ExceptionType(et) => Ok(et.params.clone()),
            _ => Err(Error::NotFound),
        }
    }

    pub fn describe(&self, compartment: &Compartment) -> Result<String> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::ExceptionType(et) => Ok(et.debug_name.clone()),
            _ => Err(Error::NotFound),
        }
    }
}

/// An opaque ordered sequence of instruction pointers captured when an
/// exception was created.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    frames: SmallVec<[usize; 8]>,
}

impl CallStack {
    pub(crate) fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_frames(frames: &[usize]) -> Self {
        Self {
            frames: SmallVec::from_slice(frames),
        }
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames
    }
}

/// Symbolizes one instruction pointer against the loaded modules.
pub fn describe_instruction_pointer(ip: usize) -> Option<String> {
    let (info, offset) = code::lookup_code(ip)?;
    let (symbol, sym_offset) = info.symbolize(offset)?;
    Some(format!("{}!{symbol}+{sym_offset:#x}", info.debug_name))
}

/// Describes a call stack frame by frame; unknown frames render as bare
/// addresses.
pub fn describe_call_stack(call_stack: &CallStack) -> Vec<String> {
    call_stack
        .frames()
        .iter()
        .map(|ip| {
            describe_instruction_pointer(*ip).unwrap_or_else(|| format!("{ip:#x}"))
        })
        .collect()
}

/// A runtime exception: a kind, its untagged argument tuple and the call
/// stack at the point of creation.
pub struct Exception {
    kind: ExceptionKind,
    arguments: SmallVec<[UntaggedValue; 4]>,
    call_stack: CallStack,
    user_data: Option<(*mut u8, Option<unsafe fn(*mut u8)>)>,
}

// Safety: the user-data pointer is host-provided and the host coordinates
// access; everything else is plain data.
unsafe impl Send for Exception {}
// Safety: see above.
unsafe impl Sync for Exception {}

impl Exception {
    /// Creates an exception of an intrinsic kind. The argument count and
    /// kinds must match the kind's parameter tuple.
    pub fn intrinsic(kind: ExceptionKind, arguments: &[UntaggedValue]) -> Exception {
        debug_assert!(!matches!(kind, ExceptionKind::User(_)));
        Exception {
            kind,
            arguments: SmallVec::from_slice(arguments),
            call_stack: CallStack::empty(),
            user_data: None,
        }
    }

    pub(crate) fn boxed_intrinsic(
        kind: ExceptionKind,
        arguments: &[UntaggedValue],
    ) -> Box<Exception> {
        Box::new(Self::intrinsic(kind, arguments))
    }

    /// Creates an exception of a user-defined type.
    pub fn user(ty: ExceptionType, arguments: &[UntaggedValue]) -> Exception {
        Exception {
            kind: ExceptionKind::User(ty),
            arguments: SmallVec::from_slice(arguments),
            call_stack: CallStack::empty(),
            user_data: None,
        }
    }

    pub(crate) fn with_call_stack(mut self, call_stack: CallStack) -> Exception {
        self.call_stack = call_stack;
        self
    }

    pub fn kind(&self) -> &ExceptionKind {
        &self.kind
    }

    /// The exception's type, for user exceptions.
    pub fn exception_type(&self) -> Option<ExceptionType> {
        match self.kind {
            ExceptionKind::User(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn argument(&self, index: usize) -> Option<UntaggedValue> {
        self.arguments.get(index).copied()
    }

    pub fn arguments(&self) -> &[UntaggedValue] {
        &self.arguments
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    pub fn set_user_data(&mut self, ptr: *mut u8, finalizer: Option<unsafe fn(*mut u8)>) {
        self.user_data = Some((ptr, finalizer));
    }

    pub fn user_data(&self) -> *mut u8 {
        self.user_data
            .map_or(core::ptr::null_mut(), |(ptr, _)| ptr)
    }

    /// Renders the exception for diagnostics, resolving object-reference
    /// arguments against `compartment` when one is supplied.
    pub fn describe(&self, compartment: Option<&Compartment>) -> String {
        let mut out = String::from("vessel.");
        match &self.kind {
            ExceptionKind::User(ty) => {
                let name = compartment
                    .and_then(|c| ty.describe(c).ok())
                    .unwrap_or_else(|| "<exception type>".to_string());
                out.push_str(&name);
            }
            kind => out.push_str(kind.name()),
        }

        out.push('(');
        for (i, argument) in self.arguments.iter().enumerate() {
            if i != 0 {
                out.push_str(", ");
            }
            let described = argument
                .as_object()
                .and_then(|object| {
                    let compartment = compartment?;
                    object_debug_name(compartment, object)
                })
                .unwrap_or_else(|| format!("{:#x}", argument.as_i64()));
            out.push_str(&described);
        }
        out.push(')');
        out
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("kind", &self.kind)
            .field("arguments", &self.arguments.as_slice())
            .finish_non_exhaustive()
    }
}

impl Drop for Exception {
    fn drop(&mut self) {
        if let Some((ptr, Some(finalizer))) = self.user_data.take() {
            // Safety: the host promised the finalizer accepts the pointer
            // it registered.
            unsafe { finalizer(ptr) };
        }
    }
}

fn object_debug_name(compartment: &Compartment, object: Object) -> Option<String> {
    if object.compartment_id() != compartment.id() {
        return None;
    }
    let state = compartment.state();
    let name = match state.data(object).ok()? {
        ObjectData::Memory(memory) => format!("memory '{}'", memory.debug_name),
        ObjectData::Table(table) => format!("table '{}'", table.debug_name),
        ObjectData::Function(function) => format!("function '{}'", function.debug_name),
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsic_parameter_tuples() {
        assert_eq!(
            ExceptionKind::OutOfBoundsMemoryAccess
                .intrinsic_parameters()
                .len(),
            2
        );
        assert_eq!(
            ExceptionKind::OutOfBoundsDataSegmentAccess
                .intrinsic_parameters()
                .len(),
            3
        );
        assert!(ExceptionKind::StackOverflow.intrinsic_parameters().is_empty());
    }

    #[test]
    fn describe_without_compartment() {
        let exception = Exception::intrinsic(
            ExceptionKind::MisalignedAtomicMemoryAccess,
            &[UntaggedValue::from_i64(0x40)],
        );
        assert_eq!(
            exception.describe(None),
            "vessel.misalignedAtomicMemoryAccess(0x40)"
        );
    }
}
