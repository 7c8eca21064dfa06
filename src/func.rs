// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use smallvec::SmallVec;

use crate::compartment::{Compartment, Object, ObjectData};
use crate::context::Context;
use crate::exception::{Exception, ExceptionKind};
use crate::traphandler;
use crate::types::FuncType;
use crate::values::{UntaggedValue, Value};
use crate::vm::VMFuncRef;
use crate::{arch, Error, Result, ValKind};

/// A callable function belonging to a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function(pub(crate) Object);

pub(crate) struct FunctionData {
    pub(crate) ty: FuncType,
    pub(crate) type_tag: u32,
    pub(crate) instance: Object,
    /// Defined-function index within the owning instance.
    pub(crate) def_index: u32,
    /// Points into the owning instance's function-reference array.
    pub(crate) func_ref: *const VMFuncRef,
    pub(crate) debug_name: String,
}

type ArrayCall = unsafe extern "C" fn(*mut u8, *mut u8, *mut UntaggedValue);

impl Function {
    pub fn as_object(&self) -> Object {
        self.0
    }

    pub fn from_object(compartment: &Compartment, object: Object) -> Result<Function> {
        match compartment.object_kind(object)? {
            crate::ObjectKind::Function => Ok(Function(object)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn ty(&self, compartment: &Compartment) -> Result<FuncType> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Function(function) => Ok(function.ty.clone()),
            _ => Err(Error::NotFound),
        }
    }

    pub(crate) fn func_ref_ptr(&self, compartment: &Compartment) -> Result<*const VMFuncRef> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Function(function) => Ok(function.func_ref),
            _ => Err(Error::NotFound),
        }
    }

    /// Invokes the function with a tightly packed, untyped argument buffer.
    ///
    /// Arguments are copied into the context's scratch slot; on success the
    /// results (one buffer slot each) are returned. The buffer shape must
    /// match the function type; no checking is performed.
    pub fn invoke_unchecked(
        &self,
        compartment: &Compartment,
        context: Context,
        arguments: &[UntaggedValue],
    ) -> Result<SmallVec<[UntaggedValue; 2]>, Box<Exception>> {
        let invalid = |_: Error| Exception::boxed_intrinsic(ExceptionKind::InvalidArgument, &[]);

        compartment.check_scope(self.0).map_err(invalid)?;
        compartment.check_scope(context.0).map_err(invalid)?;

        // Resolve everything under the lock, then release it before
        // entering compiled code: builtins re-enter the compartment.
        let (array_call, vmctx, scratch_ptr, num_results) = {
            let mut state = compartment.state();

            let (func_ref, num_params, num_results) = match state.data(self.0).map_err(invalid)? {
                ObjectData::Function(function) => (
                    function.func_ref,
                    function.ty.params().len(),
                    function.ty.results().len(),
                ),
                _ => return Err(invalid(Error::NotFound)),
            };
            // Safety: the function's instance owns the referenced array and
            // is kept alive by the compartment for the duration of the call.
            let (array_call, vmctx) = unsafe {
                let func_ref = &*func_ref;
                (func_ref.array_call, func_ref.vmctx)
            };

            let stack_limit = arch::stack_pointer()
                .saturating_sub(compartment.engine().config().max_wasm_stack);

            let scratch_ptr = match state.data_mut(context.0).map_err(invalid)? {
                ObjectData::Context(context_data) => {
                    context_data.scratch.clear();
                    context_data
                        .scratch
                        .resize(num_params.max(num_results).max(1), UntaggedValue::ZERO);
                    context_data.scratch[..arguments.len()].copy_from_slice(arguments);
                    context_data.runtime.stack_limit = stack_limit;
                    let runtime = &mut *context_data.runtime as *mut _ as *mut u8;
                    (context_data.scratch.as_mut_ptr(), runtime)
                }
                _ => return Err(invalid(Error::NotFound)),
            };

            // Safety: transmuting the stored entry pointer back to the
            // array-call signature it was compiled with.
            let array_call: ArrayCall = unsafe { core::mem::transmute(array_call) };
            (array_call, vmctx, scratch_ptr, num_results)
        };
        let (scratch, cctx) = scratch_ptr;

        compartment.begin_call();
        let result = traphandler::catch_traps(compartment, self.0, || {
            // Safety: the entry point, vmctx and buffers were resolved from
            // live objects above and stay valid while in_call is held.
            unsafe { array_call(vmctx, cctx, scratch) }
        });
        compartment.end_call();

        result?;

        // Safety: the scratch buffer outlives the call; results were
        // written by the trampoline.
        let results = unsafe { core::slice::from_raw_parts(scratch, num_results) };
        Ok(SmallVec::from_slice(results))
    }

    /// Invokes the function with tagged values, checking arity and types.
    pub fn invoke_checked(
        &self,
        compartment: &Compartment,
        context: Context,
        arguments: &[Value],
    ) -> Result<Vec<Value>, Box<Exception>> {
        let ty = self.ty(compartment).map_err(|_| {
            Exception::boxed_intrinsic(ExceptionKind::InvalidArgument, &[])
        })?;

        if arguments.len() != ty.params().len() {
            return Err(Exception::boxed_intrinsic(
                ExceptionKind::InvokeSignatureMismatch,
                &[],
            ));
        }

        let mut untagged = SmallVec::<[UntaggedValue; 4]>::new();
        for (argument, expected) in arguments.iter().zip(ty.params()) {
            if !argument.matches_kind(*expected) {
                return Err(Exception::boxed_intrinsic(ExceptionKind::InvalidArgument, &[]));
            }
            untagged.push(value_to_untagged(compartment, argument).map_err(|_| {
                Exception::boxed_intrinsic(ExceptionKind::InvalidArgument, &[])
            })?);
        }

        let results = self.invoke_unchecked(compartment, context, &untagged)?;

        Ok(results
            .iter()
            .zip(ty.results())
            .map(|(raw, kind)| untagged_to_value(compartment, *raw, *kind))
            .collect())
    }
}

fn value_to_untagged(compartment: &Compartment, value: &Value) -> Result<UntaggedValue> {
    Ok(match value {
        Value::I32(v) => UntaggedValue::from_i32(*v),
        Value::I64(v) => UntaggedValue::from_i64(*v),
        Value::F32(bits) => UntaggedValue::from_f32_bits(*bits),
        Value::F64(bits) => UntaggedValue::from_f64_bits(*bits),
        Value::V128(bits) => UntaggedValue::from_v128(*bits),
        Value::FuncRef(None) | Value::AnyRef(None) => UntaggedValue::ZERO,
        Value::FuncRef(Some(function)) => {
            UntaggedValue::from_ptr(function.func_ref_ptr(compartment)? as usize)
        }
        Value::AnyRef(Some(object)) => UntaggedValue::from_v128(object.to_bits()),
    })
}

fn untagged_to_value(compartment: &Compartment, raw: UntaggedValue, kind: ValKind) -> Value {
    match kind {
        ValKind::I32 => Value::I32(raw.as_i32()),
        ValKind::I64 => Value::I64(raw.as_i64()),
        ValKind::F32 => Value::F32(raw.as_f32_bits()),
        ValKind::F64 => Value::F64(raw.as_f64_bits()),
        ValKind::V128 => Value::V128(raw.as_v128()),
        ValKind::FuncRef => {
            let ptr = raw.as_ptr();
            if ptr == 0 {
                Value::FuncRef(None)
            } else {
                Value::FuncRef(function_from_func_ref(compartment, ptr as *const VMFuncRef))
            }
        }
        ValKind::AnyRef | ValKind::NullRef => Value::AnyRef(raw.as_object()),
    }
}

/// Reverse lookup of a runtime function reference to its object handle.
fn function_from_func_ref(
    compartment: &Compartment,
    func_ref: *const VMFuncRef,
) -> Option<Function> {
    let state = compartment.state();
    for (index, slot) in state.slots.iter().enumerate() {
        if let Some(ObjectData::Function(function)) = &slot.data {
            if core::ptr::eq(function.func_ref, func_ref) {
                let object =
                    Object::from_raw_parts(compartment.id(), index as u32, slot_gen(slot));
                return Some(Function(object));
            }
        }
    }
    None
}

fn slot_gen(slot: &crate::compartment::Slot) -> u32 {
    slot.gen()
}
