// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::compartment::{Compartment, Object, ObjectData};
use crate::context::Context;
use crate::func::Function;
use crate::types::{GlobalType, Mutability, ValKind};
use crate::values::Value;
use crate::vm::VMGlobalDefinition;
use crate::{Error, Result};

/// A global variable.
///
/// Immutable globals store their value with the owning instance and are
/// assigned exactly once; mutable globals occupy a slot in the compartment's
/// global layout, and every [`Context`] carries its own copy of that layout,
/// so reads and writes go through a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global(pub(crate) Object);

pub(crate) enum GlobalStorage {
    /// Byte offset of this global's slot in each context's buffer.
    Mutable { offset: u32 },
    Immutable { def: Box<VMGlobalDefinition> },
}

pub(crate) struct GlobalData {
    pub(crate) ty: GlobalType,
    pub(crate) storage: GlobalStorage,
    pub(crate) initialized: bool,
    /// For reference-typed globals, the referenced object (a GC edge).
    pub(crate) ref_value: Option<Object>,
}

impl GlobalData {
    pub(crate) fn definition_ptr(&self) -> *mut VMGlobalDefinition {
        match &self.storage {
            GlobalStorage::Immutable { def } => {
                def.as_ref() as *const VMGlobalDefinition as *mut VMGlobalDefinition
            }
            GlobalStorage::Mutable { .. } => core::ptr::null_mut(),
        }
    }

    pub(crate) fn duplicate(&self, compartment: u64) -> Self {
        let storage = match &self.storage {
            GlobalStorage::Mutable { offset } => GlobalStorage::Mutable { offset: *offset },
            GlobalStorage::Immutable { def } => GlobalStorage::Immutable {
                def: Box::new(VMGlobalDefinition::from_bits(def.bits())),
            },
        };
        Self {
            ty: self.ty,
            storage,
            initialized: self.initialized,
            ref_value: self.ref_value.map(|object| object.rescope(compartment)),
        }
    }
}

impl Global {
    /// Creates a global with the appropriate zero/null initial value; assign
    /// the real value with [`Global::initialize`] before first use.
    pub fn new(compartment: &Compartment, ty: GlobalType) -> Global {
        let mut state = compartment.state();
        let storage = match ty.mutability {
            Mutability::Var => GlobalStorage::Mutable {
                offset: state.alloc_mutable_global(0),
            },
            Mutability::Const => GlobalStorage::Immutable {
                def: Box::new(VMGlobalDefinition::from_bits(0)),
            },
        };
        let object = state.alloc(
            compartment.id(),
            ObjectData::Global(GlobalData {
                ty,
                storage,
                initialized: false,
                ref_value: None,
            }),
        );
        Global(object)
    }

    pub fn as_object(&self) -> Object {
        self.0
    }

    pub fn from_object(compartment: &Compartment, object: Object) -> Result<Global> {
        match compartment.object_kind(object)? {
            crate::ObjectKind::Global => Ok(Global(object)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn ty(&self, compartment: &Compartment) -> Result<GlobalType> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Global(global) => Ok(global.ty),
            _ => Err(Error::NotFound),
        }
    }

    /// Assigns the initial value. May not be called more than once per
    /// global; immutable globals must be initialized before their first
    /// read.
    pub fn initialize(&self, compartment: &Compartment, value: Value) -> Result<()> {
        compartment.check_scope(self.0)?;
        let bits = value_to_bits(compartment, &value)?;
        let ref_value = value_ref_object(&value);

        let mut state = compartment.state();
        let offset = match state.data_mut(self.0)? {
            ObjectData::Global(global) => {
                if global.initialized {
                    return Err(Error::InvalidState("global is already initialized"));
                }
                if !value.matches_kind(global.ty.content) {
                    return Err(Error::InvalidArgument("global initializer kind mismatch"));
                }
                global.initialized = true;
                global.ref_value = ref_value;
                match &mut global.storage {
                    GlobalStorage::Immutable { def } => {
                        **def = VMGlobalDefinition::from_bits(bits);
                        None
                    }
                    GlobalStorage::Mutable { offset } => Some(*offset),
                }
            }
            _ => return Err(Error::NotFound),
        };

        // A mutable global's initial value becomes part of the image every
        // context view starts from.
        if let Some(offset) = offset {
            state.write_mutable_global(offset, bits);
        }
        Ok(())
    }

    /// Reads the global's value as seen by `context`.
    pub fn get(&self, compartment: &Compartment, context: Context) -> Result<Value> {
        compartment.check_scope(self.0)?;
        compartment.check_scope(context.0)?;
        let state = compartment.state();

        let (ty, bits, ref_value) = match state.data(self.0)? {
            ObjectData::Global(global) => match &global.storage {
                GlobalStorage::Immutable { def } => (global.ty, def.bits(), global.ref_value),
                GlobalStorage::Mutable { offset } => {
                    let bits = match state.data(context.0)? {
                        ObjectData::Context(context) => context.read_global(*offset),
                        _ => return Err(Error::NotFound),
                    };
                    (global.ty, bits, global.ref_value)
                }
            },
            _ => return Err(Error::NotFound),
        };

        Ok(bits_to_value(ty.content, bits, ref_value))
    }

    /// Writes a new value through `context`'s view, returning the previous
    /// value.
    pub fn set(&self, compartment: &Compartment, context: Context, value: Value) -> Result<Value> {
        compartment.check_scope(self.0)?;
        compartment.check_scope(context.0)?;
        let bits = value_to_bits(compartment, &value)?;
        let new_ref = value_ref_object(&value);

        let mut state = compartment.state();
        let (offset, ty, old_ref) = match state.data_mut(self.0)? {
            ObjectData::Global(global) => {
                if global.ty.mutability != Mutability::Var {
                    return Err(Error::InvalidState("immutable global cannot be set"));
                }
                if !value.matches_kind(global.ty.content) {
                    return Err(Error::InvalidArgument("global value kind mismatch"));
                }
                let GlobalStorage::Mutable { offset } = &global.storage else {
                    unreachable!("mutable global with immutable storage");
                };
                let old_ref = global.ref_value;
                global.ref_value = new_ref;
                (*offset, global.ty, old_ref)
            }
            _ => return Err(Error::NotFound),
        };

        let old_bits = match state.data_mut(context.0)? {
            ObjectData::Context(context_data) => {
                let old = context_data.read_global(offset);
                context_data.write_global(offset, bits);
                old
            }
            _ => return Err(Error::NotFound),
        };

        Ok(bits_to_value(ty.content, old_bits, old_ref))
    }
}

fn value_to_bits(compartment: &Compartment, value: &Value) -> Result<u128> {
    Ok(match value {
        Value::I32(v) => *v as u32 as u128,
        Value::I64(v) => *v as u64 as u128,
        Value::F32(bits) => *bits as u128,
        Value::F64(bits) => *bits as u128,
        Value::V128(bits) => *bits,
        Value::FuncRef(None) | Value::AnyRef(None) => 0,
        Value::FuncRef(Some(function)) => function.func_ref_ptr(compartment)? as usize as u128,
        Value::AnyRef(Some(object)) => object.to_bits(),
    })
}

fn value_ref_object(value: &Value) -> Option<Object> {
    match value {
        Value::FuncRef(Some(function)) => Some(function.as_object()),
        Value::AnyRef(Some(object)) => Some(*object),
        _ => None,
    }
}

fn bits_to_value(kind: ValKind, bits: u128, ref_value: Option<Object>) -> Value {
    match kind {
        ValKind::I32 => Value::I32(bits as u32 as i32),
        ValKind::I64 => Value::I64(bits as u64 as i64),
        ValKind::F32 => Value::F32(bits as u32),
        ValKind::F64 => Value::F64(bits as u64),
        ValKind::V128 => Value::V128(bits),
        ValKind::FuncRef => Value::FuncRef(ref_value.map(Function)),
        ValKind::AnyRef | ValKind::NullRef => Value::AnyRef(ref_value),
    }
}
