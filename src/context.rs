// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::compartment::{Compartment, Object, ObjectData};
use crate::values::UntaggedValue;
use crate::vm::VMContextRuntime;
use crate::{Error, Result};

/// A single-threaded execution handle within a compartment.
///
/// Each context owns its own view of the compartment's mutable globals and
/// the scratch buffer invocation results are returned through. At most one
/// thread may execute through a given context at a time; different contexts
/// of the same compartment may run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context(pub(crate) Object);

pub(crate) struct ContextData {
    /// The runtime block compiled code reads; boxed so its address is
    /// stable across arena moves.
    pub(crate) runtime: Box<VMContextRuntime>,
    /// This context's mutable-global buffer (the compartment layout).
    globals: Vec<u8>,
    /// Argument/result buffer for the unchecked invocation path. Results of
    /// the most recent invocation stay here until the next one.
    pub(crate) scratch: Vec<UntaggedValue>,
}

impl ContextData {
    fn new(globals_image: &[u8]) -> Self {
        let mut data = Self {
            runtime: Box::new(VMContextRuntime {
                globals: core::ptr::null_mut(),
                stack_limit: 0,
            }),
            globals: globals_image.to_vec(),
            scratch: Vec::new(),
        };
        data.refresh_globals_ptr();
        data
    }

    fn refresh_globals_ptr(&mut self) {
        self.runtime.globals = self.globals.as_mut_ptr();
    }

    /// Appends a freshly created global's initial value to this context's
    /// buffer.
    pub(crate) fn extend_globals(&mut self, initial: &[u8]) {
        self.globals.extend_from_slice(initial);
        self.refresh_globals_ptr();
    }

    pub(crate) fn write_globals(&mut self, range: core::ops::Range<usize>, bytes: &[u8]) {
        self.globals[range].copy_from_slice(bytes);
    }

    pub(crate) fn read_global(&self, offset: u32) -> u128 {
        let offset = offset as usize;
        u128::from_le_bytes(self.globals[offset..offset + 16].try_into().unwrap())
    }

    pub(crate) fn write_global(&mut self, offset: u32, value: u128) {
        let offset = offset as usize;
        self.globals[offset..offset + 16].copy_from_slice(&value.to_le_bytes());
    }

    /// A copy of this context (same mutable-global state, fresh runtime).
    pub(crate) fn duplicate(&self) -> Self {
        let mut data = Self {
            runtime: Box::new(VMContextRuntime {
                globals: core::ptr::null_mut(),
                stack_limit: 0,
            }),
            globals: self.globals.clone(),
            scratch: Vec::new(),
        };
        data.refresh_globals_ptr();
        data
    }
}

impl Context {
    /// Creates a context whose mutable globals start from the compartment's
    /// current initial image.
    pub fn new(compartment: &Compartment) -> Context {
        let mut state = compartment.state();
        let data = ContextData::new(&state.globals_image);
        let object = state.alloc(compartment.id(), ObjectData::Context(data));
        Context(object)
    }

    /// Creates a new context initializing its mutable-global state from this
    /// one. The target compartment must be the context's own compartment or
    /// a clone-descendant of it.
    pub fn clone_context(&self, compartment: &Compartment) -> Result<Context> {
        let source = if compartment.contains(self.0) {
            self.0
        } else {
            compartment.remap_to_cloned_compartment(self.0)?
        };

        let mut state = compartment.state();
        let duplicate = match state.data(source)? {
            ObjectData::Context(context) => context.duplicate(),
            _ => return Err(Error::NotFound),
        };
        let object = state.alloc(compartment.id(), ObjectData::Context(duplicate));
        Ok(Context(object))
    }

    pub fn as_object(&self) -> Object {
        self.0
    }

    pub fn from_object(compartment: &Compartment, object: Object) -> Result<Context> {
        match compartment.object_kind(object)? {
            crate::ObjectKind::Context => Ok(Context(object)),
            _ => Err(Error::NotFound),
        }
    }
}
