// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime builtins reachable from compiled code.
//!
//! Compiled code calls these indirectly through a function-pointer array
//! whose address sits in every VMContext, so the emitted text contains no
//! absolute host addresses and precompiled images reload without
//! relocations.

use cranelift_entity::entity_impl;

use crate::compartment::InstanceHostData;
use crate::exception::Exception;
use crate::traphandler;
use crate::values::UntaggedValue;
use crate::vm::vmcontext::VMCTX_HOST_OFFSET;

/// Iterate over all builtin functions and call the provided macro for each.
macro_rules! foreach_builtin_function {
    ($mac:ident) => {
        $mac! {
            // `memory.grow`; raises the out-of-memory trap on failure
            memory_grow(vmctx: vmctx, memory_index: u32, delta: u64) -> u64;
            // throws a user exception; never returns
            throw(vmctx: vmctx, cctx: pointer, tag_index: u32, args: pointer);
            // raises the null-element or signature-mismatch trap for an
            // indirect call; never returns
            trap_indirect_call(vmctx: vmctx, table_index: u32, elem_index: u64, is_null: u32);
            // raises the misaligned-atomic trap; never returns
            trap_misaligned(vmctx: vmctx, addr: u64);
        }
    };
}
pub(crate) use foreach_builtin_function;

/// An index type for builtin functions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuiltinFunctionIndex(u32);
entity_impl!(BuiltinFunctionIndex);

macro_rules! declare_indexes {
    (
        $(
            $( #[$attr:meta] )*
            $name:ident( $( $pname:ident: $param:ident ),* ) $( -> $result:ident )?;
        )*
    ) => {
        impl BuiltinFunctionIndex {
            declare_indexes!(
                @indices;
                0;
                $( $( #[$attr] )* $name; )*
            );
        }
    };

    // Base case: no more indices to declare, so define the total number of
    // function indices.
    (
        @indices;
        $len:expr;
    ) => {
        /// Returns the total number of builtin functions.
        pub const fn builtin_functions_total_number() -> u32 {
            $len
        }
    };

    // Recursive case: declare the next index, and then keep declaring the rest of
    // the indices.
    (
         @indices;
         $index:expr;
         $( #[$this_attr:meta] )*
         $this_name:ident;
         $(
             $( #[$rest_attr:meta] )*
             $rest_name:ident;
         )*
    ) => {
        $( #[$this_attr] )*
        pub const fn $this_name() -> Self {
            Self($index)
        }

        declare_indexes!(
            @indices;
            ($index + 1);
            $( $( #[$rest_attr] )* $rest_name; )*
        );
    }
}

foreach_builtin_function!(declare_indexes);

macro_rules! define_builtin_array {
    (
        $(
            $( #[$attr:meta] )*
            $name:ident( $( $pname:ident: $param:ident ),* ) $( -> $result:ident )?;
        )*
    ) => {
        /// An array of function pointers to the builtins, indexed by
        /// [`BuiltinFunctionIndex`]. Compiled code loads entries out of this
        /// array through the VMContext.
        #[repr(C)]
        pub struct VMBuiltinFunctionsArray {
            $(
                $name: unsafe extern "C" fn(
                    $(define_builtin_array!(@ty $param)),*
                ) $( -> define_builtin_array!(@ty $result))?,
            )*
        }

        impl VMBuiltinFunctionsArray {
            pub const INIT: VMBuiltinFunctionsArray = VMBuiltinFunctionsArray {
                $(
                    $name: raw::$name,
                )*
            };
        }
    };

    (@ty u32) => (u32);
    (@ty u64) => (u64);
    (@ty pointer) => (*mut u8);
    (@ty vmctx) => (*mut u8);
}

foreach_builtin_function!(define_builtin_array);

static_assertions::const_assert_eq!(
    size_of::<VMBuiltinFunctionsArray>(),
    size_of::<usize>() * (BuiltinFunctionIndex::builtin_functions_total_number() as usize)
);

/// The process-wide builtin array every VMContext points at.
pub static BUILTINS: VMBuiltinFunctionsArray = VMBuiltinFunctionsArray::INIT;

/// Reads the instance host data out of a VMContext.
///
/// # Safety
///
/// `vmctx` must be a live VMContext populated by the instantiator.
unsafe fn host_data<'a>(vmctx: *mut u8) -> &'a InstanceHostData {
    // Safety: the host slot is at a fixed offset in every layout.
    unsafe {
        let ptr = vmctx.add(VMCTX_HOST_OFFSET as usize).cast::<*const InstanceHostData>();
        &*ptr.read()
    }
}

mod raw {
    use super::*;

    pub(super) unsafe extern "C" fn memory_grow(
        vmctx: *mut u8,
        memory_index: u32,
        delta: u64,
    ) -> u64 {
        // Safety: called from compiled code with a live vmctx.
        let host = unsafe { host_data(vmctx) };
        match host.grow_memory(memory_index, delta) {
            Ok(old_pages) => old_pages,
            Err(_) => {
                let exception =
                    Exception::intrinsic(crate::ExceptionKind::OutOfMemory, &[]);
                traphandler::raise_trap(exception)
            }
        }
    }

    pub(super) unsafe extern "C" fn throw(
        vmctx: *mut u8,
        _cctx: *mut u8,
        tag_index: u32,
        args: *mut u8,
    ) {
        // Safety: called from compiled code with a live vmctx.
        let host = unsafe { host_data(vmctx) };
        let (type_object, num_params) = host.exception_type(tag_index);

        // Safety: the emitter spills exactly `num_params` argument slots.
        let args = unsafe {
            core::slice::from_raw_parts(args.cast::<UntaggedValue>(), num_params)
        };

        let exception = Exception::user(crate::exception::ExceptionType(type_object), args);
        traphandler::raise_trap(exception)
    }

    pub(super) unsafe extern "C" fn trap_indirect_call(
        vmctx: *mut u8,
        table_index: u32,
        elem_index: u64,
        is_null: u32,
    ) {
        // Safety: called from compiled code with a live vmctx.
        let host = unsafe { host_data(vmctx) };
        let table = host.table(table_index);

        let kind = if is_null != 0 {
            crate::ExceptionKind::UninitializedTableElement
        } else {
            crate::ExceptionKind::IndirectCallSignatureMismatch
        };
        let args = [
            UntaggedValue::from_object(table),
            UntaggedValue::from_i64(elem_index as i64),
        ];
        let exception = if is_null != 0 {
            Exception::intrinsic(kind, &args)
        } else {
            Exception::intrinsic(kind, &[])
        };
        traphandler::raise_trap(exception)
    }

    pub(super) unsafe extern "C" fn trap_misaligned(_vmctx: *mut u8, addr: u64) {
        let exception = Exception::intrinsic(
            crate::ExceptionKind::MisalignedAtomicMemoryAccess,
            &[UntaggedValue::from_i64(addr as i64)],
        );
        traphandler::raise_trap(exception)
    }
}
