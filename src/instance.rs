// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The instantiator: binds imports, materializes declared entities inside
//! the compartment, initializes segments, and builds the executable
//! instance.
//!
//! Instantiation commits atomically at the instance level: every segment
//! range (including against imported targets) is validated before the first
//! byte is written, and any failure deallocates everything this call
//! created, leaving the compartment in its prior state.

use std::sync::{Arc, Weak};

use crate::compartment::{
    AllocationScope, Compartment, CompartmentShared, CompartmentState, ExportMap,
    InstanceHostData, Object, ObjectData,
};
use crate::exception::ExceptionTypeData;
use crate::func::{Function, FunctionData};
use crate::global::{GlobalData, GlobalStorage};
use crate::ir::{self, ConstExpr, ExportKind, ImportKind};
use crate::memory::MemoryData;
use crate::module::Module;
use crate::quota::ResourceQuota;
use crate::table::TableData;
use crate::types::Mutability;
use crate::vm::{
    VMBuiltinFunctionsArray, VMFuncRef, BUILTINS, GLOBAL_SLOT_BYTES, PTR_SIZE, VMCONTEXT_MAGIC,
};
use crate::{Error, Memory, Result, Table};

/// The vector of objects bound to a module's imports, in declaration order.
pub type ImportBindings = Vec<Object>;

/// A materialized module: its functions, tables, memories, globals and
/// exception types bound to resolved imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance(pub(crate) Object);

pub(crate) struct InstanceData {
    pub(crate) module: Module,
    /// The VMContext blob compiled code receives; u64 slots keep it
    /// 8-aligned.
    pub(crate) vmctx: Box<[u64]>,
    pub(crate) host: Box<InstanceHostData>,
    /// One function reference per defined function; table slots and import
    /// records point into this array.
    pub(crate) func_refs: Box<[VMFuncRef]>,
    /// Full index spaces, imports first.
    pub(crate) functions: Vec<Object>,
    pub(crate) tables: Vec<Object>,
    pub(crate) memories: Vec<Object>,
    pub(crate) globals: Vec<Object>,
    pub(crate) exception_types: Vec<Object>,
    /// Exports in declaration order plus a name lookup map.
    pub(crate) exports: Vec<(String, Object)>,
    pub(crate) export_map: ExportMap,
    pub(crate) start: Option<Object>,
    pub(crate) debug_name: String,
}

impl InstanceData {
    /// Objects this instance keeps alive.
    pub(crate) fn edges(&self) -> impl Iterator<Item = Object> + '_ {
        self.functions
            .iter()
            .chain(self.tables.iter())
            .chain(self.memories.iter())
            .chain(self.globals.iter())
            .chain(self.exception_types.iter())
            .chain(self.exports.iter().map(|(_, object)| object))
            .chain(self.start.iter())
            .copied()
    }

    fn vmctx_ptr(&self) -> *mut u8 {
        self.vmctx.as_ptr() as *mut u8
    }
}

/// Instantiates `module` inside `compartment`, binding `imports` in
/// declaration order.
///
/// The returned instance's start function, if any, has *not* been invoked;
/// fetch it with [`Instance::start_function`] so host glue can be installed
/// first.
pub fn instantiate_module(
    compartment: &Compartment,
    module: &Module,
    imports: ImportBindings,
    debug_name: impl Into<String>,
    quota: Option<&ResourceQuota>,
) -> Result<Instance> {
    let debug_name = debug_name.into();
    let ir = module.ir();
    let compartment_id = compartment.id();
    let mut state = compartment.state();
    let mut scope = AllocationScope::new();

    let result = instantiate_inner(
        &mut state,
        &mut scope,
        compartment,
        compartment_id,
        module,
        ir,
        imports,
        debug_name,
        quota,
    );

    match result {
        Ok(instance) => {
            scope.disarm();
            Ok(instance)
        }
        Err(error) => {
            scope.rollback(&mut state);
            Err(error)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn instantiate_inner(
    state: &mut CompartmentState,
    scope: &mut AllocationScope,
    compartment: &Compartment,
    compartment_id: u64,
    module: &Module,
    ir: &ir::Module,
    imports: ImportBindings,
    debug_name: String,
    quota: Option<&ResourceQuota>,
) -> Result<Instance> {
    // Bind imports: exactly one object per import slot, checked against the
    // expected extern type in declaration order.
    if imports.len() != ir.imports.len() {
        return Err(Error::ImportTypeMismatch(format!(
            "expected {} import(s), got {}",
            ir.imports.len(),
            imports.len()
        )));
    }

    let mut functions = Vec::new();
    let mut tables = Vec::new();
    let mut memories = Vec::new();
    let mut globals = Vec::new();
    let mut exception_types = Vec::new();

    for (import, object) in ir.imports.iter().zip(imports) {
        check_import(state, compartment_id, ir, import, object)?;
        match &import.ty {
            ImportKind::Func { .. } => functions.push(object),
            ImportKind::Table(_) => tables.push(object),
            ImportKind::Memory(_) => memories.push(object),
            ImportKind::Global(_) => globals.push(object),
            ImportKind::ExceptionType(_) => exception_types.push(object),
        }
    }

    // The instance object is created first so the function objects can
    // refer back to it; its data is patched in at the end.
    let instance_object = scope.track(state.alloc(
        compartment_id,
        ObjectData::Instance(InstanceData {
            module: module.clone(),
            vmctx: Box::new([]),
            host: Box::new(InstanceHostData {
                compartment: Weak::new(),
                memories: Vec::new(),
                tables: Vec::new(),
                exception_types: Vec::new(),
            }),
            func_refs: Box::new([]),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exception_types: Vec::new(),
            exports: Vec::new(),
            export_map: ExportMap::new(),
            start: None,
            debug_name: debug_name.clone(),
        }),
    ));

    // Materialize declared entities.
    for ty in &ir.memories {
        let data = MemoryData::new(*ty, quota, format!("{debug_name} memory"))?;
        let object = scope.track(state.alloc(compartment_id, ObjectData::Memory(data)));
        if let ObjectData::Memory(memory) = state.data(object)? {
            crate::vm::memory::register_reservation(&memory.storage, compartment_id, object);
        }
        memories.push(object);
    }

    for ty in &ir.tables {
        let data = TableData::new(*ty, quota, format!("{debug_name} table"))?;
        tables.push(scope.track(state.alloc(compartment_id, ObjectData::Table(data))));
    }

    for def in &ir.globals {
        let storage = match def.ty.mutability {
            Mutability::Var => GlobalStorage::Mutable {
                offset: state.alloc_mutable_global(0),
            },
            Mutability::Const => GlobalStorage::Immutable {
                def: Box::new(crate::vm::VMGlobalDefinition::from_bits(0)),
            },
        };
        let data = GlobalData {
            ty: def.ty,
            storage,
            initialized: false,
            ref_value: None,
        };
        globals.push(scope.track(state.alloc(compartment_id, ObjectData::Global(data))));
    }

    for def in &ir.exception_types {
        let data = ExceptionTypeData {
            params: def.params.clone(),
            debug_name: def.debug_name.clone(),
        };
        exception_types
            .push(scope.track(state.alloc(compartment_id, ObjectData::ExceptionType(data))));
    }

    // Build the VMContext and the function-reference array. Both live in
    // stable heap allocations owned by the instance data.
    let host = Box::new(InstanceHostData {
        compartment: Arc::downgrade(&compartment.shared),
        memories: memories.clone(),
        tables: tables.clone(),
        exception_types: exception_types
            .iter()
            .map(|object| {
                let count = match state.data(*object)? {
                    ObjectData::ExceptionType(et) => et.params.len(),
                    _ => return Err(Error::NotFound),
                };
                Ok((*object, count))
            })
            .collect::<Result<Vec<_>>>()?,
    });

    let mut vmctx = alloc_vmctx(module, host.as_ref());
    fill_vmctx_entities(state, module, &mut vmctx, &memories, &tables, &globals)?;

    let vmctx_ptr = vmctx.as_ptr() as *mut u8;
    let num_defined_funcs = ir.functions.len();
    let mut func_refs = Vec::with_capacity(num_defined_funcs);
    for def_index in 0..num_defined_funcs as u32 {
        let func_index = ir.num_imported_funcs() + def_index;
        func_refs.push(VMFuncRef::new(
            module.wasm_entry(def_index),
            module.array_entry(def_index),
            vmctx_ptr,
            module.func_type_tag(func_index),
        ));
    }
    let func_refs: Box<[VMFuncRef]> = func_refs.into_boxed_slice();

    // Function objects for the defined functions.
    for def_index in 0..num_defined_funcs as u32 {
        let func_index = ir.num_imported_funcs() + def_index;
        let type_index = ir.func_type_index(func_index);
        let data = FunctionData {
            ty: ir.types[type_index as usize].clone(),
            type_tag: module.func_type_tag(func_index),
            instance: instance_object,
            def_index,
            func_ref: &func_refs[def_index as usize],
            debug_name: ir.functions[def_index as usize].debug_name.clone(),
        };
        functions.push(scope.track(state.alloc(compartment_id, ObjectData::Function(data))));
    }

    // Resolved function imports go into the VMContext now that callee
    // references are known.
    fill_vmctx_function_imports(state, module, &mut vmctx, &functions)?;

    // Initialize globals; reference initializers can name defined
    // functions, so this happens after the function objects exist.
    for (def_index, def) in ir.globals.iter().enumerate() {
        let global_object = globals[ir.num_imported_globals() as usize + def_index];
        initialize_global(state, &globals, &functions, global_object, &def.init)?;
    }

    // Validate every segment before writing any byte: failed instantiation
    // must not leave partial writes behind, even in imported targets.
    for segment in &ir.data_segments {
        let offset = eval_const_u64(state, &globals, &segment.offset)?;
        let length = segment.bytes.len() as u64;
        let memory_object = memories[segment.memory as usize];
        let committed = match state.data(memory_object)? {
            ObjectData::Memory(memory) => memory.storage.committed_bytes() as u64,
            _ => return Err(Error::NotFound),
        };
        if offset.checked_add(length).is_none_or(|end| end > committed) {
            return Err(Error::OutOfBoundsDataSegment(offset, length));
        }
    }
    for segment in &ir.elem_segments {
        let offset = eval_const_u64(state, &globals, &segment.offset)?;
        let length = segment.functions.len() as u64;
        let table_object = tables[segment.table as usize];
        let table_len = match state.data(table_object)? {
            ObjectData::Table(table) => table.len(),
            _ => return Err(Error::NotFound),
        };
        if offset.checked_add(length).is_none_or(|end| end > table_len) {
            return Err(Error::OutOfBoundsElemSegment(offset, length));
        }
    }

    // Copy segments.
    for segment in &ir.data_segments {
        let offset = eval_const_u64(state, &globals, &segment.offset)?;
        let memory_object = memories[segment.memory as usize];
        if let ObjectData::Memory(memory) = state.data(memory_object)? {
            // Safety: the range was validated against the committed length
            // above and nothing shrank it while the state lock is held.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    segment.bytes.as_ptr(),
                    memory.storage.base().add(offset as usize),
                    segment.bytes.len(),
                );
            }
        }
    }
    for segment in &ir.elem_segments {
        let offset = eval_const_u64(state, &globals, &segment.offset)? as usize;
        let table_object = tables[segment.table as usize];

        let mut resolved = Vec::with_capacity(segment.functions.len());
        for entry in &segment.functions {
            resolved.push(match entry {
                Some(func_index) => {
                    let object = functions[*func_index as usize];
                    let func_ref = match state.data(object)? {
                        ObjectData::Function(function) => {
                            function.func_ref as *mut VMFuncRef
                        }
                        _ => return Err(Error::NotFound),
                    };
                    (Some(object), func_ref)
                }
                None => (None, core::ptr::null_mut()),
            });
        }

        if let ObjectData::Table(table) = state.data_mut(table_object)? {
            for (i, (object, func_ref)) in resolved.into_iter().enumerate() {
                table.set_slot(offset + i, object, func_ref);
            }
        }
    }

    // The exports table is built last, names mapping to objects in
    // declaration order.
    let mut exports = Vec::with_capacity(ir.exports.len());
    let mut export_map = ExportMap::new();
    for export in &ir.exports {
        let object = match export.kind {
            ExportKind::Func => functions[export.index as usize],
            ExportKind::Table => tables[export.index as usize],
            ExportKind::Memory => memories[export.index as usize],
            ExportKind::Global => globals[export.index as usize],
            ExportKind::ExceptionType => exception_types[export.index as usize],
        };
        export_map.insert(export.name.clone(), exports.len());
        exports.push((export.name.clone(), object));
    }

    let start = ir.start.map(|index| functions[index as usize]);

    *state.data_mut(instance_object)? = ObjectData::Instance(InstanceData {
        module: module.clone(),
        vmctx,
        host,
        func_refs,
        functions,
        tables,
        memories,
        globals,
        exception_types,
        exports,
        export_map,
        start,
        debug_name,
    });

    tracing::debug!("instantiated module as object {instance_object:?}");
    Ok(Instance(instance_object))
}

fn check_import(
    state: &CompartmentState,
    compartment_id: u64,
    ir: &ir::Module,
    import: &ir::Import,
    object: Object,
) -> Result<()> {
    let mismatch = |why: &str| {
        Error::ImportTypeMismatch(format!("{}::{}: {why}", import.module, import.name))
    };

    if object.compartment_id() != compartment_id {
        return Err(mismatch("object belongs to another compartment"));
    }
    let data = state
        .data(object)
        .map_err(|_| mismatch("no such object"))?;

    match (&import.ty, data) {
        (ImportKind::Func { type_index }, ObjectData::Function(function)) => {
            let expected = &ir.types[*type_index as usize];
            if &function.ty != expected {
                return Err(mismatch("function signature mismatch"));
            }
        }
        (ImportKind::Table(expected), ObjectData::Table(table)) => {
            let ok = table.ty.element == expected.element
                && table.ty.minimum >= expected.minimum
                && expected
                    .maximum
                    .is_none_or(|em| table.ty.maximum.is_some_and(|am| am <= em));
            if !ok {
                return Err(mismatch("table limits mismatch"));
            }
        }
        (ImportKind::Memory(expected), ObjectData::Memory(memory)) => {
            let ok = memory.ty.minimum >= expected.minimum
                && expected
                    .maximum
                    .is_none_or(|em| memory.ty.maximum.is_some_and(|am| am <= em));
            if !ok {
                return Err(mismatch("memory limits mismatch"));
            }
        }
        (ImportKind::Global(expected), ObjectData::Global(global)) => {
            if global.ty != *expected {
                return Err(mismatch("global type mismatch"));
            }
        }
        (ImportKind::ExceptionType(expected), ObjectData::ExceptionType(et)) => {
            if &et.params != expected {
                return Err(mismatch("exception parameter mismatch"));
            }
        }
        (expected, _) => {
            let desc = match expected {
                ImportKind::Func { .. } => "function",
                ImportKind::Table(_) => "table",
                ImportKind::Memory(_) => "memory",
                ImportKind::Global(_) => "global",
                ImportKind::ExceptionType(_) => "exception type",
            };
            return Err(mismatch(&format!("expected a {desc}")));
        }
    }
    Ok(())
}

fn alloc_vmctx(module: &Module, host: &InstanceHostData) -> Box<[u64]> {
    let size = module.0.offsets.size() as usize;
    let mut vmctx = vec![0u64; size.div_ceil(8)].into_boxed_slice();
    write_vmctx_word(
        &mut vmctx,
        module.0.offsets.magic(),
        u64::from(VMCONTEXT_MAGIC),
    );
    write_vmctx_word(
        &mut vmctx,
        module.0.offsets.builtins(),
        &BUILTINS as *const VMBuiltinFunctionsArray as u64,
    );
    write_vmctx_word(&mut vmctx, module.0.offsets.host(), host as *const _ as u64);
    vmctx
}

fn fill_vmctx_entities(
    state: &CompartmentState,
    module: &Module,
    vmctx: &mut [u64],
    memories: &[Object],
    tables: &[Object],
    globals: &[Object],
) -> Result<()> {
    let offsets = &module.0.offsets;

    for (index, object) in memories.iter().enumerate() {
        let def = match state.data(*object)? {
            ObjectData::Memory(memory) => memory.storage.vmmemory_definition(),
            _ => return Err(Error::NotFound),
        };
        write_vmctx_word(vmctx, offsets.memory_pointer(index as u32), def as u64);
    }

    for (index, object) in tables.iter().enumerate() {
        let def = match state.data(*object)? {
            ObjectData::Table(table) => table.storage.vmtable_definition(),
            _ => return Err(Error::NotFound),
        };
        write_vmctx_word(vmctx, offsets.table_pointer(index as u32), def as u64);
    }

    for (index, object) in globals.iter().enumerate() {
        let index = index as u32;
        match state.data(*object)? {
            ObjectData::Global(global) => match &global.storage {
                GlobalStorage::Immutable { .. } => {
                    write_vmctx_word(
                        vmctx,
                        offsets.global_definition_pointer(index),
                        global.definition_ptr() as u64,
                    );
                }
                GlobalStorage::Mutable { offset } => {
                    write_vmctx_word(vmctx, offsets.global_offset_word(index), u64::from(*offset));
                }
            },
            _ => return Err(Error::NotFound),
        }
    }

    Ok(())
}

fn fill_vmctx_function_imports(
    state: &CompartmentState,
    module: &Module,
    vmctx: &mut [u64],
    functions: &[Object],
) -> Result<()> {
    let offsets = &module.0.offsets;
    let num_imported = module.ir().num_imported_funcs();

    for import_index in 0..num_imported {
        let object = functions[import_index as usize];
        let func_ref = match state.data(object)? {
            ObjectData::Function(function) => function.func_ref,
            _ => return Err(Error::NotFound),
        };
        // Safety: the referenced array is owned by the exporting instance,
        // which lives in the same compartment.
        let func_ref = unsafe { &*func_ref };

        // A VMFunctionImport is three pointer words in declaration order.
        let base = offsets.function_import(import_index);
        write_vmctx_word(vmctx, base, func_ref.wasm_call as u64);
        write_vmctx_word(vmctx, base + PTR_SIZE, func_ref.array_call as u64);
        write_vmctx_word(vmctx, base + 2 * PTR_SIZE, func_ref.vmctx as u64);
    }
    Ok(())
}

fn write_vmctx_word(vmctx: &mut [u64], byte_offset: u32, value: u64) {
    debug_assert_eq!(byte_offset % 8, 0);
    vmctx[(byte_offset / 8) as usize] = value;
}

fn read_global_bits(
    state: &CompartmentState,
    globals: &[Object],
    index: u32,
) -> Result<u128> {
    match state.data(globals[index as usize])? {
        ObjectData::Global(global) => match &global.storage {
            GlobalStorage::Immutable { def } => Ok(def.bits()),
            GlobalStorage::Mutable { offset } => {
                let offset = *offset as usize;
                Ok(u128::from_le_bytes(
                    state.globals_image[offset..offset + GLOBAL_SLOT_BYTES as usize]
                        .try_into()
                        .unwrap(),
                ))
            }
        },
        _ => Err(Error::NotFound),
    }
}

fn eval_const_u64(
    state: &CompartmentState,
    globals: &[Object],
    expr: &ConstExpr,
) -> Result<u64> {
    let bits = match expr {
        ConstExpr::I32(v) => *v as u32 as u128,
        ConstExpr::I64(v) => *v as u64 as u128,
        ConstExpr::GlobalGet(index) => read_global_bits(state, globals, *index)?,
        _ => return Err(Error::InvalidArgument("segment offset must be an integer")),
    };
    Ok(bits as u64)
}

fn initialize_global(
    state: &mut CompartmentState,
    globals: &[Object],
    functions: &[Object],
    global_object: Object,
    init: &ConstExpr,
) -> Result<()> {
    let (bits, ref_value) = match init {
        ConstExpr::I32(v) => (*v as u32 as u128, None),
        ConstExpr::I64(v) => (*v as u64 as u128, None),
        ConstExpr::F32(bits) => (*bits as u128, None),
        ConstExpr::F64(bits) => (*bits as u128, None),
        ConstExpr::V128(bits) => (*bits, None),
        ConstExpr::RefNull => (0, None),
        ConstExpr::GlobalGet(index) => (read_global_bits(state, globals, *index)?, None),
        ConstExpr::RefFunc(index) => {
            let object = functions[*index as usize];
            let func_ref = match state.data(object)? {
                ObjectData::Function(function) => function.func_ref,
                _ => return Err(Error::NotFound),
            };
            (func_ref as usize as u128, Some(object))
        }
    };

    let offset = match state.data_mut(global_object)? {
        ObjectData::Global(global) => {
            debug_assert!(!global.initialized);
            global.initialized = true;
            global.ref_value = ref_value;
            match &mut global.storage {
                GlobalStorage::Immutable { def } => {
                    **def = crate::vm::VMGlobalDefinition::from_bits(bits);
                    None
                }
                GlobalStorage::Mutable { offset } => Some(*offset),
            }
        }
        _ => return Err(Error::NotFound),
    };

    if let Some(offset) = offset {
        state.write_mutable_global(offset, bits);
    }
    Ok(())
}

// ===== impl Instance =====

impl Instance {
    pub fn as_object(&self) -> Object {
        self.0
    }

    pub fn from_object(compartment: &Compartment, object: Object) -> Result<Instance> {
        match compartment.object_kind(object)? {
            crate::ObjectKind::Instance => Ok(Instance(object)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn module(&self, compartment: &Compartment) -> Result<Module> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Instance(instance) => Ok(instance.module.clone()),
            _ => Err(Error::NotFound),
        }
    }

    /// Gets an export by name.
    pub fn export(&self, compartment: &Compartment, name: &str) -> Result<Object> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Instance(instance) => {
                let index = instance.export_map.get(name).ok_or(Error::NotFound)?;
                Ok(instance.exports[*index].1)
            }
            _ => Err(Error::NotFound),
        }
    }

    /// All exports, in declaration order.
    pub fn exports(&self, compartment: &Compartment) -> Result<Vec<(String, Object)>> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Instance(instance) => Ok(instance.exports.clone()),
            _ => Err(Error::NotFound),
        }
    }

    /// The declared start function. Invoking it is the caller's
    /// responsibility.
    pub fn start_function(&self, compartment: &Compartment) -> Result<Option<Function>> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Instance(instance) => Ok(instance.start.map(Function)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn default_memory(&self, compartment: &Compartment) -> Result<Option<Memory>> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Instance(instance) => {
                Ok(instance.memories.first().copied().map(Memory))
            }
            _ => Err(Error::NotFound),
        }
    }

    pub fn default_table(&self, compartment: &Compartment) -> Result<Option<Table>> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Instance(instance) => Ok(instance.tables.first().copied().map(Table)),
            _ => Err(Error::NotFound),
        }
    }
}

// ===== compartment cloning support =====

/// Rebuilds an instance against the cloned entities of `dst`, sharing the
/// immutable module artifact. Function imports are filled in later by
/// [`refresh_function_imports`], once the cloned function objects exist.
pub(crate) fn duplicate_instance(
    dst: &mut CompartmentState,
    src: &InstanceData,
    new_id: u64,
    compartment: Weak<CompartmentShared>,
) -> Result<InstanceData> {
    let module = src.module.clone();

    let functions: Vec<Object> = src.functions.iter().map(|o| o.rescope(new_id)).collect();
    let tables: Vec<Object> = src.tables.iter().map(|o| o.rescope(new_id)).collect();
    let memories: Vec<Object> = src.memories.iter().map(|o| o.rescope(new_id)).collect();
    let globals: Vec<Object> = src.globals.iter().map(|o| o.rescope(new_id)).collect();
    let exception_types: Vec<Object> = src
        .exception_types
        .iter()
        .map(|o| o.rescope(new_id))
        .collect();

    let host = Box::new(InstanceHostData {
        compartment,
        memories: memories.clone(),
        tables: tables.clone(),
        exception_types: src
            .host
            .exception_types
            .iter()
            .map(|(object, count)| (object.rescope(new_id), *count))
            .collect(),
    });

    let mut vmctx = alloc_vmctx(&module, host.as_ref());
    fill_vmctx_entities(dst, &module, &mut vmctx, &memories, &tables, &globals)?;

    let vmctx_ptr = vmctx.as_ptr() as *mut u8;
    let func_refs: Box<[VMFuncRef]> = src
        .func_refs
        .iter()
        .map(|func_ref| {
            VMFuncRef::new(
                func_ref.wasm_call,
                func_ref.array_call,
                vmctx_ptr,
                func_ref.type_index,
            )
        })
        .collect();

    Ok(InstanceData {
        module,
        vmctx,
        host,
        func_refs,
        functions,
        tables,
        memories,
        globals,
        exception_types,
        exports: src
            .exports
            .iter()
            .map(|(name, object)| (name.clone(), object.rescope(new_id)))
            .collect(),
        export_map: src.export_map.clone(),
        start: src.start.map(|object| object.rescope(new_id)),
        debug_name: src.debug_name.clone(),
    })
}

/// Rebuilds a function object against its cloned instance.
pub(crate) fn duplicate_function(
    dst: &CompartmentState,
    src: &FunctionData,
    new_id: u64,
) -> Result<FunctionData> {
    let instance = src.instance.rescope(new_id);
    let func_ref = match dst.data(instance)? {
        ObjectData::Instance(data) => &data.func_refs[src.def_index as usize] as *const VMFuncRef,
        _ => return Err(Error::NotFound),
    };
    Ok(FunctionData {
        ty: src.ty.clone(),
        type_tag: src.type_tag,
        instance,
        def_index: src.def_index,
        func_ref,
        debug_name: src.debug_name.clone(),
    })
}

/// Rewrites the function-import records of the instance at `slot_index`
/// after all cloned function objects exist.
pub(crate) fn refresh_function_imports(
    dst: &mut CompartmentState,
    slot_index: u32,
) -> Result<()> {
    let (module, functions) = match &dst.slots[slot_index as usize].data {
        Some(ObjectData::Instance(instance)) => {
            (instance.module.clone(), instance.functions.clone())
        }
        _ => return Err(Error::NotFound),
    };

    // Collect the resolved records first; writing needs the instance
    // borrowed mutably.
    let num_imported = module.ir().num_imported_funcs();
    let mut records = Vec::with_capacity(num_imported as usize);
    for import_index in 0..num_imported {
        let func_ref = match dst.data(functions[import_index as usize])? {
            ObjectData::Function(function) => function.func_ref,
            _ => return Err(Error::NotFound),
        };
        // Safety: points into a sibling instance's live reference array.
        let func_ref = unsafe { &*func_ref };
        records.push((
            func_ref.wasm_call as u64,
            func_ref.array_call as u64,
            func_ref.vmctx as u64,
        ));
    }

    if let Some(ObjectData::Instance(instance)) = &mut dst.slots[slot_index as usize].data {
        let offsets = module.0.offsets.clone();
        for (import_index, (wasm_call, array_call, vmctx)) in records.into_iter().enumerate() {
            let base = offsets.function_import(import_index as u32);
            write_vmctx_word(&mut instance.vmctx, base, wasm_call);
            write_vmctx_word(&mut instance.vmctx, base + PTR_SIZE, array_call);
            write_vmctx_word(&mut instance.vmctx, base + 2 * PTR_SIZE, vmctx);
        }
    }
    Ok(())
}
