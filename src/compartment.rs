// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compartments: the isolation boundary owning all runtime objects.
//!
//! Every object lives in exactly one compartment's slot arena and is
//! addressed by a compartment-scoped [`Object`] handle (index + generation).
//! References between objects are handles, never owning pointers, which
//! sidesteps ownership cycles; liveness comes from explicit root counters
//! plus a mark-and-sweep pass over the arena. A [`Compartment`] value is
//! itself a root on the compartment: cloning the handle adds a root,
//! dropping it removes one.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hashbrown::HashMap;

use crate::context::ContextData;
use crate::engine::Engine;
use crate::exception::ExceptionTypeData;
use crate::func::FunctionData;
use crate::global::GlobalData;
use crate::instance::{self, InstanceData};
use crate::memory::MemoryData;
use crate::table::TableData;
use crate::types::ExternType;
use crate::vm::{self, VMFuncRef, GLOBAL_SLOT_BYTES};
use crate::{Error, Result};

/// A compartment-scoped handle to a runtime object.
///
/// Handles are plain data: copying one confers no liveness. Use
/// [`Compartment::add_root`] to keep the object alive across collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Object {
    compartment: u64,
    index: u32,
    gen: u32,
}

impl Object {
    pub(crate) fn from_raw_parts(compartment: u64, index: u32, gen: u32) -> Self {
        Self {
            compartment,
            index,
            gen,
        }
    }

    /// The id of the compartment this handle is scoped to.
    pub fn compartment_id(&self) -> u64 {
        self.compartment
    }

    /// Re-scopes the handle to a clone of its compartment; positions are
    /// preserved by cloning, so this is position-identical.
    pub(crate) fn rescope(&self, compartment: u64) -> Self {
        Self {
            compartment,
            ..*self
        }
    }

    /// Packs the handle into 128 bits (for untagged exception arguments).
    pub(crate) fn to_bits(self) -> u128 {
        (u128::from(self.compartment) << 64)
            | (u128::from(self.index) << 32)
            | u128::from(self.gen)
    }

    pub(crate) fn from_bits(bits: u128) -> Option<Self> {
        if bits == 0 {
            return None;
        }
        Some(Self {
            compartment: (bits >> 64) as u64,
            index: (bits >> 32) as u32,
            gen: bits as u32,
        })
    }
}

/// The kind of a runtime object. Fixed for the object's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Function,
    Table,
    Memory,
    Global,
    ExceptionType,
    Instance,
    Context,
    Foreign,
}

pub(crate) enum ObjectData {
    Function(FunctionData),
    Table(TableData),
    Memory(MemoryData),
    Global(GlobalData),
    ExceptionType(ExceptionTypeData),
    Instance(InstanceData),
    Context(ContextData),
    Foreign,
}

impl ObjectData {
    pub(crate) fn kind(&self) -> ObjectKind {
        match self {
            ObjectData::Function(_) => ObjectKind::Function,
            ObjectData::Table(_) => ObjectKind::Table,
            ObjectData::Memory(_) => ObjectKind::Memory,
            ObjectData::Global(_) => ObjectKind::Global,
            ObjectData::ExceptionType(_) => ObjectKind::ExceptionType,
            ObjectData::Instance(_) => ObjectKind::Instance,
            ObjectData::Context(_) => ObjectKind::Context,
            ObjectData::Foreign => ObjectKind::Foreign,
        }
    }
}

type Finalizer = unsafe fn(*mut u8);

struct UserData {
    ptr: *mut u8,
    finalizer: Option<Finalizer>,
}

pub(crate) struct Slot {
    gen: u32,
    root_count: u32,
    user_data: Option<UserData>,
    pub(crate) data: Option<ObjectData>,
}

impl Slot {
    pub(crate) fn gen(&self) -> u32 {
        self.gen
    }

    fn finalize(&mut self) {
        if let Some(user_data) = self.user_data.take() {
            if let Some(finalizer) = user_data.finalizer {
                // Safety: the host promised the finalizer accepts the
                // pointer it registered.
                unsafe { finalizer(user_data.ptr) };
            }
        }
        self.data = None;
    }
}

pub(crate) struct CompartmentState {
    /// Roots held on the compartment itself (live `Compartment` handles).
    root_count: u32,
    pub(crate) slots: Vec<Slot>,
    free: Vec<u32>,
    /// Clone lineage, oldest first.
    ancestors: Vec<u64>,
    /// Bytes of the compartment-wide mutable-global layout.
    globals_layout: u32,
    /// Initial values of the layout; new contexts start from this image.
    pub(crate) globals_image: Vec<u8>,
    dead: bool,
}

pub(crate) struct CompartmentShared {
    pub(crate) id: u64,
    pub(crate) engine: Engine,
    state: Mutex<CompartmentState>,
    /// Number of invocations currently executing in this compartment;
    /// collection requires it to be zero.
    pub(crate) in_call: AtomicU32,
}

// Safety: the raw pointers inside object data target allocations owned by
// the same state and all access is behind the state mutex; compiled-code
// access is coordinated by the in-call counter and the caller contract.
unsafe impl Send for CompartmentShared {}
// Safety: see above.
unsafe impl Sync for CompartmentShared {}

impl CompartmentState {
    pub(crate) fn alloc(&mut self, compartment: u64, data: ObjectData) -> Object {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.data.is_none());
            slot.data = Some(data);
            slot.root_count = 0;
            Object {
                compartment,
                index,
                gen: slot.gen,
            }
        } else {
            let index = u32::try_from(self.slots.len()).unwrap();
            self.slots.push(Slot {
                gen: 0,
                root_count: 0,
                user_data: None,
                data: Some(data),
            });
            Object {
                compartment,
                index,
                gen: 0,
            }
        }
    }

    /// Frees one object immediately (instantiation rollback); finalizers
    /// run as if collected.
    pub(crate) fn dealloc(&mut self, object: Object) {
        let slot = &mut self.slots[object.index as usize];
        debug_assert_eq!(slot.gen, object.gen);
        slot.finalize();
        slot.gen = slot.gen.wrapping_add(1);
        slot.root_count = 0;
        self.free.push(object.index);
    }

    fn slot(&self, object: Object) -> Result<&Slot> {
        let slot = self
            .slots
            .get(object.index as usize)
            .ok_or(Error::NotFound)?;
        if slot.gen != object.gen || slot.data.is_none() {
            return Err(Error::NotFound);
        }
        Ok(slot)
    }

    fn slot_mut(&mut self, object: Object) -> Result<&mut Slot> {
        let slot = self
            .slots
            .get_mut(object.index as usize)
            .ok_or(Error::NotFound)?;
        if slot.gen != object.gen || slot.data.is_none() {
            return Err(Error::NotFound);
        }
        Ok(slot)
    }

    pub(crate) fn data(&self, object: Object) -> Result<&ObjectData> {
        Ok(self.slot(object)?.data.as_ref().unwrap())
    }

    pub(crate) fn data_mut(&mut self, object: Object) -> Result<&mut ObjectData> {
        Ok(self.slot_mut(object)?.data.as_mut().unwrap())
    }

    /// Reserves a slot in the mutable-global layout, propagating the
    /// initial value image to every live context.
    pub(crate) fn alloc_mutable_global(&mut self, initial: u128) -> u32 {
        let offset = self.globals_layout;
        self.globals_layout += GLOBAL_SLOT_BYTES;
        self.globals_image.extend_from_slice(&initial.to_le_bytes());

        for slot in &mut self.slots {
            if let Some(ObjectData::Context(context)) = &mut slot.data {
                context.extend_globals(&initial.to_le_bytes());
            }
        }
        offset
    }

    /// Writes a mutable global's value into the initial image and all live
    /// contexts (used by global initialization).
    pub(crate) fn write_mutable_global(&mut self, offset: u32, value: u128) {
        let range = offset as usize..offset as usize + GLOBAL_SLOT_BYTES as usize;
        self.globals_image[range.clone()].copy_from_slice(&value.to_le_bytes());
        for slot in &mut self.slots {
            if let Some(ObjectData::Context(context)) = &mut slot.data {
                context.write_globals(range.clone(), &value.to_le_bytes());
            }
        }
    }

    fn objects(&self) -> impl Iterator<Item = (u32, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.data.is_some())
            .map(|(i, slot)| (i as u32, slot))
    }
}

impl CompartmentShared {
    pub(crate) fn state(&self) -> MutexGuard<'_, CompartmentState> {
        self.state.lock().unwrap()
    }

    /// Memory growth on behalf of compiled code (the `memory.grow` builtin).
    pub(crate) fn grow_memory_object(&self, object: Object, delta: u64) -> Result<u64> {
        let state = self.state();
        let ObjectData::Memory(memory) = state.data(object)? else {
            return Err(Error::NotFound);
        };
        memory.grow(delta)
    }
}

/// An isolation boundary owning a set of runtime objects.
///
/// The value is a rooted handle: it keeps the compartment itself alive.
/// Clone to share; pass to [`Compartment::try_collect`] to give the root up
/// and tear the compartment down if nothing else can reach it.
pub struct Compartment {
    pub(crate) shared: Arc<CompartmentShared>,
}

impl Compartment {
    pub fn new(engine: &Engine) -> Self {
        let shared = Arc::new(CompartmentShared {
            id: engine.next_compartment_id(),
            engine: engine.clone(),
            state: Mutex::new(CompartmentState {
                root_count: 1,
                slots: Vec::new(),
                free: Vec::new(),
                ancestors: Vec::new(),
                globals_layout: 0,
                globals_image: Vec::new(),
                dead: false,
            }),
            in_call: AtomicU32::new(0),
        });
        Self { shared }
    }

    pub fn engine(&self) -> &Engine {
        &self.shared.engine
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, CompartmentState> {
        self.shared.state()
    }

    /// Whether `object` is a live object of this compartment.
    pub fn contains(&self, object: Object) -> bool {
        object.compartment == self.shared.id && self.state().slot(object).is_ok()
    }

    pub(crate) fn check_scope(&self, object: Object) -> Result<()> {
        if object.compartment == self.shared.id {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Increments the object's counter of root references.
    pub fn add_root(&self, object: Object) -> Result<()> {
        self.check_scope(object)?;
        let mut state = self.state();
        let slot = state.slot_mut(object)?;
        slot.root_count = slot
            .root_count
            .checked_add(1)
            .ok_or(Error::InvalidState("root counter overflow"))?;
        Ok(())
    }

    /// Decrements the object's counter of root references.
    pub fn remove_root(&self, object: Object) -> Result<()> {
        self.check_scope(object)?;
        let mut state = self.state();
        let slot = state.slot_mut(object)?;
        slot.root_count = slot
            .root_count
            .checked_sub(1)
            .ok_or(Error::InvalidState("root counter underflow"))?;
        Ok(())
    }

    /// Attaches an opaque host pointer to the object. The finalizer runs
    /// exactly once when the object is freed, including at compartment
    /// teardown.
    pub fn set_user_data(
        &self,
        object: Object,
        ptr: *mut u8,
        finalizer: Option<unsafe fn(*mut u8)>,
    ) -> Result<()> {
        self.check_scope(object)?;
        let mut state = self.state();
        let slot = state.slot_mut(object)?;
        slot.user_data = Some(UserData { ptr, finalizer });
        Ok(())
    }

    pub fn user_data(&self, object: Object) -> Result<*mut u8> {
        self.check_scope(object)?;
        let state = self.state();
        let slot = state.slot(object)?;
        Ok(slot
            .user_data
            .as_ref()
            .map_or(core::ptr::null_mut(), |u| u.ptr))
    }

    pub fn object_kind(&self, object: Object) -> Result<ObjectKind> {
        self.check_scope(object)?;
        Ok(self.state().data(object)?.kind())
    }

    /// The extern type of an importable/exportable object.
    pub fn extern_type(&self, object: Object) -> Result<ExternType> {
        self.check_scope(object)?;
        let state = self.state();
        match state.data(object)? {
            ObjectData::Function(f) => Ok(ExternType::Func(f.ty.clone())),
            ObjectData::Table(t) => Ok(ExternType::Table(t.ty)),
            ObjectData::Memory(m) => Ok(ExternType::Memory(m.ty)),
            ObjectData::Global(g) => Ok(ExternType::Global(g.ty)),
            ObjectData::ExceptionType(e) => {
                Ok(ExternType::ExceptionType(e.params.iter().copied().collect()))
            }
            _ => Err(Error::InvalidArgument("object has no extern type")),
        }
    }

    /// Tests whether an object is of the given extern type.
    pub fn is_a(&self, object: Object, ty: &ExternType) -> bool {
        match self.extern_type(object) {
            Ok(actual) => match (&actual, ty) {
                // Table and memory limits are satisfied by anything at
                // least as large.
                (ExternType::Table(a), ExternType::Table(e)) => {
                    a.element == e.element
                        && a.minimum >= e.minimum
                        && e.maximum.is_none_or(|em| a.maximum.is_some_and(|am| am <= em))
                }
                (ExternType::Memory(a), ExternType::Memory(e)) => {
                    a.minimum >= e.minimum
                        && e.maximum.is_none_or(|em| a.maximum.is_some_and(|am| am <= em))
                }
                _ => actual == *ty,
            },
            Err(_) => false,
        }
    }

    /// Frees all objects unreachable from roots, live contexts, and
    /// everything reachable from those.
    ///
    /// # Panics
    ///
    /// Panics if any context of this compartment is mid-invocation; the
    /// caller must quiesce the compartment first.
    pub fn collect_garbage(&self) {
        self.assert_quiesced("collect_garbage");
        let mut state = self.state();
        collect(&mut state);
    }

    fn assert_quiesced(&self, what: &str) {
        let in_call = self.shared.in_call.load(Ordering::Acquire);
        assert!(
            in_call == 0,
            "{what} while {in_call} invocation(s) are executing in the compartment"
        );
    }

    /// Gives up this handle's root and collects. Returns true iff the whole
    /// compartment was freed: no other compartment roots and no rooted
    /// objects remain.
    pub fn try_collect(self) -> bool {
        self.assert_quiesced("try_collect");

        let shared = Arc::clone(&self.shared);
        // The root this handle holds is released manually below.
        core::mem::forget(self);

        let mut state = shared.state();
        state.root_count -= 1;

        let freeable =
            state.root_count == 0 && state.objects().all(|(_, slot)| slot.root_count == 0);
        if freeable {
            for slot in &mut state.slots {
                if slot.data.is_some() {
                    slot.finalize();
                }
            }
            state.slots.clear();
            state.free.clear();
            state.dead = true;
            true
        } else {
            collect(&mut state);
            false
        }
    }

    /// Produces a new compartment with every object duplicated at the same
    /// position: same data, new identities.
    ///
    /// # Panics
    ///
    /// Panics if the compartment is mid-invocation.
    pub fn clone_compartment(&self) -> Result<Compartment> {
        self.assert_quiesced("clone_compartment");

        let engine = &self.shared.engine;
        let new_id = engine.next_compartment_id();
        let src = self.state();

        let mut ancestors = src.ancestors.clone();
        ancestors.push(self.shared.id);

        let mut dst = CompartmentState {
            root_count: 1,
            slots: Vec::with_capacity(src.slots.len()),
            free: src.free.clone(),
            ancestors,
            globals_layout: src.globals_layout,
            globals_image: src.globals_image.clone(),
            dead: false,
        };

        let shared = Arc::new(CompartmentShared {
            id: new_id,
            engine: engine.clone(),
            state: Mutex::new(CompartmentState {
                root_count: 1,
                slots: Vec::new(),
                free: Vec::new(),
                ancestors: Vec::new(),
                globals_layout: 0,
                globals_image: Vec::new(),
                dead: false,
            }),
            in_call: AtomicU32::new(0),
        });

        // Pass 1: everything except instances and functions, which need the
        // cloned entities in place first.
        for slot in src.slots.iter() {
            let data = match &slot.data {
                None => None,
                Some(ObjectData::Memory(memory)) => {
                    Some(ObjectData::Memory(memory.duplicate()?))
                }
                Some(ObjectData::Table(table)) => {
                    Some(ObjectData::Table(table.duplicate(new_id)?))
                }
                Some(ObjectData::Global(global)) => {
                    Some(ObjectData::Global(global.duplicate(new_id)))
                }
                Some(ObjectData::ExceptionType(et)) => {
                    Some(ObjectData::ExceptionType(et.clone()))
                }
                Some(ObjectData::Context(context)) => {
                    Some(ObjectData::Context(context.duplicate()))
                }
                Some(ObjectData::Foreign) => Some(ObjectData::Foreign),
                // Placeholders; filled by pass 2.
                Some(ObjectData::Instance(_)) | Some(ObjectData::Function(_)) => None,
            };
            dst.slots.push(Slot {
                gen: slot.gen,
                root_count: slot.root_count,
                user_data: None,
                data,
            });
        }

        // Pass 2: rebuild instances against the cloned entities (sharing
        // the immutable code objects), then their function objects.
        let mut instance_indices = Vec::new();
        for (index, slot) in src.objects() {
            if let Some(ObjectData::Instance(src_instance)) = &slot.data {
                let cloned = instance::duplicate_instance(
                    &mut dst,
                    src_instance,
                    new_id,
                    Arc::downgrade(&shared),
                )?;
                dst.slots[index as usize].data = Some(ObjectData::Instance(cloned));
                instance_indices.push(index);
            }
        }
        for (index, slot) in src.objects() {
            if let Some(ObjectData::Function(function)) = &slot.data {
                let cloned = instance::duplicate_function(&dst, function, new_id)?;
                dst.slots[index as usize].data = Some(ObjectData::Function(cloned));
            }
        }
        // Function imports can only be resolved once every function object
        // exists.
        for index in instance_indices {
            instance::refresh_function_imports(&mut dst, index)?;
        }

        // Re-point table slots at the cloned instances' function references.
        for index in 0..dst.slots.len() {
            let elements = match &dst.slots[index].data {
                Some(ObjectData::Table(table)) => table.elements.clone(),
                _ => continue,
            };
            let mut resolved = Vec::with_capacity(elements.len());
            for element in &elements {
                let func_ref = match element {
                    Some(object) => match dst.data(*object)? {
                        ObjectData::Function(f) => f.func_ref as *mut VMFuncRef,
                        _ => core::ptr::null_mut(),
                    },
                    None => core::ptr::null_mut(),
                };
                resolved.push(func_ref);
            }
            if let Some(ObjectData::Table(table)) = &mut dst.slots[index].data {
                for (i, func_ref) in resolved.into_iter().enumerate() {
                    table.storage.set(i, func_ref);
                }
            }
        }

        // Register the cloned memory reservations under their new identity.
        for (index, slot) in dst.slots.iter().enumerate() {
            if let Some(ObjectData::Memory(memory)) = &slot.data {
                let object = Object {
                    compartment: new_id,
                    index: index as u32,
                    gen: slot.gen,
                };
                vm::memory::register_reservation(&memory.storage, new_id, object);
            }
        }

        *shared.state() = dst;
        Ok(Compartment { shared })
    }

    /// Given an object of this compartment's clone-ancestor, returns the
    /// object at the structurally identical position in this compartment.
    pub fn remap_to_cloned_compartment(&self, object: Object) -> Result<Object> {
        let state = self.state();
        if !state.ancestors.contains(&object.compartment) {
            return Err(Error::NotFound);
        }
        let remapped = object.rescope(self.shared.id);
        state.slot(remapped)?;
        Ok(remapped)
    }

    pub(crate) fn begin_call(&self) {
        self.shared.in_call.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_call(&self) {
        self.shared.in_call.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Clone for Compartment {
    fn clone(&self) -> Self {
        self.shared.state().root_count += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Compartment {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        if !state.dead {
            state.root_count = state.root_count.saturating_sub(1);
        }
    }
}

impl core::fmt::Debug for Compartment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Compartment")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

/// Mark from roots and live contexts, then sweep. Cycles are fine: the mark
/// phase visits each reachable slot once.
fn collect(state: &mut CompartmentState) {
    let mut marked = vec![false; state.slots.len()];
    let mut worklist = Vec::new();

    for (index, slot) in state.objects() {
        let is_root = slot.root_count > 0
            || matches!(slot.data, Some(ObjectData::Context(_)));
        if is_root {
            worklist.push(index);
        }
    }

    while let Some(index) = worklist.pop() {
        if marked[index as usize] {
            continue;
        }
        marked[index as usize] = true;

        let mut push = |object: &Object, worklist: &mut Vec<u32>| {
            worklist.push(object.index);
        };

        match &state.slots[index as usize].data {
            Some(ObjectData::Function(f)) => push(&f.instance, &mut worklist),
            Some(ObjectData::Table(t)) => {
                for element in t.elements.iter().flatten() {
                    push(element, &mut worklist);
                }
            }
            Some(ObjectData::Global(g)) => {
                if let Some(value) = &g.ref_value {
                    push(value, &mut worklist);
                }
            }
            Some(ObjectData::Instance(i)) => {
                for object in i.edges() {
                    push(&object, &mut worklist);
                }
            }
            _ => {}
        }
    }

    let mut freed = 0usize;
    let CompartmentState { slots, free, .. } = state;
    for (index, slot) in slots.iter_mut().enumerate() {
        if slot.data.is_some() && !marked[index] {
            slot.finalize();
            slot.gen = slot.gen.wrapping_add(1);
            slot.root_count = 0;
            free.push(index as u32);
            freed += 1;
        }
    }

    if freed > 0 {
        tracing::debug!("collected {freed} object(s)");
    }
}

/// An opaque host object: a user-data carrier with a finalizer, otherwise
/// inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Foreign(pub(crate) Object);

impl Foreign {
    pub fn new(
        compartment: &Compartment,
        user_data: *mut u8,
        finalizer: Option<unsafe fn(*mut u8)>,
    ) -> Result<Foreign> {
        let object = compartment
            .state()
            .alloc(compartment.id(), ObjectData::Foreign);
        compartment.set_user_data(object, user_data, finalizer)?;
        Ok(Foreign(object))
    }

    pub fn as_object(&self) -> Object {
        self.0
    }
}

/// The host-visible data a VMContext points at, consumed by builtins.
pub(crate) struct InstanceHostData {
    pub(crate) compartment: Weak<CompartmentShared>,
    pub(crate) memories: Vec<Object>,
    pub(crate) tables: Vec<Object>,
    /// (object, parameter count) per exception-type index.
    pub(crate) exception_types: Vec<(Object, usize)>,
}

impl InstanceHostData {
    pub(crate) fn grow_memory(&self, memory_index: u32, delta: u64) -> Result<u64> {
        let shared = self
            .compartment
            .upgrade()
            .ok_or(Error::InvalidState("compartment is gone"))?;
        let object = *self
            .memories
            .get(memory_index as usize)
            .ok_or(Error::NotFound)?;
        shared.grow_memory_object(object, delta)
    }

    pub(crate) fn table(&self, table_index: u32) -> Object {
        self.tables[table_index as usize]
    }

    pub(crate) fn exception_type(&self, tag_index: u32) -> (Object, usize) {
        self.exception_types[tag_index as usize]
    }
}

/// Tracks objects allocated during a fallible multi-object operation
/// (instantiation); unless disarmed, they are deallocated on drop.
pub(crate) struct AllocationScope {
    pub(crate) created: Vec<Object>,
    pub(crate) armed: bool,
}

impl AllocationScope {
    pub(crate) fn new() -> Self {
        Self {
            created: Vec::new(),
            armed: true,
        }
    }

    pub(crate) fn track(&mut self, object: Object) -> Object {
        self.created.push(object);
        object
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }

    pub(crate) fn rollback(&mut self, state: &mut CompartmentState) {
        if !self.armed {
            return;
        }
        for object in self.created.drain(..).rev() {
            state.dealloc(object);
        }
    }
}

/// Lookup helpers shared by the typed object wrappers.
pub(crate) fn with_data<T>(
    compartment: &Compartment,
    object: Object,
    f: impl FnOnce(&ObjectData) -> Result<T>,
) -> Result<T> {
    compartment.check_scope(object)?;
    let state = compartment.state();
    f(state.data(object)?)
}

/// Well-known map type for export tables.
pub(crate) type ExportMap = HashMap<String, usize>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineConfig;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn roots_balance() {
        let engine = engine();
        let compartment = Compartment::new(&engine);
        let foreign = Foreign::new(&compartment, core::ptr::null_mut(), None).unwrap();
        let object = foreign.as_object();

        compartment.add_root(object).unwrap();
        compartment.remove_root(object).unwrap();
        assert!(matches!(
            compartment.remove_root(object),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn unrooted_objects_are_collected_with_finalizer() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static FINALIZED: AtomicU32 = AtomicU32::new(0);
        unsafe fn finalizer(_ptr: *mut u8) {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
        }

        let engine = engine();
        let compartment = Compartment::new(&engine);
        let foreign = Foreign::new(&compartment, core::ptr::null_mut(), Some(finalizer)).unwrap();
        let rooted = Foreign::new(&compartment, core::ptr::null_mut(), None).unwrap();
        compartment.add_root(rooted.as_object()).unwrap();

        compartment.collect_garbage();

        assert!(!compartment.contains(foreign.as_object()));
        assert!(compartment.contains(rooted.as_object()));
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);

        // A second collection must not re-run the finalizer.
        compartment.collect_garbage();
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn try_collect_frees_unrooted_compartment() {
        let engine = engine();
        let compartment = Compartment::new(&engine);
        let foreign = Foreign::new(&compartment, core::ptr::null_mut(), None).unwrap();
        compartment.add_root(foreign.as_object()).unwrap();

        let keep = compartment.clone();
        // A rooted object keeps the compartment alive.
        assert!(!compartment.try_collect());

        keep.remove_root(foreign.as_object()).unwrap();
        assert!(keep.try_collect());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let engine = engine();
        let compartment = Compartment::new(&engine);
        let foreign = Foreign::new(&compartment, core::ptr::null_mut(), None).unwrap();
        let object = foreign.as_object();

        compartment.collect_garbage();
        assert!(matches!(compartment.add_root(object), Err(Error::NotFound)));
    }
}
