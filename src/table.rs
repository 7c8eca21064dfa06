// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::compartment::{Compartment, Object, ObjectData};
use crate::func::FunctionData;
use crate::quota::ResourceQuota;
use crate::types::{TableType, ValKind};
use crate::vm::{self, VMFuncRef};
use crate::{Error, Result};

/// A table of typed references.
///
/// Function tables back indirect calls; their storage size is a power of
/// two so the dispatch mask cannot escape it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table(pub(crate) Object);

pub(crate) struct TableData {
    pub(crate) ty: TableType,
    pub(crate) storage: Box<vm::Table>,
    /// Logical elements; storage padding beyond this length holds null.
    pub(crate) elements: Vec<Option<Object>>,
    pub(crate) quota: Option<ResourceQuota>,
    pub(crate) debug_name: String,
}

impl TableData {
    pub(crate) fn new(
        ty: TableType,
        quota: Option<&ResourceQuota>,
        debug_name: String,
    ) -> Result<Self> {
        // The emitter masks indirect-call indices with the storage size
        // minus one, so function tables must be declared as powers of two.
        if ty.element == ValKind::FuncRef && ty.minimum != 0 && !ty.minimum.is_power_of_two() {
            return Err(Error::InvalidTableSize(ty.minimum));
        }
        if ty.maximum.is_some_and(|max| max < ty.minimum) {
            return Err(Error::InvalidArgument("table minimum exceeds maximum"));
        }

        let storage_len = usize::try_from(ty.minimum.next_power_of_two().max(1))
            .map_err(|_| Error::InvalidTableSize(ty.minimum))?;
        let storage_len = if ty.minimum == 0 { 1 } else { storage_len };

        if let Some(quota) = quota {
            quota.reserve_table_elems(ty.minimum)?;
        }

        Ok(Self {
            ty,
            storage: Box::new(vm::Table::new(storage_len)),
            elements: vec![None; usize::try_from(ty.minimum).unwrap()],
            quota: quota.cloned(),
            debug_name,
        })
    }

    pub(crate) fn len(&self) -> u64 {
        self.elements.len() as u64
    }

    /// Grows by `delta` elements (null-initialized); storage is padded to
    /// the next power of two so the dispatch mask stays sound. Returns the
    /// previous length.
    pub(crate) fn grow(&mut self, delta: u64) -> Result<u64> {
        let old_len = self.len();
        if delta == 0 {
            return Ok(old_len);
        }

        let new_len = old_len.checked_add(delta).ok_or(Error::QuotaExceeded)?;
        if self.ty.maximum.is_some_and(|max| new_len > max) {
            return Err(Error::PageLimit);
        }
        if let Some(quota) = &self.quota {
            quota.reserve_table_elems(delta)?;
        }

        let new_storage = usize::try_from(new_len.next_power_of_two()).unwrap();
        if new_storage > self.storage.storage_len() {
            self.storage.grow_storage(new_storage);
        }
        self.elements
            .resize(usize::try_from(new_len).unwrap(), None);
        Ok(old_len)
    }

    pub(crate) fn set_slot(&mut self, index: usize, object: Option<Object>, func_ref: *mut VMFuncRef) {
        self.elements[index] = object;
        self.storage.set(index, func_ref);
    }

    /// A duplicate whose element handles are re-scoped to `compartment`.
    /// Function-reference slots are re-pointed by the compartment clone once
    /// the cloned instances exist.
    pub(crate) fn duplicate(&self, compartment: u64) -> Result<Self> {
        if let Some(quota) = &self.quota {
            quota.reserve_table_elems(self.len())?;
        }
        let elements = self
            .elements
            .iter()
            .map(|element| element.map(|object| object.rescope(compartment)))
            .collect();
        Ok(Self {
            ty: self.ty,
            storage: Box::new(vm::Table::new(self.storage.storage_len())),
            elements,
            quota: self.quota.clone(),
            debug_name: self.debug_name.clone(),
        })
    }
}

impl Drop for TableData {
    fn drop(&mut self) {
        if let Some(quota) = &self.quota {
            quota.release_table_elems(self.len());
        }
    }
}

impl Table {
    pub fn new(
        compartment: &Compartment,
        ty: TableType,
        quota: Option<&ResourceQuota>,
        debug_name: impl Into<String>,
    ) -> Result<Table> {
        let data = TableData::new(ty, quota, debug_name.into())?;
        let object = compartment
            .state()
            .alloc(compartment.id(), ObjectData::Table(data));
        Ok(Table(object))
    }

    pub fn as_object(&self) -> Object {
        self.0
    }

    pub fn from_object(compartment: &Compartment, object: Object) -> Result<Table> {
        match compartment.object_kind(object)? {
            crate::ObjectKind::Table => Ok(Table(object)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn ty(&self, compartment: &Compartment) -> Result<TableType> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Table(table) => Ok(table.ty),
            _ => Err(Error::NotFound),
        }
    }

    /// The current number of elements.
    pub fn len(&self, compartment: &Compartment) -> Result<u64> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Table(table) => Ok(table.len()),
            _ => Err(Error::NotFound),
        }
    }

    /// Reads an element; fails with an out-of-bounds error past the current
    /// length.
    pub fn get(&self, compartment: &Compartment, index: u64) -> Result<Option<Object>> {
        compartment.check_scope(self.0)?;
        let state = compartment.state();
        match state.data(self.0)? {
            ObjectData::Table(table) => table
                .elements
                .get(usize::try_from(index).map_err(|_| Error::OutOfBounds(index))?)
                .copied()
                .ok_or(Error::OutOfBounds(index)),
            _ => Err(Error::NotFound),
        }
    }

    /// Writes an element, returning the previous value. `None` stores a
    /// null reference.
    pub fn set(
        &self,
        compartment: &Compartment,
        index: u64,
        value: Option<Object>,
    ) -> Result<Option<Object>> {
        compartment.check_scope(self.0)?;
        let mut state = compartment.state();

        // Elements are either null or objects of the declared reference
        // kind in the same compartment. Only function references have
        // runtime dispatch slots; resolve before re-borrowing the table.
        let element_kind = match state.data(self.0)? {
            ObjectData::Table(table) => table.ty.element,
            _ => return Err(Error::NotFound),
        };
        let func_ref: *mut VMFuncRef = match value {
            Some(object) => {
                if object.compartment_id() != compartment.id() {
                    return Err(Error::InvalidArgument("element from another compartment"));
                }
                match (element_kind, state.data(object)?) {
                    (ValKind::FuncRef, ObjectData::Function(FunctionData { func_ref, .. })) => {
                        *func_ref as *mut VMFuncRef
                    }
                    (ValKind::FuncRef, _) => {
                        return Err(Error::InvalidArgument("expected a function element"))
                    }
                    _ => core::ptr::null_mut(),
                }
            }
            None => core::ptr::null_mut(),
        };

        match state.data_mut(self.0)? {
            ObjectData::Table(table) => {
                let i = usize::try_from(index).map_err(|_| Error::OutOfBounds(index))?;
                if i >= table.elements.len() {
                    return Err(Error::OutOfBounds(index));
                }
                let previous = table.elements[i];
                table.set_slot(i, value, func_ref);
                Ok(previous)
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Grows the table by `delta` null elements, returning the previous
    /// length.
    pub fn grow(&self, compartment: &Compartment, delta: u64) -> Result<u64> {
        compartment.check_scope(self.0)?;
        let mut state = compartment.state();
        match state.data_mut(self.0)? {
            ObjectData::Table(table) => table.grow(delta),
            _ => Err(Error::NotFound),
        }
    }
}
