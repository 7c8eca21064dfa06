// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::compartment::{with_data, Compartment, Object, ObjectData};
use crate::quota::ResourceQuota;
use crate::types::MemoryType;
use crate::vm;
use crate::{Error, Result, WASM_MAX_PAGES};

/// A sandboxed linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory(pub(crate) Object);

pub(crate) struct MemoryData {
    pub(crate) ty: MemoryType,
    pub(crate) storage: Box<vm::Memory>,
    pub(crate) quota: Option<ResourceQuota>,
    pub(crate) debug_name: String,
}

impl MemoryData {
    pub(crate) fn new(
        ty: MemoryType,
        quota: Option<&ResourceQuota>,
        debug_name: String,
    ) -> Result<Self> {
        let maximum = ty.maximum.unwrap_or(WASM_MAX_PAGES).min(WASM_MAX_PAGES);
        if ty.minimum > maximum {
            return Err(Error::InvalidArgument("memory minimum exceeds maximum"));
        }

        if let Some(quota) = quota {
            quota.reserve_memory_pages(ty.minimum)?;
        }

        let storage = match vm::Memory::new(ty.minimum, maximum) {
            Ok(storage) => Box::new(storage),
            Err(error) => {
                if let Some(quota) = quota {
                    quota.release_memory_pages(ty.minimum);
                }
                return Err(error);
            }
        };

        Ok(Self {
            ty,
            storage,
            quota: quota.cloned(),
            debug_name,
        })
    }

    /// Grows by `delta` pages, returning the previous page count.
    pub(crate) fn grow(&self, delta: u64) -> Result<u64> {
        if let Some(quota) = &self.quota {
            quota.reserve_memory_pages(delta)?;
        }
        match self.storage.grow(delta) {
            Ok(old_pages) => Ok(old_pages),
            Err(error) => {
                if let Some(quota) = &self.quota {
                    quota.release_memory_pages(delta);
                }
                Err(error)
            }
        }
    }

    /// A duplicate with the same committed contents in a fresh reservation.
    pub(crate) fn duplicate(&self) -> Result<Self> {
        let pages = self.storage.num_pages();
        if let Some(quota) = &self.quota {
            quota.reserve_memory_pages(pages)?;
        }

        let storage = match vm::Memory::new(pages, self.storage.maximum()) {
            Ok(storage) => Box::new(storage),
            Err(error) => {
                if let Some(quota) = &self.quota {
                    quota.release_memory_pages(pages);
                }
                return Err(error);
            }
        };
        let committed = self.storage.committed_bytes();
        // Safety: both reservations have at least `committed` bytes
        // committed and do not overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(self.storage.base(), storage.base(), committed);
        }

        Ok(Self {
            ty: self.ty,
            storage,
            quota: self.quota.clone(),
            debug_name: self.debug_name.clone(),
        })
    }
}

impl Drop for MemoryData {
    fn drop(&mut self) {
        if let Some(quota) = &self.quota {
            quota.release_memory_pages(self.storage.num_pages());
        }
    }
}

impl Memory {
    /// Creates a memory in the compartment: reserves the sandbox range and
    /// commits `ty.minimum` zero-filled pages.
    pub fn new(
        compartment: &Compartment,
        ty: MemoryType,
        quota: Option<&ResourceQuota>,
        debug_name: impl Into<String>,
    ) -> Result<Memory> {
        let data = MemoryData::new(ty, quota, debug_name.into())?;
        let mut state = compartment.state();
        let object = state.alloc(compartment.id(), ObjectData::Memory(data));

        // Register the reservation for fault attribution now that the
        // object identity exists.
        if let ObjectData::Memory(memory) = state.data(object).unwrap() {
            vm::memory::register_reservation(&memory.storage, compartment.id(), object);
        }
        Ok(Memory(object))
    }

    pub fn as_object(&self) -> Object {
        self.0
    }

    pub fn from_object(compartment: &Compartment, object: Object) -> Result<Memory> {
        match compartment.object_kind(object)? {
            crate::ObjectKind::Memory => Ok(Memory(object)),
            _ => Err(Error::NotFound),
        }
    }

    pub fn ty(&self, compartment: &Compartment) -> Result<MemoryType> {
        with_data(compartment, self.0, |data| match data {
            ObjectData::Memory(memory) => Ok(memory.ty),
            _ => Err(Error::NotFound),
        })
    }

    /// The base address of the memory's reserved range.
    pub fn base_address(&self, compartment: &Compartment) -> Result<*mut u8> {
        with_data(compartment, self.0, |data| match data {
            ObjectData::Memory(memory) => Ok(memory.storage.base()),
            _ => Err(Error::NotFound),
        })
    }

    pub fn num_pages(&self, compartment: &Compartment) -> Result<u64> {
        with_data(compartment, self.0, |data| match data {
            ObjectData::Memory(memory) => Ok(memory.storage.num_pages()),
            _ => Err(Error::NotFound),
        })
    }

    /// Grows the memory by `delta` pages, returning the previous page
    /// count.
    pub fn grow(&self, compartment: &Compartment, delta: u64) -> Result<u64> {
        with_data(compartment, self.0, |data| match data {
            ObjectData::Memory(memory) => memory.grow(delta),
            _ => Err(Error::NotFound),
        })
    }

    /// Decommits a page range; the pages read as zero afterwards.
    pub fn unmap_pages(
        &self,
        compartment: &Compartment,
        start_page: u64,
        num_pages: u64,
    ) -> Result<()> {
        with_data(compartment, self.0, |data| match data {
            ObjectData::Memory(memory) => memory.storage.unmap_pages(start_page, num_pages),
            _ => Err(Error::NotFound),
        })
    }

    /// Host pointer for a range validated only against the reservation; may
    /// fault on access if uncommitted.
    pub fn reserved_range(
        &self,
        compartment: &Compartment,
        offset: u64,
        num_bytes: u64,
    ) -> Result<*mut u8> {
        with_data(compartment, self.0, |data| match data {
            ObjectData::Memory(memory) => memory.storage.reserved_range(offset, num_bytes),
            _ => Err(Error::NotFound),
        })
    }

    /// Host pointer for a range validated against the committed pages.
    pub fn validated_range(
        &self,
        compartment: &Compartment,
        offset: u64,
        num_bytes: u64,
    ) -> Result<*mut u8> {
        with_data(compartment, self.0, |data| match data {
            ObjectData::Memory(memory) => memory.storage.validated_range(offset, num_bytes),
            _ => Err(Error::NotFound),
        })
    }

    /// Copies bytes out of the memory; fails if the range is not committed.
    pub fn read(&self, compartment: &Compartment, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let ptr = self.validated_range(compartment, offset, buffer.len() as u64)?;
        // Safety: validated_range checked the bounds; the compartment lock
        // has been released but the committed range never shrinks.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, buffer.as_mut_ptr(), buffer.len());
        }
        Ok(())
    }

    /// Copies bytes into the memory; fails if the range is not committed.
    pub fn write(&self, compartment: &Compartment, offset: u64, buffer: &[u8]) -> Result<()> {
        let ptr = self.validated_range(compartment, offset, buffer.len() as u64)?;
        // Safety: see read.
        unsafe {
            core::ptr::copy_nonoverlapping(buffer.as_ptr(), ptr, buffer.len());
        }
        Ok(())
    }
}
