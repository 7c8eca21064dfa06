// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::arch;
use crate::trap::TrapKind;
use crate::vm::mmap::{round_up_to_host_pages, Mmap, Permissions};
use crate::{Error, Result};

/// Location of one compiled function inside the text section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionLoc {
    pub start: u32,
    pub length: u32,
}

/// Everything the signal handler and the symbolizer need to know about one
/// loaded text region.
#[derive(Debug)]
pub struct CodeInfo {
    /// Trap sites, sorted by code offset.
    pub trap_offsets: Vec<u32>,
    pub traps: Vec<TrapKind>,
    /// `(loc, symbol)` per compiled function, sorted by start offset.
    pub functions: Vec<(FunctionLoc, String)>,
    pub debug_name: String,
}

impl CodeInfo {
    /// Looks up the trap recorded for the instruction at `text_offset`.
    pub fn lookup_trap_code(&self, text_offset: usize) -> Option<TrapKind> {
        let text_offset = u32::try_from(text_offset).ok()?;
        let index = self
            .trap_offsets
            .binary_search_by_key(&text_offset, |val| *val)
            .ok()?;
        Some(self.traps[index])
    }

    /// Returns the symbol covering `text_offset` and the offset within it.
    pub fn symbolize(&self, text_offset: usize) -> Option<(&str, usize)> {
        let text_offset = u32::try_from(text_offset).ok()?;
        let index = self
            .functions
            .partition_point(|(loc, _)| loc.start <= text_offset)
            .checked_sub(1)?;
        let (loc, symbol) = &self.functions[index];
        if text_offset < loc.start + loc.length {
            Some((symbol, (text_offset - loc.start) as usize))
        } else {
            None
        }
    }
}

/// Executable memory holding one module's text section.
#[derive(Debug)]
pub struct CodeMemory {
    mmap: Mmap,
    len: usize,
    published: bool,
    info: Arc<CodeInfo>,
}

impl CodeMemory {
    /// Copies `text` into fresh read/write memory. The code is not
    /// executable until [`CodeMemory::publish`].
    pub fn with_text(text: &[u8], info: CodeInfo) -> Result<Self> {
        let len = round_up_to_host_pages(text.len().max(1));
        let mmap = Mmap::new_committed(len, Permissions::READ | Permissions::WRITE)
            .map_err(|_| Error::OutOfMemory)?;

        // Safety: freshly mapped read/write region of at least text.len().
        unsafe {
            core::ptr::copy_nonoverlapping(text.as_ptr(), mmap.as_ptr(), text.len());
        }

        Ok(Self {
            mmap,
            len: text.len(),
            published: false,
            info: Arc::new(info),
        })
    }

    /// Switches the region to read/execute and registers it for trap
    /// resolution.
    pub fn publish(&mut self) -> Result<()> {
        debug_assert!(!self.published);
        self.published = true;

        if self.len == 0 {
            tracing::warn!("compiled module has no code to publish");
            return Ok(());
        }

        self.mmap
            .protect(0, self.mmap.len(), Permissions::READ | Permissions::EXECUTE)
            .map_err(|_| Error::OutOfMemory)?;
        arch::flush_icache(self.mmap.as_ptr(), self.len);

        register_code(self.mmap.addr_range().start, self.mmap.len(), &self.info);
        Ok(())
    }

    #[inline]
    pub fn text_base(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    pub fn info(&self) -> &Arc<CodeInfo> {
        &self.info
    }

    /// Resolves a function location to an absolute entry address.
    pub fn resolve_function_loc(&self, loc: FunctionLoc) -> usize {
        let addr = self.mmap.addr_range().start + loc.start as usize;
        // Assert the function location actually lies in our text section
        debug_assert!(addr + loc.length as usize <= self.mmap.addr_range().end);
        addr
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        if self.published {
            unregister_code(self.mmap.addr_range().start);
        }
    }
}

/// Process-wide registry of published text regions.
///
/// Invariant: no thread holds this lock while executing compiled code, so
/// the signal handler taking it cannot self-deadlock.
fn code_registry() -> &'static Mutex<BTreeMap<usize, (usize, Weak<CodeInfo>)>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<usize, (usize, Weak<CodeInfo>)>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

fn register_code(start: usize, len: usize, info: &Arc<CodeInfo>) {
    code_registry()
        .lock()
        .unwrap()
        .insert(start, (len, Arc::downgrade(info)));
}

fn unregister_code(start: usize) {
    code_registry().lock().unwrap().remove(&start);
}

/// Attributes a program counter to a published text region, returning the
/// region info and the pc's offset within it.
pub(crate) fn lookup_code(pc: usize) -> Option<(Arc<CodeInfo>, usize)> {
    let map = code_registry().lock().unwrap();
    let (start, (len, info)) = map.range(..=pc).next_back()?;
    if pc - start < *len {
        Some((info.upgrade()?, pc - start))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_lookup_and_symbolize() {
        let info = CodeInfo {
            trap_offsets: vec![4, 16],
            traps: vec![TrapKind::StackOverflow, TrapKind::IntegerDivisionByZero],
            functions: vec![
                (
                    FunctionLoc {
                        start: 0,
                        length: 12,
                    },
                    "f0".to_string(),
                ),
                (
                    FunctionLoc {
                        start: 12,
                        length: 12,
                    },
                    "f1".to_string(),
                ),
            ],
            debug_name: "test".to_string(),
        };

        assert_eq!(info.lookup_trap_code(4), Some(TrapKind::StackOverflow));
        assert_eq!(
            info.lookup_trap_code(16),
            Some(TrapKind::IntegerDivisionByZero)
        );
        assert_eq!(info.lookup_trap_code(5), None);

        assert_eq!(info.symbolize(0), Some(("f0", 0)));
        assert_eq!(info.symbolize(13), Some(("f1", 1)));
        assert_eq!(info.symbolize(24), None);
    }
}
