// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::{self, NonNull};
use std::io;
use std::sync::OnceLock;

use anyhow::{bail, Context};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Allow reads from the memory region
        const READ = 1 << 0;
        /// Allow writes to the memory region
        const WRITE = 1 << 1;
        /// Allow code execution from the memory region
        const EXECUTE = 1 << 2;
    }
}

impl Permissions {
    fn as_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Permissions::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Permissions::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Permissions::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// The host page size.
pub fn host_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // Safety: sysconf is always safe to call.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).expect("host page size")
    })
}

pub fn round_up_to_host_pages(bytes: usize) -> usize {
    let mask = host_page_size() - 1;
    bytes.checked_add(mask).expect("size overflow") & !mask
}

/// An owned anonymous mapping.
///
/// A fresh `Mmap` is a pure address-space reservation (`PROT_NONE`,
/// `MAP_NORESERVE`): no pages are committed until [`Mmap::commit`] grants
/// access, and [`Mmap::decommit`] returns a committed range to zero-filled
/// pages without giving the addresses up.
#[derive(Debug)]
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is owned and access is coordinated by the callers.
unsafe impl Send for Mmap {}
// Safety: see above.
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Reserves `len` bytes of virtual address space without committing any
    /// of it.
    pub fn reserve(len: usize) -> anyhow::Result<Self> {
        debug_assert!(len % host_page_size() == 0);

        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
            } else {
                // PROT_NONE mappings are not charged against commit limits
                // on the BSD-derived systems.
                let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
            }
        }

        // Safety: anonymous mapping, no observable aliasing.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, libc::PROT_NONE, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            bail!(
                "failed to reserve {len:#x} bytes of address space: {}",
                io::Error::last_os_error()
            );
        }

        Ok(Self {
            ptr: NonNull::new(ptr.cast()).unwrap(),
            len,
        })
    }

    /// Reserves and immediately commits `len` bytes with the given
    /// permissions.
    pub fn new_committed(len: usize, permissions: Permissions) -> anyhow::Result<Self> {
        let len = round_up_to_host_pages(len);
        let mmap = Self::reserve(len)?;
        mmap.commit(0, len, permissions)?;
        Ok(mmap)
    }

    /// Grants access to `[offset, offset + len)`. Newly touched pages read
    /// as zero.
    pub fn commit(&self, offset: usize, len: usize, permissions: Permissions) -> anyhow::Result<()> {
        self.protect(offset, len, permissions)
            .context("failed to commit pages")
    }

    /// Returns `[offset, offset + len)` to zero-filled pages. The range
    /// stays accessible; the backing frames are released.
    pub fn decommit(&self, offset: usize, len: usize) -> anyhow::Result<()> {
        self.check_range(offset, len);
        if len == 0 {
            return Ok(());
        }

        // Replacing the range with a fresh anonymous mapping releases the
        // frames and guarantees zero on the next read, on every supported
        // host.
        // Safety: range checked above and owned by this mapping.
        let ptr = unsafe {
            libc::mmap(
                self.ptr.as_ptr().add(offset).cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!("decommit failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    /// Changes the protection of `[offset, offset + len)`.
    pub fn protect(
        &self,
        offset: usize,
        len: usize,
        permissions: Permissions,
    ) -> anyhow::Result<()> {
        self.check_range(offset, len);

        // Safety: range checked above.
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(offset).cast(),
                len,
                permissions.as_prot(),
            )
        };
        if rc != 0 {
            bail!("mprotect failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) {
        let page = host_page_size();
        assert!(offset % page == 0 && len % page == 0);
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.len));
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn addr_range(&self) -> core::ops::Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.len
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // Safety: we own the mapping.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        debug_assert_eq!(rc, 0, "munmap failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_and_decommit_zero_fill() {
        let page = host_page_size();
        let mmap = Mmap::reserve(4 * page).unwrap();
        mmap.commit(0, 2 * page, Permissions::READ | Permissions::WRITE)
            .unwrap();

        // Safety: the first two pages are committed read/write.
        unsafe {
            let ptr = mmap.as_ptr();
            assert_eq!(*ptr, 0);
            *ptr = 0xaa;
            assert_eq!(*ptr, 0xaa);

            mmap.decommit(0, page).unwrap();
            assert_eq!(*ptr, 0);
        }
    }
}
