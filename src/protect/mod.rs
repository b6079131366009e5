//! # Protect
//!
//! This module temporarily makes read-only image memory writable so it can be patched.
//!
//! A [`ProtectionGuard`] remembers every page range whose protection it changed and puts the original protection back
//! when it is dropped, in reverse order. Ranges that are already writable are left alone, so guards can overlap and nest.

use log::{error, trace};
use region::Protection;
use thiserror::Error;

use crate::segment::Module;

/// Errors when changing memory protections
#[derive(Debug, Error)]
pub enum ProtectError {
    /// The protection of a range could not be queried
    #[error("failed to query memory protection at {address:#x}")]
    Query {
        /// Start of the queried range
        address: usize,
        /// Underlying error
        #[source]
        source: region::Error,
    },
    /// The protection of a range could not be changed
    #[error("failed to change memory protection of {size:#x} bytes at {base:#x}")]
    Protect {
        /// Start of the range
        base: usize,
        /// Size of the range
        size: usize,
        /// Underlying error
        #[source]
        source: region::Error,
    },
}

/// A range whose protection was changed by a guard, and what it was before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionRecord {
    /// Page aligned start of the range
    pub base: usize,
    /// Size of the range
    pub size: usize,
    /// Protection before the guard changed it
    pub protection: Protection,
}

/// Keeps memory writable for as long as it is alive.
///
/// Dropping the guard restores every protection it changed, whichever way the scope is left.
///
/// # Panics
///
/// Dropping panics if an original protection can't be restored, as the image is then in an unknown state.
#[must_use = "the memory is protected again as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ProtectionGuard {
    /// Changed ranges, in the order they were changed
    records: Vec<ProtectionRecord>,
    /// Whether the requested section was found, for [`unprotect_module_or_region`]
    section_located: bool,
}

impl ProtectionGuard {
    /// A guard that hasn't changed anything yet
    fn empty() -> Self {
        Self {
            records: Vec::new(),
            section_located: false,
        }
    }

    /// Ranges this guard changed, in the order they were changed
    pub fn records(&self) -> &[ProtectionRecord] {
        &self.records
    }

    /// Whether [`unprotect_module_or_region`] found the named section rather than falling back to the whole module
    pub fn section_located(&self) -> bool {
        self.section_located
    }

    /// Restores the original protections now rather than at the end of the scope
    pub fn restore(self) {
        // Implemented in [`Drop::drop`]
    }

    /// Makes every committed, non-writable page in `[base, base + size)` writable.
    ///
    /// Executable pages stay executable. Pages that aren't mapped are skipped.
    ///
    /// # Safety
    ///
    /// Nothing may rely on the range being read-only while the guard is alive.
    unsafe fn unprotect_range(&mut self, base: usize, size: usize) -> Result<(), ProtectError> {
        if size == 0 {
            return Ok(());
        }
        let start = region::page::floor(base as *const u8) as usize;
        let end = region::page::ceil((base + size) as *const u8) as usize;

        let query_error = |source| ProtectError::Query {
            address: base,
            source,
        };
        for queried in region::query_range(base as *const u8, size).map_err(query_error)? {
            let queried = queried.map_err(query_error)?;
            let protection = queried.protection();
            if !queried.is_committed()
                || queried.is_guarded()
                || !image_backed(queried.as_range().start)
                || protection == Protection::NONE
                || protection.contains(Protection::WRITE)
            {
                continue;
            }

            // only touch the part of the region that was asked for
            let range = queried.as_range();
            let lo = range.start.max(start);
            let hi = range.end.min(end);
            if lo >= hi {
                continue;
            }

            let writable = if protection.contains(Protection::EXECUTE) {
                Protection::READ_WRITE_EXECUTE
            } else {
                Protection::READ_WRITE
            };
            region::protect(lo as *const u8, hi - lo, writable).map_err(|source| {
                ProtectError::Protect {
                    base: lo,
                    size: hi - lo,
                    source,
                }
            })?;
            trace!("unprotected {:#x}..{:#x} (was {:?})", lo, hi, protection);

            self.records.push(ProtectionRecord {
                base: lo,
                size: hi - lo,
                protection,
            });
        }

        Ok(())
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        while let Some(record) = self.records.pop() {
            // SAFETY: the range was mapped with this protection when the guard changed it
            let restored = unsafe {
                region::protect(record.base as *const u8, record.size, record.protection)
            };
            match restored {
                Ok(()) => trace!(
                    "restored {:#x}..{:#x} to {:?}",
                    record.base,
                    record.base + record.size,
                    record.protection
                ),
                Err(e) => {
                    error!(
                        "failed to restore {:#x}..{:#x} to {:?}: {}",
                        record.base,
                        record.base + record.size,
                        record.protection,
                        e
                    );
                    panic!("failed to restore memory protection at {:#x}", record.base);
                }
            }
        }
    }
}

/// Whether the memory at `address` is mapped from an image file
#[cfg(windows)]
fn image_backed(address: usize) -> bool {
    use winapi::um::memoryapi::VirtualQuery;
    use winapi::um::winnt::{MEMORY_BASIC_INFORMATION, MEM_IMAGE};

    let size = std::mem::size_of::<MEMORY_BASIC_INFORMATION>();
    // SAFETY: the structure is plain data, and VirtualQuery writes at most `size` bytes into it
    unsafe {
        let mut info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
        VirtualQuery(address as *const _, &mut info, size) == size && info.Type == MEM_IMAGE
    }
}

/// Whether the memory at `address` is mapped from an image file.
///
/// The backing isn't reported outside Windows, so every committed mapping counts.
#[cfg(not(windows))]
fn image_backed(_address: usize) -> bool {
    true
}

/// Makes `[base, base + size)` writable until the returned guard is dropped.
///
/// If changing a page fails, the pages changed so far are restored before the error is returned.
///
/// On Windows only pages mapped from an image are changed. Elsewhere the backing of a page can't be queried, so every
/// committed, accessible page in the range is.
///
/// # Safety
///
/// The range should belong to a loaded image. Nothing may rely on it being read-only while the guard is alive.
pub unsafe fn unprotect_region(base: *const u8, size: usize) -> Result<ProtectionGuard, ProtectError> {
    let mut guard = ProtectionGuard::empty();
    guard.unprotect_range(base as usize, size)?;
    Ok(guard)
}

/// Makes the section named `name` writable, or the whole of `module` if it has no such section.
///
/// See [`ProtectionGuard::section_located`] for which one happened.
///
/// # Safety
///
/// Nothing may rely on the unprotected memory being read-only while the guard is alive.
pub unsafe fn unprotect_module_or_region(
    module: &Module,
    name: &str,
) -> Result<ProtectionGuard, ProtectError> {
    let mut guard = ProtectionGuard::empty();
    match module.section(name) {
        Some(section) => {
            guard.section_located = true;
            guard.unprotect_range(section.segment.start(), section.segment.len())?;
        }
        None => guard.unprotect_range(module.base(), module.size())?,
    }
    Ok(guard)
}
