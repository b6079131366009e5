//! # Memory
//!
//! Raw helpers for patching code and data at an address.
//!
//! The functions at the top level expect the memory to already be writable, e.g. inside a [`ProtectionGuard`]'s
//! scope. The [`vp`] module has the same functions, each making its own target writable for the duration of the write.
//!
//! [`ProtectionGuard`]: crate::protect::ProtectionGuard

use std::{ptr, slice};

use thiserror::Error;

use crate::alloc::{AllocError, TrampolineAllocator};
use crate::code::x64::{self, CALL_REL32, JMP_REL32, NEAR_BRANCH_LEN};
use crate::code::AsAddress;
use crate::protect::ProtectError;

/// Errors when patching memory
#[derive(Debug, Error)]
pub enum PatchError {
    /// The target is too far away for a 32-bit displacement
    #[error("{to:#x} is out of rel32 range from {from:#x}")]
    Displacement {
        /// Address the displacement is relative to
        from: usize,
        /// Address that had to be reached
        to: usize,
    },
    /// A trampoline could not be allocated
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// The target could not be made writable
    #[error(transparent)]
    Protect(#[from] ProtectError),
}

/// Which near branch [`inject_hook`] writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    /// `call rel32`
    Call,
    /// `jmp rel32`
    Jump,
}

impl HookType {
    /// Opcode of the branch
    fn opcode(self) -> u8 {
        match self {
            Self::Call => CALL_REL32,
            Self::Jump => JMP_REL32,
        }
    }
}

/// Writes `value` at `address`.
///
/// # Safety
///
/// `[address, address + size_of::<T>())` must be writable.
pub unsafe fn patch<T: Copy>(address: usize, value: T) {
    ptr::write_unaligned(address as *mut T, value);
}

/// Writes `bytes` at `address`.
///
/// # Safety
///
/// `[address, address + bytes.len())` must be writable.
pub unsafe fn patch_bytes(address: usize, bytes: &[u8]) {
    ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
}

/// Reads a `T` from `address`.
///
/// # Safety
///
/// `[address, address + size_of::<T>())` must be readable and hold a valid `T`.
pub unsafe fn read<T: Copy>(address: usize) -> T {
    ptr::read_unaligned(address as *const T)
}

/// Overwrites `count` bytes at `address` with `nop`s.
///
/// # Safety
///
/// `[address, address + count)` must be writable.
pub unsafe fn nop(address: usize, count: usize) {
    ptr::write_bytes(address as *mut u8, 0x90, count);
}

/// Whether the memory at `address` starts with `expected`.
///
/// # Safety
///
/// `[address, address + expected.len())` must be readable.
pub unsafe fn mem_equals(address: usize, expected: &[u8]) -> bool {
    slice::from_raw_parts(address as *const u8, expected.len()) == expected
}

/// Writes the 32-bit displacement at `address` that makes the instruction containing it reach `target`.
///
/// `bytes_after` is the number of instruction bytes following the displacement, e.g. an immediate operand.
///
/// # Safety
///
/// `[address, address + 4)` must be writable.
pub unsafe fn write_offset_value(
    address: usize,
    target: impl AsAddress,
    bytes_after: usize,
) -> Result<(), PatchError> {
    let next = address.wrapping_add(4 + bytes_after);
    let to = target.as_address();
    let displacement = x64::rel32(next, to).ok_or(PatchError::Displacement { from: next, to })?;
    patch(address, displacement);
    Ok(())
}

/// Reads the 32-bit displacement at `address` and returns the address it refers to.
///
/// # Safety
///
/// `[address, address + 4)` must be readable.
pub unsafe fn read_offset_value(address: usize, bytes_after: usize) -> usize {
    let displacement = read::<i32>(address);
    address
        .wrapping_add(4 + bytes_after)
        .wrapping_add_signed(displacement as isize)
}

/// Writes a near `call`/`jmp` to `hook` at `address`.
///
/// Nothing is written if `hook` is out of reach.
///
/// # Safety
///
/// `[address, address + 5)` must be writable, and no thread may be executing it.
pub unsafe fn inject_hook(
    address: usize,
    hook: impl AsAddress,
    kind: HookType,
) -> Result<(), PatchError> {
    let to = hook.as_address();
    let code = x64::near_branch(kind.opcode(), address, to).ok_or(PatchError::Displacement {
        from: address.wrapping_add(NEAR_BRANCH_LEN),
        to,
    })?;
    patch_bytes(address, &code);
    Ok(())
}

/// Destination of the near `call`/`jmp` at `address`.
///
/// # Safety
///
/// `[address, address + 5)` must be readable.
pub unsafe fn read_call(address: usize) -> usize {
    read_offset_value(address + 1, 0)
}

/// Points the near call at `address` to `hook` and returns its previous destination.
///
/// # Safety
///
/// See [`inject_hook`].
pub unsafe fn intercept_call(address: usize, hook: impl AsAddress) -> Result<usize, PatchError> {
    let previous = read_call(address);
    inject_hook(address, hook, HookType::Call)?;
    Ok(previous)
}

/// Points the near call at `address` to `hook`, going through a trampoline if `hook` is out of reach, and returns the
/// call's previous destination.
///
/// # Safety
///
/// See [`inject_hook`].
pub unsafe fn intercept_call_via(
    trampolines: &TrampolineAllocator,
    address: usize,
    hook: impl AsAddress,
) -> Result<usize, PatchError> {
    let hook = hook.as_address();
    if x64::rel32(address.wrapping_add(NEAR_BRANCH_LEN), hook).is_some() {
        return intercept_call(address, hook);
    }
    let stub = trampolines.make_trampoline(address)?.jump(hook)?;
    intercept_call(address, stub)
}

/// Address `offset` bytes past the destination of the near `call`/`jmp` at `address`.
///
/// # Safety
///
/// `[address, address + 5)` must be readable.
pub unsafe fn read_call_from(address: usize, offset: isize) -> usize {
    read_call(address).wrapping_add_signed(offset)
}

/// Points the memory operand whose displacement is at `address` to `location`.
///
/// On x86-64 the operand is RIP-relative and `bytes_after` counts the instruction bytes after the displacement. On
/// x86 the operand is the absolute address itself.
///
/// # Safety
///
/// `[address, address + 4)` must be writable.
#[cfg(target_pointer_width = "64")]
pub unsafe fn write_mem_displacement(
    address: usize,
    location: impl AsAddress,
    bytes_after: usize,
) -> Result<(), PatchError> {
    write_offset_value(address, location, bytes_after)
}

/// Points the memory operand whose displacement is at `address` to `location`.
///
/// # Safety
///
/// `[address, address + 4)` must be writable.
#[cfg(target_pointer_width = "32")]
pub unsafe fn write_mem_displacement(
    address: usize,
    location: impl AsAddress,
    _bytes_after: usize,
) -> Result<(), PatchError> {
    patch(address, location.as_address());
    Ok(())
}

/// Location referred to by the memory operand whose displacement is at `address`.
///
/// See [`write_mem_displacement`] for `bytes_after`.
///
/// # Safety
///
/// `[address, address + 4)` must be readable.
pub unsafe fn read_mem_displacement(address: usize, bytes_after: usize) -> usize {
    if cfg!(target_pointer_width = "64") {
        read_offset_value(address, bytes_after)
    } else {
        read::<usize>(address)
    }
}

/// Points the memory operand whose displacement is at `address` to `location` and returns the location it referred to.
///
/// # Safety
///
/// `[address, address + 4)` must be writable, and no thread may be executing the instruction.
pub unsafe fn intercept_mem_displacement(
    address: usize,
    location: impl AsAddress,
    bytes_after: usize,
) -> Result<usize, PatchError> {
    let previous = read_mem_displacement(address, bytes_after);
    write_mem_displacement(address, location, bytes_after)?;
    Ok(previous)
}

/// Makes the memory operand whose displacement is at `address` load `value` instead, and returns the value it loaded.
///
/// This redirects e.g. `call [rip+disp]` to `value`. The operand is pointed at a fresh trampoline slot holding
/// `value`, within reach of the instruction.
///
/// # Safety
///
/// `[address, address + 4)` must be writable, the location the operand refers to must be readable, and no thread may
/// be executing the instruction.
pub unsafe fn intercept_mem_pointer(
    trampolines: &TrampolineAllocator,
    address: usize,
    value: impl AsAddress,
    bytes_after: usize,
) -> Result<usize, PatchError> {
    let previous = read::<usize>(read_mem_displacement(address, bytes_after));
    let slot = trampolines.make_trampoline(address)?.address_slot(value)?;
    write_mem_displacement(address, slot, bytes_after)?;
    Ok(previous)
}

/// The same helpers, each making its target writable for the duration of the write
pub mod vp {
    use super::{HookType, PatchError, NEAR_BRANCH_LEN};
    use crate::alloc::TrampolineAllocator;
    use crate::code::AsAddress;
    use crate::protect::unprotect_region;

    /// Runs `f` with `[address, address + size)` writable
    unsafe fn writable<R>(
        address: usize,
        size: usize,
        f: impl FnOnce() -> Result<R, PatchError>,
    ) -> Result<R, PatchError> {
        let _guard = unprotect_region(address as *const u8, size)?;
        f()
    }

    /// See [`super::patch`].
    ///
    /// # Safety
    ///
    /// `[address, address + size_of::<T>())` must be mapped.
    pub unsafe fn patch<T: Copy>(address: usize, value: T) -> Result<(), PatchError> {
        writable(address, std::mem::size_of::<T>(), || {
            super::patch(address, value);
            Ok(())
        })
    }

    /// See [`super::patch_bytes`].
    ///
    /// # Safety
    ///
    /// `[address, address + bytes.len())` must be mapped.
    pub unsafe fn patch_bytes(address: usize, bytes: &[u8]) -> Result<(), PatchError> {
        writable(address, bytes.len(), || {
            super::patch_bytes(address, bytes);
            Ok(())
        })
    }

    /// See [`super::nop`].
    ///
    /// # Safety
    ///
    /// `[address, address + count)` must be mapped.
    pub unsafe fn nop(address: usize, count: usize) -> Result<(), PatchError> {
        writable(address, count, || {
            super::nop(address, count);
            Ok(())
        })
    }

    /// See [`super::write_offset_value`].
    ///
    /// # Safety
    ///
    /// `[address, address + 4)` must be mapped.
    pub unsafe fn write_offset_value(
        address: usize,
        target: impl AsAddress,
        bytes_after: usize,
    ) -> Result<(), PatchError> {
        writable(address, 4, || {
            super::write_offset_value(address, target, bytes_after)
        })
    }

    /// See [`super::inject_hook`].
    ///
    /// # Safety
    ///
    /// `[address, address + 5)` must be mapped, and no thread may be executing it.
    pub unsafe fn inject_hook(
        address: usize,
        hook: impl AsAddress,
        kind: HookType,
    ) -> Result<(), PatchError> {
        writable(address, NEAR_BRANCH_LEN, || {
            super::inject_hook(address, hook, kind)
        })
    }

    /// See [`super::intercept_call`].
    ///
    /// # Safety
    ///
    /// See [`inject_hook`].
    pub unsafe fn intercept_call(address: usize, hook: impl AsAddress) -> Result<usize, PatchError> {
        writable(address, NEAR_BRANCH_LEN, || {
            super::intercept_call(address, hook)
        })
    }

    /// See [`super::write_mem_displacement`].
    ///
    /// # Safety
    ///
    /// `[address, address + 4)` must be mapped.
    pub unsafe fn write_mem_displacement(
        address: usize,
        location: impl AsAddress,
        bytes_after: usize,
    ) -> Result<(), PatchError> {
        writable(address, 4, || {
            super::write_mem_displacement(address, location, bytes_after)
        })
    }

    /// See [`super::intercept_mem_displacement`].
    ///
    /// # Safety
    ///
    /// `[address, address + 4)` must be mapped, and no thread may be executing the instruction.
    pub unsafe fn intercept_mem_displacement(
        address: usize,
        location: impl AsAddress,
        bytes_after: usize,
    ) -> Result<usize, PatchError> {
        writable(address, 4, || {
            super::intercept_mem_displacement(address, location, bytes_after)
        })
    }

    /// See [`super::intercept_mem_pointer`].
    ///
    /// # Safety
    ///
    /// See [`super::intercept_mem_pointer`].
    pub unsafe fn intercept_mem_pointer(
        trampolines: &TrampolineAllocator,
        address: usize,
        value: impl AsAddress,
        bytes_after: usize,
    ) -> Result<usize, PatchError> {
        writable(address, 4, || {
            super::intercept_mem_pointer(trampolines, address, value, bytes_after)
        })
    }

    /// See [`super::intercept_call_via`].
    ///
    /// # Safety
    ///
    /// See [`inject_hook`].
    pub unsafe fn intercept_call_via(
        trampolines: &TrampolineAllocator,
        address: usize,
        hook: impl AsAddress,
    ) -> Result<usize, PatchError> {
        writable(address, NEAR_BRANCH_LEN, || {
            super::intercept_call_via(trampolines, address, hook)
        })
    }
}

#[cfg(test)]
mod tests {
    use region::Protection;

    use super::{
        inject_hook, intercept_call, intercept_mem_displacement, mem_equals, nop, patch,
        patch_bytes, read, read_call, read_call_from, read_mem_displacement, read_offset_value, vp,
        write_mem_displacement, write_offset_value, HookType, PatchError,
    };

    /// A heap buffer to patch, with its address
    fn buffer(len: usize) -> (Vec<u8>, usize) {
        let mut buffer = vec![0u8; len];
        let address = buffer.as_mut_ptr() as usize;
        (buffer, address)
    }

    #[test]
    fn test_patch_read() {
        let (buffer, address) = buffer(16);
        unsafe {
            patch(address + 1, 0xDEAD_BEEFu32);
            assert_eq!(read::<u32>(address + 1), 0xDEAD_BEEF);
            patch_bytes(address + 8, &[1, 2, 3]);
            nop(address + 12, 2);
            assert!(mem_equals(address + 8, &[1, 2, 3, 0, 0x90, 0x90]));
            assert!(!mem_equals(address + 8, &[1, 2, 4]));
        }
        assert_eq!(buffer[1..5], 0xDEAD_BEEFu32.to_ne_bytes());
    }

    #[test]
    /// Displacements are relative to the end of the instruction
    fn test_offset_value() {
        let (buffer, address) = buffer(64);
        unsafe {
            write_offset_value(address + 2, address + 40, 0).unwrap();
            assert_eq!(read::<i32>(address + 2), 40 - 6);
            assert_eq!(read_offset_value(address + 2, 0), address + 40);

            write_offset_value(address + 2, address, 4).unwrap();
            assert_eq!(read::<i32>(address + 2), -10);
            assert_eq!(read_offset_value(address + 2, 4), address);
        }
        drop(buffer);
    }

    #[test]
    fn test_inject_hook() {
        let (buffer, address) = buffer(32);
        unsafe {
            inject_hook(address, address + 20, HookType::Call).unwrap();
            assert_eq!(buffer[0], 0xE8);
            assert_eq!(read_call(address), address + 20);

            inject_hook(address + 10, address, HookType::Jump).unwrap();
            assert_eq!(buffer[10], 0xE9);
            assert_eq!(read_call(address + 10), address);

            assert_eq!(intercept_call(address, address + 30).unwrap(), address + 20);
            assert_eq!(read_call(address), address + 30);
            assert_eq!(read_call_from(address, 2), address + 32);
            assert_eq!(read_call_from(address, -30), address);
        }
    }

    #[test]
    /// Memory operands are swapped to another location and the old one is handed back
    fn test_mem_displacement() {
        let (buffer, address) = buffer(64);
        unsafe {
            // `mov eax, [disp]` style operand followed by a 1 byte immediate
            write_mem_displacement(address + 2, address + 40, 1).unwrap();
            assert_eq!(read_mem_displacement(address + 2, 1), address + 40);

            assert_eq!(
                intercept_mem_displacement(address + 2, address + 48, 1).unwrap(),
                address + 40
            );
            assert_eq!(read_mem_displacement(address + 2, 1), address + 48);
        }
        drop(buffer);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    /// Nothing is written when the target is out of reach
    fn test_out_of_range() {
        let (buffer, address) = buffer(8);
        let far = address.wrapping_add(0x1_0000_0000);
        unsafe {
            assert!(matches!(
                inject_hook(address, far, HookType::Call),
                Err(PatchError::Displacement { .. })
            ));
            assert!(matches!(
                write_offset_value(address, far, 0),
                Err(PatchError::Displacement { .. })
            ));
        }
        assert_eq!(buffer, [0; 8]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    /// A far hook is reached through a stub next to the call site
    fn test_intercept_call_via() {
        use iced_x86::{Decoder, DecoderOptions, Mnemonic};

        use super::intercept_call_via;
        use crate::alloc::TrampolineAllocator;

        let trampolines = TrampolineAllocator::new();
        let (buffer, address) = buffer(8);
        let far = address ^ (1 << 40);

        unsafe {
            inject_hook(address, address + 3, HookType::Call).unwrap();
            assert_eq!(intercept_call_via(&trampolines, address, far).unwrap(), address + 3);

            let stub = read_call(address);
            assert_eq!(trampolines.block_count(), 1);
            let code = std::slice::from_raw_parts(stub as *const u8, 12);
            let mov = Decoder::with_ip(64, code, stub as u64, DecoderOptions::NONE).decode();
            assert_eq!(mov.mnemonic(), Mnemonic::Mov);
            assert_eq!(mov.immediate64(), far as u64);

            // a near hook needs no stub
            intercept_call_via(&trampolines, address, address + 5).unwrap();
            assert_eq!(read_call(address), address + 5);
            assert_eq!(trampolines.block_count(), 1);
        }
        drop(buffer);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    /// `call [rip+disp]` ends up loading the new pointer from a slot next to the instruction
    fn test_intercept_mem_pointer() {
        use iced_x86::{Decoder, DecoderOptions, Mnemonic};

        use super::intercept_mem_pointer;
        use crate::alloc::TrampolineAllocator;

        let trampolines = TrampolineAllocator::new();
        let (mut buffer, address) = buffer(32);
        let original = 0x1234_5678usize;

        // call qword ptr [rip+disp] pointing at a pointer stored in the buffer
        buffer[..2].copy_from_slice(&[0xFF, 0x15]);
        unsafe {
            patch(address + 16, original);
            write_mem_displacement(address + 2, address + 16, 0).unwrap();

            let hook = address ^ (1 << 40);
            assert_eq!(
                intercept_mem_pointer(&trampolines, address + 2, hook, 0).unwrap(),
                original
            );

            let slot = read_mem_displacement(address + 2, 0);
            assert_ne!(slot, address + 16);
            assert_eq!(read::<usize>(slot), hook);
            assert_eq!(read::<usize>(address + 16), original);
            assert_eq!(trampolines.block_count(), 1);

            let code = std::slice::from_raw_parts(address as *const u8, 6);
            let call = Decoder::with_ip(64, code, address as u64, DecoderOptions::NONE).decode();
            assert_eq!(call.mnemonic(), Mnemonic::Call);
            assert!(call.is_ip_rel_memory_operand());
            assert_eq!(call.ip_rel_memory_address(), slot as u64);
        }
        drop(buffer);
    }

    #[cfg(not(windows))]
    #[test]
    /// Read-only memory is patched and goes back to read-only
    fn test_vp() {
        let page = region::page::size();
        let map = mmap::MemoryMap::new(
            page,
            &[mmap::MapOption::MapReadable, mmap::MapOption::MapWritable],
        )
        .unwrap();
        let address = map.data() as usize;
        unsafe {
            region::protect(address as *const u8, page, Protection::READ).unwrap();

            vp::patch_bytes(address, &[0x55, 0x48]).unwrap();
            vp::patch(address + 2, 0xC3u8).unwrap();
            vp::nop(address + 3, 2).unwrap();
            vp::inject_hook(address + 8, address + 0x40, HookType::Jump).unwrap();
            vp::write_offset_value(address + 16, address, 0).unwrap();

            assert!(mem_equals(address, &[0x55, 0x48, 0xC3, 0x90, 0x90]));
            assert_eq!(read_call(address + 8), address + 0x40);
            assert_eq!(read_offset_value(address + 16, 0), address);
            assert_eq!(
                vp::intercept_call(address + 8, address + 0x80).unwrap(),
                address + 0x40
            );
            vp::write_mem_displacement(address + 24, address + 0x100, 0).unwrap();
            assert_eq!(
                vp::intercept_mem_displacement(address + 24, address + 0x200, 0).unwrap(),
                address + 0x100
            );
            assert_eq!(read_mem_displacement(address + 24, 0), address + 0x200);
            assert_eq!(
                region::query(address as *const u8).unwrap().protection(),
                Protection::READ
            );
        }
    }
}
