//! # Alloc
//!
//! This module allocates executable memory close to a given address.
//!
//! A near `call`/`jmp` can only reach 2 GiB in either direction. When the real destination is further away, the
//! branch is pointed at a [`Trampoline`] slot within reach instead, and the slot holds a jump that can reach anything.
//!
//! Blocks are mapped on demand, handed out front to back and never released: patched code may jump into them for the
//! rest of the process.

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use log::{debug, trace};
use thiserror::Error;

use crate::code::AsAddress;

pub mod block;
pub mod search;

use self::block::Block;

/// Alignment of every block, the coarsest allocation granularity of any supported platform
const ALLOCATION_GRANULARITY: usize = 0x10000;

/// Space reserved by [`TrampolineAllocator::make_trampoline`]: one jump stub and its alignment padding
const STUB_RESERVE: usize = STUB_LEN + STUB_ALIGN;

/// Size of the stub written by [`Trampoline::jump`]
const STUB_LEN: usize = crate::code::x64::MOV_RAX_JMP_LEN;

/// Alignment of the stubs written by [`Trampoline::jump`]
const STUB_ALIGN: usize = 16;

/// Errors while allocating trampoline memory
#[derive(Debug, Error)]
pub enum AllocError {
    /// No free memory within reach of the target could be mapped
    #[error("no free memory within reach of {target:#x}")]
    NoReachableRegion {
        /// Address the memory had to be reachable from
        target: usize,
    },
    /// A slot doesn't fit in what is left of a block
    #[error("trampoline block exhausted: {requested:#x} bytes requested, {remaining:#x} remaining")]
    BlockExhausted {
        /// Bytes requested, including alignment padding
        requested: usize,
        /// Bytes left in the block
        remaining: usize,
    },
    /// The process's memory map could not be queried
    #[error("failed to query memory")]
    Region(#[source] region::Error),
    /// Memory could not be mapped
    #[error("failed to map trampoline memory: {0}")]
    Map(mmap::MapError),
}

/// How far trampolines may be from their targets and how much memory is mapped at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrampolineConfig {
    /// Largest distance between a target and any byte of a block serving it
    pub max_distance: usize,
    /// Size of each newly mapped block
    pub block_size: usize,
}

impl Default for TrampolineConfig {
    fn default() -> Self {
        Self {
            max_distance: i32::MAX as usize,
            block_size: ALLOCATION_GRANULARITY,
        }
    }
}

lazy_static! {
    static ref TRAMPOLINES: TrampolineAllocator = TrampolineAllocator::new();
}

/// Registry of trampoline blocks.
///
/// Blocks are only ever added, so an index into the registry stays valid for the allocator's lifetime.
#[derive(Debug)]
pub struct TrampolineAllocator {
    /// Reach and block size
    config: TrampolineConfig,
    /// Blocks in the order they were mapped
    blocks: Mutex<Vec<Block>>,
}

impl Default for TrampolineAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TrampolineAllocator {
    /// Creates an empty allocator with the default configuration
    pub fn new() -> Self {
        Self::with_config(TrampolineConfig::default())
    }

    /// Creates an empty allocator
    pub fn with_config(config: TrampolineConfig) -> Self {
        Self {
            config,
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide allocator
    pub fn global() -> &'static Self {
        &TRAMPOLINES
    }

    /// Reach and block size
    pub fn config(&self) -> TrampolineConfig {
        self.config
    }

    /// Number of blocks mapped so far
    pub fn block_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns a block within reach of `target` with room for at least one jump stub
    pub fn make_trampoline(&self, target: usize) -> Result<Trampoline<'_>, AllocError> {
        self.make_trampoline_for(target, STUB_RESERVE, 1)
    }

    /// Returns a block within reach of `target` with room for a `size` byte slot aligned to `align`.
    ///
    /// An existing block is reused when one qualifies, otherwise a new one is mapped. Where a near branch reaches the
    /// whole address space, nothing is mapped until the first slot is carved.
    pub fn make_trampoline_for(
        &self,
        target: usize,
        size: usize,
        align: usize,
    ) -> Result<Trampoline<'_>, AllocError> {
        let worst_case = size.saturating_add(align.saturating_sub(1));
        if worst_case > self.config.block_size {
            return Err(AllocError::BlockExhausted {
                requested: worst_case,
                remaining: self.config.block_size,
            });
        }

        let index = if cfg!(target_pointer_width = "64") {
            Some(self.assign(target, size, align)?)
        } else {
            None
        };

        Ok(Trampoline {
            allocator: self,
            index: Cell::new(index),
            target,
        })
    }

    /// Index of a block serving `target` with room for the slot, mapping one if needed
    fn assign(&self, target: usize, size: usize, align: usize) -> Result<usize, AllocError> {
        let mut blocks = self.lock();
        match blocks
            .iter()
            .position(|b| self.serves(b, target) && b.fits(size, align))
        {
            Some(index) => Ok(index),
            None => {
                blocks.push(self.map_block(target)?);
                Ok(blocks.len() - 1)
            }
        }
    }

    /// Whether `block` is within reach of `target`
    fn serves(&self, block: &Block, target: usize) -> bool {
        cfg!(target_pointer_width = "32") || block.reachable(target, self.config.max_distance)
    }

    /// Maps a new block within reach of `target`
    #[cfg(target_pointer_width = "64")]
    fn map_block(&self, target: usize) -> Result<Block, AllocError> {
        let TrampolineConfig {
            max_distance,
            block_size,
        } = self.config;
        let low = target.saturating_sub(max_distance / 2);
        let high = target.saturating_add(max_distance);

        for candidate in search::free_regions(low..high, ALLOCATION_GRANULARITY) {
            let candidate = candidate.map_err(AllocError::Region)?;
            if !block::within(candidate.saturating_add(block_size), target, max_distance) {
                if candidate > target {
                    break;
                }
                continue;
            }

            // a fixed mapping replaces whatever is already there
            let occupied = region::query_range(candidate as *const u8, block_size)
                .map_err(AllocError::Region)?
                .next()
                .is_some();
            if occupied {
                continue;
            }

            let block = match Block::map(Some(candidate), block_size) {
                Ok(block) => block,
                Err(e) => {
                    trace!("failed to map {:#x}: {}", candidate, e);
                    continue;
                }
            };
            if block.base() == candidate && self.serves(&block, target) {
                debug!("trampoline block {:#x} serves {:#x}", block.base(), target);
                return Ok(block);
            }
            debug!(
                "abandoning trampoline block {:#x}, wanted {:#x}",
                block.base(),
                candidate
            );
        }

        Err(AllocError::NoReachableRegion { target })
    }

    /// Maps a new block anywhere, since everything is within reach
    #[cfg(target_pointer_width = "32")]
    fn map_block(&self, _target: usize) -> Result<Block, AllocError> {
        Block::map(None, self.config.block_size).map_err(AllocError::Map)
    }

    /// Locks the block list
    fn lock(&self) -> MutexGuard<'_, Vec<Block>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A block within reach of one target address, to carve slots from
#[derive(Debug, Clone)]
pub struct Trampoline<'a> {
    /// Allocator owning the block
    allocator: &'a TrampolineAllocator,
    /// Position of the block in the allocator, once one has been assigned
    index: Cell<Option<usize>>,
    /// Address the block was chosen for
    target: usize,
}

impl Trampoline<'_> {
    /// Runs `f` on the block if one has been assigned
    fn with_block<R>(&self, f: impl FnOnce(&mut Block) -> R) -> Option<R> {
        let index = self.index.get()?;
        Some(f(&mut self.allocator.lock()[index]))
    }

    /// First address of the block, or `None` while no memory has been needed
    pub fn base(&self) -> Option<usize> {
        self.with_block(|b| b.base())
    }

    /// Address the block was chosen for
    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes left in the block, or `None` while no memory has been needed
    pub fn remaining(&self) -> Option<usize> {
        self.with_block(|b| b.remaining())
    }

    /// Whether the whole block is within reach of `address`
    pub fn is_reachable(&self, address: usize) -> bool {
        self.with_block(|b| self.allocator.serves(b, address))
            .unwrap_or(cfg!(target_pointer_width = "32"))
    }

    /// Carves a zeroed slot of `size` bytes aligned to `align` and returns its address
    pub fn space(&self, size: usize, align: usize) -> Result<usize, AllocError> {
        if self.index.get().is_none() {
            let index = self.allocator.assign(self.target, size, align)?;
            self.index.set(Some(index));
        }
        let carved = self.with_block(|b| {
            let address = b.carve(size, align).ok_or(AllocError::BlockExhausted {
                requested: b.padding(align).saturating_add(size),
                remaining: b.remaining(),
            })?;
            trace!("carved {:#x} bytes at {:#x}", size, address);
            Ok(address)
        });
        carved.unwrap_or(Err(AllocError::NoReachableRegion {
            target: self.target,
        }))
    }

    /// Writes a stub that jumps to `function` and returns its address, for use as a near branch destination
    #[cfg(target_pointer_width = "64")]
    pub fn jump(&self, function: impl AsAddress) -> Result<usize, AllocError> {
        let stub = crate::code::x64::mov_rax_jmp(function.as_address());
        let address = self.space(stub.len(), STUB_ALIGN)?;
        // SAFETY: the slot was just carved from a writable block
        unsafe { std::ptr::copy_nonoverlapping(stub.as_ptr(), address as *mut u8, stub.len()) };
        Ok(address)
    }

    /// Returns `function` itself, since a near branch reaches the whole address space
    #[cfg(target_pointer_width = "32")]
    pub fn jump(&self, function: impl AsAddress) -> Result<usize, AllocError> {
        Ok(function.as_address())
    }

    /// Carves a zeroed, `align` aligned slot for a `T`
    pub fn pointer<T>(&self, align: usize) -> Result<*mut T, AllocError> {
        let align = align.max(std::mem::align_of::<T>());
        self.space(std::mem::size_of::<T>(), align)
            .map(|address| address as *mut T)
    }

    /// Carves a slot holding `value`, for instructions that load an absolute address from memory
    pub fn address_slot(&self, value: impl AsAddress) -> Result<*mut usize, AllocError> {
        let slot = self.pointer::<usize>(std::mem::size_of::<usize>())?;
        // SAFETY: the slot was just carved from a writable block and is aligned for a usize
        unsafe { slot.write(value.as_address()) };
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocError, TrampolineAllocator, TrampolineConfig};

    /// Something to jump to from the test binary's own code
    extern "C" fn answer() -> u32 {
        42
    }

    /// Address inside the test binary, so blocks have to be found near the code
    fn target() -> usize {
        answer as usize
    }

    /// Signed distance from `target` to `address` fits a rel32 displacement
    fn rel32_reachable(address: usize, target: usize) -> bool {
        i32::try_from(address as i128 - target as i128).is_ok()
    }

    #[test]
    fn test_reachable_stub() {
        let allocator = TrampolineAllocator::new();
        let trampoline = allocator.make_trampoline(target()).unwrap();
        let stub = trampoline.jump(answer as extern "C" fn() -> u32).unwrap();
        assert!(rel32_reachable(stub, target()));
        assert!(trampoline.is_reachable(target()));
        assert_eq!(trampoline.target(), target());
    }

    #[test]
    /// Nearby requests share one block until it fills up
    fn test_reuse() {
        let allocator = TrampolineAllocator::new();
        let first = allocator.make_trampoline(target()).unwrap();
        let a = first.jump(0x1234usize).unwrap();
        let second = allocator.make_trampoline(target() + 0x100).unwrap();
        let b = second.jump(0x5678usize).unwrap();

        assert_eq!(allocator.block_count(), 1);
        assert!(first.base().is_some());
        assert_eq!(first.base(), second.base());
        assert_ne!(a, b);
    }

    #[test]
    /// A full block makes the next request map another one
    fn test_exhaustion() {
        let page = region::page::size();
        let allocator = TrampolineAllocator::with_config(TrampolineConfig {
            block_size: page,
            ..TrampolineConfig::default()
        });

        for _ in 0..2 {
            let trampoline = allocator.make_trampoline_for(target(), page / 2, 1).unwrap();
            trampoline.space(page / 2, 1).unwrap();
        }
        assert_eq!(allocator.block_count(), 1);

        let trampoline = allocator.make_trampoline_for(target(), page / 2, 1).unwrap();
        assert_eq!(allocator.block_count(), 2);
        let address = trampoline.space(page / 2, 1).unwrap();
        assert!(rel32_reachable(address + page / 2, target()));

        assert!(matches!(
            trampoline.space(page, 1),
            Err(AllocError::BlockExhausted { .. })
        ));
        assert!(matches!(
            allocator.make_trampoline_for(target(), page + 1, 1),
            Err(AllocError::BlockExhausted { .. })
        ));
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    /// Jumps need no memory where a near branch reaches everything, so blocks are only mapped for data slots
    fn test_passthrough() {
        let allocator = TrampolineAllocator::new();
        let trampoline = allocator.make_trampoline(target()).unwrap();
        assert_eq!(trampoline.jump(0x1234usize).unwrap(), 0x1234);
        assert_eq!(trampoline.base(), None);
        assert!(trampoline.is_reachable(target()));
        assert_eq!(allocator.block_count(), 0);

        let slot = trampoline.address_slot(target()).unwrap();
        assert_eq!(unsafe { *slot }, target());
        assert_eq!(allocator.block_count(), 1);
        assert!(trampoline.base().is_some());
    }

    #[test]
    fn test_pointer() {
        let allocator = TrampolineAllocator::new();
        let trampoline = allocator.make_trampoline(target()).unwrap();
        trampoline.space(1, 1).unwrap();

        let slot = trampoline.pointer::<u64>(64).unwrap();
        assert_eq!(slot as usize % 64, 0);
        assert_eq!(unsafe { *slot }, 0);
        unsafe { *slot = u64::MAX };

        let address = trampoline.address_slot(target()).unwrap();
        assert_eq!(unsafe { *address }, target());
        assert!(rel32_reachable(address as usize, target()));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    /// Calling the stub ends up in the function it was made for
    fn test_call_through_stub() {
        let allocator = TrampolineAllocator::new();
        let trampoline = allocator.make_trampoline(target()).unwrap();
        let stub = trampoline.jump(answer as extern "C" fn() -> u32).unwrap();

        let call: extern "C" fn() -> u32 = unsafe { std::mem::transmute(stub) };
        assert_eq!(call(), 42);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_decode_stub() {
        use iced_x86::{Decoder, DecoderOptions, Mnemonic, Register};

        let allocator = TrampolineAllocator::new();
        let trampoline = allocator.make_trampoline(target()).unwrap();
        let stub = trampoline.jump(target()).unwrap();
        let code = unsafe { std::slice::from_raw_parts(stub as *const u8, 12) };

        let mut decoder = Decoder::with_ip(64, code, stub as u64, DecoderOptions::NONE);
        let mov = decoder.decode();
        assert_eq!(mov.mnemonic(), Mnemonic::Mov);
        assert_eq!(mov.immediate64(), target() as u64);
        let jmp = decoder.decode();
        assert_eq!(jmp.mnemonic(), Mnemonic::Jmp);
        assert_eq!(jmp.op0_register(), Register::RAX);
    }
}
