//! A block of executable memory handed out front to back

use std::ptr;

use log::debug;

/// Executable memory that slots are carved from.
///
/// The mapping is never unmapped, since patched code may jump into it for the rest of the process.
#[derive(Debug)]
pub struct Block {
    /// First address of the block
    base: usize,
    /// Size of the block
    size: usize,
    /// Bytes already handed out from the front
    used: usize,
}

impl Block {
    /// Maps `size` bytes of read-, write- & executable memory, at exactly `address` if one is given
    pub fn map(address: Option<usize>, size: usize) -> Result<Self, mmap::MapError> {
        let mut options = vec![
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
        ];
        if let Some(address) = address {
            options.push(mmap::MapOption::MapAddr(address as *const u8));
        }

        let map = mmap::MemoryMap::new(size, &options)?;
        let block = Self {
            base: map.data() as usize,
            size: map.len(),
            used: 0,
        };
        std::mem::forget(map);

        debug!("mapped trampoline block {:#x}..{:#x}", block.base, block.end());
        Ok(block)
    }

    /// First address of the block
    pub fn base(&self) -> usize {
        self.base
    }

    /// One past the last address of the block
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.size - self.used
    }

    /// Bytes skipped to align the next slot to `align`
    pub fn padding(&self, align: usize) -> usize {
        let next = self.base + self.used;
        next.next_multiple_of(align.max(1)) - next
    }

    /// Whether a slot of `size` bytes aligned to `align` still fits
    pub fn fits(&self, size: usize, align: usize) -> bool {
        self.padding(align)
            .checked_add(size)
            .is_some_and(|needed| needed <= self.remaining())
    }

    /// Hands out a zeroed slot of `size` bytes aligned to `align`
    pub fn carve(&mut self, size: usize, align: usize) -> Option<usize> {
        if !self.fits(size, align) {
            return None;
        }
        let address = self.base + self.used + self.padding(align);
        self.used = address + size - self.base;

        // SAFETY: the slot lies inside the mapping, which is writable and never handed out twice
        unsafe { ptr::write_bytes(address as *mut u8, 0, size) };
        Some(address)
    }

    /// Whether every byte of the block is within `max_distance` of `target`
    pub fn reachable(&self, target: usize, max_distance: usize) -> bool {
        within(self.base, target, max_distance) && within(self.end(), target, max_distance)
    }
}

/// Whether `address` is at most `max_distance` away from `target` in either direction
pub fn within(address: usize, target: usize, max_distance: usize) -> bool {
    address.abs_diff(target) <= max_distance
}

#[cfg(test)]
mod tests {
    use super::{within, Block};

    /// A block that is never mapped, for bookkeeping tests
    fn fake(base: usize, size: usize, used: usize) -> Block {
        Block { base, size, used }
    }

    #[test]
    fn test_padding() {
        let block = fake(0x1000, 0x100, 3);
        assert_eq!(block.padding(1), 0);
        assert_eq!(block.padding(0), 0);
        assert_eq!(block.padding(8), 5);
        assert_eq!(block.padding(16), 13);
        assert!(block.fits(0x100 - 3 - 13, 16));
        assert!(!block.fits(0x100 - 3 - 12, 16));
    }

    #[test]
    fn test_reachable() {
        let block = fake(0x1_0000, 0x1000, 0);
        assert!(block.reachable(0x1_0800, 0x800));
        assert!(!block.reachable(0x1_0800, 0x7ff));
        assert!(!block.reachable(0x1_0000, 0xfff));
        assert!(within(0, usize::MAX, usize::MAX));
    }

    #[test]
    /// Slots come out aligned, zeroed, and without overlapping
    fn test_carve() {
        let page = region::page::size();
        let mut block = Block::map(None, page).unwrap();
        unsafe { std::ptr::write_bytes(block.base() as *mut u8, 0xCC, page) };

        let first = block.carve(3, 1).unwrap();
        let second = block.carve(8, 8).unwrap();
        assert_eq!(first, block.base());
        assert_eq!(second % 8, 0);
        assert!(second >= first + 3);
        assert_eq!(unsafe { *(second as *const u64) }, 0);

        assert!(block.carve(block.remaining() + 1, 1).is_none());
        assert!(block.carve(block.remaining(), 1).is_some());
        assert_eq!(block.remaining(), 0);
    }
}
