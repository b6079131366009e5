//! # Segment
//!
//! This module describes which memory a scan is allowed to read: plain address ranges, and the sections of loaded images
//! they are usually taken from.

use std::ops::Range;
use std::slice;

use thiserror::Error;

pub mod image;
pub mod maps;

pub use image::{Module, Section};
pub use maps::{default_segments, main_image};

/// Errors when describing a loaded image
#[derive(Debug, Error)]
pub enum ImageError {
    /// Error reading the image or the process's memory map
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    /// Error parsing the image's headers
    #[error("failed to parse image headers: {0}")]
    Parse(#[from] goblin::error::Error),
    /// The image is neither ELF nor PE
    #[error("unsupported image format")]
    UnsupportedFormat,
    /// The image file isn't mapped into this process
    #[error("{0} is not mapped into this process")]
    NotMapped(String),
    /// The main executable can't be located on this platform
    #[error("locating the main executable is not supported on this platform")]
    UnsupportedPlatform,
    /// Locating the main executable failed earlier in the process
    #[error("main executable is unavailable: {0}")]
    MainImage(String),
}

/// A half-open address range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    /// First address in the segment
    start: usize,
    /// One past the last address in the segment
    end: usize,
}

impl Segment {
    /// Creates a segment. An inverted range is treated as empty.
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Segment covering the memory of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        let range = data.as_ptr_range();
        Self::new(range.start as usize, range.end as usize)
    }

    /// First address
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last address
    pub fn end(&self) -> usize {
        self.end
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the segment covers no memory
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The segment as an address range
    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Whether `[address, address + len)` lies entirely inside the segment
    pub fn contains_range(&self, address: usize, len: usize) -> bool {
        address >= self.start
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.end)
    }

    /// Reads the segment's memory.
    ///
    /// # Safety
    ///
    /// The whole segment must be mapped and readable for `'a`, and not written to while the slice is alive.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.is_empty() {
            return &[];
        }
        slice::from_raw_parts(self.start as *const u8, self.len())
    }
}

/// Something that can enumerate the scannable memory of a loaded image
pub trait SegmentProvider {
    /// Every readable section, with adjacent sections merged
    fn readable_segments(&self) -> Vec<Segment>;
    /// Every section containing code, with adjacent sections merged
    fn code_segments(&self) -> Vec<Segment>;
    /// Every section named exactly `name`
    fn section_segments(&self, name: &str) -> Vec<Segment>;
}

/// Collects segments in order, merging each one into its predecessor when they touch.
///
/// Patterns may legitimately cross a section boundary, so touching sections are searched as one.
pub(crate) fn merge_adjacent(segments: impl IntoIterator<Item = Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::new();
    for segment in segments {
        match merged.last_mut() {
            Some(last) if last.end == segment.start => last.end = segment.end,
            _ => merged.push(segment),
        }
    }
    merged
}
