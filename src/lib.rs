#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod memory;
pub mod pattern;
pub mod protect;
pub mod segment;

pub use alloc::{Trampoline, TrampolineAllocator, TrampolineConfig};
pub use pattern::{Match, Pattern, Scan};
pub use protect::{unprotect_module_or_region, unprotect_region, ProtectionGuard};
pub use segment::{Module, Segment, SegmentProvider};
