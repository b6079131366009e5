//! What happens when a pattern matches an unexpected number of times

use log::error;

use super::ScanError;

/// Strategy for a failed [`Scan::count`](super::Scan::count) assertion
pub trait MismatchPolicy {
    /// Called when `expected` matches were asserted but `actual` were found.
    ///
    /// Returning `Ok(())` lets the scan continue as if the count was correct.
    fn on_count_mismatch(&self, expected: usize, actual: usize) -> Result<(), ScanError>;
}

/// Treats a mismatch as a broken assumption about the host binary and panics.
///
/// This is the default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Assert;

impl MismatchPolicy for Assert {
    fn on_count_mismatch(&self, expected: usize, actual: usize) -> Result<(), ScanError> {
        error!("pattern matched {actual} times, expected {expected}");
        panic!("pattern matched {actual} times, expected {expected}");
    }
}

/// Reports a mismatch as [`ScanError::PatternMismatch`] so callers can try other signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recoverable;

impl MismatchPolicy for Recoverable {
    fn on_count_mismatch(&self, expected: usize, actual: usize) -> Result<(), ScanError> {
        Err(ScanError::PatternMismatch { expected, actual })
    }
}
