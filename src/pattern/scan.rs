//! Lazily resolved pattern scans

use std::borrow::Cow;
use std::slice;
use std::sync::Arc;

use log::{debug, warn};
use thiserror::Error;

use crate::segment::{self, ImageError, Module, Segment, SegmentProvider};

use super::policy::{Assert, MismatchPolicy};
use super::search::{Matches, ShiftTable};
use super::{HintCache, Pattern, PatternError};

/// Errors when resolving a scan
#[derive(Debug, Error)]
pub enum ScanError {
    /// The pattern matched a different number of times than was asserted
    #[error("pattern matched {actual} times, expected {expected}")]
    PatternMismatch {
        /// Asserted match count
        expected: usize,
        /// Number of matches found
        actual: usize,
    },
    /// A match was requested past the end of the results
    #[error("match {index} requested but only {len} were found")]
    OutOfRange {
        /// Requested index
        index: usize,
        /// Number of matches found
        len: usize,
    },
    /// The signature could not be compiled
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// The default segments could not be determined
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Address of a single match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Match(usize);

impl Match {
    /// Wraps a raw address
    pub fn new(address: usize) -> Self {
        Self(address)
    }

    /// Address of the match displaced by `offset` bytes
    pub fn addr(self, offset: isize) -> usize {
        self.0.wrapping_add_signed(offset)
    }

    /// Pointer to the match displaced by `offset` bytes
    pub fn get<T>(self, offset: isize) -> *mut T {
        self.addr(offset) as *mut T
    }
}

/// A pattern bound to the segments it should be searched in.
///
/// Nothing is searched until the results are first needed. Once resolved, the matches are kept until [`Scan::clear`].
/// `P` decides what a failed [`Scan::count`] does; by default the scan panics.
pub struct Scan<P = Assert> {
    /// Pattern to look for
    pattern: Pattern,
    /// Memory to look in, in enumeration order
    segments: Cow<'static, [Segment]>,
    /// Hints to consult before scanning and to update afterwards
    hints: Option<Arc<HintCache>>,
    /// Behaviour on count mismatches
    policy: P,
    /// Matches found so far
    matches: Vec<Match>,
    /// Whether `matches` holds the final result
    resolved: bool,
}

impl Scan {
    /// Creates a scan over explicit segments, using the process-wide [`HintCache`].
    ///
    /// # Safety
    ///
    /// Every segment must stay mapped and readable for as long as the scan can resolve.
    pub unsafe fn new(pattern: Pattern, segments: Vec<Segment>) -> Self {
        Self::over(pattern, Cow::Owned(segments))
    }

    /// Creates a scan over owned or shared segments, using the process-wide [`HintCache`].
    ///
    /// # Safety
    ///
    /// See [`Scan::new`].
    unsafe fn over(pattern: Pattern, segments: Cow<'static, [Segment]>) -> Self {
        Self {
            pattern,
            segments,
            hints: Some(HintCache::global()),
            policy: Assert,
            matches: Vec::new(),
            resolved: false,
        }
    }

    /// Creates a scan over `[begin, end)`.
    ///
    /// # Safety
    ///
    /// The range must stay mapped and readable for as long as the scan can resolve.
    pub unsafe fn in_range(begin: usize, end: usize, pattern: Pattern) -> Self {
        Self::new(pattern, vec![Segment::new(begin, end)])
    }

    /// Creates a scan over every readable section of `module`
    pub fn in_module(module: &Module, pattern: Pattern) -> Self {
        // SAFETY: a `Module` only describes sections of a loaded image
        unsafe { Self::new(pattern, module.readable_segments()) }
    }

    /// Creates a scan over every readable section of the main executable
    pub fn main_image(pattern: Pattern) -> Result<Self, ImageError> {
        let segments = segment::default_segments()?;
        // SAFETY: the main executable is never unloaded
        Ok(unsafe { Self::over(pattern, Cow::Borrowed(segments)) })
    }
}

impl<P: MismatchPolicy> Scan<P> {
    /// Replaces the mismatch policy
    pub fn with_policy<Q: MismatchPolicy>(self, policy: Q) -> Scan<Q> {
        Scan {
            pattern: self.pattern,
            segments: self.segments,
            hints: self.hints,
            policy,
            matches: self.matches,
            resolved: self.resolved,
        }
    }

    /// Uses `hints` instead of the process-wide cache
    pub fn with_hints(mut self, hints: Arc<HintCache>) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Always performs a full scan and records nothing
    pub fn without_hints(mut self) -> Self {
        self.hints = None;
        self
    }

    /// Pattern being searched for
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Segments being searched
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the scan has already run
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Resolves the scan if it has at least `expected` matches, then asserts that it has exactly `expected`.
    pub fn count(&mut self, expected: usize) -> Result<&mut Self, ScanError> {
        // one past the expected count, so too many matches are noticed as well
        self.ensure_matches(expected.saturating_add(1));
        let actual = self.matches.len();
        if actual != expected {
            self.policy.on_count_mismatch(expected, actual)?;
        }
        Ok(self)
    }

    /// Resolves the scan, stopping after `expected` matches. Never asserts.
    ///
    /// Verified hints are cut off at `expected` the same way.
    pub fn count_hint(&mut self, expected: usize) -> &mut Self {
        self.ensure_matches(expected);
        self
    }

    /// Forgets the results, so the next access scans again
    pub fn clear(&mut self) -> &mut Self {
        self.matches.clear();
        self.resolved = false;
        self
    }

    /// Number of matches
    pub fn len(&mut self) -> usize {
        self.ensure_matches(usize::MAX);
        self.matches.len()
    }

    /// Whether the pattern matched nowhere
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Match number `index`
    pub fn get(&mut self, index: usize) -> Result<Match, ScanError> {
        self.ensure_matches(usize::MAX);
        self.matches
            .get(index)
            .copied()
            .ok_or(ScanError::OutOfRange {
                index,
                len: self.matches.len(),
            })
    }

    /// The only match, asserting that there is exactly one
    pub fn get_one(&mut self) -> Result<Match, ScanError> {
        self.count(1)?;
        self.get(0)
    }

    /// Pointer `offset` bytes past the only match
    pub fn get_first<T>(&mut self, offset: isize) -> Result<*mut T, ScanError> {
        self.get_one().map(|m| m.get(offset))
    }

    /// All matches, in segment order and then address order
    pub fn matches(&mut self) -> &[Match] {
        self.ensure_matches(usize::MAX);
        &self.matches
    }

    /// Calls `f` on every match and hands it back
    pub fn for_each<F: FnMut(Match)>(&mut self, mut f: F) -> F {
        self.matches().iter().copied().for_each(&mut f);
        f
    }

    /// Resolves the scan with at most `max` matches if it hasn't been resolved yet
    fn ensure_matches(&mut self, max: usize) {
        if self.resolved {
            return;
        }

        if self.consider_hints(max) {
            debug!(
                "pattern {:016x} resolved to {} hinted matches",
                self.pattern.fingerprint(),
                self.matches.len()
            );
            self.resolved = true;
            return;
        }

        let table = ShiftTable::new(&self.pattern);
        'segments: for segment in self.segments.iter() {
            if self.matches.len() >= max {
                break;
            }
            // SAFETY: every constructor requires the segments to be readable
            let haystack = unsafe { segment.as_slice() };
            for offset in Matches::new(haystack, &self.pattern, &table) {
                self.matches.push(Match(segment.start() + offset));
                if self.matches.len() >= max {
                    break 'segments;
                }
            }
        }

        if let Some(hints) = &self.hints {
            for m in &self.matches {
                hints.hint(self.pattern.fingerprint(), m.0);
            }
        }

        debug!(
            "pattern {:016x} resolved to {} matches over {} segments",
            self.pattern.fingerprint(),
            self.matches.len(),
            self.segments.len()
        );
        self.resolved = true;
    }

    /// Fills `matches` with up to `max` hints that still match. Returns `false` if none did.
    fn consider_hints(&mut self, max: usize) -> bool {
        let Some(hints) = &self.hints else {
            return false;
        };
        let candidates = hints.get(self.pattern.fingerprint());
        if candidates.is_empty() || max == 0 {
            return false;
        }

        let len = self.pattern.len();
        for &address in &candidates {
            // a hint outside the scanned segments might not be mapped at all
            if !self.segments.iter().any(|s| s.contains_range(address, len)) {
                continue;
            }
            // SAFETY: the window lies inside a readable segment
            let data = unsafe { slice::from_raw_parts(address as *const u8, len) };
            if self.pattern.matches(data) {
                self.matches.push(Match(address));
                if self.matches.len() >= max {
                    break;
                }
            }
        }

        if self.matches.is_empty() {
            warn!(
                "discarding {} stale hints for pattern {:016x}",
                candidates.len(),
                self.pattern.fingerprint()
            );
            return false;
        }
        true
    }
}

/// Pointer `offset` bytes past the single match of `signature` in the main executable
pub fn get_pattern<T>(signature: &str, offset: isize) -> Result<*mut T, ScanError> {
    Scan::main_image(Pattern::new(signature)?)?.get_first(offset)
}

/// Address `offset` bytes past the single match of `signature` in the main executable
pub fn get_pattern_addr(signature: &str, offset: isize) -> Result<usize, ScanError> {
    Ok(Scan::main_image(Pattern::new(signature)?)?
        .get_one()?
        .addr(offset))
}
