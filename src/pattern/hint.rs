//! Address hints for patterns that have already been resolved
//!
//! A hint is only an accelerant: every hinted address is re-verified against the pattern before it is used.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;

lazy_static! {
    static ref HINTS: Arc<HintCache> = Arc::new(HintCache::new());
}

/// Mapping from pattern fingerprints to addresses they have matched at.
///
/// Entries are only ever added. Inserting the same address twice for a fingerprint is a no-op.
#[derive(Debug, Default)]
pub struct HintCache {
    /// Known addresses per fingerprint, in insertion order
    hints: Mutex<HashMap<u64, Vec<usize>>>,
}

impl HintCache {
    /// Creates an empty cache, independent of the process-wide one
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache used by scans unless told otherwise
    pub fn global() -> Arc<HintCache> {
        HINTS.clone()
    }

    /// Records `address` as a candidate for `fingerprint`
    pub fn hint(&self, fingerprint: u64, address: usize) {
        let mut hints = self.hints.lock().unwrap_or_else(PoisonError::into_inner);
        let addresses = hints.entry(fingerprint).or_default();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    /// Candidate addresses for `fingerprint`
    pub fn get(&self, fingerprint: u64) -> Vec<usize> {
        self.hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    /// Forgets every hint
    pub fn clear(&self) {
        self.hints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
