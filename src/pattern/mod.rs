//! # Pattern
//!
//! This module covers signatures: compiling them from their textual form, searching memory for them,
//! and caching the addresses they resolved to.
//!
//! Signatures use the IDA/x64dbg style: space separated hex byte pairs where `?` or `??` is a wildcard.
//!
//! ```ignore
//! let pattern = Pattern::new("48 8B ?? 89 ? C3")?;
//! let address = Scan::main_image(pattern)?.get_one()?.addr(0);
//! ```

use thiserror::Error;

pub mod hint;
pub mod policy;
pub mod scan;
pub mod search;

pub use hint::HintCache;
pub use policy::{Assert, MismatchPolicy, Recoverable};
pub use scan::{get_pattern, get_pattern_addr, Match, Scan, ScanError};

/// FNV-1 prime for 64-bit hashes
const FNV_PRIME: u64 = 1_099_511_628_211;
/// FNV-1 offset basis for 64-bit hashes
const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;

/// Errors when building a pattern
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// The signature did not contain a single byte or wildcard
    #[error("pattern contains no bytes")]
    Empty,
    /// A pretransformed pattern had a mask of a different length than its bytes
    #[error("pattern mask is {mask} bytes long but pattern is {bytes} bytes long")]
    MaskLength {
        /// Length of the byte sequence
        bytes: usize,
        /// Length of the mask
        mask: usize,
    },
}

/// A compiled signature.
///
/// `bytes` and `mask` are always the same non-zero length. A mask byte of `0x00` is a wildcard and `0xFF` is an exact match.
/// Wildcard positions always hold `0x00` in `bytes` so a position matches when `bytes[i] == data[i] & mask[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    /// Bytes to match
    bytes: Vec<u8>,
    /// Per-byte mask
    mask: Vec<u8>,
    /// Content hash used as the key into a [`HintCache`]
    fingerprint: u64,
}

impl Pattern {
    /// Compiles a signature string.
    ///
    /// Anything that isn't a hex digit, a space or `?` is ignored. A run of two `?` is a single wildcard.
    pub fn new(signature: &str) -> Result<Self, PatternError> {
        let mut bytes = Vec::with_capacity(signature.len() / 3 + 1);
        let mut mask = Vec::with_capacity(signature.len() / 3 + 1);

        // high nibble waiting for its low half
        let mut high: Option<u8> = None;
        // the previous character was a `?` that already produced a wildcard
        let mut open_wildcard = false;

        for ch in signature.chars() {
            if ch == '?' {
                if !open_wildcard {
                    bytes.push(0);
                    mask.push(0);
                }
                open_wildcard = !open_wildcard;
                continue;
            }
            open_wildcard = false;

            if let Some(digit) = ch.to_digit(16) {
                let digit = digit as u8;
                match high.take() {
                    Some(high) => {
                        bytes.push((high << 4) | digit);
                        mask.push(0xFF);
                    }
                    None => high = Some(digit),
                }
            }
        }

        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self {
            bytes,
            mask,
            fingerprint: fnv1(signature.bytes()),
        })
    }

    /// Builds a pattern from a pretransformed byte sequence and mask.
    pub fn from_raw(bytes: &[u8], mask: &[u8]) -> Result<Self, PatternError> {
        if bytes.len() != mask.len() {
            return Err(PatternError::MaskLength {
                bytes: bytes.len(),
                mask: mask.len(),
            });
        }
        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }

        let fingerprint = fnv1(bytes.iter().chain(mask).copied());
        let bytes = bytes.iter().zip(mask).map(|(b, m)| b & m).collect();

        Ok(Self {
            bytes,
            mask: mask.to_vec(),
            fingerprint,
        })
    }

    /// Bytes to match, with wildcard positions zeroed
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mask for each byte
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Number of bytes the pattern spans, wildcards included
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Content hash of the source signature
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Returns `true` if `data` starts with bytes matching this pattern.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.len()
            && self
                .bytes
                .iter()
                .zip(&self.mask)
                .zip(data)
                .all(|((b, m), d)| *b == d & m)
    }
}

/// 64-bit FNV-1 (multiply, then xor)
fn fnv1(data: impl IntoIterator<Item = u8>) -> u64 {
    data.into_iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        hash.wrapping_mul(FNV_PRIME) ^ u64::from(byte)
    })
}

#[cfg(test)]
mod tests {
    use super::{Pattern, PatternError};

    #[test]
    /// Wildcards in both spellings compile to a zeroed mask byte
    fn test_compile() {
        let pattern = Pattern::new("48 8B ?? 89 ? C3").unwrap();
        assert_eq!(pattern.bytes(), [0x48, 0x8B, 0x00, 0x89, 0x00, 0xC3]);
        assert_eq!(pattern.mask(), [0xFF, 0xFF, 0x00, 0xFF, 0x00, 0xFF]);
        assert_eq!(pattern.len(), 6);
    }

    #[test]
    fn test_compile_case_insensitive() {
        let upper = Pattern::new("AB CD EF").unwrap();
        let lower = Pattern::new("ab cd ef").unwrap();
        assert_eq!(upper.bytes(), lower.bytes());
        assert_eq!(upper.mask(), lower.mask());
    }

    #[test]
    /// Separate `?` tokens are separate wildcards, but `??` is only one
    fn test_compile_wildcard_runs() {
        assert_eq!(Pattern::new("? ?").unwrap().len(), 2);
        assert_eq!(Pattern::new("??").unwrap().len(), 1);
        assert_eq!(Pattern::new("?? ?? 90").unwrap().len(), 3);
    }

    #[test]
    /// Characters outside the signature alphabet are skipped
    fn test_compile_skips_garbage() {
        let pattern = Pattern::new("48 zz 8B, C3").unwrap();
        assert_eq!(pattern.bytes(), [0x48, 0x8B, 0xC3]);
    }

    #[test]
    fn test_compile_empty() {
        assert_eq!(Pattern::new(""), Err(PatternError::Empty));
        assert_eq!(Pattern::new("  xyz "), Err(PatternError::Empty));
        assert_eq!(Pattern::from_raw(&[], &[]), Err(PatternError::Empty));
    }

    #[test]
    fn test_from_raw() {
        let pattern = Pattern::from_raw(&[0x55, 0x12, 0xC3], &[0xFF, 0x00, 0xFF]).unwrap();
        // wildcard positions are normalized
        assert_eq!(pattern.bytes(), [0x55, 0x00, 0xC3]);
        assert!(pattern.matches(&[0x55, 0x77, 0xC3]));
        assert!(!pattern.matches(&[0x55, 0x77]));

        assert_eq!(
            Pattern::from_raw(&[1, 2], &[0xFF]),
            Err(PatternError::MaskLength { bytes: 2, mask: 1 })
        );
    }

    #[test]
    /// Fingerprints follow the signature text
    fn test_fingerprint() {
        let a = Pattern::new("55 8B EC").unwrap();
        let b = Pattern::new("55 8B EC").unwrap();
        let c = Pattern::new("55 8B ED").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
