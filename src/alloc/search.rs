//! Forward search for unmapped address ranges
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;

/// Returns an iterator over unmapped, `granularity` aligned addresses in `range`, lowest first.
///
/// An address is yielded when the page at it is unmapped; whether enough memory after it is free is up to the caller.
pub fn free_regions(
    range: Range<usize>,
    granularity: usize,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegions {
        current: align_up(range.start.max(granularity), granularity),
        limit: range.end,
        granularity,
    }
}

/// Rounds `address` up to a multiple of `granularity`, or `None` past the end of the address space
fn align_up(address: usize, granularity: usize) -> Option<usize> {
    address.checked_next_multiple_of(granularity)
}

/// An iterator searching forward for free regions
struct FreeRegions {
    /// Next address to query, or `None` once the address space is exhausted
    current: Option<usize>,
    /// Addresses at or past this aren't searched
    limit: usize,
    /// Alignment of every yielded address
    granularity: usize,
}

impl Iterator for FreeRegions {
    type Item = Result<usize, region::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current) = self.current.filter(|&c| c < self.limit) {
            match region::query(current as *const u8) {
                Ok(mapped) => {
                    // skip past the mapping, staying aligned
                    self.current = align_up(mapped.as_range().end, self.granularity)
                        .filter(|&next| next > current);
                }
                Err(region::Error::UnmappedRegion) => {
                    self.current = current.checked_add(self.granularity);
                    return Some(Ok(current));
                }
                Err(error) => {
                    self.current = None;
                    return Some(Err(error));
                }
            }
        }

        None
    }
}
