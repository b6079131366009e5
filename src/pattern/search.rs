//! Boyer-Moore-Horspool search adapted for wildcard patterns

use std::cmp;

use super::Pattern;

/// "Last occurrence" table for a pattern.
///
/// For every byte value this holds the rightmost index at which the value appears in the pattern,
/// but never less than the index of the last wildcard (which matches any value), or `-1` if there is none.
pub struct ShiftTable([isize; 256]);

impl ShiftTable {
    /// Builds the table for `pattern`
    pub fn new(pattern: &Pattern) -> Self {
        let last_wildcard = pattern
            .mask()
            .iter()
            .rposition(|&m| m != 0xFF)
            .map_or(-1, |i| i as isize);

        let mut table = [last_wildcard; 256];
        for (i, &byte) in pattern.bytes().iter().enumerate() {
            let slot = &mut table[byte as usize];
            *slot = cmp::max(*slot, i as isize);
        }
        Self(table)
    }

    /// How far the window can move after a mismatch of `byte` at pattern index `index`. Always at least 1.
    fn shift(&self, index: isize, byte: u8) -> usize {
        cmp::max(1, index - self.0[byte as usize]) as usize
    }
}

/// Iterator over the offsets of every match inside a haystack, left to right.
///
/// Overlapping matches are all reported.
pub struct Matches<'a> {
    /// Data being searched
    haystack: &'a [u8],
    /// Pattern being searched for
    pattern: &'a Pattern,
    /// Shift table built from `pattern`
    table: &'a ShiftTable,
    /// Start of the next window to compare
    position: usize,
}

impl<'a> Matches<'a> {
    /// Creates a search over `haystack`. `table` must have been built from `pattern`.
    pub fn new(haystack: &'a [u8], pattern: &'a Pattern, table: &'a ShiftTable) -> Self {
        Self {
            haystack,
            pattern,
            table,
            position: 0,
        }
    }
}

impl Iterator for Matches<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let bytes = self.pattern.bytes();
        let mask = self.pattern.mask();
        let len = bytes.len();

        while self.position + len <= self.haystack.len() {
            let window = &self.haystack[self.position..self.position + len];

            // compare from the last byte backwards
            let mut j = len as isize - 1;
            while j >= 0 && bytes[j as usize] == window[j as usize] & mask[j as usize] {
                j -= 1;
            }

            if j < 0 {
                let found = self.position;
                self.position += 1;
                return Some(found);
            }
            self.position += self.table.shift(j, window[j as usize]);
        }

        None
    }
}

/// Finds every match of `pattern` in `haystack`
pub fn find_all(haystack: &[u8], pattern: &Pattern) -> Vec<usize> {
    let table = ShiftTable::new(pattern);
    Matches::new(haystack, pattern, &table).collect()
}
