//! Byte-range bookkeeping for in-progress uploads.
//!
//! A [`Coverage`] is the union of chunk ranges received so far for a session.
//! Ranges are half-open (`[start, end)`), kept sorted, never overlap, and
//! adjacent ranges are merged so a fully received upload collapses into a
//! single span.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open byte range `[start, end)`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "range start must not exceed end");
        Self { start, end }
    }

    /// Range starting at `offset` spanning `len` bytes. `None` on overflow.
    pub fn at(offset: u64, len: u64) -> Option<Self> {
        offset.checked_add(len).map(|end| Self::new(offset, end))
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when the two ranges share at least one byte.
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Sorted, coalesced set of received byte ranges.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Coverage {
    ranges: Vec<ByteRange>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Total number of bytes received.
    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Highest byte offset received so far (exclusive).
    pub fn max_end(&self) -> u64 {
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }

    /// True if any byte of `range` has already been received.
    pub fn overlaps(&self, range: &ByteRange) -> bool {
        if range.is_empty() {
            return false;
        }
        // First stored range whose end lies past the candidate start.
        let idx = self.ranges.partition_point(|r| r.end <= range.start);
        self.ranges
            .get(idx)
            .is_some_and(|existing| existing.overlaps(range))
    }

    /// Add a range that the caller has already checked with [`Coverage::overlaps`].
    ///
    /// Neighbours that touch the new range are merged into it.
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        debug_assert!(!self.overlaps(&range), "coverage ranges must not overlap");

        let idx = self.ranges.partition_point(|r| r.end < range.start);
        let mut merged = range;
        let mut remove_to = idx;
        while let Some(next) = self.ranges.get(remove_to) {
            if next.start > merged.end {
                break;
            }
            merged.start = merged.start.min(next.start);
            merged.end = merged.end.max(next.end);
            remove_to += 1;
        }
        self.ranges.splice(idx..remove_to, std::iter::once(merged));
    }

    /// True when coverage is exactly `[0, size)`.
    pub fn is_complete(&self, size: u64) -> bool {
        match self.ranges.as_slice() {
            [] => size == 0,
            [only] => only.start == 0 && only.end == size,
            _ => false,
        }
    }

    /// Gaps between received ranges within `[0, size)`.
    pub fn missing(&self, size: u64) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for range in &self.ranges {
            if range.start > cursor {
                gaps.push(ByteRange::new(cursor, range.start.min(size)));
            }
            cursor = cursor.max(range.end);
        }
        if cursor < size {
            gaps.push(ByteRange::new(cursor, size));
        }
        gaps
    }
}
