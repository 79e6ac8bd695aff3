//! Byte ranges of a file already claimed by a successful unpack.
//!
//! Intervals are half-open and kept sorted by start. Inserting an interval
//! that overlaps an existing one is a logic error and panics.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ByteInterval {
    pub start: u64,
    pub end: u64,
}

impl ByteInterval {
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start < end, "empty or inverted interval [{start}, {end})");
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end && self.start < end
    }
}

impl fmt::Display for ByteInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    intervals: Vec<ByteInterval>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval containing `offset`, if any.
    pub fn is_blacklisted(&self, offset: u64) -> Option<ByteInterval> {
        // first interval starting strictly after offset; the candidate is the one before it
        let idx = self.intervals.partition_point(|iv| iv.start <= offset);
        if idx == 0 {
            return None;
        }
        let candidate = self.intervals[idx - 1];
        candidate.contains(offset).then_some(candidate)
    }

    /// Claim `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics when the range is empty or overlaps an interval already claimed.
    pub fn add(&mut self, start: u64, end: u64) {
        let interval = ByteInterval::new(start, end);
        let idx = self.intervals.partition_point(|iv| iv.start < start);
        if let Some(prev) = idx.checked_sub(1).map(|i| self.intervals[i]) {
            assert!(
                !prev.overlaps(start, end),
                "blacklist overlap: {interval} intersects {prev}"
            );
        }
        if let Some(next) = self.intervals.get(idx) {
            assert!(
                !next.overlaps(start, end),
                "blacklist overlap: {interval} intersects {next}"
            );
        }
        self.intervals.insert(idx, interval);
    }

    /// Smallest interval start that is `>= offset`.
    pub fn next_claimed_after(&self, offset: u64) -> Option<u64> {
        let idx = self.intervals.partition_point(|iv| iv.start < offset);
        self.intervals.get(idx).map(|iv| iv.start)
    }

    /// True when any claimed interval intersects `[start, end)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return false;
        }
        let idx = self.intervals.partition_point(|iv| iv.end <= start);
        self.intervals
            .get(idx)
            .is_some_and(|iv| iv.overlaps(start, end))
    }

    /// True when the claimed intervals cover `[start, end)` without gaps.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        while cursor < end {
            match self.is_blacklisted(cursor) {
                Some(iv) => cursor = iv.end,
                None => return false,
            }
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteInterval> {
        self.intervals.iter()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}
