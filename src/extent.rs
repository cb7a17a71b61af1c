//! Sorted set of disjoint block ranges.
//!
//! Used to answer "has an earlier operation written any block in
//! `[start, end)`?" without keeping one entry per block.

use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtentSet {
    /// start → end (exclusive).  Ranges never overlap or touch.
    ranges: BTreeMap<u64, u64>,
}

impl ExtentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges held.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Add `[start, end)`, merging with neighbours it overlaps or touches.
    pub fn insert(&mut self, mut start: u64, mut end: u64) {
        if start >= end {
            return;
        }
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        while let Some((s, e)) = self.ranges.range(start..=end).next().map(|(&s, &e)| (s, e)) {
            end = end.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(start, end);
    }

    /// Lowest block of `[start, end)` already in the set.
    pub fn first_overlap(&self, start: u64, end: u64) -> Option<u64> {
        if start >= end {
            return None;
        }
        if let Some((_, &e)) = self.ranges.range(..=start).next_back() {
            if e > start {
                return Some(start);
            }
        }
        self.ranges.range(start..end).next().map(|(&s, _)| s)
    }
}
