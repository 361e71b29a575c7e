//! Hole manager
//!
//! Free byte ranges inside the data region, keyed by offset in a `BTreeMap`.
//! Holes are pairwise disjoint; releases coalesce with both neighbours.

use crate::error::{CaskError, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// A contiguous unused byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Hole {
    pub offset: u64,
    pub size: u64,
}

impl Hole {
    pub fn new(offset: u64, size: u64) -> Self {
        Hole { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Check if `[offset, offset + size)` lies entirely inside this hole
    pub fn contains_range(&self, offset: u64, size: u64) -> bool {
        offset >= self.offset && offset + size <= self.end()
    }

    /// Check if this hole touches or overlaps another (can be coalesced)
    pub fn is_adjacent(&self, other: &Hole) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }

    pub fn coalesce(&self, other: &Hole) -> Option<Hole> {
        if !self.is_adjacent(other) {
            return None;
        }
        let start = self.offset.min(other.offset);
        let end = self.end().max(other.end());
        Some(Hole::new(start, end - start))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HoleManager {
    /// offset -> size
    holes: BTreeMap<u64, u64>,
    total_bytes: u64,
}

impl HoleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release a range. Zero-size additions are no-ops; anything touching an
    /// existing hole is merged into it.
    pub fn add_hole(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }

        let mut merged = Hole::new(offset, size);

        // Every hole starting at or before the new end may touch it; walk
        // backwards until one ends before the new start
        let touching: Vec<Hole> = self
            .holes
            .range(..=merged.end())
            .rev()
            .map(|(&o, &s)| Hole::new(o, s))
            .take_while(|h| h.end() >= merged.offset)
            .collect();

        for hole in touching {
            if let Some(union) = merged.coalesce(&hole) {
                merged = union;
            }
            self.holes.remove(&hole.offset);
            self.total_bytes -= hole.size;
        }

        self.holes.insert(merged.offset, merged.size);
        self.total_bytes += merged.size;
    }

    /// Smallest hole that can hold `size` bytes. Ties go to the lowest
    /// offset; a perfect fit ends the search.
    pub fn best_fit(&self, size: u64) -> Option<Hole> {
        if size == 0 {
            return None;
        }

        let mut best: Option<Hole> = None;
        for (&offset, &hole_size) in &self.holes {
            if hole_size < size {
                continue;
            }
            if best.map_or(true, |b| hole_size < b.size) {
                best = Some(Hole::new(offset, hole_size));
                if hole_size == size {
                    break;
                }
            }
        }
        best
    }

    /// The hole containing `offset`, if any
    pub fn find_containing(&self, offset: u64) -> Option<Hole> {
        self.holes
            .range(..=offset)
            .next_back()
            .map(|(&o, &s)| Hole::new(o, s))
            .filter(|h| offset < h.end())
    }

    pub fn contains_range(&self, offset: u64, size: u64) -> bool {
        self.find_containing(offset)
            .is_some_and(|h| h.contains_range(offset, size))
    }

    /// Check if any hole overlaps `[offset, offset + size)`
    pub fn overlaps(&self, offset: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        let end = offset + size;
        self.holes
            .range(..end)
            .next_back()
            .is_some_and(|(&o, &s)| o + s > offset)
    }

    /// Carve `[offset, offset + size)` out of the hole that contains it,
    /// leaving leading and trailing remnants as holes
    pub fn allocate_from_hole(&mut self, offset: u64, size: u64) -> Result<()> {
        let hole = self
            .find_containing(offset)
            .filter(|h| h.contains_range(offset, size))
            .ok_or_else(|| {
                CaskError::NoSpace(format!(
                    "range {}+{} is not inside a free hole",
                    offset, size
                ))
            })?;

        self.split_out(hole, offset, size);
        Ok(())
    }

    /// Remove whatever free space overlaps `[offset, offset + size)`. Parts
    /// of the range that are not free are ignored.
    pub fn claim_range(&mut self, offset: u64, size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        let end = offset + size;

        let overlapping: Vec<Hole> = self
            .holes
            .range(..end)
            .rev()
            .map(|(&o, &s)| Hole::new(o, s))
            .take_while(|h| h.end() > offset)
            .collect();

        let mut claimed = 0;
        for hole in overlapping {
            let start = hole.offset.max(offset);
            let stop = hole.end().min(end);
            claimed += stop - start;
            self.split_out(hole, start, stop - start);
        }
        claimed
    }

    fn split_out(&mut self, hole: Hole, offset: u64, size: u64) {
        self.holes.remove(&hole.offset);
        self.total_bytes -= hole.size;

        let leading = offset - hole.offset;
        if leading > 0 {
            self.holes.insert(hole.offset, leading);
            self.total_bytes += leading;
        }

        let trailing = hole.end() - (offset + size);
        if trailing > 0 {
            self.holes.insert(offset + size, trailing);
            self.total_bytes += trailing;
        }
    }

    /// One pass over the ordered holes combining abutting neighbours.
    /// Returns the number of merges performed.
    pub fn merge_adjacent_holes(&mut self) -> usize {
        let mut merged: BTreeMap<u64, u64> = BTreeMap::new();
        let mut merges = 0;
        let mut current: Option<Hole> = None;

        for (&offset, &size) in &self.holes {
            let next = Hole::new(offset, size);
            current = match current {
                Some(cur) if cur.end() >= next.offset => {
                    merges += 1;
                    cur.coalesce(&next)
                }
                Some(cur) => {
                    merged.insert(cur.offset, cur.size);
                    Some(next)
                }
                None => Some(next),
            };
        }
        if let Some(cur) = current {
            merged.insert(cur.offset, cur.size);
        }

        self.holes = merged;
        self.total_bytes = self.holes.values().sum();
        merges
    }

    /// Drop holes smaller than `min_size`. Returns how many were dropped.
    pub fn cleanup_small_holes(&mut self, min_size: u64) -> usize {
        let before = self.holes.len();
        self.holes.retain(|_, size| *size >= min_size);
        self.total_bytes = self.holes.values().sum();
        before - self.holes.len()
    }

    pub fn len(&self) -> usize {
        self.holes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holes.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn largest(&self) -> Option<Hole> {
        self.iter().max_by_key(|h| h.size)
    }

    /// Holes in offset order
    pub fn iter(&self) -> impl Iterator<Item = Hole> + '_ {
        self.holes.iter().map(|(&o, &s)| Hole::new(o, s))
    }

    pub fn clear(&mut self) {
        self.holes.clear();
        self.total_bytes = 0;
    }
}
