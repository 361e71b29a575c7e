//! Variable-size slot allocator
//!
//! Decides where the encoded bytes of a page go. The cascade, in order:
//!
//! 1. **Reuse** the page's own slot when the new encoding fits in it.
//! 2. **Expand** the slot in place when it grew by at most
//!    [`EXTREME_GROWTH_FACTOR`]× and the bytes after it are free (no live
//!    slot within [`EXPANSION_GUARD`] bytes, inside the current file).
//! 3. **Best fit** from the hole list.
//! 4. **Append** at the end of the file, bumping past any live slot in the way.
//!
//! Placement is two-phase: [`SpaceAllocator::place`] only decides, the
//! session writes the bytes, and [`SpaceAllocator::commit`] then updates the
//! hole list, live-slot map and counters. A failed write leaves the
//! allocator untouched.

pub mod holes;

pub use holes::{Hole, HoleManager};

use crate::error::{CaskError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Bytes that must stay free between an expanded slot and its next neighbour
pub const EXPANSION_GUARD: u64 = 32;

/// Growth beyond this factor abandons the slot instead of expanding it
pub const EXTREME_GROWTH_FACTOR: u64 = 10;

/// Collision bumps allowed while searching for an append offset
const MAX_APPEND_RETRIES: usize = 64;

/// A physical extent in the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub offset: u64,
    pub size: u64,
}

impl Slot {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveSlot {
    page: u64,
    /// Bytes reserved for the slot; stays put when a smaller rewrite reuses it
    capacity: u64,
    /// Encoded bytes currently stored
    used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    Reuse,
    Expand,
    BestFit,
    Append,
}

/// Where a page's encoded bytes will be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub page: u64,
    pub offset: u64,
    /// Encoded length to be written
    pub len: u64,
    pub kind: PlacementKind,
    /// The page's previous slot, returned to the hole list on commit
    pub release: Option<Slot>,
    consulted_holes: bool,
    bumps: usize,
    extreme_growth: bool,
}

/// Allocation decision counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Rewrites that fit in the existing slot
    pub space_reuse: u64,
    /// Slots grown in place
    pub space_expand: u64,
    /// Fresh slots appended at the end of the file
    pub new_allocation: u64,
    /// Fresh allocations that consulted a non-empty hole list
    pub space_reclaim: u64,
    /// Fresh allocations served from a hole
    pub best_fit: u64,
    /// Appends that needed no collision bump
    pub sequential: u64,
    /// Slots abandoned by the extreme-growth guard
    pub extreme_growth: u64,
    /// Cumulative bytes left unused by in-place reuse
    pub wasted_bytes: u64,
    /// Slots returned to the hole list
    pub slots_released: u64,
}

/// Space usage snapshot with derived efficiency ratios
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpaceStats {
    pub data_region_start: u64,
    pub live_slots: usize,
    /// Bytes reserved by live slots
    pub allocated_bytes: u64,
    /// Encoded bytes actually stored in them
    pub used_bytes: u64,
    pub hole_count: usize,
    pub hole_bytes: u64,
    pub largest_hole: u64,
    /// 0 (ideal) to 100; diagnostic only
    pub fragmentation_score: f64,
    pub reuse_ratio: f64,
    pub reclaim_ratio: f64,
    pub sequential_ratio: f64,
    pub counters: AllocatorStats,
}

impl SpaceStats {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Slot allocator for one container
#[derive(Debug, Clone)]
pub struct SpaceAllocator {
    data_region_start: u64,
    /// offset -> slot
    live: BTreeMap<u64, LiveSlot>,
    holes: HoleManager,
    stats: AllocatorStats,
}

impl SpaceAllocator {
    pub fn new(data_region_start: u64) -> Self {
        SpaceAllocator {
            data_region_start,
            live: BTreeMap::new(),
            holes: HoleManager::new(),
            stats: AllocatorStats::default(),
        }
    }

    /// Rebuild from the live slots of a loaded index. Every gap between
    /// slots inside `[data_region_start, file_size)` becomes a hole.
    pub fn rebuild<I>(data_region_start: u64, slots: I, file_size: u64) -> Result<Self>
    where
        I: IntoIterator<Item = (u64, Slot)>,
    {
        let mut allocator = Self::new(data_region_start);

        for (page, slot) in slots {
            if slot.size == 0 {
                return Err(CaskError::corrupt(page, "live slot has zero size"));
            }
            let end = slot.offset.checked_add(slot.size).ok_or_else(|| {
                CaskError::corrupt(
                    page,
                    format!("slot {}+{} overflows the address space", slot.offset, slot.size),
                )
            })?;
            if slot.offset < data_region_start || end > file_size {
                return Err(CaskError::corrupt(
                    page,
                    format!(
                        "slot {}+{} lies outside the data region [{}, {})",
                        slot.offset, slot.size, data_region_start, file_size
                    ),
                ));
            }
            if let Some((other, _)) = allocator.first_overlap(slot.offset, slot.size, None) {
                return Err(CaskError::corrupt(
                    page,
                    format!("slot {}+{} overlaps page {}", slot.offset, slot.size, other.page),
                ));
            }
            allocator.live.insert(
                slot.offset,
                LiveSlot {
                    page,
                    capacity: slot.size,
                    used: slot.size,
                },
            );
        }

        let mut cursor = data_region_start;
        for (&offset, slot) in &allocator.live {
            if offset > cursor {
                allocator.holes.add_hole(cursor, offset - cursor);
            }
            cursor = offset + slot.capacity;
        }
        if file_size > cursor {
            allocator.holes.add_hole(cursor, file_size - cursor);
        }

        debug!(
            "Rebuilt allocator: {} live slots, {} holes ({} bytes)",
            allocator.live.len(),
            allocator.holes.len(),
            allocator.holes.total_bytes()
        );
        Ok(allocator)
    }

    pub fn data_region_start(&self) -> u64 {
        self.data_region_start
    }

    /// Decide where `need` encoded bytes for `page` go.
    ///
    /// `current` is the offset of the page's existing slot, if it has one.
    /// `file_size` is the current size of the underlying file.
    pub fn place(
        &self,
        page: u64,
        current: Option<u64>,
        need: u64,
        file_size: u64,
    ) -> Result<Placement> {
        if need == 0 {
            return Err(CaskError::Codec(format!("page {} encoded to zero bytes", page)));
        }

        let mut release = None;
        let mut extreme_growth = false;

        if let Some(offset) = current {
            let slot = self.live_slot(page, offset)?;

            if need <= slot.capacity {
                return Ok(Placement {
                    page,
                    offset,
                    len: need,
                    kind: PlacementKind::Reuse,
                    release: None,
                    consulted_holes: false,
                    bumps: 0,
                    extreme_growth: false,
                });
            }

            if need > slot.capacity.saturating_mul(EXTREME_GROWTH_FACTOR) {
                debug!(
                    "Page {} grew {} -> {} bytes, abandoning slot at {}",
                    page, slot.capacity, need, offset
                );
                extreme_growth = true;
            } else if self.can_expand(offset, need, file_size) {
                return Ok(Placement {
                    page,
                    offset,
                    len: need,
                    kind: PlacementKind::Expand,
                    release: None,
                    consulted_holes: false,
                    bumps: 0,
                    extreme_growth: false,
                });
            }

            release = Some(Slot {
                offset,
                size: slot.capacity,
            });
        }

        let consulted_holes = !self.holes.is_empty();
        if let Some(hole) = self.holes.best_fit(need) {
            return Ok(Placement {
                page,
                offset: hole.offset,
                len: need,
                kind: PlacementKind::BestFit,
                release,
                consulted_holes,
                bumps: 0,
                extreme_growth,
            });
        }

        let (offset, bumps) = self.append_offset(need, file_size)?;
        Ok(Placement {
            page,
            offset,
            len: need,
            kind: PlacementKind::Append,
            release,
            consulted_holes,
            bumps,
            extreme_growth,
        })
    }

    /// Final overlap scan before bytes hit the disk. A placement may only
    /// overlap the page's own slot (reuse or expansion) and a best-fit
    /// placement must sit entirely inside a known hole.
    pub fn verify(&self, placement: &Placement) -> Result<()> {
        if placement.offset < self.data_region_start {
            return Err(CaskError::NoSpace(format!(
                "offset {} for page {} is below the data region",
                placement.offset, placement.page
            )));
        }

        let own = match placement.kind {
            PlacementKind::Reuse | PlacementKind::Expand => {
                self.live_slot(placement.page, placement.offset)?;
                Some(placement.offset)
            }
            PlacementKind::BestFit | PlacementKind::Append => None,
        };

        if let Some((other, offset)) = self
            .first_overlap(placement.offset, placement.len, own)
            .map(|(slot, offset)| (slot.page, offset))
        {
            return Err(CaskError::NoSpace(format!(
                "refusing to write page {} at {}+{}: overlaps page {} at {}",
                placement.page, placement.offset, placement.len, other, offset
            )));
        }

        if placement.kind == PlacementKind::BestFit
            && !self.holes.contains_range(placement.offset, placement.len)
        {
            return Err(CaskError::NoSpace(format!(
                "best-fit offset {} for page {} is not inside a hole",
                placement.offset, placement.page
            )));
        }

        Ok(())
    }

    /// Record a placement whose bytes were written successfully
    pub fn commit(&mut self, placement: &Placement) -> Result<()> {
        let Placement {
            page, offset, len, ..
        } = *placement;

        match placement.kind {
            PlacementKind::Reuse => {
                let slot = self.live_slot_mut(page, offset)?;
                let waste = slot.capacity - len;
                slot.used = len;
                self.stats.wasted_bytes += waste;
                self.stats.space_reuse += 1;
            }
            PlacementKind::Expand => {
                let slot = self.live_slot_mut(page, offset)?;
                let old_end = offset + slot.capacity;
                slot.capacity = len;
                slot.used = len;
                self.holes.claim_range(old_end, offset + len - old_end);
                self.stats.space_expand += 1;
            }
            PlacementKind::BestFit => {
                self.holes.allocate_from_hole(offset, len)?;
                self.insert_slot(page, offset, len);
                self.stats.best_fit += 1;
            }
            PlacementKind::Append => {
                self.holes.claim_range(offset, len);
                self.insert_slot(page, offset, len);
                self.stats.new_allocation += 1;
                if placement.bumps == 0 {
                    self.stats.sequential += 1;
                }
            }
        }

        if placement.consulted_holes {
            self.stats.space_reclaim += 1;
        }
        if placement.extreme_growth {
            self.stats.extreme_growth += 1;
        }
        if let Some(old) = placement.release {
            self.release(old.offset);
        }

        Ok(())
    }

    /// Return the slot at `offset` to the hole list
    pub fn release(&mut self, offset: u64) -> Option<Slot> {
        let slot = self.live.remove(&offset)?;
        self.holes.add_hole(offset, slot.capacity);
        self.stats.slots_released += 1;
        Some(Slot {
            offset,
            size: slot.capacity,
        })
    }

    /// Coalesce holes and optionally drop ones below `min_useful_size`.
    /// Returns `(merged, dropped)`.
    pub fn maintain(&mut self, min_useful_size: u64) -> (usize, usize) {
        let merged = self.holes.merge_adjacent_holes();
        let dropped = if min_useful_size > 0 {
            self.holes.cleanup_small_holes(min_useful_size)
        } else {
            0
        };
        (merged, dropped)
    }

    pub fn holes(&self) -> &HoleManager {
        &self.holes
    }

    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    pub fn live_slot_count(&self) -> usize {
        self.live.len()
    }

    /// `(page, slot)` pairs in offset order; slot sizes are capacities
    pub fn live_slots(&self) -> impl Iterator<Item = (u64, Slot)> + '_ {
        self.live.iter().map(|(&offset, s)| {
            (
                s.page,
                Slot {
                    offset,
                    size: s.capacity,
                },
            )
        })
    }

    pub fn space_stats(&self) -> SpaceStats {
        let allocated_bytes: u64 = self.live.values().map(|s| s.capacity).sum();
        let used_bytes: u64 = self.live.values().map(|s| s.used).sum();
        let ratios = EfficiencyRatios::from_stats(&self.stats);

        SpaceStats {
            data_region_start: self.data_region_start,
            live_slots: self.live.len(),
            allocated_bytes,
            used_bytes,
            hole_count: self.holes.len(),
            hole_bytes: self.holes.total_bytes(),
            largest_hole: self.holes.largest().map_or(0, |h| h.size),
            fragmentation_score: fragmentation_score(allocated_bytes, used_bytes, &self.stats),
            reuse_ratio: ratios.reuse,
            reclaim_ratio: ratios.reclaim,
            sequential_ratio: ratios.sequential,
            counters: self.stats,
        }
    }

    /// Check the layout invariants: live slots are disjoint and inside the
    /// data region, holes are inside the data region and never overlap a
    /// live slot.
    pub fn check_layout(&self) -> Result<()> {
        let mut previous_end = self.data_region_start;
        for (&offset, slot) in &self.live {
            if offset < previous_end {
                return Err(CaskError::corrupt(
                    slot.page,
                    format!("slot at {} overlaps the previous slot or the index", offset),
                ));
            }
            if self.holes.overlaps(offset, slot.capacity) {
                return Err(CaskError::corrupt(
                    slot.page,
                    format!("slot at {} overlaps a hole", offset),
                ));
            }
            previous_end = offset + slot.capacity;
        }

        if let Some(first) = self.holes.iter().next() {
            if first.offset < self.data_region_start {
                return Err(CaskError::NoSpace(format!(
                    "hole at {} lies below the data region",
                    first.offset
                )));
            }
        }
        Ok(())
    }

    fn insert_slot(&mut self, page: u64, offset: u64, len: u64) {
        self.live.insert(
            offset,
            LiveSlot {
                page,
                capacity: len,
                used: len,
            },
        );
    }

    fn live_slot(&self, page: u64, offset: u64) -> Result<LiveSlot> {
        match self.live.get(&offset) {
            Some(slot) if slot.page == page => Ok(*slot),
            Some(slot) => Err(CaskError::corrupt(
                page,
                format!("slot at {} belongs to page {}", offset, slot.page),
            )),
            None => Err(CaskError::corrupt(
                page,
                format!("no live slot recorded at {}", offset),
            )),
        }
    }

    fn live_slot_mut(&mut self, page: u64, offset: u64) -> Result<&mut LiveSlot> {
        match self.live.get_mut(&offset) {
            Some(slot) if slot.page == page => Ok(slot),
            _ => Err(CaskError::corrupt(
                page,
                format!("no live slot for this page at {}", offset),
            )),
        }
    }

    fn can_expand(&self, offset: u64, need: u64, file_size: u64) -> bool {
        let new_end = offset + need;
        if new_end > file_size {
            return false;
        }
        match self.live.range(offset + 1..).next() {
            Some((&next, _)) => next >= new_end + EXPANSION_GUARD,
            None => true,
        }
    }

    /// Highest-ending live slot overlapping `[offset, offset + len)`,
    /// ignoring the slot at `exclude`
    fn first_overlap(&self, offset: u64, len: u64, exclude: Option<u64>) -> Option<(LiveSlot, u64)> {
        let end = offset + len;
        self.live
            .range(..end)
            .rev()
            .take_while(|(o, s)| **o + s.capacity > offset)
            .find(|(o, _)| Some(**o) != exclude)
            .map(|(&o, s)| (*s, o))
    }

    fn append_offset(&self, need: u64, file_size: u64) -> Result<(u64, usize)> {
        let mut candidate = file_size.max(self.data_region_start);
        for bumps in 0..=MAX_APPEND_RETRIES {
            match self.first_overlap(candidate, need, None) {
                None => return Ok((candidate, bumps)),
                Some((slot, offset)) => candidate = offset + slot.capacity,
            }
        }
        Err(CaskError::NoSpace(format!(
            "no collision-free append offset for {} bytes after {} retries",
            need, MAX_APPEND_RETRIES
        )))
    }
}

struct EfficiencyRatios {
    reuse: f64,
    reclaim: f64,
    sequential: f64,
}

impl EfficiencyRatios {
    fn from_stats(stats: &AllocatorStats) -> Self {
        let placements =
            stats.space_reuse + stats.space_expand + stats.best_fit + stats.new_allocation;
        let reuse = if placements == 0 {
            0.0
        } else {
            (stats.space_reuse + stats.space_expand) as f64 / placements as f64
        };
        let reclaim = if stats.space_reclaim == 0 {
            1.0
        } else {
            stats.best_fit as f64 / stats.space_reclaim as f64
        };
        let sequential = if stats.new_allocation == 0 {
            1.0
        } else {
            stats.sequential as f64 / stats.new_allocation as f64
        };
        EfficiencyRatios {
            reuse,
            reclaim: reclaim.min(1.0),
            sequential,
        }
    }
}

/// `wasted_share (0-30) + (1 - reuse)·30 + (1 - reclaim)·25 + (1 - sequential)·15`,
/// clamped to 100. Zero when nothing has been placed yet.
pub fn fragmentation_score(allocated_bytes: u64, used_bytes: u64, stats: &AllocatorStats) -> f64 {
    let placements = stats.space_reuse + stats.space_expand + stats.best_fit + stats.new_allocation;
    if placements == 0 {
        return 0.0;
    }

    let wasted_share = if allocated_bytes == 0 {
        0.0
    } else {
        30.0 * allocated_bytes.saturating_sub(used_bytes) as f64 / allocated_bytes as f64
    };
    let ratios = EfficiencyRatios::from_stats(stats);

    let score = wasted_share
        + (1.0 - ratios.reuse) * 30.0
        + (1.0 - ratios.reclaim) * 25.0
        + (1.0 - ratios.sequential) * 15.0;
    score.clamp(0.0, 100.0)
}
