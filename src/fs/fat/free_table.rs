use std::collections::BTreeSet;

/// Longest run a single bucket can hold: 20 LFN slots for a 255-char name
/// ((255 + 12) / 13) plus one short-name slot.
pub const MAX_RUN: usize = 21;

/// Size-bucketed allocator of contiguous free directory-entry slots.
///
/// Positions are byte offsets of 32-byte slots within one directory's
/// stream. Bucket `n` holds the start positions of runs of exactly `n`
/// consecutive free slots, ordered ascending; a bitmask mirrors which
/// buckets are non-empty so `allocate` finds the smallest feasible bucket
/// with a single trailing-zero count.
///
/// The table never coalesces adjacent runs: the directory scanner feeds it
/// maximal runs, and remainders from splits stay where the split put them.
pub struct FreeDirectoryEntryTable {
    /// Index = run size; index 0 unused.
    buckets: Vec<BTreeSet<u64>>,
    bucket_mask: u32,
}

impl FreeDirectoryEntryTable {
    pub fn new() -> Self {
        Self {
            buckets: (0..=MAX_RUN).map(|_| BTreeSet::new()).collect(),
            bucket_mask: 0,
        }
    }

    /// Record `count` consecutive free slots starting at `position`.
    ///
    /// Runs longer than [`MAX_RUN`] are split into maximal chunks.
    pub fn add_free_range(&mut self, mut position: u64, mut count: usize) {
        debug_assert!(position % 32 == 0, "unaligned free position {position}");
        debug_assert!(count > 0, "empty free range at {position}");
        while count > MAX_RUN {
            self.insert_run(position, MAX_RUN);
            position += (MAX_RUN * 32) as u64;
            count -= MAX_RUN;
        }
        if count > 0 {
            self.insert_run(position, count);
        }
    }

    /// Take the lowest-position run from the smallest non-empty bucket of
    /// size >= `count`, re-inserting any remainder. Returns the byte
    /// position of the allocated slots, or `None` when no bucket fits.
    ///
    /// Counts outside `1..=MAX_RUN` are a caller bug, not a full table.
    pub fn allocate(&mut self, count: usize) -> Option<u64> {
        assert!(
            count >= 1 && count <= MAX_RUN,
            "directory entry run of {count} slots is out of range"
        );

        let feasible = self.bucket_mask >> count;
        if feasible == 0 {
            return None;
        }
        let size = count + feasible.trailing_zeros() as usize;

        let position = *self.buckets[size].iter().next()?;
        self.buckets[size].remove(&position);
        if self.buckets[size].is_empty() {
            self.bucket_mask &= !(1 << size);
        }

        if size > count {
            self.add_free_range(position + (count * 32) as u64, size - count);
        }
        Some(position)
    }

    /// Total free slots currently tracked.
    pub fn free_slots(&self) -> usize {
        self.buckets
            .iter()
            .enumerate()
            .map(|(size, set)| size * set.len())
            .sum()
    }

    fn insert_run(&mut self, position: u64, size: usize) {
        self.buckets[size].insert(position);
        self.bucket_mask |= 1 << size;
    }
}

impl Default for FreeDirectoryEntryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_fit() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(64, 3);
        assert_eq!(table.allocate(3), Some(64));
        assert_eq!(table.allocate(1), None);
    }

    #[test]
    fn test_best_fit_prefers_smallest_bucket() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(0, 8);
        table.add_free_range(1024, 3);
        // A 2-slot request must come from the 3-run, not the 8-run
        assert_eq!(table.allocate(2), Some(1024));
        // The leftover single slot is still available
        assert_eq!(table.allocate(1), Some(1024 + 2 * 32));
    }

    #[test]
    fn test_split_remainder_reused() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(320, 3);
        // One slot out of the 3-run; the remaining 2 keep serving
        assert_eq!(table.allocate(1), Some(320));
        assert_eq!(table.allocate(1), Some(352));
        assert_eq!(table.allocate(1), Some(384));
        assert_eq!(table.allocate(1), None);
    }

    #[test]
    fn test_tie_break_lowest_position() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(960, 2);
        table.add_free_range(128, 2);
        assert_eq!(table.allocate(2), Some(128));
        assert_eq!(table.allocate(2), Some(960));
    }

    #[test]
    fn test_long_range_chunking_and_churn() {
        let mut table = FreeDirectoryEntryTable::new();
        // 50 slots split into maximal chunks of 21, 21, 8
        table.add_free_range(0, 50);
        assert_eq!(table.free_slots(), 50);

        // Best-fit over the chunked runs: each 10-slot request takes the
        // smallest feasible bucket at its lowest position, remainders are
        // re-bucketed as they appear.
        assert_eq!(table.allocate(10), Some(0));
        assert_eq!(table.allocate(10), Some(320));
        assert_eq!(table.allocate(10), Some(672));
        assert_eq!(table.allocate(10), Some(992));
        // 10 slots remain, but no run of 10
        assert_eq!(table.allocate(10), None);
        assert_eq!(table.free_slots(), 10);

        assert_eq!(table.allocate(1), Some(640));
        assert_eq!(table.allocate(1), Some(1312));
        for i in 0..8 {
            assert_eq!(table.allocate(1), Some(1344 + i * 32));
        }
        assert_eq!(table.allocate(1), None);
        assert_eq!(table.free_slots(), 0);
    }

    #[test]
    fn test_conservation() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(0, 17);
        table.add_free_range(4096, 30);
        let mut allocated = 0;
        for count in [5, 5, 21, 1, 9, 2] {
            if table.allocate(count).is_some() {
                allocated += count;
            }
        }
        assert_eq!(allocated + table.free_slots(), 47);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_allocate_zero_is_a_bug() {
        let mut table = FreeDirectoryEntryTable::new();
        table.allocate(0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_allocate_oversized_is_a_bug() {
        let mut table = FreeDirectoryEntryTable::new();
        table.add_free_range(0, MAX_RUN);
        table.allocate(MAX_RUN + 1);
    }
}
