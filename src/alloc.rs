use log::debug;

use crate::error::{FsError, Result};
use crate::extent::Extent;

/// Longest run of blocks a single planner request will ask the allocator
/// for. Larger files are split into several extents of at most this many
/// blocks each, which keeps single allocator calls small enough to succeed
/// on a moderately fragmented disk.
pub const MAX_RUN: u32 = 4;

/// Boundary to the block allocation collaborator. The tree engine only ever
/// talks to the disk bitmap through this pair of calls.
pub trait BlockAllocator {
    /// Allocates `count` contiguous blocks and returns the first block
    /// number of the run.
    ///
    /// # Errors
    ///
    /// Fails with `OutOfSpace` when no free run of `count` blocks exists.
    fn allocate_block(&mut self, count: u32) -> Result<u32>;

    /// Returns a single block to the free pool. Must only be called on
    /// blocks the caller actually owns.
    fn free_block(&mut self, blockno: u32);
}

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// A first-fit contiguous allocator over a simple bitmap, one bit per
/// logical disk block.
///
/// ## Other Allocation Policies
///
/// 1. Next-fit allocation that remembers where the previous search ended,
///    trading packing density for cheaper scans.
/// 2. Allocation that spreads runs over the whole disk to even out wear on
///    physical devices.
pub struct BitmapAllocator {
    /// One bit per block; a set bit marks the block as allocated.
    bitmap: Vec<u64>,
    /// The number of blocks actually backed by the disk. Bits at and above
    /// this index are never handed out.
    num_blocks: u32,
}

impl BitmapAllocator {
    pub fn new(num_blocks: u32) -> Self {
        let words = (num_blocks as usize + 63) / 64;
        Self {
            bitmap: vec![0; words],
            num_blocks,
        }
    }

    pub fn get(&self, blocknr: u32) -> State {
        assert!(blocknr < self.num_blocks);
        let mask = 0b01_u64 << (blocknr % 64);
        if self.bitmap[blocknr as usize / 64] & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    fn set_reserved(&mut self, blocknr: u32) {
        assert!(blocknr < self.num_blocks);
        self.bitmap[blocknr as usize / 64] |= 0b01_u64 << (blocknr % 64);
    }

    fn set_free(&mut self, blocknr: u32) {
        assert!(blocknr < self.num_blocks);
        self.bitmap[blocknr as usize / 64] &= !(0b01_u64 << (blocknr % 64));
    }

    /// Marks a block allocated while rebuilding allocator state from a
    /// loaded master file table.
    pub(crate) fn reserve(&mut self, blocknr: u32) -> Result<()> {
        if blocknr >= self.num_blocks {
            return Err(FsError::Corrupt("extent reaches past the end of the disk"));
        }
        if let State::Used = self.get(blocknr) {
            return Err(FsError::Corrupt("block claimed by more than one extent"));
        }
        self.set_reserved(blocknr);
        Ok(())
    }

    /// Number of blocks currently free on the disk.
    pub fn free_blocks(&self) -> u32 {
        (0..self.num_blocks)
            .filter(|&blocknr| self.get(blocknr) == State::Free)
            .count() as u32
    }
}

impl BlockAllocator for BitmapAllocator {
    fn allocate_block(&mut self, count: u32) -> Result<u32> {
        assert!(count > 0);
        if count > self.num_blocks {
            return Err(FsError::OutOfSpace);
        }

        let mut start = 0;
        while start + count <= self.num_blocks {
            match (start..start + count).find(|&blocknr| self.get(blocknr) == State::Used) {
                // Restart the scan just past the allocated block.
                Some(used) => start = used + 1,
                None => {
                    for blocknr in start..start + count {
                        self.set_reserved(blocknr);
                    }
                    return Ok(start);
                }
            }
        }
        Err(FsError::OutOfSpace)
    }

    fn free_block(&mut self, blockno: u32) {
        debug_assert!(
            self.get(blockno) == State::Used,
            "freeing block {} which is not allocated",
            blockno
        );
        self.set_free(blockno);
    }
}

/// Plans the extents backing a file of `blocks` total blocks.
///
/// Runs of up to [`MAX_RUN`] blocks are requested first; when the allocator
/// cannot produce a full run the planner falls back to a single block and
/// plans the rest of the run out of whatever fragments remain. The returned
/// extents always sum to exactly `blocks`.
///
/// A failed plan releases every block it already took before returning, so
/// callers observe either a complete allocation or none at all.
pub fn plan_extents<A: BlockAllocator>(alloc: &mut A, blocks: u32) -> Result<Vec<Extent>> {
    debug_assert!(blocks > 0);
    let mut extents = Vec::new();
    match fill_extents(alloc, blocks, &mut extents) {
        Ok(()) => {
            debug!("planned {} blocks across {} extents", blocks, extents.len());
            Ok(extents)
        }
        Err(err) => {
            for extent in &extents {
                for blockno in extent.blocks() {
                    alloc.free_block(blockno);
                }
            }
            Err(err)
        }
    }
}

fn fill_extents<A: BlockAllocator>(
    alloc: &mut A,
    remaining: u32,
    extents: &mut Vec<Extent>,
) -> Result<()> {
    if remaining == 0 {
        return Ok(());
    }

    let want = remaining.min(MAX_RUN);
    match alloc.allocate_block(want) {
        Ok(start) => extents.push(Extent::new(start, want)),
        Err(_) if want == 1 => return Err(FsError::OutOfSpace),
        Err(_) => {
            // The disk may be too fragmented for a full run even though
            // enough single blocks are free.
            let start = alloc.allocate_block(1).map_err(|_| FsError::OutOfSpace)?;
            extents.push(Extent::new(start, 1));
            fill_extents(alloc, want - 1, extents)?;
        }
    }
    fill_extents(alloc, remaining - want, extents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut alloc = BitmapAllocator::new(64);

        alloc.set_reserved(2);

        assert_eq!(alloc.get(0), State::Free);
        assert_eq!(alloc.get(2), State::Used);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut alloc = BitmapAllocator::new(128);

        alloc.set_reserved(0);
        alloc.set_reserved(127);

        assert_eq!(alloc.get(0), State::Used);
        assert_eq!(alloc.get(127), State::Used);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut alloc = BitmapAllocator::new(64);

        alloc.set_reserved(10);
        assert_eq!(alloc.get(10), State::Used);

        alloc.set_free(10);
        assert_eq!(alloc.get(10), State::Free);
    }

    #[test]
    fn allocation_skips_over_used_blocks() {
        let mut alloc = BitmapAllocator::new(8);
        alloc.set_reserved(1);

        assert_eq!(alloc.allocate_block(2).unwrap(), 2);
        assert_eq!(alloc.free_blocks(), 5);
    }

    #[test]
    fn allocation_fails_without_a_contiguous_run() {
        let mut alloc = BitmapAllocator::new(8);
        for blocknr in [1u32, 3, 5, 7].iter() {
            alloc.set_reserved(*blocknr);
        }

        assert!(alloc.allocate_block(2).is_err());
        assert_eq!(alloc.allocate_block(1).unwrap(), 0);
    }

    #[test]
    fn planning_caps_runs_at_max_run() {
        let mut alloc = BitmapAllocator::new(64);

        let extents = plan_extents(&mut alloc, 10).unwrap();

        let sizes: Vec<u32> = extents.iter().map(|e| e.block_count).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(alloc.free_blocks(), 54);
    }

    #[test]
    fn planning_falls_back_to_single_blocks_on_fragmentation() {
        let mut alloc = BitmapAllocator::new(8);
        // Leave only every other block free so no run of two exists.
        for blocknr in [1u32, 3, 5, 7].iter() {
            alloc.set_reserved(*blocknr);
        }

        let extents = plan_extents(&mut alloc, 3).unwrap();

        assert_eq!(extents.iter().map(|e| e.block_count).sum::<u32>(), 3);
        assert!(extents.iter().all(|e| e.block_count == 1));
        assert_eq!(alloc.free_blocks(), 1);
    }

    #[test]
    fn failed_plan_releases_partial_allocations() {
        let mut alloc = BitmapAllocator::new(8);
        alloc.set_reserved(0);
        let free_before = alloc.free_blocks();

        assert!(plan_extents(&mut alloc, 8).is_err());
        assert_eq!(alloc.free_blocks(), free_before);
    }
}
