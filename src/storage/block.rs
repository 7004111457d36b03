//! Fixed-size block arena
//!
//! A `BlockStore` owns one contiguous byte arena cut into equal blocks.
//! Values are placed in contiguous runs of blocks chosen first-fit from a
//! free-block bitmap; a [`Region`] is the coordinate of one such run.
//!
//! ```text
//! arena:  |blk0|blk1|blk2|blk3|blk4|blk5|blk6|blk7| ...
//! used:     1    1    0    1    1    1    0    0
//! heads:    2    .    .    3    .    .    .    .
//!           └─ Region{start: 0, blocks: 2}
//!                          └─ Region{start: 3, blocks: 3}
//! ```
//!
//! Accounting is in whole blocks: `used_bytes() + free_bytes()` always equals
//! `store_size_bytes()`. Internal fragmentation is below one block per region.

use crate::StorageError;

const WORD_BITS: usize = u64::BITS as usize;

/// Placement of one value inside a [`BlockStore`].
///
/// Not an owner of bytes: it is only meaningful while the run it names is
/// still allocated in the store that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    /// Payload length in bytes
    pub length: u32,
    /// Number of blocks reserved for the payload
    pub block_count: u32,
    /// Index of the first block of the run
    pub start_block: u32,
}

/// Block-allocated byte arena with first-fit allocation.
pub struct BlockStore {
    arena: Box<[u8]>,
    block_size: usize,
    total_blocks: usize,
    free_blocks: usize,
    /// Bit set = block in use
    used: Vec<u64>,
    /// Run length allocated at each block index, 0 when not a run head
    heads: Vec<u32>,
    /// No free block exists below this index
    search_from: usize,
    closed: bool,
}

impl BlockStore {
    /// Create a store of `capacity_bytes` rounded down to whole blocks
    pub fn new(capacity_bytes: usize, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let total_blocks = (capacity_bytes / block_size).min(u32::MAX as usize);

        Self {
            arena: vec![0u8; total_blocks * block_size].into_boxed_slice(),
            block_size,
            total_blocks,
            free_blocks: total_blocks,
            used: vec![0; total_blocks.div_ceil(WORD_BITS)],
            heads: vec![0; total_blocks],
            search_from: 0,
            closed: false,
        }
    }

    /// Total arena size in bytes
    pub fn store_size_bytes(&self) -> usize {
        self.total_blocks * self.block_size
    }

    pub fn free_bytes(&self) -> usize {
        self.free_blocks * self.block_size
    }

    pub fn used_bytes(&self) -> usize {
        (self.total_blocks - self.free_blocks) * self.block_size
    }

    /// Reserve the first run of free blocks large enough for `size` bytes
    pub fn alloc(&mut self, size: usize) -> Result<Region, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }

        let needed = size.div_ceil(self.block_size).max(1);
        let out_of_space = StorageError::OutOfSpace {
            requested: size,
            available: self.free_bytes(),
        };
        if needed > self.free_blocks {
            return Err(out_of_space);
        }

        let start = self.find_run(needed).ok_or(out_of_space)?;
        for block in start..start + needed {
            self.set_used(block, true);
        }
        self.heads[start] = needed as u32;
        self.free_blocks -= needed;
        if start == self.search_from {
            self.search_from = start + needed;
        }

        Ok(Region {
            length: size as u32,
            block_count: needed as u32,
            start_block: start as u32,
        })
    }

    /// Copy `data` into a region previously returned by [`alloc`](Self::alloc)
    pub fn write(&mut self, region: &Region, data: &[u8]) -> Result<(), StorageError> {
        self.check_live(region)?;
        if data.len() != region.length as usize {
            return Err(StorageError::InvalidRegion(format!(
                "write of {} bytes into region of {} bytes",
                data.len(),
                region.length
            )));
        }
        let offset = region.start_block as usize * self.block_size;
        self.arena[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Borrow the payload stored in a live region
    pub fn get(&self, region: &Region) -> Result<&[u8], StorageError> {
        self.check_live(region)?;
        let offset = region.start_block as usize * self.block_size;
        Ok(&self.arena[offset..offset + region.length as usize])
    }

    /// Return a region's blocks to the free set
    pub fn free(&mut self, region: &Region) -> Result<(), StorageError> {
        self.check_live(region)?;
        let start = region.start_block as usize;
        let count = region.block_count as usize;
        for block in start..start + count {
            self.set_used(block, false);
        }
        self.heads[start] = 0;
        self.free_blocks += count;
        self.search_from = self.search_from.min(start);
        Ok(())
    }

    /// Mark every block free
    pub fn clear(&mut self) {
        self.used.fill(0);
        self.heads.fill(0);
        self.free_blocks = self.total_blocks;
        self.search_from = 0;
    }

    /// Release the arena; later allocations fail with [`StorageError::Closed`]
    pub fn close(&mut self) {
        self.arena = Box::default();
        self.used = Vec::new();
        self.heads = Vec::new();
        self.total_blocks = 0;
        self.free_blocks = 0;
        self.search_from = 0;
        self.closed = true;
    }

    fn check_live(&self, region: &Region) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let start = region.start_block as usize;
        if start >= self.total_blocks {
            return Err(StorageError::InvalidRegion(format!(
                "start block {start} outside store of {} blocks",
                self.total_blocks
            )));
        }
        if region.block_count == 0 || self.heads[start] != region.block_count {
            return Err(StorageError::InvalidRegion(format!(
                "no live run of {} blocks at block {start}",
                region.block_count
            )));
        }
        if region.length as usize > region.block_count as usize * self.block_size {
            return Err(StorageError::InvalidRegion(format!(
                "length {} exceeds {} blocks",
                region.length, region.block_count
            )));
        }
        Ok(())
    }

    fn is_used(&self, block: usize) -> bool {
        self.used[block / WORD_BITS] & (1 << (block % WORD_BITS)) != 0
    }

    fn set_used(&mut self, block: usize, used: bool) {
        let bit = 1 << (block % WORD_BITS);
        if used {
            self.used[block / WORD_BITS] |= bit;
        } else {
            self.used[block / WORD_BITS] &= !bit;
        }
    }

    fn find_run(&self, needed: usize) -> Option<usize> {
        let mut start = self.search_from;
        let mut len = 0;
        let mut block = self.search_from;

        while block < self.total_blocks {
            if block % WORD_BITS == 0 && self.used[block / WORD_BITS] == u64::MAX {
                // Whole word in use
                block += WORD_BITS;
                start = block;
                len = 0;
                continue;
            }
            if self.is_used(block) {
                block += 1;
                start = block;
                len = 0;
            } else {
                block += 1;
                len += 1;
                if len == needed {
                    return Some(start);
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("free_blocks", &self.free_blocks)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
