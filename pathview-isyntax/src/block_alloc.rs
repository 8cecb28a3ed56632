//! A pool of fixed-size coefficient blocks.
//!
//! Tile reconstruction allocates and frees subband blocks at a very high
//! rate; going through the system allocator for each one does not scale
//! across threads. The pool hands out equally-sized blocks from chunked
//! backing storage: the first chunk is created eagerly, further chunks one
//! at a time on demand, up to a fixed total capacity. Freed blocks go on a
//! free list and are handed out again before any new chunk is grown.
//!
//! A block is owned by whoever holds the [`CoeffBlock`]; returning it to
//! the pool is an explicit `free`. Exhausting the configured capacity is
//! fatal, as is freeing a block into a pool with a different block size.

use parking_lot::Mutex;

/// An owned coefficient block. Must be returned to the pool it came from
/// with [`BlockAllocator::free`].
pub(crate) struct CoeffBlock {
    data: Box<[i16]>,
}

impl CoeffBlock {
    #[inline]
    pub(crate) fn as_slice(&self) -> &[i16] {
        &self.data
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [i16] {
        &mut self.data
    }
}

struct AllocatorInner {
    /// Blocks returned by `free`, handed out again first.
    free_list: Vec<Box<[i16]>>,
    /// Blocks handed out of the current chunk so far.
    used_blocks_in_chunk: usize,
    /// Chunks grown so far (the first chunk is grown eagerly).
    used_chunks: usize,
    /// Live allocations, for capacity accounting.
    outstanding: usize,
}

/// Thread-safe pool of fixed-size coefficient blocks.
pub(crate) struct BlockAllocator {
    /// Length of every block, in coefficients.
    block_len: usize,
    chunk_capacity_in_blocks: usize,
    chunk_count: usize,
    inner: Mutex<AllocatorInner>,
}

impl BlockAllocator {
    /// `block_len` is in coefficients; `max_capacity_in_blocks` bounds the
    /// total number of live blocks; backing storage grows in chunks of
    /// `chunk_size` bytes.
    pub(crate) fn new(
        block_len: usize,
        max_capacity_in_blocks: usize,
        chunk_size: usize,
    ) -> Self {
        let block_size = block_len * size_of::<i16>();
        let total_capacity = block_size * max_capacity_in_blocks;
        let chunk_count = (total_capacity / chunk_size).max(1);
        let chunk_capacity_in_blocks = max_capacity_in_blocks / chunk_count;
        assert!(chunk_capacity_in_blocks > 0);

        Self {
            block_len,
            chunk_capacity_in_blocks,
            chunk_count,
            inner: Mutex::new(AllocatorInner {
                free_list: Vec::new(),
                used_blocks_in_chunk: 0,
                used_chunks: 1,
                outstanding: 0,
            }),
        }
    }

    /// Number of blocks currently handed out.
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }

    /// Allocate a zeroed block.
    ///
    /// Panics when the configured capacity is exhausted; the caller has no
    /// way to make progress without coefficient storage.
    pub(crate) fn alloc(&self) -> CoeffBlock {
        let mut inner = self.inner.lock();
        inner.outstanding += 1;

        if let Some(mut data) = inner.free_list.pop() {
            data.fill(0);
            return CoeffBlock { data };
        }

        if inner.used_blocks_in_chunk >= self.chunk_capacity_in_blocks {
            // Chunk is full, grow a new chunk.
            if inner.used_chunks >= self.chunk_count {
                panic!("coefficient block allocator out of memory");
            }
            inner.used_chunks += 1;
            inner.used_blocks_in_chunk = 0;
        }
        inner.used_blocks_in_chunk += 1;
        drop(inner);

        CoeffBlock {
            data: vec![0i16; self.block_len].into_boxed_slice(),
        }
    }

    /// Return a block to the pool.
    ///
    /// Panics when the block does not belong to this pool (wrong size),
    /// mirroring the out-of-range-pointer check of the original design.
    pub(crate) fn free(&self, block: CoeffBlock) {
        if block.data.len() != self.block_len {
            panic!("coefficient block freed into the wrong allocator");
        }
        let mut inner = self.inner.lock();
        debug_assert!(inner.outstanding > 0);
        inner.outstanding -= 1;
        inner.free_list.push(block.data);
    }
}

#[cfg(test)]
mod tests {
    use super::BlockAllocator;

    #[test]
    fn alloc_free_recycles_blocks() {
        let pool = BlockAllocator::new(16, 8, 16 * 2 * 4);
        let mut a = pool.alloc();
        a.as_mut_slice().fill(42);
        assert_eq!(pool.outstanding(), 1);
        pool.free(a);
        assert_eq!(pool.outstanding(), 0);

        // A recycled block comes back zeroed.
        let b = pool.alloc();
        assert!(b.as_slice().iter().all(|&v| v == 0));
        pool.free(b);
    }

    #[test]
    fn grows_one_chunk_at_a_time() {
        // 4 chunks of 2 blocks each.
        let pool = BlockAllocator::new(16, 8, 16 * 2 * 2);
        let blocks: Vec<_> = (0..8).map(|_| pool.alloc()).collect();
        assert_eq!(pool.outstanding(), 8);
        for b in blocks {
            pool.free(b);
        }
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn capacity_exhaustion_is_fatal() {
        let pool = BlockAllocator::new(16, 4, 16 * 2 * 2);
        let _blocks: Vec<_> = (0..5).map(|_| pool.alloc()).collect();
    }

    #[test]
    #[should_panic(expected = "wrong allocator")]
    fn cross_pool_free_is_fatal() {
        let ll = BlockAllocator::new(16, 4, 16 * 2 * 2);
        let h = BlockAllocator::new(48, 4, 48 * 2 * 2);
        let block = ll.alloc();
        h.free(block);
    }
}
