//! The shared tile cache.
//!
//! The cache tracks which tiles currently hold coefficient blocks, in
//! LRU order of their last participation in a reconstruction. One cache
//! can serve several open slides (they must share block dimensions, as
//! the coefficient pools are sized per block): entries are keyed by
//! `(slide id, tile index)` and the list links live in a cache-owned
//! map, so no raw pointers thread through the tiles themselves.
//!
//! During a reconstruction, every participating tile is removed from the
//! list ("reserved") so a concurrent trim cannot evict it, and
//! re-inserted at the head afterwards. Trimming pops tail entries and
//! returns their LL/H blocks to the pools until the target size is
//! reached.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::block_alloc::BlockAllocator;
use crate::image::TileGrid;

/// The two coefficient pools: single-subband LL blocks and triple-size H
/// blocks.
pub(crate) struct Allocators {
    pub(crate) ll: BlockAllocator,
    pub(crate) h: BlockAllocator,
}

const GIB: usize = 1 << 30;

impl Allocators {
    /// Pool sizing mirrors the original layout: a quarter of a 32 GiB
    /// coefficient budget for LL blocks, three quarters for H blocks,
    /// grown in 256 MiB chunks.
    pub(crate) fn new(block_width: i32, block_height: i32) -> Self {
        let ll_block_len = (block_width * block_height) as usize;
        let ll_block_size = ll_block_len * size_of::<i16>();
        let max_blocks = (32 * GIB) / ll_block_size;
        let ll_capacity = max_blocks / 4;
        let h_capacity = ll_capacity * 3;
        Self {
            ll: BlockAllocator::new(ll_block_len, ll_capacity, 256 << 20),
            h: BlockAllocator::new(ll_block_len * 3, h_capacity, 256 << 20),
        }
    }
}

pub(crate) type TileKey = (u32, u32);

#[derive(Clone, Copy, Default)]
struct LruNode {
    prev: Option<TileKey>,
    next: Option<TileKey>,
}

/// Doubly-linked LRU list over tile keys.
#[derive(Default)]
pub(crate) struct LruList {
    nodes: FxHashMap<TileKey, LruNode>,
    head: Option<TileKey>,
    tail: Option<TileKey>,
}

impl LruList {
    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn contains(&self, key: TileKey) -> bool {
        self.nodes.contains_key(&key)
    }

    /// Detach `key` if present. Absent keys are fine (the tile was not
    /// resident or is already reserved).
    pub(crate) fn remove(&mut self, key: TileKey) -> bool {
        let Some(node) = self.nodes.remove(&key) else {
            return false;
        };
        match node.prev {
            Some(prev) => self.nodes.get_mut(&prev).unwrap().next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes.get_mut(&next).unwrap().prev = node.prev,
            None => self.tail = node.prev,
        }
        true
    }

    /// Insert `key` at the head (most recently used).
    pub(crate) fn insert_first(&mut self, key: TileKey) {
        debug_assert!(!self.nodes.contains_key(&key));
        let node = LruNode {
            prev: None,
            next: self.head,
        };
        if let Some(head) = self.head {
            self.nodes.get_mut(&head).unwrap().prev = Some(key);
        }
        self.nodes.insert(key, node);
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    /// Detach and return the least recently used key.
    pub(crate) fn pop_tail(&mut self) -> Option<TileKey> {
        let tail = self.tail?;
        self.remove(tail);
        Some(tail)
    }

    #[cfg(test)]
    fn keys_front_to_back(&self) -> Vec<TileKey> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while let Some(key) = cursor {
            out.push(key);
            cursor = self.nodes[&key].next;
        }
        out
    }
}

pub(crate) struct CacheInner {
    #[allow(dead_code)]
    pub(crate) name: String,
    pub(crate) target_size: usize,
    pub(crate) lru: LruList,
    /// Created lazily at the first injection, when the block dimensions
    /// become known.
    pub(crate) allocators: Option<Arc<Allocators>>,
    pub(crate) allocator_block_width: i32,
    pub(crate) allocator_block_height: i32,
    /// Tile grids of every slide this cache was injected into.
    pub(crate) grids: FxHashMap<u32, Arc<Mutex<TileGrid>>>,
    pub(crate) next_slide_id: u32,
}

/// A tile cache shared between readers (and optionally between slides).
pub struct Cache {
    pub(crate) inner: Mutex<CacheInner>,
}

impl Cache {
    /// Number of tiles currently holding coefficients (reserved tiles of
    /// an in-flight reconstruction not included).
    pub fn resident_tile_count(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Create a cache retaining up to `target_size` tiles' coefficients.
    pub fn new(name: Option<&str>, target_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                name: name.unwrap_or("isyntax-cache").to_string(),
                target_size,
                lru: LruList::default(),
                allocators: None,
                allocator_block_width: 0,
                allocator_block_height: 0,
                grids: FxHashMap::default(),
                next_slide_id: 0,
            }),
        }
    }
}

impl CacheInner {
    /// Evict tail tiles until the list fits the target size, returning
    /// their coefficient blocks to the pools. Reserved tiles are not in
    /// the list and therefore never evicted.
    pub(crate) fn trim_to_target(&mut self) {
        while self.lru.len() > self.target_size {
            let Some((slide, tile_index)) = self.lru.pop_tail() else {
                break;
            };
            let Some(grid) = self.grids.get(&slide).cloned() else {
                continue;
            };
            let allocators = self
                .allocators
                .as_ref()
                .expect("cache with resident tiles has allocators")
                .clone();
            let mut grid = grid.lock();
            let tile = grid.tile_mut(tile_index as usize);
            for channel in &mut tile.channels {
                if let Some(block) = channel.coeff_ll.take() {
                    allocators.ll.free(block);
                }
                if let Some(block) = channel.coeff_h.take() {
                    allocators.h.free(block);
                }
            }
            tile.has_ll = false;
            tile.has_h = false;
        }
    }
}
