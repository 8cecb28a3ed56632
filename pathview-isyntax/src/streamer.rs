//! The viewport-driven streaming prefetcher.
//!
//! The first call performs the "first load": every chunk of the top
//! scale is read and decoded, and the top one-to-three levels (however
//! many the top chunks span) are transformed outright, so a freshly
//! opened slide immediately has its overview levels available. Every
//! later call works incrementally from the camera: visible tiles are
//! collected per level with a safety margin, the unloaded tile nearest
//! the camera center becomes the target, the unique chunks feeding it
//! and the rest of the viewport (at most [`MAX_CHUNKS_PER_CALL`]) are
//! read in file order, and decompression and transform jobs go to the
//! worker pool, falling back inline when the pool is saturated.
//!
//! A shared `frame_boundary_passed` flag preempts the streamer between
//! chunks; whoever drives the frame loop re-invokes it on the next
//! frame. Completed tiles carry the resource id of the viewport they
//! were scheduled for, so stale completions can be discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};

use crate::Isyntax;
use crate::cache::Allocators;
use crate::codeblock::DataChunk;
use crate::color::PixelFormat;
use crate::error::{Error, Result};
use crate::hulsken::hulsken_decompress;
use crate::image::{Image, TileGrid};
use crate::reader::transform_tile;
use crate::stitch::{NEIGHBORHOOD, adjacent_tiles_mask_only_existing};
use crate::work_queue::{CompletionQueue, TileCompletion, WorkQueue};

/// Chunk reads per `stream` call; keeps a single call bounded so the
/// frame loop stays responsive.
const MAX_CHUNKS_PER_CALL: usize = 64;
/// Tiles of margin added around the visible rectangle.
const PREFETCH_MARGIN_TILES: i32 = 5;
/// Queue backlog (per worker) above which work runs inline instead.
const QUEUE_SATURATION_PER_WORKER: usize = 10;

/// The camera rectangle in level-0 micrometers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CameraBounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl CameraBounds {
    fn center(&self) -> (f32, f32) {
        (
            (self.min_x + self.max_x) * 0.5,
            (self.min_y + self.max_y) * 0.5,
        )
    }
}

/// Drives prefetching for one open slide.
pub struct Streamer {
    isyntax: Arc<Isyntax>,
    work_queue: Arc<WorkQueue>,
    completions: Arc<CompletionQueue>,
    frame_boundary_passed: Arc<AtomicBool>,
    camera: CameraBounds,
    /// Optional crop: tiles outside are never prefetched.
    crop: Option<CameraBounds>,
    zoom_level: i32,
    resource_id: u32,
    pixel_format: PixelFormat,
    /// Set when the streamer returned early because the frame ended.
    in_progress: bool,
}

impl Streamer {
    pub fn new(
        isyntax: Arc<Isyntax>,
        work_queue: Arc<WorkQueue>,
        completions: Arc<CompletionQueue>,
        resource_id: u32,
        pixel_format: PixelFormat,
    ) -> Self {
        Self {
            isyntax,
            work_queue,
            completions,
            frame_boundary_passed: Arc::new(AtomicBool::new(false)),
            camera: CameraBounds::default(),
            crop: None,
            zoom_level: 0,
            resource_id,
            pixel_format,
            in_progress: false,
        }
    }

    /// The shared preemption flag; the frame loop sets it when a frame
    /// boundary passes, and clears it before re-driving the streamer.
    pub fn frame_boundary_flag(&self) -> Arc<AtomicBool> {
        self.frame_boundary_passed.clone()
    }

    pub fn set_viewport(&mut self, camera: CameraBounds, zoom_level: i32, resource_id: u32) {
        self.camera = camera;
        self.zoom_level = zoom_level;
        self.resource_id = resource_id;
    }

    pub fn set_crop(&mut self, crop: Option<CameraBounds>) {
        self.crop = crop;
    }

    /// Whether the last call was preempted before finishing its work.
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    fn frame_passed(&self) -> bool {
        self.frame_boundary_passed.load(Ordering::Relaxed)
    }

    /// Run one streaming step. Returns early whenever the frame flag is
    /// raised; call again on the next frame.
    pub fn stream(&mut self) -> Result<()> {
        let first_load_needed = !self.isyntax.grid.lock().first_load_complete;
        if first_load_needed {
            self.do_first_load()?;
            return Ok(());
        }
        self.stream_visible_tiles()
    }

    /// Visible tile range of `scale`, padded and clipped to the level
    /// (and to the crop rectangle, if any).
    fn visible_tile_range(&self, image: &Image, scale: i32) -> (i32, i32, i32, i32) {
        let level = &image.levels[scale as usize];
        let clip = |bounds: &CameraBounds| {
            let x0 = ((bounds.min_x - level.origin_offset_um.0) / level.x_tile_side_in_um).floor()
                as i32
                - PREFETCH_MARGIN_TILES;
            let y0 = ((bounds.min_y - level.origin_offset_um.1) / level.y_tile_side_in_um).floor()
                as i32
                - PREFETCH_MARGIN_TILES;
            let x1 = ((bounds.max_x - level.origin_offset_um.0) / level.x_tile_side_in_um).ceil()
                as i32
                + PREFETCH_MARGIN_TILES;
            let y1 = ((bounds.max_y - level.origin_offset_um.1) / level.y_tile_side_in_um).ceil()
                as i32
                + PREFETCH_MARGIN_TILES;
            (x0, y0, x1, y1)
        };
        let (mut x0, mut y0, mut x1, mut y1) = clip(&self.camera);
        if let Some(crop) = &self.crop {
            let (cx0, cy0, cx1, cy1) = clip(crop);
            x0 = x0.max(cx0);
            y0 = y0.max(cy0);
            x1 = x1.min(cx1);
            y1 = y1.min(cy1);
        }
        (
            x0.clamp(0, level.width_in_tiles - 1),
            y0.clamp(0, level.height_in_tiles - 1),
            x1.clamp(0, level.width_in_tiles - 1),
            y1.clamp(0, level.height_in_tiles - 1),
        )
    }

    fn allocators(&self) -> Result<Arc<Allocators>> {
        self.isyntax
            .allocators
            .get()
            .cloned()
            .ok_or(Error::InvalidArgument("no allocators available for streaming"))
    }

    /// Load and transform the top of the pyramid in one go.
    fn do_first_load(&mut self) -> Result<()> {
        let isyntax = &self.isyntax;
        let image = isyntax.wsi_image().ok_or(Error::InvalidArgument("no WSI image"))?;
        let allocators = self.allocators()?;
        let scale = image.max_scale();
        let level = &image.levels[scale as usize];
        let levels_in_chunk = scale % 3 + 1;

        let mut grid = isyntax.grid.lock();

        // Read and decode every top-level chunk.
        for tile_y in 0..level.height_in_tiles {
            for tile_x in 0..level.width_in_tiles {
                let tile_index = TileGrid::tile_index(level, tile_x, tile_y);
                if !grid.tile(tile_index).exists {
                    continue;
                }
                let chunk_index = grid.tile(tile_index).data_chunk_index as usize;
                let chunk = &image.data_chunks[chunk_index];
                let data = read_chunk(isyntax, image, chunk)?;
                decompress_chunk_codeblocks(isyntax, image, &mut grid, &allocators, chunk, &data);
            }
        }

        // Transform top-down so LL donations reach the next level before
        // it runs, and hand every produced tile to the consumer.
        let tile_pixel_count =
            (isyntax.tile_width * isyntax.tile_height) as usize * 4;
        for transform_scale in ((scale - levels_in_chunk + 1)..=scale).rev() {
            let level = &image.levels[transform_scale as usize];
            for tile_y in 0..level.height_in_tiles {
                for tile_x in 0..level.width_in_tiles {
                    let tile_index = TileGrid::tile_index(level, tile_x, tile_y);
                    if !grid.tile(tile_index).exists {
                        continue;
                    }
                    let mut pixels = vec![0u8; tile_pixel_count];
                    transform_tile(
                        isyntax,
                        image,
                        &mut grid,
                        &allocators,
                        tile_index,
                        Some((&mut pixels, self.pixel_format)),
                    );
                    self.completions.push(TileCompletion {
                        pixels,
                        scale: transform_scale,
                        tile_x,
                        tile_y,
                        resource_id: self.resource_id,
                    });
                }
            }
            grid.level_fully_loaded[transform_scale as usize] = true;
        }

        grid.first_load_complete = true;
        self.in_progress = false;
        Ok(())
    }

    /// One incremental streaming step from the current viewport.
    fn stream_visible_tiles(&mut self) -> Result<()> {
        let isyntax = self.isyntax.clone();
        let image = isyntax.wsi_image().ok_or(Error::InvalidArgument("no WSI image"))?;
        let allocators = self.allocators()?;
        self.in_progress = true;

        let lowest_scale = self.zoom_level.clamp(0, image.max_scale());
        let highest_scale = image.max_scale();
        let (center_x, center_y) = self.camera.center();

        // Collect unloaded visible tiles, nearest to the camera center
        // first, and aggregate the unique chunks that feed them.
        let mut chunk_list: Vec<(u64, usize)> = Vec::new();
        {
            let mut grid = isyntax.grid.lock();
            let mut candidates: Vec<(f32, usize, i32)> = Vec::new();
            for scale in lowest_scale..=highest_scale {
                if grid.level_fully_loaded[scale as usize] {
                    continue;
                }
                let level = &image.levels[scale as usize];
                let (x0, y0, x1, y1) = self.visible_tile_range(image, scale);
                for tile_y in y0..=y1 {
                    for tile_x in x0..=x1 {
                        let tile_index = TileGrid::tile_index(level, tile_x, tile_y);
                        let tile = grid.tile(tile_index);
                        if !tile.exists || tile.has_h || tile.is_submitted_for_loading {
                            continue;
                        }
                        let tile_center_x = level.origin_offset_um.0
                            + (tile_x as f32 + 0.5) * level.x_tile_side_in_um;
                        let tile_center_y = level.origin_offset_um.1
                            + (tile_y as f32 + 0.5) * level.y_tile_side_in_um;
                        let dx = tile_center_x - center_x;
                        let dy = tile_center_y - center_y;
                        candidates.push((dx * dx + dy * dy, tile_index, scale));
                    }
                }
            }
            candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

            // The nearest tile is the target; its ancestors' chunks are
            // part of its dependency chain and load first.
            if let Some(&(_, target_index, target_scale)) = candidates.first() {
                let mut scale = target_scale;
                let (mut tx, mut ty) = {
                    let t = grid.tile(target_index);
                    (t.tile_x, t.tile_y)
                };
                while scale <= image.max_scale() {
                    let level = &image.levels[scale as usize];
                    let tile_index = TileGrid::tile_index(level, tx, ty);
                    let tile = grid.tile(tile_index);
                    if tile.exists && !tile.has_h && !tile.is_submitted_for_loading {
                        push_unique_chunk(
                            &mut chunk_list,
                            image,
                            tile.data_chunk_index as usize,
                        );
                    }
                    scale += 1;
                    tx /= 2;
                    ty /= 2;
                }
            }

            for &(_, tile_index, _) in &candidates {
                if chunk_list.len() >= MAX_CHUNKS_PER_CALL {
                    break;
                }
                let chunk_index = grid.tile(tile_index).data_chunk_index as usize;
                push_unique_chunk(&mut chunk_list, image, chunk_index);
            }
            chunk_list.truncate(MAX_CHUNKS_PER_CALL);

            // Everything fed by a scheduled chunk is now in flight.
            for &(_, chunk_index) in &chunk_list {
                for tile_index in chunk_tile_indices(image, &image.data_chunks[chunk_index]) {
                    grid.tile_mut(tile_index).is_submitted_for_loading = true;
                }
            }
        }

        // Sequential reads in file order maximize throughput once the
        // target has been fixed.
        chunk_list.sort_by_key(|&(offset, _)| offset);

        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        for &(_, chunk_index) in &chunk_list {
            if self.frame_passed() {
                self.in_progress = true;
                return Ok(());
            }
            let chunk = &image.data_chunks[chunk_index];
            let data = Arc::new(read_chunk(&isyntax, image, chunk)?);

            let use_worker = self.work_queue.idle_worker_count() > 0
                && self.work_queue.entry_count() < worker_count * QUEUE_SATURATION_PER_WORKER;
            if use_worker {
                let isyntax = isyntax.clone();
                let allocators = allocators.clone();
                let data = data.clone();
                self.work_queue.submit(Box::new(move || {
                    let Some(image) = isyntax.wsi_image() else {
                        return;
                    };
                    let chunk = &image.data_chunks[chunk_index];
                    let mut grid = isyntax.grid.lock();
                    decompress_chunk_codeblocks(&isyntax, image, &mut grid, &allocators, chunk, &data);
                }));
            } else {
                let mut grid = isyntax.grid.lock();
                decompress_chunk_codeblocks(&isyntax, image, &mut grid, &allocators, chunk, &data);
            }
        }

        // Schedule transforms for visible tiles whose prerequisites hold,
        // highest scale first (ancestors donate LL downward).
        for scale in (lowest_scale..=highest_scale).rev() {
            let level = &image.levels[scale as usize];
            let (x0, y0, x1, y1) = self.visible_tile_range(image, scale);
            for tile_y in y0..=y1 {
                for tile_x in x0..=x1 {
                    if self.frame_passed() {
                        self.in_progress = true;
                        return Ok(());
                    }
                    let tile_index = TileGrid::tile_index(level, tile_x, tile_y);
                    {
                        let grid = isyntax.grid.lock();
                        let tile = grid.tile(tile_index);
                        if !tile.exists || tile.is_loaded || tile.is_submitted_for_h_decompress {
                            continue;
                        }
                        if !is_tile_ready_for_idwt(&grid, image, scale, tile_x, tile_y) {
                            continue;
                        }
                    }
                    isyntax.grid.lock().tile_mut(tile_index).is_submitted_for_h_decompress = true;

                    let use_worker = self.work_queue.idle_worker_count() > 0
                        && self.work_queue.entry_count()
                            < worker_count * QUEUE_SATURATION_PER_WORKER;
                    let job = {
                        let isyntax = isyntax.clone();
                        let allocators = allocators.clone();
                        let completions = self.completions.clone();
                        let resource_id = self.resource_id;
                        let pixel_format = self.pixel_format;
                        move || {
                            let Some(image) = isyntax.wsi_image() else {
                                return;
                            };
                            let tile_pixel_count =
                                (isyntax.tile_width * isyntax.tile_height) as usize * 4;
                            let mut pixels = vec![0u8; tile_pixel_count];
                            let mut grid = isyntax.grid.lock();
                            transform_tile(
                                &isyntax,
                                image,
                                &mut grid,
                                &allocators,
                                tile_index,
                                Some((&mut pixels, pixel_format)),
                            );
                            grid.tile_mut(tile_index).is_submitted_for_h_decompress = false;
                            drop(grid);
                            completions.push(TileCompletion {
                                pixels,
                                scale,
                                tile_x,
                                tile_y,
                                resource_id,
                            });
                        }
                    };
                    if use_worker {
                        self.work_queue.submit(Box::new(job));
                    } else {
                        job();
                    }
                }
            }
        }

        self.in_progress = false;
        Ok(())
    }
}

fn push_unique_chunk(chunk_list: &mut Vec<(u64, usize)>, image: &Image, chunk_index: usize) {
    if chunk_list.iter().any(|&(_, c)| c == chunk_index) {
        return;
    }
    chunk_list.push((image.data_chunks[chunk_index].offset, chunk_index));
}

/// Read the contiguous byte range of one chunk.
fn read_chunk(isyntax: &Isyntax, image: &Image, chunk: &DataChunk) -> Result<Vec<u8>> {
    let (base, len) = crate::codeblock::chunk_byte_range(image, chunk);
    let mut data = vec![0u8; len];
    isyntax
        .file
        .read_at(&mut data, base)
        .map_err(|e| Error::Open(e.into()))?;
    Ok(data)
}

/// Tile indices covered by a chunk (one tile per codeblock position of
/// color 0, LL duplicates included).
fn chunk_tile_indices(image: &Image, chunk: &DataChunk) -> Vec<usize> {
    let per_color = chunk.codeblock_count_per_color as usize;
    let mut out = Vec::with_capacity(per_color);
    for k in 0..per_color {
        let codeblock = &image.codeblocks[chunk.top_codeblock_index as usize + k];
        let level = &image.levels[codeblock.scale as usize];
        out.push(TileGrid::tile_index(
            level,
            codeblock.block_x,
            codeblock.block_y,
        ));
    }
    out
}

/// Decode every codeblock of a chunk into the owning tiles' channels.
fn decompress_chunk_codeblocks(
    isyntax: &Isyntax,
    image: &Image,
    grid: &mut TileGrid,
    allocators: &Allocators,
    chunk: &DataChunk,
    data: &[u8],
) {
    let per_color = chunk.codeblock_count_per_color as usize;
    let base = image.codeblocks[chunk.top_codeblock_index as usize].block_data_offset;
    let block_width = isyntax.block_width as usize;
    let block_height = isyntax.block_height as usize;
    let compressor = image
        .compressor_version
        .unwrap_or(crate::image::CompressorVersion::V1);

    for color in 0..3 {
        for k in 0..per_color {
            let codeblock_index = chunk.top_codeblock_index as usize + color * per_color + k;
            let codeblock = &image.codeblocks[codeblock_index];
            let level = &image.levels[codeblock.scale as usize];
            let tile_index = TileGrid::tile_index(level, codeblock.block_x, codeblock.block_y);

            let is_ll = codeblock.coefficient == 0;
            {
                let tile = grid.tile(tile_index);
                if (is_ll && tile.channels[color].coeff_ll.is_some())
                    || (!is_ll && tile.channels[color].coeff_h.is_some())
                {
                    continue;
                }
            }

            let start = (codeblock.block_data_offset - base) as usize;
            let end = start + codeblock.block_size as usize;
            let Some(slice) = data.get(start..end) else {
                warn!("codeblock data range escapes its chunk");
                continue;
            };

            let mut block = if is_ll {
                allocators.ll.alloc()
            } else {
                allocators.h.alloc()
            };
            if let Err(e) = hulsken_decompress(
                slice,
                block_width,
                block_height,
                codeblock.coefficient,
                compressor,
                block.as_mut_slice(),
            ) {
                error!("codeblock decode failed during streaming: {e}");
            }
            let tile = grid.tile_mut(tile_index);
            if is_ll {
                tile.channels[color].coeff_ll = Some(block);
            } else {
                tile.channels[color].coeff_h = Some(block);
            }
            if color == 2 {
                if is_ll {
                    tile.has_ll = true;
                } else {
                    tile.has_h = true;
                }
                tile.is_submitted_for_loading = false;
            }
        }
    }
}

/// A tile may be transformed once its own and all existing neighbors'
/// detail coefficients are resident, and its LL is either resident or
/// unobtainable (no parent tile exists).
fn is_tile_ready_for_idwt(
    grid: &TileGrid,
    image: &Image,
    scale: i32,
    tile_x: i32,
    tile_y: i32,
) -> bool {
    let level = &image.levels[scale as usize];
    let existing = adjacent_tiles_mask_only_existing(grid, level, tile_x, tile_y);
    for &(bit, dx, dy) in NEIGHBORHOOD {
        if existing & bit == 0 {
            continue;
        }
        let index = TileGrid::tile_index(level, tile_x + dx, tile_y + dy);
        let tile = grid.tile(index);
        if !tile.has_h {
            return false;
        }
        if !tile.has_ll {
            if scale == image.max_scale() {
                // Top-scale tiles read LL from their own chunk; it is
                // simply not resident yet.
                return false;
            }
            // Otherwise LL arrives from the parent transform. A missing
            // parent slot means this edge legitimately runs from the
            // background dummy.
            let parent_level = &image.levels[(scale + 1) as usize];
            let parent_index =
                TileGrid::tile_index(parent_level, (tile_x + dx) / 2, (tile_y + dy) / 2);
            if grid.tile(parent_index).exists {
                return false;
            }
        }
    }
    true
}
